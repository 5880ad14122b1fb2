//! Call envelope: what to send and what came back

use crate::error::ClientError;
use hyper::body::Bytes;
use hyper::Method;
use lift_core::{LoadBalanceStrategy, ServiceInstance};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// An outbound call to a named service
#[derive(Clone, Debug)]
pub struct ServiceRequest {
    pub service_name: String,
    pub method: Method,
    pub path: String,
    /// Applied after the standard headers, so they can override them
    pub headers: HashMap<String, String>,
    /// JSON body
    pub body: Option<serde_json::Value>,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    /// Generated when absent
    pub request_id: Option<String>,
    /// Defaults to round robin
    pub strategy: Option<LoadBalanceStrategy>,
    /// Per-attempt timeout; defaults to the client's
    pub timeout: Option<Duration>,
}

impl ServiceRequest {
    pub fn new(service_name: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            method,
            path: path.into(),
            headers: HashMap::new(),
            body: None,
            tenant_id: None,
            user_id: None,
            request_id: None,
            strategy: None,
            timeout: None,
        }
    }

    pub fn get(service_name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(service_name, Method::GET, path)
    }

    pub fn post(service_name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(service_name, Method::POST, path)
    }

    pub fn put(service_name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(service_name, Method::PUT, path)
    }

    pub fn delete(service_name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(service_name, Method::DELETE, path)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Serialize `body` as the JSON request body
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, ClientError> {
        self.body = Some(serde_json::to_value(body).map_err(ClientError::Marshal)?);
        Ok(self)
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_strategy(mut self, strategy: LoadBalanceStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result of a completed call
#[derive(Clone, Debug)]
pub struct ServiceResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    /// Wall time of the whole call, retries included
    pub duration: Duration,
    /// The instance that served the final attempt
    pub instance: ServiceInstance,
}

impl ServiceResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        serde_json::from_slice(&self.body).map_err(ClientError::Unmarshal)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

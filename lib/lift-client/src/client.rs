//! Service client: discovery, request building, retry and metrics for one call

use crate::circuit_breaker::CircuitBreaker;
use crate::config::ClientConfig;
use crate::error::{ClientError, TransportError};
use crate::metrics::{
    MetricsSink, ERRORS_TOTAL, IN_FLIGHT, REQUESTS_TOTAL, REQUEST_DURATION_SECONDS,
};
use crate::request::{ServiceRequest, ServiceResponse};
use crate::retry::{retry_with_backoff, RetryError};
use crate::trace::{TraceContext, TRACEPARENT};
use crate::transport::{HyperTransport, Transport};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE, USER_AGENT};
use hyper::{Method, Request, Response, Uri};
use lift_core::{DiscoveryOptions, LoadBalanceStrategy, ServiceInstance, ServiceRegistry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Value of `X-Source-Service` on every outbound call
pub const SOURCE_SERVICE: &str = "lift-client";

const APPLICATION_JSON: &str = "application/json";

const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
const X_TENANT_ID: HeaderName = HeaderName::from_static("x-tenant-id");
const X_USER_ID: HeaderName = HeaderName::from_static("x-user-id");
const X_SOURCE_SERVICE: HeaderName = HeaderName::from_static("x-source-service");
const X_TARGET_SERVICE: HeaderName = HeaderName::from_static("x-target-service");
const X_INSTANCE_ID: HeaderName = HeaderName::from_static("x-instance-id");

/// Calls named services through the registry.
///
/// One client is meant to be shared across tasks; every collaborator it holds
/// is shareable.
pub struct ServiceClient {
    registry: Arc<ServiceRegistry>,
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    circuit_breaker: Option<Arc<dyn CircuitBreaker>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    in_flight: Mutex<HashMap<String, i64>>,
}

/// A fully built outbound request, reusable across attempts
struct Outbound {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
}

impl Outbound {
    fn to_request(&self) -> Request<Bytes> {
        let mut request = Request::new(self.body.clone());
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = self.uri.clone();
        *request.headers_mut() = self.headers.clone();
        request
    }
}

/// Settles per-call bookkeeping when the call ends, including when its
/// future is dropped before completion
struct CallGuard<'a> {
    client: &'a ServiceClient,
    service: String,
    // Least-connections slot to hand back
    connection: Option<String>,
}

impl<'a> CallGuard<'a> {
    fn new(client: &'a ServiceClient, service: &str) -> Self {
        client.track_in_flight(service, 1);
        Self {
            client,
            service: service.to_string(),
            connection: None,
        }
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if let Some(instance_id) = self.connection.take() {
            self.client.registry.release_connection(&instance_id);
        }
        self.client.track_in_flight(&self.service, -1);
    }
}

impl ServiceClient {
    pub fn new(registry: Arc<ServiceRegistry>, config: ClientConfig) -> Self {
        let transport = Arc::new(HyperTransport::new(config.connect_timeout));
        Self {
            registry,
            transport,
            config,
            circuit_breaker: None,
            metrics: None,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<dyn CircuitBreaker>) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub async fn call(&self, request: ServiceRequest) -> Result<ServiceResponse, ClientError> {
        self.call_with_cancellation(request, &CancellationToken::new()).await
    }

    /// Execute `request`, giving up with `ClientError::Cancelled` as soon as
    /// `cancel` fires
    pub async fn call_with_cancellation(
        &self,
        request: ServiceRequest,
        cancel: &CancellationToken,
    ) -> Result<ServiceResponse, ClientError> {
        let started = Instant::now();
        let service = request.service_name.clone();

        let mut guard = CallGuard::new(self, &service);
        let result = self.dispatch(request, cancel, started, &mut guard).await;
        drop(guard);

        match &result {
            Ok(response) => debug!(
                service = %service,
                status = response.status,
                instance_id = %response.instance.id,
                "Call completed in {:?}",
                response.duration
            ),
            Err(e) => warn!(service = %service, kind = e.kind(), "Call failed: {}", e),
        }
        self.record(&service, started, &result);
        result
    }

    async fn dispatch(
        &self,
        request: ServiceRequest,
        cancel: &CancellationToken,
        started: Instant,
        guard: &mut CallGuard<'_>,
    ) -> Result<ServiceResponse, ClientError> {
        let strategy = request.strategy.unwrap_or_default();
        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        let request_id = request
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut options = DiscoveryOptions::new().with_strategy(strategy);
        if let Some(tenant_id) = &request.tenant_id {
            options = options.with_tenant(tenant_id.clone());
        }

        let instance = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            discovered = self.registry.discover(&request.service_name, &options) => {
                discovered.map_err(|source| ClientError::Discovery {
                    service: request.service_name.clone(),
                    source,
                })?
            }
        };

        // Least-connections slots are handed back once the call is over
        if strategy == LoadBalanceStrategy::LeastConnections {
            guard.connection = Some(instance.id.clone());
        }

        self.call_instance(&request, &instance, &request_id, timeout, cancel, started)
            .await
    }

    async fn call_instance(
        &self,
        request: &ServiceRequest,
        instance: &ServiceInstance,
        request_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<ServiceResponse, ClientError> {
        let outbound = self.build_request(request, instance, request_id)?;
        let call = self.execute(
            &request.service_name,
            &outbound,
            instance,
            timeout,
            cancel,
            started,
        );

        match &self.circuit_breaker {
            Some(breaker) => breaker.execute(Box::pin(call)).await,
            None => call.await,
        }
    }

    fn build_request(
        &self,
        request: &ServiceRequest,
        instance: &ServiceInstance,
        request_id: &str,
    ) -> Result<Outbound, ClientError> {
        let path = if request.path.is_empty() || request.path.starts_with('/') {
            request.path.clone()
        } else {
            format!("/{}", request.path)
        };
        let url = format!("{}{}", instance.base_url(), path);
        let uri: Uri = url
            .parse()
            .map_err(|e| ClientError::InvalidRequest(format!("{}: {}", url, e)))?;

        let body = match &request.body {
            Some(body) => Bytes::from(serde_json::to_vec(body).map_err(ClientError::Marshal)?),
            None => Bytes::new(),
        };

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, header_value(&self.config.user_agent)?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
        headers.insert(ACCEPT, HeaderValue::from_static(APPLICATION_JSON));
        headers.insert(X_REQUEST_ID, header_value(request_id)?);
        if let Some(tenant_id) = &request.tenant_id {
            headers.insert(X_TENANT_ID, header_value(tenant_id)?);
        }
        if let Some(user_id) = &request.user_id {
            headers.insert(X_USER_ID, header_value(user_id)?);
        }
        headers.insert(X_SOURCE_SERVICE, HeaderValue::from_static(SOURCE_SERVICE));
        headers.insert(X_TARGET_SERVICE, header_value(&request.service_name)?);
        headers.insert(X_INSTANCE_ID, header_value(&instance.id)?);

        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ClientError::InvalidRequest(format!("header {}: {}", name, e)))?;
            headers.insert(name, header_value(value)?);
        }

        // traceparent always carries the child span; X-Trace-ID and X-Span-ID
        // set by the caller are kept
        if self.config.enable_tracing {
            let mut trace_headers = HeaderMap::new();
            TraceContext::from_headers(&headers).inject(&mut trace_headers);
            for (name, value) in &trace_headers {
                if name.as_str() == TRACEPARENT || !headers.contains_key(name) {
                    headers.insert(name.clone(), value.clone());
                }
            }
        }

        Ok(Outbound {
            method: request.method.clone(),
            uri,
            headers,
            body,
        })
    }

    async fn execute(
        &self,
        service: &str,
        outbound: &Outbound,
        instance: &ServiceInstance,
        timeout: Duration,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<ServiceResponse, ClientError> {
        let policy = &self.config.retry;
        let transport = &self.transport;

        let response = retry_with_backoff(policy, cancel, |attempt| {
            let request = outbound.to_request();
            async move {
                debug!(
                    attempt,
                    instance_id = %instance.id,
                    "{} {}",
                    request.method(),
                    request.uri()
                );
                let response = transport.execute(request, timeout).await?;
                let status = response.status().as_u16();
                if policy.should_retry_status(status) {
                    return Err(TransportError::Status { status });
                }
                Ok(response)
            }
        })
        .await
        .map_err(|e| match e {
            RetryError::Cancelled { .. } => ClientError::Cancelled,
            RetryError::Failed { attempts, source } => ClientError::Execution {
                service: service.to_string(),
                attempts,
                source,
            },
        })?;

        Ok(service_response(response, instance.clone(), started.elapsed()))
    }

    fn track_in_flight(&self, service: &str, delta: i64) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let count = in_flight.entry(service.to_string()).or_insert(0);
        *count = (*count + delta).max(0);
        if let Some(metrics) = &self.metrics {
            metrics.set_gauge(IN_FLIGHT, &[("service", service)], *count as f64);
        }
    }

    fn record(
        &self,
        service: &str,
        started: Instant,
        result: &Result<ServiceResponse, ClientError>,
    ) {
        let Some(metrics) = &self.metrics else {
            return;
        };

        let outcome = if result.is_ok() { "success" } else { "error" };
        let labels = [("service", service), ("outcome", outcome)];
        metrics.increment_counter(REQUESTS_TOTAL, &labels);
        metrics.observe_histogram(
            REQUEST_DURATION_SECONDS,
            &labels,
            started.elapsed().as_secs_f64(),
        );

        if let Err(e) = result {
            metrics.increment_counter(ERRORS_TOTAL, &[("service", service), ("kind", e.kind())]);
        }
    }
}

fn header_value(value: &str) -> Result<HeaderValue, ClientError> {
    HeaderValue::from_str(value)
        .map_err(|e| ClientError::InvalidRequest(format!("header value {:?}: {}", value, e)))
}

fn service_response(
    response: Response<Bytes>,
    instance: ServiceInstance,
    duration: Duration,
) -> ServiceResponse {
    let (parts, body) = response.into_parts();
    let headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();

    ServiceResponse {
        status: parts.status.as_u16(),
        headers,
        body,
        duration,
        instance,
    }
}

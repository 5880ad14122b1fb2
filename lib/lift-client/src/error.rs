use lift_core::CoreError;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single outbound attempt
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("request timeout after {0:?}")]
    Timeout(Duration),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("retryable status code {status}")]
    Status { status: u16 },

    #[error("request error: {0}")]
    Request(String),
}

/// Error returned by `ServiceClient::call`, one variant per failure category
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("service discovery failed for {service}")]
    Discovery {
        service: String,
        #[source]
        source: CoreError,
    },

    #[error("circuit breaker rejected call: {0}")]
    CircuitBreaker(String),

    #[error("request to {service} failed after {attempts} attempt(s)")]
    Execution {
        service: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("failed to encode request body")]
    Marshal(#[source] serde_json::Error),

    #[error("failed to decode response body")]
    Unmarshal(#[source] serde_json::Error),

    #[error("call cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ClientError {
    /// Short label used for error metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::Discovery { .. } => "discovery",
            ClientError::CircuitBreaker(_) => "circuit_breaker",
            ClientError::Execution { .. } => "execution",
            ClientError::Marshal(_) => "marshal",
            ClientError::Unmarshal(_) => "unmarshal",
            ClientError::Cancelled => "cancelled",
            ClientError::InvalidRequest(_) => "invalid_request",
        }
    }
}

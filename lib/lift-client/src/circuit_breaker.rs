//! Circuit breaker contract
//!
//! The client only drives the breaker through `execute`; the state machine
//! behind it belongs to the implementation.

use crate::error::ClientError;
use crate::request::ServiceResponse;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;

/// Circuit breaker states
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CircuitState {
    /// Requests flow normally
    #[default]
    Closed,
    /// Requests are rejected
    Open,
    /// Trial requests are allowed
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub requests: u64,
    pub failures: u64,
    pub rejections: u64,
}

pub type CallFuture<'a> = BoxFuture<'a, Result<ServiceResponse, ClientError>>;

/// Failure isolation around an outbound call.
///
/// `execute` either runs `call` and returns its result unchanged, or rejects
/// without running it. Rejections should be reported as
/// `ClientError::CircuitBreaker`.
#[async_trait]
pub trait CircuitBreaker: Send + Sync {
    async fn execute<'a>(&self, call: CallFuture<'a>) -> Result<ServiceResponse, ClientError>;

    fn state(&self) -> CircuitState;

    fn stats(&self) -> CircuitBreakerStats;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_labels() {
        assert_eq!(CircuitState::default(), CircuitState::Closed);
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
        assert_eq!(CircuitState::Open.as_str(), "open");
    }
}

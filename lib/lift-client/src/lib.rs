//! Outbound calls to discovered services
//!
//! This library provides:
//! - `ServiceClient`, which resolves a service through the registry and calls it
//! - Exponential-backoff retry with cancellation
//! - Transport, circuit breaker and metrics sink contracts
//! - A pooled hyper transport and a Prometheus metrics sink

pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod request;
pub mod retry;
pub mod trace;
pub mod transport;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState};
pub use client::ServiceClient;
pub use config::ClientConfig;
pub use error::{ClientError, TransportError};
pub use metrics::{MetricsSink, PrometheusMetrics};
pub use request::{ServiceRequest, ServiceResponse};
pub use retry::RetryPolicy;
pub use trace::TraceContext;
pub use transport::{HyperTransport, Transport};

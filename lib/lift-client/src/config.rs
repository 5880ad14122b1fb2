use crate::retry::RetryPolicy;
use lift_core::config::{env_bool, env_parse};
use std::time::Duration;

/// Service client configuration
#[derive(Clone, Debug, PartialEq)]
pub struct ClientConfig {
    pub user_agent: String,
    /// Per-attempt timeout when the request sets none
    pub default_timeout: Duration,
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
    /// Send `traceparent`, `X-Trace-ID` and `X-Span-ID`
    pub enable_tracing: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("lift-client/{}", env!("CARGO_PKG_VERSION")),
            default_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            enable_tracing: true,
        }
    }
}

impl ClientConfig {
    /// Load from `LIFT_CLIENT_*` environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            user_agent: std::env::var("LIFT_CLIENT_USER_AGENT")
                .ok()
                .filter(|ua| !ua.is_empty())
                .unwrap_or(defaults.user_agent),
            default_timeout: env_parse("LIFT_CLIENT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_timeout),
            connect_timeout: env_parse("LIFT_CLIENT_CONNECT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            retry: RetryPolicy {
                max_retries: env_parse("LIFT_CLIENT_MAX_RETRIES")
                    .unwrap_or(defaults.retry.max_retries),
                ..defaults.retry
            },
            enable_tracing: env_bool("LIFT_CLIENT_TRACING").unwrap_or(defaults.enable_tracing),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.enable_tracing = enabled;
        self
    }
}

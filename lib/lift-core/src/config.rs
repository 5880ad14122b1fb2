//! Registry and cache configuration

use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Default lifetime of a cached discovery result
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Discovery cache configuration
#[derive(Clone, Debug, PartialEq)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Capacity of the single-tier cache
    pub max_size: usize,
    pub default_ttl: Duration,
    /// Use an L1/L2 cache instead of a single LRU
    pub multi_tier: bool,
    pub l1_max_size: usize,
    pub l2_max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 1000,
            default_ttl: DEFAULT_CACHE_TTL,
            multi_tier: false,
            l1_max_size: 100,
            l2_max_size: 10_000,
        }
    }
}

impl CacheConfig {
    /// Load from `LIFT_CACHE_*` environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_bool("LIFT_CACHE_ENABLED").unwrap_or(defaults.enabled),
            max_size: env_parse("LIFT_CACHE_MAX_SIZE").unwrap_or(defaults.max_size),
            default_ttl: env_parse("LIFT_CACHE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_ttl),
            multi_tier: env_bool("LIFT_CACHE_MULTI_TIER").unwrap_or(defaults.multi_tier),
            l1_max_size: env_parse("LIFT_CACHE_L1_MAX_SIZE").unwrap_or(defaults.l1_max_size),
            l2_max_size: env_parse("LIFT_CACHE_L2_MAX_SIZE").unwrap_or(defaults.l2_max_size),
        }
    }
}

/// Service registry configuration
#[derive(Clone, Debug, PartialEq)]
pub struct RegistryConfig {
    pub cache: CacheConfig,
    /// Require a tenant on registration and match it on discovery
    pub tenant_isolation: bool,
    /// Instances not seen for longer than this are skipped by health-aware balancing
    pub stale_after: Duration,
    /// Region used by the local-first strategy
    pub local_region: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            tenant_isolation: false,
            stale_after: Duration::from_secs(60),
            local_region: None,
        }
    }
}

impl RegistryConfig {
    /// Load from `LIFT_*` environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cache: CacheConfig::from_env(),
            tenant_isolation: env_bool("LIFT_TENANT_ISOLATION")
                .unwrap_or(defaults.tenant_isolation),
            stale_after: env_parse("LIFT_STALE_AFTER_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_after),
            local_region: std::env::var("LIFT_LOCAL_REGION")
                .ok()
                .filter(|r| !r.is_empty()),
        }
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_tenant_isolation(mut self, enabled: bool) -> Self {
        self.tenant_isolation = enabled;
        self
    }

    pub fn with_local_region(mut self, region: impl Into<String>) -> Self {
        self.local_region = Some(region.into());
        self
    }
}

/// Parse an environment variable, ignoring (and logging) malformed values
pub fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring malformed value for {}: {:?}", key, raw);
            None
        }
    }
}

/// Parse a boolean environment variable (`true`/`false`, `1`/`0`, `yes`/`no`)
pub fn env_bool(key: &str) -> Option<bool> {
    let raw = std::env::var(key).ok()?;
    parse_bool(&raw)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

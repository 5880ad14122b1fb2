//! Service registration and discovery data model

use crate::health::HealthCheckConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Metadata key compared against the caller's region for locality preferences
pub const REGION_METADATA_KEY: &str = "region";

/// A network address at which a service is reachable
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_protocol() -> String {
    "http".to_string()
}

impl ServiceEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: default_protocol(),
            host: host.into(),
            port,
            path: String::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Base URL of the endpoint, e.g. `http://10.0.0.1:8080/api`
    pub fn base_url(&self) -> String {
        let protocol = if self.protocol.is_empty() {
            "http"
        } else {
            self.protocol.as_str()
        };
        format!(
            "{}://{}:{}{}",
            protocol,
            self.host,
            self.port,
            self.path.trim_end_matches('/')
        )
    }
}

/// Health state reported for an instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,
    #[serde(default)]
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthStatus {
    pub fn new(status: HealthState) -> Self {
        Self {
            status,
            message: None,
            checked_at: Utc::now(),
        }
    }

    pub fn healthy() -> Self {
        Self::new(HealthState::Healthy)
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(HealthState::Unhealthy)
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Healthy
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new(HealthState::Unknown)
    }
}

/// Registration-time description of a service
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Registration ID; generated on register when empty
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub version: String,
    pub endpoints: Vec<ServiceEndpoint>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: i32,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

fn default_weight() -> i32 {
    1
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            version: version.into(),
            endpoints: Vec::new(),
            tags: Vec::new(),
            weight: default_weight(),
            tenant_id: String::new(),
            health_check: None,
            metadata: HashMap::new(),
            created: None,
            last_seen: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: ServiceEndpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn with_health_check(mut self, health_check: HealthCheckConfig) -> Self {
        self.health_check = Some(health_check);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Expand the config into one addressable instance per endpoint.
    ///
    /// Endpoint metadata takes precedence over service-level metadata.
    pub fn instances(&self, health: &HealthStatus) -> Vec<ServiceInstance> {
        let last_seen = self.last_seen.unwrap_or_else(Utc::now);
        self.endpoints
            .iter()
            .enumerate()
            .map(|(index, endpoint)| {
                let mut metadata = self.metadata.clone();
                metadata.extend(endpoint.metadata.clone());
                ServiceInstance {
                    id: format!("{}-{}", self.id, index),
                    service_name: self.name.clone(),
                    version: self.version.clone(),
                    endpoint: endpoint.clone(),
                    health: health.clone(),
                    weight: self.weight,
                    tenant_id: self.tenant_id.clone(),
                    tags: self.tags.clone(),
                    metadata,
                    last_seen,
                }
            })
            .collect()
    }
}

/// A discovered, addressable deployment of a named service
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub service_name: String,
    pub version: String,
    pub endpoint: ServiceEndpoint,
    pub health: HealthStatus,
    pub weight: i32,
    pub tenant_id: String,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub last_seen: DateTime<Utc>,
}

impl ServiceInstance {
    pub fn new(
        id: impl Into<String>,
        service_name: impl Into<String>,
        endpoint: ServiceEndpoint,
    ) -> Self {
        Self {
            id: id.into(),
            service_name: service_name.into(),
            version: String::new(),
            endpoint,
            health: HealthStatus::healthy(),
            weight: 1,
            tenant_id: String::new(),
            tags: Vec::new(),
            metadata: HashMap::new(),
            last_seen: Utc::now(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_health(mut self, health: HealthStatus) -> Self {
        self.health = health;
        self
    }

    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_last_seen(mut self, last_seen: DateTime<Utc>) -> Self {
        self.last_seen = last_seen;
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn region(&self) -> Option<&str> {
        self.metadata.get(REGION_METADATA_KEY).map(String::as_str)
    }

    pub fn base_url(&self) -> String {
        self.endpoint.base_url()
    }
}

/// Instance selection strategy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    /// Cycle through instances in order
    #[default]
    RoundRobin,
    /// Random choice proportional to instance weight
    WeightedRandom,
    /// Instance with the fewest outstanding selections
    LeastConnections,
    /// Round-robin over healthy instances, unhealthy ones as a last resort
    HealthyFirst,
    /// Prefer instances in the local region
    LocalFirst,
}

impl LoadBalanceStrategy {
    /// Parse a strategy name; unrecognised names fall back to round-robin
    pub fn from_string(s: &str) -> Self {
        match s.to_lowercase().replace('-', "_").as_str() {
            "weighted_random" | "weighted" => LoadBalanceStrategy::WeightedRandom,
            "least_connections" | "least_conn" => LoadBalanceStrategy::LeastConnections,
            "healthy_first" => LoadBalanceStrategy::HealthyFirst,
            "local_first" => LoadBalanceStrategy::LocalFirst,
            _ => LoadBalanceStrategy::RoundRobin,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalanceStrategy::RoundRobin => "round_robin",
            LoadBalanceStrategy::WeightedRandom => "weighted_random",
            LoadBalanceStrategy::LeastConnections => "least_connections",
            LoadBalanceStrategy::HealthyFirst => "healthy_first",
            LoadBalanceStrategy::LocalFirst => "local_first",
        }
    }
}

impl fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call filtering and selection options
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiscoveryOptions {
    pub tenant_id: Option<String>,
    pub strategy: LoadBalanceStrategy,
    /// Every listed tag must be present on an instance
    pub tags: Vec<String>,
    pub version: Option<String>,
    pub region: Option<String>,
    pub include_unhealthy: bool,
    /// Zero means unlimited
    pub max_instances: usize,
    pub prefer_local: bool,
}

impl DiscoveryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, strategy: LoadBalanceStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn include_unhealthy(mut self, include: bool) -> Self {
        self.include_unhealthy = include;
        self
    }

    pub fn with_max_instances(mut self, max_instances: usize) -> Self {
        self.max_instances = max_instances;
        self
    }

    pub fn prefer_local(mut self, prefer_local: bool) -> Self {
        self.prefer_local = prefer_local;
        self
    }

    /// Composite cache key: `name:tenant:version:strategy`
    pub fn cache_key(&self, service_name: &str) -> String {
        format!(
            "{}:{}:{}:{}",
            service_name,
            self.tenant_id.as_deref().unwrap_or(""),
            self.version.as_deref().unwrap_or(""),
            self.strategy
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_base_url() {
        let endpoint = ServiceEndpoint::new("10.0.0.1", 8080);
        assert_eq!(endpoint.base_url(), "http://10.0.0.1:8080");

        let endpoint = ServiceEndpoint::new("api.internal", 443)
            .with_protocol("https")
            .with_path("/v1/");
        assert_eq!(endpoint.base_url(), "https://api.internal:443/v1");
    }

    #[test]
    fn test_strategy_from_string() {
        assert_eq!(
            LoadBalanceStrategy::from_string("weighted_random"),
            LoadBalanceStrategy::WeightedRandom
        );
        assert_eq!(
            LoadBalanceStrategy::from_string("Least-Connections"),
            LoadBalanceStrategy::LeastConnections
        );
        assert_eq!(
            LoadBalanceStrategy::from_string("healthy_first"),
            LoadBalanceStrategy::HealthyFirst
        );
        assert_eq!(
            LoadBalanceStrategy::from_string("bogus"),
            LoadBalanceStrategy::RoundRobin
        );
    }

    #[test]
    fn test_config_expands_to_instances() {
        let config = ServiceConfig::new("user-service", "v1")
            .with_id("user-1")
            .with_endpoint(ServiceEndpoint::new("10.0.0.1", 8080))
            .with_endpoint(ServiceEndpoint::new("10.0.0.2", 8080).with_metadata("region", "eu"))
            .with_tag("primary")
            .with_metadata("region", "us");

        let instances = config.instances(&HealthStatus::healthy());
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].id, "user-1-0");
        assert_eq!(instances[1].id, "user-1-1");
        assert_eq!(instances[0].region(), Some("us"));
        assert_eq!(instances[1].region(), Some("eu"));
        assert!(instances[0].has_tag("primary"));
        assert!(instances.iter().all(|i| i.is_healthy()));
    }

    #[test]
    fn test_cache_key_includes_strategy() {
        let options = DiscoveryOptions::new()
            .with_tenant("acme")
            .with_version("v1")
            .with_strategy(LoadBalanceStrategy::LeastConnections);
        assert_eq!(
            options.cache_key("user-service"),
            "user-service:acme:v1:least_connections"
        );
        assert_eq!(
            DiscoveryOptions::new().cache_key("user-service"),
            "user-service:::round_robin"
        );
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let json = r#"{
            "name": "user-service",
            "version": "v1",
            "endpoints": [{"host": "10.0.0.1", "port": 8080}]
        }"#;
        let config: ServiceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.weight, 1);
        assert_eq!(config.endpoints[0].protocol, "http");
        assert!(config.health_check.is_none());
    }
}

//! Client-side service discovery core
//!
//! This library provides:
//! - Service, instance and discovery-option data model
//! - LRU+TTL discovery cache with an optional L1/L2 topology
//! - Load balancing strategies and balancer decorators
//! - Discovery store contract with an in-memory store
//! - Health monitoring and the service registry tying it all together

pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod instance;
pub mod load_balancer;
pub mod registry;
pub mod store;

pub use cache::{CacheStats, LruServiceCache, MultiTierServiceCache, ServiceCache};
pub use config::{CacheConfig, RegistryConfig};
pub use error::{CoreError, Result};
pub use health::{HealthCheckConfig, HealthManager, HealthReporter, TcpHealthMonitor};
pub use instance::{
    DiscoveryOptions, HealthState, HealthStatus, LoadBalanceStrategy, ServiceConfig,
    ServiceEndpoint, ServiceInstance,
};
pub use load_balancer::{
    HealthAwareLoadBalancer, LoadBalancer, LoadBalancerStats, StrategyLoadBalancer,
    WeightedLoadBalancer,
};
pub use registry::{RegistryStats, ServiceRegistry};
pub use store::{DiscoveryStore, MemoryStore};

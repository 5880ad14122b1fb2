//! Service registry: registration, cached discovery and instance selection

use crate::cache::{build_cache, CacheStats, ServiceCache};
use crate::config::RegistryConfig;
use crate::health::HealthManager;
use crate::instance::{DiscoveryOptions, ServiceConfig, ServiceInstance};
use crate::load_balancer::{
    HealthAwareLoadBalancer, LoadBalancer, LoadBalancerStats, StrategyLoadBalancer,
};
use crate::store::DiscoveryStore;
use crate::{CoreError, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// ServiceRegistry resolves service names into selected instances
pub struct ServiceRegistry {
    config: RegistryConfig,
    store: Arc<dyn DiscoveryStore>,
    cache: Option<Arc<dyn ServiceCache>>,
    balancer: Arc<dyn LoadBalancer>,
    health: Option<Arc<dyn HealthManager>>,
    // Map of registration id to the config it was registered with
    services: RwLock<HashMap<String, ServiceConfig>>,
}

/// Snapshot of registry state
#[derive(Clone, Debug)]
pub struct RegistryStats {
    pub registered_services: usize,
    pub cache: Option<CacheStats>,
    pub load_balancer: LoadBalancerStats,
}

impl ServiceRegistry {
    pub fn new(config: RegistryConfig, store: Arc<dyn DiscoveryStore>) -> Self {
        let mut strategies = StrategyLoadBalancer::new();
        if let Some(region) = &config.local_region {
            strategies = strategies.with_local_region(region.clone());
        }
        let balancer: Arc<dyn LoadBalancer> = Arc::new(HealthAwareLoadBalancer::new(
            Arc::new(strategies),
            config.stale_after,
        ));

        Self {
            cache: build_cache(&config.cache),
            config,
            store,
            balancer,
            health: None,
            services: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_load_balancer(mut self, balancer: Arc<dyn LoadBalancer>) -> Self {
        self.balancer = balancer;
        self
    }

    pub fn with_health_manager(mut self, health: Arc<dyn HealthManager>) -> Self {
        self.health = Some(health);
        self
    }

    /// Replace the cache built from configuration (`None` disables caching)
    pub fn with_cache(mut self, cache: Option<Arc<dyn ServiceCache>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<&Arc<dyn ServiceCache>> {
        self.cache.as_ref()
    }

    pub fn load_balancer(&self) -> &Arc<dyn LoadBalancer> {
        &self.balancer
    }

    /// Register or update a service, returning its registration id
    pub async fn register(&self, mut config: ServiceConfig) -> Result<String> {
        self.validate(&config)?;

        if config.id.is_empty() {
            config.id = uuid::Uuid::new_v4().to_string();
        }

        let now = Utc::now();
        let previous_created = self
            .services
            .read()
            .await
            .get(&config.id)
            .and_then(|existing| existing.created);
        config.created = previous_created.or(Some(now));
        config.last_seen = Some(now);

        self.store.register(&config).await?;
        self.services
            .write()
            .await
            .insert(config.id.clone(), config.clone());

        if let (Some(health), Some(check)) = (&self.health, &config.health_check) {
            if check.enabled {
                if let Err(e) = health.start_monitoring(&config).await {
                    warn!("Failed to start health monitoring for {}: {}", config.id, e);
                }
            }
        }

        info!(
            service = %config.name,
            version = %config.version,
            endpoints = config.endpoints.len(),
            "Registered service {}",
            config.id
        );
        Ok(config.id)
    }

    /// Deregister a service by registration id
    pub async fn deregister(&self, service_id: &str) -> Result<()> {
        self.store.deregister(service_id).await?;
        self.services.write().await.remove(service_id);

        if let Some(health) = &self.health {
            health.stop_monitoring(service_id).await;
        }

        info!("Deregistered service {}", service_id);
        Ok(())
    }

    /// Resolve a service name to one selected instance
    pub async fn discover(
        &self,
        service_name: &str,
        options: &DiscoveryOptions,
    ) -> Result<ServiceInstance> {
        let key = options.cache_key(service_name);

        let cached = self.cache.as_ref().and_then(|cache| cache.get(&key));
        let instances = match cached {
            Some(instances) => {
                debug!("Discovery cache hit for {}", key);
                instances
            }
            None => {
                let instances = self.lookup(service_name, options).await?;
                if let Some(cache) = &self.cache {
                    cache.set(&key, &instances, self.config.cache.default_ttl);
                }
                instances
            }
        };

        self.balancer
            .select(&instances, options.strategy)
            .ok_or_else(|| CoreError::NoSuitableInstances(service_name.to_string()))
    }

    /// Resolve a service name to every instance passing the filters, uncached
    pub async fn discover_all(
        &self,
        service_name: &str,
        options: &DiscoveryOptions,
    ) -> Result<Vec<ServiceInstance>> {
        self.lookup(service_name, options).await
    }

    /// Stream instance snapshots for a service from the backing store
    pub async fn watch(&self, service_name: &str) -> Result<mpsc::Receiver<Vec<ServiceInstance>>> {
        self.store.watch(service_name).await
    }

    /// Hand back a least-connections slot taken by `discover`
    pub fn release_connection(&self, instance_id: &str) {
        self.balancer.release_connection(instance_id);
    }

    /// Get a registered service config
    pub async fn get_service(&self, service_id: &str) -> Result<ServiceConfig> {
        let services = self.services.read().await;
        services
            .get(service_id)
            .cloned()
            .ok_or_else(|| CoreError::ServiceNotFound(service_id.to_string()))
    }

    /// List all registered service configs
    pub async fn list_services(&self) -> Vec<ServiceConfig> {
        let services = self.services.read().await;
        services.values().cloned().collect()
    }

    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            registered_services: self.services.read().await.len(),
            cache: self.cache.as_ref().map(|cache| cache.stats()),
            load_balancer: self.balancer.stats(),
        }
    }

    async fn lookup(
        &self,
        service_name: &str,
        options: &DiscoveryOptions,
    ) -> Result<Vec<ServiceInstance>> {
        let instances = self.store.discover(service_name).await?;
        let found = instances.len();
        let filtered = self.filter_instances(instances, options);

        if filtered.is_empty() {
            debug!(
                "All {} instances of {} were filtered out",
                found, service_name
            );
            return Err(CoreError::NoSuitableInstances(service_name.to_string()));
        }
        Ok(filtered)
    }

    /// Apply tenant, health, version, tag, region and size filters
    pub fn filter_instances(
        &self,
        instances: Vec<ServiceInstance>,
        options: &DiscoveryOptions,
    ) -> Vec<ServiceInstance> {
        let tenant = options.tenant_id.as_deref().unwrap_or("");

        let mut filtered: Vec<ServiceInstance> = instances
            .into_iter()
            .filter(|instance| !self.config.tenant_isolation || instance.tenant_id == tenant)
            .filter(|instance| options.include_unhealthy || instance.is_healthy())
            .filter(|instance| match &options.version {
                Some(version) => &instance.version == version,
                None => true,
            })
            .filter(|instance| options.tags.iter().all(|tag| instance.has_tag(tag)))
            .collect();

        if options.prefer_local {
            if let Some(region) = &options.region {
                if filtered
                    .iter()
                    .any(|instance| instance.region() == Some(region.as_str()))
                {
                    filtered.retain(|instance| instance.region() == Some(region.as_str()));
                }
            }
        }

        if options.max_instances > 0 {
            filtered.truncate(options.max_instances);
        }
        filtered
    }

    fn validate(&self, config: &ServiceConfig) -> Result<()> {
        if config.name.is_empty() {
            return Err(CoreError::InvalidConfiguration(
                "service name is required".to_string(),
            ));
        }
        if config.version.is_empty() {
            return Err(CoreError::InvalidConfiguration(format!(
                "version is required for service {}",
                config.name
            )));
        }
        if config.endpoints.is_empty() {
            return Err(CoreError::InvalidConfiguration(format!(
                "at least one endpoint is required for service {}",
                config.name
            )));
        }
        for (index, endpoint) in config.endpoints.iter().enumerate() {
            if endpoint.host.is_empty() {
                return Err(CoreError::InvalidConfiguration(format!(
                    "endpoint {} of service {} has no host",
                    index, config.name
                )));
            }
            if endpoint.port == 0 {
                return Err(CoreError::InvalidConfiguration(format!(
                    "endpoint {} of service {} has invalid port 0",
                    index, config.name
                )));
            }
        }
        if self.config.tenant_isolation && config.tenant_id.is_empty() {
            return Err(CoreError::InvalidConfiguration(format!(
                "tenant id is required for service {} when tenant isolation is enabled",
                config.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::health::HealthCheckConfig;
    use crate::instance::{HealthState, HealthStatus, LoadBalanceStrategy, ServiceEndpoint};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// MemoryStore wrapper counting backing-store lookups
    struct CountingStore {
        inner: MemoryStore,
        discovers: AtomicUsize,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                discovers: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DiscoveryStore for CountingStore {
        async fn register(&self, config: &ServiceConfig) -> Result<()> {
            self.inner.register(config).await
        }

        async fn deregister(&self, service_id: &str) -> Result<()> {
            self.inner.deregister(service_id).await
        }

        async fn discover(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
            self.discovers.fetch_add(1, Ordering::SeqCst);
            self.inner.discover(service_name).await
        }

        async fn watch(
            &self,
            service_name: &str,
        ) -> Result<mpsc::Receiver<Vec<ServiceInstance>>> {
            self.inner.watch(service_name).await
        }

        async fn health_check(&self, instance: &ServiceInstance) -> Result<HealthStatus> {
            self.inner.health_check(instance).await
        }
    }

    #[derive(Default)]
    struct RecordingHealthManager {
        started: tokio::sync::Mutex<Vec<String>>,
        stopped: tokio::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HealthManager for RecordingHealthManager {
        async fn start_monitoring(&self, config: &ServiceConfig) -> Result<()> {
            self.started.lock().await.push(config.id.clone());
            Ok(())
        }

        async fn stop_monitoring(&self, service_id: &str) {
            self.stopped.lock().await.push(service_id.to_string());
        }
    }

    fn user_service() -> ServiceConfig {
        ServiceConfig::new("user-service", "v1")
            .with_endpoint(ServiceEndpoint::new("10.0.0.1", 8080))
    }

    fn registry_with(store: Arc<dyn DiscoveryStore>) -> ServiceRegistry {
        ServiceRegistry::new(RegistryConfig::default(), store)
    }

    #[tokio::test]
    async fn test_discover_uses_cache_on_second_call() {
        let store = Arc::new(CountingStore::new());
        let registry = registry_with(store.clone());
        registry.register(user_service()).await.unwrap();

        let options = DiscoveryOptions::new().with_strategy(LoadBalanceStrategy::RoundRobin);
        let first = registry.discover("user-service", &options).await.unwrap();
        assert_eq!(store.discovers.load(Ordering::SeqCst), 1);

        let second = registry.discover("user-service", &options).await.unwrap();
        assert_eq!(store.discovers.load(Ordering::SeqCst), 1);

        assert_eq!(first.id, second.id);
        assert_eq!(first.endpoint.host, "10.0.0.1");
        assert_eq!(first.endpoint.port, 8080);

        let stats = registry.stats().await;
        let cache = stats.cache.unwrap();
        assert_eq!(cache.hits, 1);
        assert_eq!(cache.misses, 1);
        assert_eq!(stats.registered_services, 1);
    }

    #[tokio::test]
    async fn test_cache_key_separates_strategies() {
        let store = Arc::new(CountingStore::new());
        let registry = registry_with(store.clone());
        registry.register(user_service()).await.unwrap();

        let round_robin = DiscoveryOptions::new();
        let least = DiscoveryOptions::new().with_strategy(LoadBalanceStrategy::LeastConnections);
        registry.discover("user-service", &round_robin).await.unwrap();
        registry.discover("user-service", &least).await.unwrap();
        assert_eq!(store.discovers.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_discover_without_cache_always_hits_store() {
        let store = Arc::new(CountingStore::new());
        let config = RegistryConfig::default().with_cache(CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        });
        let registry = ServiceRegistry::new(config, store.clone());
        registry.register(user_service()).await.unwrap();

        let options = DiscoveryOptions::new();
        registry.discover("user-service", &options).await.unwrap();
        registry.discover("user-service", &options).await.unwrap();
        assert_eq!(store.discovers.load(Ordering::SeqCst), 2);
        assert!(registry.stats().await.cache.is_none());
    }

    #[tokio::test]
    async fn test_register_validation() {
        let registry = registry_with(Arc::new(MemoryStore::new()));

        let no_name = ServiceConfig::new("", "v1").with_endpoint(ServiceEndpoint::new("h", 1));
        assert!(registry.register(no_name).await.unwrap_err().is_validation());

        let no_version = ServiceConfig::new("svc", "").with_endpoint(ServiceEndpoint::new("h", 1));
        assert!(registry.register(no_version).await.unwrap_err().is_validation());

        let no_endpoints = ServiceConfig::new("svc", "v1");
        assert!(registry.register(no_endpoints).await.unwrap_err().is_validation());

        let no_host = ServiceConfig::new("svc", "v1").with_endpoint(ServiceEndpoint::new("", 80));
        assert!(registry.register(no_host).await.unwrap_err().is_validation());

        let zero_port = ServiceConfig::new("svc", "v1").with_endpoint(ServiceEndpoint::new("h", 0));
        assert!(registry.register(zero_port).await.unwrap_err().is_validation());

        assert!(registry.list_services().await.is_empty());
    }

    #[tokio::test]
    async fn test_tenant_isolation() {
        let config = RegistryConfig::default().with_tenant_isolation(true);
        let registry = ServiceRegistry::new(config, Arc::new(MemoryStore::new()));

        let err = registry.register(user_service()).await.unwrap_err();
        assert!(err.is_validation());

        registry
            .register(user_service().with_tenant("acme"))
            .await
            .unwrap();

        let acme = DiscoveryOptions::new().with_tenant("acme");
        assert!(registry.discover("user-service", &acme).await.is_ok());

        let other = DiscoveryOptions::new().with_tenant("globex");
        assert!(matches!(
            registry.discover("user-service", &other).await,
            Err(CoreError::NoSuitableInstances(_))
        ));
    }

    #[tokio::test]
    async fn test_register_assigns_id_and_keeps_created() {
        let registry = registry_with(Arc::new(MemoryStore::new()));

        let id = registry.register(user_service()).await.unwrap();
        assert!(!id.is_empty());
        let first = registry.get_service(&id).await.unwrap();
        assert!(first.created.is_some());

        let updated = user_service()
            .with_id(id.clone())
            .with_endpoint(ServiceEndpoint::new("10.0.0.2", 8080));
        registry.register(updated).await.unwrap();

        let second = registry.get_service(&id).await.unwrap();
        assert_eq!(second.created, first.created);
        assert_eq!(second.endpoints.len(), 2);
        assert_eq!(registry.list_services().await.len(), 1);
    }

    #[tokio::test]
    async fn test_deregister() {
        let registry = registry_with(Arc::new(MemoryStore::new()));
        let id = registry.register(user_service()).await.unwrap();

        registry.deregister(&id).await.unwrap();
        assert!(matches!(
            registry.get_service(&id).await,
            Err(CoreError::ServiceNotFound(_))
        ));
        assert!(registry
            .discover_all("user-service", &DiscoveryOptions::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_filters() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry_with(store.clone());

        registry
            .register(
                ServiceConfig::new("api", "v1")
                    .with_id("api-a")
                    .with_tag("primary")
                    .with_tag("http")
                    .with_endpoint(ServiceEndpoint::new("10.0.0.1", 80))
                    .with_endpoint(ServiceEndpoint::new("10.0.0.2", 80)),
            )
            .await
            .unwrap();
        registry
            .register(
                ServiceConfig::new("api", "v2")
                    .with_id("api-b")
                    .with_tag("http")
                    .with_endpoint(ServiceEndpoint::new("10.0.1.1", 80)),
            )
            .await
            .unwrap();
        store
            .set_health("api-a-1", HealthState::Unhealthy)
            .await
            .unwrap();

        let all = registry
            .discover_all("api", &DiscoveryOptions::new())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let with_unhealthy = registry
            .discover_all("api", &DiscoveryOptions::new().include_unhealthy(true))
            .await
            .unwrap();
        assert_eq!(with_unhealthy.len(), 3);

        let v2 = registry
            .discover_all("api", &DiscoveryOptions::new().with_version("v2"))
            .await
            .unwrap();
        assert_eq!(v2.len(), 1);
        assert_eq!(v2[0].id, "api-b-0");

        // Every required tag must be present
        let tagged = registry
            .discover_all(
                "api",
                &DiscoveryOptions::new().with_tag("primary").with_tag("http"),
            )
            .await
            .unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].id, "api-a-0");

        let limited = registry
            .discover_all(
                "api",
                &DiscoveryOptions::new()
                    .include_unhealthy(true)
                    .with_max_instances(2),
            )
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);

        assert!(matches!(
            registry
                .discover_all("api", &DiscoveryOptions::new().with_version("v3"))
                .await,
            Err(CoreError::NoSuitableInstances(_))
        ));
    }

    #[tokio::test]
    async fn test_region_preference() {
        let registry = registry_with(Arc::new(MemoryStore::new()));
        registry
            .register(
                ServiceConfig::new("api", "v1")
                    .with_id("api")
                    .with_endpoint(
                        ServiceEndpoint::new("10.0.0.1", 80).with_metadata("region", "us-east"),
                    )
                    .with_endpoint(
                        ServiceEndpoint::new("10.0.0.2", 80).with_metadata("region", "eu-west"),
                    ),
            )
            .await
            .unwrap();

        let local = DiscoveryOptions::new()
            .with_region("eu-west")
            .prefer_local(true);
        let instances = registry.discover_all("api", &local).await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].endpoint.host, "10.0.0.2");

        // No match keeps the full set
        let elsewhere = DiscoveryOptions::new()
            .with_region("ap-south")
            .prefer_local(true);
        assert_eq!(registry.discover_all("api", &elsewhere).await.unwrap().len(), 2);

        // Region alone is not a filter
        let unpreferred = DiscoveryOptions::new().with_region("eu-west");
        assert_eq!(
            registry.discover_all("api", &unpreferred).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_round_robin_through_registry() {
        let registry = registry_with(Arc::new(MemoryStore::new()));
        registry
            .register(
                ServiceConfig::new("api", "v1")
                    .with_id("api")
                    .with_endpoint(ServiceEndpoint::new("10.0.0.1", 80))
                    .with_endpoint(ServiceEndpoint::new("10.0.0.2", 80)),
            )
            .await
            .unwrap();

        let options = DiscoveryOptions::new();
        let first = registry.discover("api", &options).await.unwrap();
        let second = registry.discover("api", &options).await.unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_older_registration_is_still_selected() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry_with(store.clone());

        let mut old = ServiceConfig::new("api", "v1")
            .with_id("old")
            .with_endpoint(ServiceEndpoint::new("10.0.0.1", 80));
        old.last_seen = Some(Utc::now() - chrono::Duration::minutes(2));
        store.register(&old).await.unwrap();
        registry
            .register(
                ServiceConfig::new("api", "v1")
                    .with_id("new")
                    .with_endpoint(ServiceEndpoint::new("10.0.0.2", 80)),
            )
            .await
            .unwrap();

        let options = DiscoveryOptions::new().with_strategy(LoadBalanceStrategy::RoundRobin);
        let mut selected = std::collections::HashSet::new();
        for _ in 0..10 {
            selected.insert(registry.discover("api", &options).await.unwrap().id);
        }
        assert!(selected.contains("old-0"));
        assert!(selected.contains("new-0"));
    }

    #[tokio::test]
    async fn test_least_connections_release() {
        let registry = registry_with(Arc::new(MemoryStore::new()));
        registry
            .register(
                ServiceConfig::new("api", "v1")
                    .with_id("api")
                    .with_endpoint(ServiceEndpoint::new("10.0.0.1", 80))
                    .with_endpoint(ServiceEndpoint::new("10.0.0.2", 80)),
            )
            .await
            .unwrap();

        let options = DiscoveryOptions::new().with_strategy(LoadBalanceStrategy::LeastConnections);
        let first = registry.discover("api", &options).await.unwrap();
        let second = registry.discover("api", &options).await.unwrap();
        assert_ne!(first.id, second.id);

        // Releasing the first makes it the least loaded again
        registry.release_connection(&first.id);
        let third = registry.discover("api", &options).await.unwrap();
        assert_eq!(third.id, first.id);
    }

    #[tokio::test]
    async fn test_health_monitoring_lifecycle() {
        let health = Arc::new(RecordingHealthManager::default());
        let registry = registry_with(Arc::new(MemoryStore::new()))
            .with_health_manager(health.clone());

        let id = registry
            .register(user_service().with_health_check(HealthCheckConfig::default()))
            .await
            .unwrap();
        registry
            .register(user_service().with_id("unmonitored"))
            .await
            .unwrap();
        assert_eq!(*health.started.lock().await, vec![id.clone()]);

        registry.deregister(&id).await.unwrap();
        assert_eq!(*health.stopped.lock().await, vec![id]);
    }

    #[tokio::test]
    async fn test_watch_delegates_to_store() {
        let registry = registry_with(Arc::new(MemoryStore::new()));
        let mut updates = registry.watch("user-service").await.unwrap();
        assert!(updates.recv().await.unwrap().is_empty());

        registry.register(user_service()).await.unwrap();
        assert_eq!(updates.recv().await.unwrap().len(), 1);
    }
}

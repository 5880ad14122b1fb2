//! Backing discovery store contract and an in-memory implementation

use crate::health::HealthReporter;
use crate::instance::{HealthState, HealthStatus, ServiceConfig, ServiceInstance};
use crate::{CoreError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::debug;

const WATCH_CHANNEL_CAPACITY: usize = 16;

/// Backing store for service registrations (etcd, Consul, DNS, ...)
#[async_trait]
pub trait DiscoveryStore: Send + Sync {
    async fn register(&self, config: &ServiceConfig) -> Result<()>;

    async fn deregister(&self, service_id: &str) -> Result<()>;

    /// All instances of a service, healthy or not; empty when the name is unknown
    async fn discover(&self, service_name: &str) -> Result<Vec<ServiceInstance>>;

    /// Stream of instance snapshots, starting with the current one
    async fn watch(&self, service_name: &str) -> Result<mpsc::Receiver<Vec<ServiceInstance>>>;

    async fn health_check(&self, instance: &ServiceInstance) -> Result<HealthStatus>;
}

/// Process-local discovery store.
///
/// Registered instances start out healthy; health reports override that per
/// instance. Watchers are notified on every change to their service.
///
/// A registration held in process memory is live until it is deregistered, so
/// every snapshot stamps its instances' `last_seen` with the snapshot time.
pub struct MemoryStore {
    services: RwLock<HashMap<String, ServiceConfig>>,
    health: RwLock<HashMap<String, HealthStatus>>,
    watchers: Mutex<HashMap<String, Vec<mpsc::Sender<Vec<ServiceInstance>>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            health: RwLock::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Override the health of one instance and notify its watchers
    pub async fn set_health(&self, instance_id: &str, state: HealthState) -> Result<()> {
        let status = match state {
            HealthState::Unhealthy => HealthStatus::unhealthy("marked unhealthy"),
            other => HealthStatus::new(other),
        };
        self.apply_health(instance_id, status).await
    }

    pub async fn service_count(&self) -> usize {
        self.services.read().await.len()
    }

    async fn apply_health(&self, instance_id: &str, status: HealthStatus) -> Result<()> {
        let service_name = self
            .service_name_for_instance(instance_id)
            .await
            .ok_or_else(|| CoreError::ServiceNotFound(instance_id.to_string()))?;

        self.health
            .write()
            .await
            .insert(instance_id.to_string(), status);
        self.notify(&service_name).await;
        Ok(())
    }

    async fn service_name_for_instance(&self, instance_id: &str) -> Option<String> {
        let (service_id, _) = instance_id.rsplit_once('-')?;
        self.services
            .read()
            .await
            .get(service_id)
            .map(|config| config.name.clone())
    }

    async fn snapshot(&self, service_name: &str) -> Vec<ServiceInstance> {
        let services = self.services.read().await;
        let health = self.health.read().await;

        let mut configs: Vec<&ServiceConfig> = services
            .values()
            .filter(|config| config.name == service_name)
            .collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));

        let now = Utc::now();
        configs
            .into_iter()
            .flat_map(|config| config.instances(&HealthStatus::healthy()))
            .map(|mut instance| {
                if let Some(status) = health.get(&instance.id) {
                    instance.health = status.clone();
                }
                instance.last_seen = now;
                instance
            })
            .collect()
    }

    async fn notify(&self, service_name: &str) {
        let snapshot = self.snapshot(service_name).await;
        let mut watchers = self.watchers.lock().await;
        if let Some(senders) = watchers.get_mut(service_name) {
            senders.retain(|sender| !sender.is_closed());
            for sender in senders.iter() {
                if sender.try_send(snapshot.clone()).is_err() {
                    debug!("Watcher for {} is lagging, dropping update", service_name);
                }
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DiscoveryStore for MemoryStore {
    async fn register(&self, config: &ServiceConfig) -> Result<()> {
        let previous = self
            .services
            .write()
            .await
            .insert(config.id.clone(), config.clone());

        // A renamed re-registration leaves watchers of the old name stale otherwise
        if let Some(previous) = previous {
            if previous.endpoints.len() > config.endpoints.len() {
                let mut health = self.health.write().await;
                for index in config.endpoints.len()..previous.endpoints.len() {
                    health.remove(&format!("{}-{}", config.id, index));
                }
            }
            if previous.name != config.name {
                self.notify(&previous.name).await;
            }
        }
        self.notify(&config.name).await;
        debug!("Stored service {} ({})", config.id, config.name);
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> Result<()> {
        let removed = self
            .services
            .write()
            .await
            .remove(service_id)
            .ok_or_else(|| CoreError::ServiceNotFound(service_id.to_string()))?;

        {
            let mut health = self.health.write().await;
            for index in 0..removed.endpoints.len() {
                health.remove(&format!("{}-{}", service_id, index));
            }
        }
        self.notify(&removed.name).await;
        Ok(())
    }

    async fn discover(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        Ok(self.snapshot(service_name).await)
    }

    async fn watch(&self, service_name: &str) -> Result<mpsc::Receiver<Vec<ServiceInstance>>> {
        let (sender, receiver) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let snapshot = self.snapshot(service_name).await;
        sender
            .try_send(snapshot)
            .map_err(|e| CoreError::Internal(format!("watch channel: {}", e)))?;

        self.watchers
            .lock()
            .await
            .entry(service_name.to_string())
            .or_default()
            .push(sender);
        Ok(receiver)
    }

    async fn health_check(&self, instance: &ServiceInstance) -> Result<HealthStatus> {
        Ok(self
            .health
            .read()
            .await
            .get(&instance.id)
            .cloned()
            .unwrap_or_else(HealthStatus::healthy))
    }
}

#[async_trait]
impl HealthReporter for MemoryStore {
    async fn report(&self, instance_id: &str, status: HealthStatus) {
        if let Err(e) = self.apply_health(instance_id, status).await {
            debug!("Dropping health report for {}: {}", instance_id, e);
        }
    }
}

//! Health monitoring for registered service endpoints

use crate::instance::{HealthState, HealthStatus, ServiceConfig, ServiceEndpoint};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

/// Health check configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    /// Interval between health checks
    pub interval_ms: u64,
    /// Timeout for a single health check
    pub timeout_ms: u64,
    /// Number of consecutive failures before marking unhealthy
    pub unhealthy_threshold: u32,
    /// Number of consecutive successes before marking healthy
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 10_000,
            timeout_ms: 5_000,
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}

/// Runs health checks for registered services
#[async_trait]
pub trait HealthManager: Send + Sync {
    /// Begin monitoring every endpoint of `config`; replaces any monitor for the same ID
    async fn start_monitoring(&self, config: &ServiceConfig) -> Result<()>;

    async fn stop_monitoring(&self, service_id: &str);
}

/// Receives health transitions, typically to feed them back into a discovery store
#[async_trait]
pub trait HealthReporter: Send + Sync {
    async fn report(&self, instance_id: &str, status: HealthStatus);
}

/// Counts consecutive results and flips state once a threshold is crossed
#[derive(Debug)]
struct ThresholdTracker {
    state: HealthState,
    consecutive_successes: u32,
    consecutive_failures: u32,
}

impl ThresholdTracker {
    fn new() -> Self {
        Self {
            state: HealthState::Unknown,
            consecutive_successes: 0,
            consecutive_failures: 0,
        }
    }

    /// Record one probe result, returning the new state on a transition
    fn record(&mut self, healthy: bool, config: &HealthCheckConfig) -> Option<HealthState> {
        if healthy {
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
            if self.state != HealthState::Healthy
                && self.consecutive_successes >= config.healthy_threshold.max(1)
            {
                self.state = HealthState::Healthy;
                return Some(self.state);
            }
        } else {
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
            if self.state != HealthState::Unhealthy
                && self.consecutive_failures >= config.unhealthy_threshold.max(1)
            {
                self.state = HealthState::Unhealthy;
                return Some(self.state);
            }
        }
        None
    }
}

/// Check if an endpoint accepts TCP connections within `timeout`
pub async fn check_endpoint(endpoint: &ServiceEndpoint, timeout: Duration) -> bool {
    let address = (endpoint.host.as_str(), endpoint.port);
    match time::timeout(timeout, tokio::net::TcpStream::connect(address)).await {
        Ok(Ok(_)) => {
            debug!("Endpoint {}:{} is healthy", endpoint.host, endpoint.port);
            true
        }
        Ok(Err(e)) => {
            warn!("Endpoint {}:{} health check error: {}", endpoint.host, endpoint.port, e);
            false
        }
        Err(_) => {
            warn!("Endpoint {}:{} health check timeout", endpoint.host, endpoint.port);
            false
        }
    }
}

/// Health manager that probes endpoints with TCP connects on a fixed interval.
///
/// One background task is spawned per registered service and aborted on
/// [`HealthManager::stop_monitoring`] or when the monitor is dropped.
pub struct TcpHealthMonitor {
    reporter: Option<Arc<dyn HealthReporter>>,
    statuses: Arc<RwLock<HashMap<String, HealthStatus>>>,
    tasks: Mutex<HashMap<String, MonitorTask>>,
}

/// Background checker of one service and the instances it owns
struct MonitorTask {
    handle: JoinHandle<()>,
    instance_ids: Vec<String>,
}

impl TcpHealthMonitor {
    pub fn new() -> Self {
        Self {
            reporter: None,
            statuses: Arc::new(RwLock::new(HashMap::new())),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Forward every health transition to `reporter`
    pub fn with_reporter(mut self, reporter: Arc<dyn HealthReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Last known status of an instance
    pub async fn status(&self, instance_id: &str) -> Option<HealthStatus> {
        self.statuses.read().await.get(instance_id).cloned()
    }

    pub fn monitored_services(&self) -> usize {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Default for TcpHealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TcpHealthMonitor {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, task) in tasks.drain() {
            task.handle.abort();
        }
    }
}

#[async_trait]
impl HealthManager for TcpHealthMonitor {
    async fn start_monitoring(&self, config: &ServiceConfig) -> Result<()> {
        let check = match &config.health_check {
            Some(check) if check.enabled => check.clone(),
            _ => return Ok(()),
        };

        let instances = config.instances(&HealthStatus::default());
        let instance_ids: Vec<String> = instances.iter().map(|i| i.id.clone()).collect();
        let statuses = self.statuses.clone();
        let reporter = self.reporter.clone();
        let service_id = config.id.clone();

        info!(
            "Health monitoring started for {} ({} endpoints, interval {:?})",
            service_id,
            instances.len(),
            check.interval()
        );

        let handle = tokio::spawn(async move {
            let mut trackers: HashMap<String, ThresholdTracker> = instances
                .iter()
                .map(|i| (i.id.clone(), ThresholdTracker::new()))
                .collect();
            let mut ticker = time::interval(check.interval());

            loop {
                ticker.tick().await;
                for instance in &instances {
                    let healthy = check_endpoint(&instance.endpoint, check.timeout()).await;
                    let transition = trackers
                        .get_mut(&instance.id)
                        .and_then(|tracker| tracker.record(healthy, &check));

                    if let Some(state) = transition {
                        let status = match state {
                            HealthState::Unhealthy => HealthStatus::unhealthy(format!(
                                "{} consecutive failed checks",
                                check.unhealthy_threshold
                            )),
                            other => HealthStatus::new(other),
                        };
                        info!("Instance {} is now {}", instance.id, state);
                        statuses
                            .write()
                            .await
                            .insert(instance.id.clone(), status.clone());
                        if let Some(reporter) = &reporter {
                            reporter.report(&instance.id, status).await;
                        }
                    }
                }
            }
        });

        let previous = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                config.id.clone(),
                MonitorTask {
                    handle,
                    instance_ids: instance_ids.clone(),
                },
            );
        if let Some(previous) = previous {
            previous.handle.abort();
            let mut statuses = self.statuses.write().await;
            for id in previous.instance_ids.iter().filter(|id| !instance_ids.contains(id)) {
                statuses.remove(id);
            }
        }
        Ok(())
    }

    async fn stop_monitoring(&self, service_id: &str) {
        let task = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(service_id);
        let Some(task) = task else {
            return;
        };
        task.handle.abort();

        let mut statuses = self.statuses.write().await;
        for id in &task.instance_ids {
            statuses.remove(id);
        }
        debug!("Health monitoring stopped for {}", service_id);
    }
}

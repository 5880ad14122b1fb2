use anyhow::{Context, Result};
use lift_core::config::env_parse;
use lift_core::{
    DiscoveryOptions, MemoryStore, RegistryConfig, ServiceConfig, ServiceRegistry,
    TcpHealthMonitor,
};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(30);

/// Services to register at startup
#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    services: Vec<ServiceConfig>,
}

impl Manifest {
    fn parse(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).context("invalid service manifest")
    }

    fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&contents)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting service-discovery daemon...");

    let manifest = match manifest_path() {
        Some(path) => {
            info!("Loading services from {}", path.display());
            Manifest::load(&path)?
        }
        None => {
            warn!("No manifest given (LIFT_SERVICES_FILE or first argument); starting empty");
            Manifest { services: vec![] }
        }
    };

    let store = Arc::new(MemoryStore::new());
    let monitor = Arc::new(TcpHealthMonitor::new().with_reporter(store.clone()));
    let registry = Arc::new(
        ServiceRegistry::new(RegistryConfig::from_env(), store).with_health_manager(monitor),
    );

    let registered = register_services(&registry, manifest.services).await;
    info!("Registered {} services", registered);

    let interval = env_parse("LIFT_DISCOVERY_INTERVAL_SECS")
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_DISCOVERY_INTERVAL);
    let mut ticker = tokio::time::interval(interval);

    // Periodic discovery loop
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let resolved = discover_services(&registry).await;
                debug!("Resolved {} instances", resolved);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down service-discovery daemon");
                break;
            }
        }
    }

    Ok(())
}

fn manifest_path() -> Option<PathBuf> {
    std::env::var("LIFT_SERVICES_FILE")
        .ok()
        .filter(|p| !p.is_empty())
        .or_else(|| std::env::args().nth(1))
        .map(PathBuf::from)
}

async fn register_services(registry: &ServiceRegistry, services: Vec<ServiceConfig>) -> usize {
    let mut count = 0;
    for service in services {
        let name = service.name.clone();
        match registry.register(service).await {
            Ok(id) => {
                debug!("Registered {} as {}", name, id);
                count += 1;
            }
            Err(e) => error!("Failed to register {}: {}", name, e),
        }
    }
    count
}

/// Resolve every registered service, logging what is reachable
async fn discover_services(registry: &ServiceRegistry) -> usize {
    if let Some(cache) = registry.cache() {
        cache.purge_expired();
    }

    let names: BTreeSet<String> = registry
        .list_services()
        .await
        .into_iter()
        .map(|service| service.name)
        .collect();

    let mut total = 0;
    for name in &names {
        let options = DiscoveryOptions::new().include_unhealthy(true);
        match registry.discover_all(name, &options).await {
            Ok(instances) => {
                let healthy = instances.iter().filter(|i| i.is_healthy()).count();
                info!(
                    service = %name,
                    instances = instances.len(),
                    healthy,
                    "Service resolved"
                );
                total += instances.len();
            }
            Err(e) => warn!(service = %name, "Discovery failed: {}", e),
        }
    }

    let stats = registry.stats().await;
    if let Some(cache) = &stats.cache {
        debug!(
            entries = cache.size,
            hit_rate = cache.hit_rate(),
            evictions = cache.evictions,
            "Cache stats"
        );
    }
    debug!(
        services = stats.registered_services,
        selections = stats.load_balancer.total_requests,
        "Registry stats"
    );

    total
}

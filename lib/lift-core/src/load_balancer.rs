//! Load balancing strategies for choosing one instance out of a discovered set

use crate::instance::{LoadBalanceStrategy, ServiceInstance};
use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

/// Instance selection over a set of candidates
pub trait LoadBalancer: Send + Sync {
    /// Pick one instance, or `None` when `instances` is empty
    fn select(
        &self,
        instances: &[ServiceInstance],
        strategy: LoadBalanceStrategy,
    ) -> Option<ServiceInstance>;

    fn update_weights(&self, instances: &[ServiceInstance]);

    /// Give back a slot taken by a least-connections selection.
    ///
    /// Selection never releases on its own; a caller that skips this keeps the
    /// instance looking busier than it is.
    fn release_connection(&self, instance_id: &str);

    fn stats(&self) -> LoadBalancerStats;
}

/// Selection counters
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadBalancerStats {
    pub total_requests: u64,
    pub successful_selections: u64,
    pub failed_selections: u64,
    pub total_latency: Duration,
    pub tracked_services: usize,
    pub tracked_instances: usize,
}

impl LoadBalancerStats {
    pub fn average_latency(&self) -> Duration {
        if self.total_requests == 0 {
            Duration::ZERO
        } else {
            let nanos = self.total_latency.as_nanos() / u128::from(self.total_requests);
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        }
    }
}

type CounterMap = RwLock<HashMap<String, Arc<AtomicUsize>>>;

/// Look up a counter, creating it on first sight.
///
/// The write lock is only taken for registration; the counter itself is
/// updated atomically after the map lock is released.
fn counter(map: &CounterMap, key: &str) -> Arc<AtomicUsize> {
    if let Some(existing) = map
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(key)
    {
        return existing.clone();
    }

    map.write()
        .unwrap_or_else(PoisonError::into_inner)
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
        .clone()
}

fn effective_weight(weight: i32) -> u64 {
    if weight <= 0 {
        1
    } else {
        weight as u64
    }
}

/// Load balancer implementing every [`LoadBalanceStrategy`].
///
/// Round-robin counters are keyed by service name and live as long as the
/// balancer, so a service keeps cycling even when its instance list is rebuilt
/// between calls. Least-connections counters are keyed by instance ID.
pub struct StrategyLoadBalancer {
    round_robin: CounterMap,
    connections: CounterMap,
    local_region: Option<String>,
    total_requests: AtomicU64,
    successful_selections: AtomicU64,
    failed_selections: AtomicU64,
    total_latency_nanos: AtomicU64,
}

impl StrategyLoadBalancer {
    pub fn new() -> Self {
        Self {
            round_robin: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            local_region: None,
            total_requests: AtomicU64::new(0),
            successful_selections: AtomicU64::new(0),
            failed_selections: AtomicU64::new(0),
            total_latency_nanos: AtomicU64::new(0),
        }
    }

    /// Region preferred by [`LoadBalanceStrategy::LocalFirst`]
    pub fn with_local_region(mut self, region: impl Into<String>) -> Self {
        self.local_region = Some(region.into());
        self
    }

    /// Current least-connections count for an instance
    pub fn connection_count(&self, instance_id: &str) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instance_id)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn select_by_strategy<'a>(
        &self,
        candidates: &[&'a ServiceInstance],
        strategy: LoadBalanceStrategy,
    ) -> Option<&'a ServiceInstance> {
        match strategy {
            LoadBalanceStrategy::RoundRobin => self.select_round_robin(candidates),
            LoadBalanceStrategy::WeightedRandom => self.select_weighted_random(candidates),
            LoadBalanceStrategy::LeastConnections => self.select_least_connections(candidates),
            LoadBalanceStrategy::HealthyFirst => self.select_healthy_first(candidates),
            LoadBalanceStrategy::LocalFirst => self.select_local_first(candidates),
        }
    }

    /// Select instance using a per-service round-robin counter
    fn select_round_robin<'a>(
        &self,
        candidates: &[&'a ServiceInstance],
    ) -> Option<&'a ServiceInstance> {
        let first = candidates.first()?;
        let current =
            counter(&self.round_robin, &first.service_name).fetch_add(1, Ordering::SeqCst);
        candidates.get(current % candidates.len()).copied()
    }

    /// Select instance with probability proportional to weight
    fn select_weighted_random<'a>(
        &self,
        candidates: &[&'a ServiceInstance],
    ) -> Option<&'a ServiceInstance> {
        if candidates.is_empty() {
            return None;
        }

        let total_weight: u64 = candidates.iter().map(|i| effective_weight(i.weight)).sum();
        let mut rng = rand::thread_rng();
        if total_weight == 0 {
            return candidates.get(rng.gen_range(0..candidates.len())).copied();
        }

        let mut draw = rng.gen_range(0..total_weight);
        for candidate in candidates {
            let weight = effective_weight(candidate.weight);
            if draw < weight {
                return Some(*candidate);
            }
            draw -= weight;
        }
        candidates.last().copied()
    }

    /// Select instance with the fewest outstanding selections (first seen wins ties)
    fn select_least_connections<'a>(
        &self,
        candidates: &[&'a ServiceInstance],
    ) -> Option<&'a ServiceInstance> {
        let mut best: Option<(&'a ServiceInstance, Arc<AtomicUsize>, usize)> = None;
        for candidate in candidates {
            let count = counter(&self.connections, &candidate.id);
            let load = count.load(Ordering::SeqCst);
            let better = match &best {
                Some((_, _, best_load)) => load < *best_load,
                None => true,
            };
            if better {
                best = Some((*candidate, count, load));
            }
        }

        let (selected, count, _) = best?;
        count.fetch_add(1, Ordering::SeqCst);
        Some(selected)
    }

    /// Round-robin over healthy instances; unhealthy ones only when nothing is healthy
    fn select_healthy_first<'a>(
        &self,
        candidates: &[&'a ServiceInstance],
    ) -> Option<&'a ServiceInstance> {
        let (healthy, unhealthy): (Vec<&'a ServiceInstance>, Vec<&'a ServiceInstance>) =
            candidates.iter().copied().partition(|i| i.is_healthy());

        if healthy.is_empty() {
            debug!("No healthy instances, falling back to unhealthy set");
            self.select_round_robin(&unhealthy)
        } else {
            self.select_round_robin(&healthy)
        }
    }

    /// Round-robin over instances in the local region, or over all of them
    fn select_local_first<'a>(
        &self,
        candidates: &[&'a ServiceInstance],
    ) -> Option<&'a ServiceInstance> {
        if let Some(region) = &self.local_region {
            let local: Vec<&'a ServiceInstance> = candidates
                .iter()
                .copied()
                .filter(|i| i.region() == Some(region.as_str()))
                .collect();
            if !local.is_empty() {
                return self.select_round_robin(&local);
            }
        }
        self.select_round_robin(candidates)
    }

    fn record(&self, started: Instant, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_selections.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_selections.fetch_add(1, Ordering::Relaxed);
        }
        let nanos = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.total_latency_nanos.fetch_add(nanos, Ordering::Relaxed);
    }
}

impl Default for StrategyLoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for StrategyLoadBalancer {
    fn select(
        &self,
        instances: &[ServiceInstance],
        strategy: LoadBalanceStrategy,
    ) -> Option<ServiceInstance> {
        let started = Instant::now();
        let candidates: Vec<&ServiceInstance> = instances.iter().collect();
        let selected = self.select_by_strategy(&candidates, strategy).cloned();
        self.record(started, selected.is_some());

        if let Some(instance) = &selected {
            debug!(
                service = %instance.service_name,
                instance_id = %instance.id,
                strategy = %strategy,
                "Selected instance"
            );
        }
        selected
    }

    /// Registers least-connections counters ahead of the first selection
    fn update_weights(&self, instances: &[ServiceInstance]) {
        for instance in instances {
            counter(&self.connections, &instance.id);
        }
    }

    fn release_connection(&self, instance_id: &str) {
        let count = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instance_id)
            .cloned();

        if let Some(count) = count {
            // Compare-and-swap loop; stays at zero instead of wrapping
            let _ = count.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1));
        }
    }

    fn stats(&self) -> LoadBalancerStats {
        LoadBalancerStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_selections: self.successful_selections.load(Ordering::Relaxed),
            failed_selections: self.failed_selections.load(Ordering::Relaxed),
            total_latency: Duration::from_nanos(self.total_latency_nanos.load(Ordering::Relaxed)),
            tracked_services: self
                .round_robin
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            tracked_instances: self
                .connections
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }
}

/// Skips instances that have not been seen recently.
///
/// When every instance is stale the unfiltered set is used instead, since a
/// possibly-stale instance beats no instance at all.
pub struct HealthAwareLoadBalancer {
    inner: Arc<dyn LoadBalancer>,
    stale_after: Duration,
}

impl HealthAwareLoadBalancer {
    pub fn new(inner: Arc<dyn LoadBalancer>, stale_after: Duration) -> Self {
        Self { inner, stale_after }
    }

    fn is_fresh(&self, instance: &ServiceInstance) -> bool {
        // A last-seen time in the future counts as fresh
        match (Utc::now() - instance.last_seen).to_std() {
            Ok(age) => age <= self.stale_after,
            Err(_) => true,
        }
    }
}

impl LoadBalancer for HealthAwareLoadBalancer {
    fn select(
        &self,
        instances: &[ServiceInstance],
        strategy: LoadBalanceStrategy,
    ) -> Option<ServiceInstance> {
        let fresh: Vec<ServiceInstance> = instances
            .iter()
            .filter(|i| self.is_fresh(i))
            .cloned()
            .collect();

        if fresh.is_empty() {
            if !instances.is_empty() {
                debug!("All {} instances are stale, using unfiltered set", instances.len());
            }
            self.inner.select(instances, strategy)
        } else {
            self.inner.select(&fresh, strategy)
        }
    }

    fn update_weights(&self, instances: &[ServiceInstance]) {
        self.inner.update_weights(instances);
    }

    fn release_connection(&self, instance_id: &str) {
        self.inner.release_connection(instance_id);
    }

    fn stats(&self) -> LoadBalancerStats {
        self.inner.stats()
    }
}

/// Overlays externally managed per-instance weights before delegating
pub struct WeightedLoadBalancer {
    inner: Arc<dyn LoadBalancer>,
    weights: RwLock<HashMap<String, i32>>,
}

impl WeightedLoadBalancer {
    pub fn new(inner: Arc<dyn LoadBalancer>) -> Self {
        Self {
            inner,
            weights: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_weight(&self, instance_id: impl Into<String>, weight: i32) {
        self.weights
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(instance_id.into(), weight);
    }

    /// Weight for an instance; 1 when none has been set
    pub fn weight(&self, instance_id: &str) -> i32 {
        self.weights
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instance_id)
            .copied()
            .unwrap_or(1)
    }

    pub fn remove_weight(&self, instance_id: &str) {
        self.weights
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(instance_id);
    }
}

impl LoadBalancer for WeightedLoadBalancer {
    fn select(
        &self,
        instances: &[ServiceInstance],
        strategy: LoadBalanceStrategy,
    ) -> Option<ServiceInstance> {
        let weighted: Vec<ServiceInstance> = instances
            .iter()
            .map(|instance| {
                let mut instance = instance.clone();
                instance.weight = self.weight(&instance.id);
                instance
            })
            .collect();
        self.inner.select(&weighted, strategy)
    }

    /// Adopt each instance's advertised weight as its override
    fn update_weights(&self, instances: &[ServiceInstance]) {
        {
            let mut weights = self.weights.write().unwrap_or_else(PoisonError::into_inner);
            for instance in instances {
                weights.insert(instance.id.clone(), instance.weight);
            }
        }
        self.inner.update_weights(instances);
    }

    fn release_connection(&self, instance_id: &str) {
        self.inner.release_connection(instance_id);
    }

    fn stats(&self) -> LoadBalancerStats {
        self.inner.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{HealthStatus, ServiceEndpoint};
    use std::collections::HashMap;

    fn instances(service: &str, count: usize) -> Vec<ServiceInstance> {
        (0..count)
            .map(|i| {
                ServiceInstance::new(
                    format!("{}-{}", service, i),
                    service,
                    ServiceEndpoint::new(format!("10.0.0.{}", i + 1), 8080),
                )
            })
            .collect()
    }

    #[test]
    fn test_empty_input_returns_none() {
        let lb = StrategyLoadBalancer::new();
        assert!(lb.select(&[], LoadBalanceStrategy::RoundRobin).is_none());
        assert!(lb.select(&[], LoadBalanceStrategy::LeastConnections).is_none());

        let stats = lb.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.failed_selections, 2);
        assert_eq!(stats.successful_selections, 0);
    }

    #[test]
    fn test_round_robin_visits_each_instance_in_order() {
        let lb = StrategyLoadBalancer::new();
        let pool = instances("user-service", 4);

        let selected: Vec<String> = (0..4)
            .map(|_| lb.select(&pool, LoadBalanceStrategy::RoundRobin).unwrap().id)
            .collect();
        assert_eq!(
            selected,
            vec!["user-service-0", "user-service-1", "user-service-2", "user-service-3"]
        );
    }

    #[test]
    fn test_round_robin_counter_survives_rebuilt_slices() {
        let lb = StrategyLoadBalancer::new();
        let first = lb
            .select(&instances("svc", 3), LoadBalanceStrategy::RoundRobin)
            .unwrap();
        let second = lb
            .select(&instances("svc", 3), LoadBalanceStrategy::RoundRobin)
            .unwrap();
        assert_eq!(first.id, "svc-0");
        assert_eq!(second.id, "svc-1");
    }

    #[test]
    fn test_round_robin_counters_are_per_service() {
        let lb = StrategyLoadBalancer::new();
        lb.select(&instances("a", 2), LoadBalanceStrategy::RoundRobin);
        let b = lb
            .select(&instances("b", 2), LoadBalanceStrategy::RoundRobin)
            .unwrap();
        assert_eq!(b.id, "b-0");
        assert_eq!(lb.stats().tracked_services, 2);
    }

    #[test]
    fn test_round_robin_concurrent_fairness() {
        let lb = Arc::new(StrategyLoadBalancer::new());
        let pool = Arc::new(instances("svc", 4));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lb = lb.clone();
                let pool = pool.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| lb.select(&pool, LoadBalanceStrategy::RoundRobin).unwrap().id)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                *counts.entry(id).or_insert(0) += 1;
            }
        }
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|&c| c == 200));
        assert_eq!(lb.stats().successful_selections, 800);
    }

    #[test]
    fn test_weighted_random_stays_within_input() {
        let lb = StrategyLoadBalancer::new();
        let pool: Vec<ServiceInstance> = instances("svc", 3)
            .into_iter()
            .zip([5, 0, -3])
            .map(|(i, w)| i.with_weight(w))
            .collect();

        for _ in 0..500 {
            let selected = lb.select(&pool, LoadBalanceStrategy::WeightedRandom).unwrap();
            assert!(pool.iter().any(|i| i.id == selected.id));
        }
    }

    #[test]
    fn test_weighted_random_zero_weight_defaults_to_one() {
        let lb = StrategyLoadBalancer::new();
        let pool = vec![
            instances("svc", 2)[0].clone().with_weight(0),
            instances("svc", 2)[1].clone().with_weight(1),
        ];

        let zero_weight_hits = (0..2000)
            .filter(|_| {
                lb.select(&pool, LoadBalanceStrategy::WeightedRandom).unwrap().id == "svc-0"
            })
            .count();
        // Both instances carry an effective weight of 1
        assert!(zero_weight_hits > 700, "got {}", zero_weight_hits);
        assert!(zero_weight_hits < 1300, "got {}", zero_weight_hits);
    }

    #[test]
    fn test_weighted_random_prefers_heavier_instances() {
        let lb = StrategyLoadBalancer::new();
        let pool = vec![
            instances("svc", 2)[0].clone().with_weight(9),
            instances("svc", 2)[1].clone().with_weight(1),
        ];

        let heavy_hits = (0..2000)
            .filter(|_| {
                lb.select(&pool, LoadBalanceStrategy::WeightedRandom).unwrap().id == "svc-0"
            })
            .count();
        assert!(heavy_hits > 1600, "got {}", heavy_hits);
    }

    #[test]
    fn test_least_connections_counts_selections() {
        let lb = StrategyLoadBalancer::new();
        let pool = instances("svc", 3);

        let order: Vec<String> = (0..6)
            .map(|_| lb.select(&pool, LoadBalanceStrategy::LeastConnections).unwrap().id)
            .collect();
        // Ties go to the first instance seen
        assert_eq!(order, vec!["svc-0", "svc-1", "svc-2", "svc-0", "svc-1", "svc-2"]);
        for instance in &pool {
            assert_eq!(lb.connection_count(&instance.id), 2);
        }
    }

    #[test]
    fn test_least_connections_prefers_released_instance() {
        let lb = StrategyLoadBalancer::new();
        let pool = instances("svc", 2);

        lb.select(&pool, LoadBalanceStrategy::LeastConnections);
        lb.select(&pool, LoadBalanceStrategy::LeastConnections);
        lb.release_connection("svc-1");

        let next = lb.select(&pool, LoadBalanceStrategy::LeastConnections).unwrap();
        assert_eq!(next.id, "svc-1");
    }

    #[test]
    fn test_release_never_goes_negative() {
        let lb = StrategyLoadBalancer::new();
        let pool = instances("svc", 1);

        lb.select(&pool, LoadBalanceStrategy::LeastConnections);
        lb.release_connection("svc-0");
        lb.release_connection("svc-0");
        lb.release_connection("svc-0");
        assert_eq!(lb.connection_count("svc-0"), 0);

        // Unknown instances are ignored
        lb.release_connection("missing");
        assert_eq!(lb.connection_count("missing"), 0);
    }

    #[test]
    fn test_update_weights_registers_counters() {
        let lb = StrategyLoadBalancer::new();
        lb.update_weights(&instances("svc", 3));
        assert_eq!(lb.stats().tracked_instances, 3);
    }

    #[test]
    fn test_healthy_first_skips_unhealthy() {
        let lb = StrategyLoadBalancer::new();
        let mut pool = instances("svc", 3);
        pool[0].health = HealthStatus::unhealthy("down");
        pool[2].health = HealthStatus::unhealthy("down");

        for _ in 0..5 {
            let selected = lb.select(&pool, LoadBalanceStrategy::HealthyFirst).unwrap();
            assert_eq!(selected.id, "svc-1");
        }
    }

    #[test]
    fn test_healthy_first_falls_back_to_unhealthy() {
        let lb = StrategyLoadBalancer::new();
        let pool: Vec<ServiceInstance> = instances("svc", 2)
            .into_iter()
            .map(|i| i.with_health(HealthStatus::unhealthy("down")))
            .collect();

        assert!(lb.select(&pool, LoadBalanceStrategy::HealthyFirst).is_some());
    }

    #[test]
    fn test_local_first_prefers_local_region() {
        let lb = StrategyLoadBalancer::new().with_local_region("eu-west");
        let pool = vec![
            instances("svc", 3)[0].clone().with_metadata("region", "us-east"),
            instances("svc", 3)[1].clone().with_metadata("region", "eu-west"),
            instances("svc", 3)[2].clone().with_metadata("region", "us-east"),
        ];

        for _ in 0..4 {
            let selected = lb.select(&pool, LoadBalanceStrategy::LocalFirst).unwrap();
            assert_eq!(selected.id, "svc-1");
        }
    }

    #[test]
    fn test_local_first_degrades_to_round_robin() {
        let lb = StrategyLoadBalancer::new();
        let pool = instances("svc", 2);
        let first = lb.select(&pool, LoadBalanceStrategy::LocalFirst).unwrap();
        let second = lb.select(&pool, LoadBalanceStrategy::LocalFirst).unwrap();
        assert_eq!(first.id, "svc-0");
        assert_eq!(second.id, "svc-1");
    }

    #[test]
    fn test_health_aware_skips_stale_instances() {
        let base = Arc::new(StrategyLoadBalancer::new());
        let lb = HealthAwareLoadBalancer::new(base, Duration::from_secs(60));

        let mut pool = instances("svc", 2);
        pool[0].last_seen = Utc::now() - chrono::Duration::minutes(10);

        for _ in 0..4 {
            let selected = lb.select(&pool, LoadBalanceStrategy::RoundRobin).unwrap();
            assert_eq!(selected.id, "svc-1");
        }
    }

    #[test]
    fn test_health_aware_falls_back_when_all_stale() {
        let base = Arc::new(StrategyLoadBalancer::new());
        let lb = HealthAwareLoadBalancer::new(base, Duration::from_secs(60));

        let pool: Vec<ServiceInstance> = instances("svc", 2)
            .into_iter()
            .map(|i| i.with_last_seen(Utc::now() - chrono::Duration::hours(1)))
            .collect();
        assert!(lb.select(&pool, LoadBalanceStrategy::RoundRobin).is_some());
        assert!(lb.select(&[], LoadBalanceStrategy::RoundRobin).is_none());
    }

    #[test]
    fn test_weighted_overlay() {
        let base = Arc::new(StrategyLoadBalancer::new());
        let lb = WeightedLoadBalancer::new(base);
        assert_eq!(lb.weight("svc-0"), 1);

        lb.set_weight("svc-0", 99);
        lb.set_weight("svc-1", 1);
        let pool = instances("svc", 2);

        let heavy_hits = (0..1000)
            .filter(|_| {
                lb.select(&pool, LoadBalanceStrategy::WeightedRandom).unwrap().id == "svc-0"
            })
            .count();
        assert!(heavy_hits > 900, "got {}", heavy_hits);

        lb.remove_weight("svc-0");
        assert_eq!(lb.weight("svc-0"), 1);
    }

    #[test]
    fn test_weighted_update_weights_adopts_instance_weights() {
        let base = Arc::new(StrategyLoadBalancer::new());
        let lb = WeightedLoadBalancer::new(base.clone());
        let pool = vec![instances("svc", 1)[0].clone().with_weight(7)];

        lb.update_weights(&pool);
        assert_eq!(lb.weight("svc-0"), 7);
        assert_eq!(base.stats().tracked_instances, 1);
    }

    #[test]
    fn test_decorators_forward_release_and_stats() {
        let base = Arc::new(StrategyLoadBalancer::new());
        let lb = HealthAwareLoadBalancer::new(
            Arc::new(WeightedLoadBalancer::new(base.clone())),
            Duration::from_secs(60),
        );
        let pool = instances("svc", 1);

        lb.select(&pool, LoadBalanceStrategy::LeastConnections);
        assert_eq!(base.connection_count("svc-0"), 1);
        lb.release_connection("svc-0");
        assert_eq!(base.connection_count("svc-0"), 0);
        assert_eq!(lb.stats().successful_selections, 1);
    }

    #[test]
    fn test_average_latency() {
        let stats = LoadBalancerStats {
            total_requests: 4,
            total_latency: Duration::from_micros(40),
            ..LoadBalancerStats::default()
        };
        assert_eq!(stats.average_latency(), Duration::from_micros(10));
        assert_eq!(LoadBalancerStats::default().average_latency(), Duration::ZERO);
    }
}

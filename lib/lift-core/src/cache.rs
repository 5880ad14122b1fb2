//! Discovery result caching: LRU + TTL store and an L1/L2 composition

use crate::config::{CacheConfig, DEFAULT_CACHE_TTL};
use crate::instance::ServiceInstance;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Longest lifetime an L2 hit is given when promoted into L1
pub const L1_PROMOTION_TTL: Duration = Duration::from_secs(60);

/// Longest lifetime an entry is given in L1 on write
pub const L1_MAX_TTL: Duration = Duration::from_secs(300);

const DEFAULT_MAX_SIZE: usize = 1000;

/// A store of discovery results keyed by discovery key.
///
/// Implementations never fail: a miss is the only negative outcome, and every
/// read or write copies the instance list so callers never alias cache state.
pub trait ServiceCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<ServiceInstance>>;

    /// Store a copy of `instances`; a zero `ttl` means the default five minutes
    fn set(&self, key: &str, instances: &[ServiceInstance], ttl: Duration);

    fn delete(&self, key: &str);

    fn clear(&self);

    fn stats(&self) -> CacheStats;

    /// Remaining lifetime of a live entry, without touching LRU order or stats
    fn ttl(&self, key: &str) -> Option<Duration>;

    /// Drop every expired entry, returning how many were removed
    fn purge_expired(&self) -> usize;
}

/// Point-in-time cache counters
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
    pub max_size: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

struct CacheEntry {
    instances: Vec<ServiceInstance>,
    expires_at: Instant,
    accessed_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Bounded LRU cache with per-entry expiry.
///
/// Expiry is lazy: an expired entry stays in memory until it is looked up,
/// evicted, or swept by [`ServiceCache::purge_expired`].
pub struct LruServiceCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    max_size: usize,
    // Counters sit outside the entry lock so stats reads never contend with lookups
    counters: CacheCounters,
}

impl LruServiceCache {
    /// Create a cache holding at most `max_size` keys (zero selects the default of 1000)
    pub fn new(max_size: usize) -> Self {
        let max_size = if max_size == 0 {
            DEFAULT_MAX_SIZE
        } else {
            max_size
        };
        let capacity = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);

        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            max_size,
            counters: CacheCounters::default(),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of physically present entries, expired ones included
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_miss(&self) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for LruServiceCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}

impl ServiceCache for LruServiceCache {
    fn get(&self, key: &str) -> Option<Vec<ServiceInstance>> {
        let now = Instant::now();
        let mut entries = self.lock();

        let expired = entries.peek(key).map(|entry| entry.is_expired(now));
        match expired {
            None => {
                drop(entries);
                self.record_miss();
                return None;
            }
            Some(true) => {
                entries.pop(key);
                drop(entries);
                debug!("Cache entry expired: {}", key);
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                self.record_miss();
                return None;
            }
            Some(false) => {}
        }

        // get_mut moves the entry to the front of the LRU list
        let instances = entries.get_mut(key).map(|entry| {
            entry.accessed_at = now;
            entry.instances.clone()
        });
        drop(entries);

        match instances {
            Some(instances) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(instances)
            }
            None => {
                self.record_miss();
                None
            }
        }
    }

    fn set(&self, key: &str, instances: &[ServiceInstance], ttl: Duration) {
        let ttl = if ttl.is_zero() { DEFAULT_CACHE_TTL } else { ttl };
        let now = Instant::now();
        let entry = CacheEntry {
            instances: instances.to_vec(),
            expires_at: expiry(now, ttl),
            accessed_at: now,
        };

        let mut evicted = 0u64;
        {
            let mut entries = self.lock();
            if let Some(existing) = entries.get_mut(key) {
                *existing = entry;
            } else {
                while entries.len() >= self.max_size {
                    match entries.pop_lru() {
                        Some((evicted_key, _)) => {
                            debug!("Evicted least recently used cache entry: {}", evicted_key);
                            evicted += 1;
                        }
                        None => break,
                    }
                }
                entries.put(key.to_string(), entry);
            }
        }

        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
    }

    fn delete(&self, key: &str) {
        if self.lock().pop(key).is_some() {
            self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn clear(&self) {
        self.lock().clear();
    }

    fn stats(&self) -> CacheStats {
        let size = self.len();
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            size,
            max_size: self.max_size,
        }
    }

    fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.lock();
        let entry = entries.peek(key)?;
        if entry.is_expired(now) {
            None
        } else {
            Some(entry.expires_at.saturating_duration_since(now))
        }
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        drop(entries);

        if !expired.is_empty() {
            debug!("Purged {} expired cache entries", expired.len());
            self.counters
                .expirations
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
        }
        expired.len()
    }
}

fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 24 * 60 * 60))
}

/// Two-tier cache: a small, short-lived L1 in front of a larger L2.
///
/// L2 is the long-lived source of truth; L1 lifetimes are capped so stale
/// entries age out of the fast tier quickly.
pub struct MultiTierServiceCache {
    l1: Arc<dyn ServiceCache>,
    l2: Arc<dyn ServiceCache>,
}

impl MultiTierServiceCache {
    pub fn new(l1: Arc<dyn ServiceCache>, l2: Arc<dyn ServiceCache>) -> Self {
        Self { l1, l2 }
    }

    /// Build both tiers as in-memory LRU caches
    pub fn with_capacity(l1_max_size: usize, l2_max_size: usize) -> Self {
        Self::new(
            Arc::new(LruServiceCache::new(l1_max_size)),
            Arc::new(LruServiceCache::new(l2_max_size)),
        )
    }

    pub fn l1(&self) -> &Arc<dyn ServiceCache> {
        &self.l1
    }

    pub fn l2(&self) -> &Arc<dyn ServiceCache> {
        &self.l2
    }

    /// Stats of each tier, L1 first
    pub fn tier_stats(&self) -> (CacheStats, CacheStats) {
        (self.l1.stats(), self.l2.stats())
    }
}

impl ServiceCache for MultiTierServiceCache {
    fn get(&self, key: &str) -> Option<Vec<ServiceInstance>> {
        if let Some(instances) = self.l1.get(key) {
            return Some(instances);
        }

        let instances = self.l2.get(key)?;
        let promotion_ttl = self
            .l2
            .ttl(key)
            .map(|remaining| remaining.min(L1_PROMOTION_TTL))
            .unwrap_or(L1_PROMOTION_TTL);
        if !promotion_ttl.is_zero() {
            debug!("Promoting L2 cache hit into L1: {}", key);
            self.l1.set(key, &instances, promotion_ttl);
        }
        Some(instances)
    }

    fn set(&self, key: &str, instances: &[ServiceInstance], ttl: Duration) {
        let ttl = if ttl.is_zero() { DEFAULT_CACHE_TTL } else { ttl };
        self.l1.set(key, instances, ttl.min(L1_MAX_TTL));
        self.l2.set(key, instances, ttl);
    }

    fn delete(&self, key: &str) {
        self.l1.delete(key);
        self.l2.delete(key);
    }

    fn clear(&self) {
        self.l1.clear();
        self.l2.clear();
    }

    /// Combined view: hits from either tier, misses that fell through both
    fn stats(&self) -> CacheStats {
        let (l1, l2) = self.tier_stats();
        CacheStats {
            hits: l1.hits + l2.hits,
            misses: l2.misses,
            sets: l2.sets,
            deletes: l2.deletes,
            evictions: l1.evictions + l2.evictions,
            expirations: l1.expirations + l2.expirations,
            size: l2.size,
            max_size: l2.max_size,
        }
    }

    fn ttl(&self, key: &str) -> Option<Duration> {
        self.l2.ttl(key).or_else(|| self.l1.ttl(key))
    }

    fn purge_expired(&self) -> usize {
        self.l1.purge_expired() + self.l2.purge_expired()
    }
}

/// Build the cache described by `config`, or `None` when caching is disabled
pub fn build_cache(config: &CacheConfig) -> Option<Arc<dyn ServiceCache>> {
    if !config.enabled {
        return None;
    }

    let cache: Arc<dyn ServiceCache> = if config.multi_tier {
        Arc::new(MultiTierServiceCache::with_capacity(
            config.l1_max_size,
            config.l2_max_size,
        ))
    } else {
        Arc::new(LruServiceCache::new(config.max_size))
    };
    Some(cache)
}

//! In-process hot data cache with LRU eviction and per-entry TTL.
//!
//! The cache is bounded by `max_size`. Inserting a new key into a full cache
//! evicts the least-recently-used entry first; reads promote. Expired entries
//! are purged lazily on access and periodically by a background sweep.
//!
//! Reads never fail: an absent or expired key is simply a miss.

use crate::config::CacheConfig;
use crate::maintenance::BackgroundTask;
use lru::LruCache;
use parking_lot::Mutex;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// TTL used by [`cache_aside`] callers that have no better value.
pub const DEFAULT_CACHE_ASIDE_TTL: Duration = Duration::from_secs(60);

/// Longest TTL an entry can carry; larger values are clamped to it.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// A cached value and its deadline.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// The cached value
    pub value: V,
    /// Instant after which the entry is dead
    pub expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value,
            expires_at: now.checked_add(ttl.min(MAX_TTL)).unwrap_or(now),
        }
    }

    /// Whether the entry is expired at `now`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Cache statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Live entries (may include not yet purged expired ones)
    pub size: usize,
    /// Capacity
    pub max_size: usize,
    /// Successful lookups
    pub hits: u64,
    /// Lookups that found nothing or an expired entry
    pub misses: u64,
    /// Entries removed to make room
    pub evictions: u64,
    /// Entries removed because their TTL passed
    pub expirations: u64,
    /// hits / (hits + misses)
    pub hit_rate: f64,
}

/// Bounded LRU cache with per-entry expiry.
pub struct HotCache<V> {
    entries: Mutex<LruCache<String, CacheEntry<V>>>,
    max_size: usize,
    default_ttl: Duration,
    sweep_interval: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    sweeper: BackgroundTask,
}

impl<V: Clone + Send + Sync + 'static> HotCache<V> {
    /// Create a cache from configuration.
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            max_size: capacity.get(),
            default_ttl: config.default_ttl(),
            sweep_interval: config.sweep_interval(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            sweeper: BackgroundTask::new("cache-sweep"),
        }
    }

    /// Create a cache with the given capacity and default TTL.
    pub fn with_capacity(max_size: usize, default_ttl: Duration) -> Self {
        let config = CacheConfig {
            max_size,
            default_ttl_seconds: default_ttl.as_secs(),
            ..CacheConfig::default()
        };
        let mut cache = Self::new(&config);
        cache.default_ttl = default_ttl;
        cache
    }

    /// Look up `key`, promoting it to most-recently-used on a hit.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock();

        let expired = match entries.peek(key) {
            Some(entry) => entry.is_expired_at(Instant::now()),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if expired {
            entries.pop(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(key, "Cache entry expired on read");
            return None;
        }

        let value = entries.get(key).map(|entry| entry.value.clone());
        self.hits.fetch_add(1, Ordering::Relaxed);
        value
    }

    /// Insert or replace `key` with the default TTL.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// Insert or replace `key` with an explicit TTL.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let mut entries = self.entries.lock();

        if !entries.contains(&key) && entries.len() >= self.max_size {
            if let Some((evicted, _)) = entries.pop_lru() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(evicted = %evicted, "Evicted least recently used cache entry");
            }
        }

        entries.put(key, CacheEntry::new(value, ttl));
    }

    /// Whether a live entry exists for `key`. Does not promote or count.
    pub fn has(&self, key: &str) -> bool {
        let mut entries = self.entries.lock();
        let expired = match entries.peek(key) {
            Some(entry) => entry.is_expired_at(Instant::now()),
            None => return false,
        };
        if expired {
            entries.pop(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        !expired
    }

    /// Remove `key`. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    /// Remove every entry. Statistics are kept.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Fraction of lookups that hit; 0.0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            max_size: self.max_size,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
        }
    }

    /// Remove all expired entries. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            entries.pop(key);
        }
        drop(entries);

        if !expired.is_empty() {
            self.expirations
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            debug!(removed = expired.len(), "Cache sweep removed expired entries");
        }
        expired.len()
    }

    /// Start the background expiry sweep.
    pub fn start(self: &Arc<Self>) -> bool {
        self.sweeper
            .spawn_periodic(self, self.sweep_interval, |cache| async move {
                cache.sweep_expired();
            })
    }

    /// Stop the background sweep.
    pub fn stop(&self) {
        self.sweeper.stop();
    }

    /// Stop the background sweep and wait for it to exit.
    pub async fn shutdown(&self) {
        self.sweeper.stop();
        self.sweeper.join().await;
    }

    /// Whether the background sweep is running.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper.is_running()
    }
}

/// Return the cached value for `key`, or fetch, cache with `ttl` and return it.
///
/// Fetch errors are returned to the caller and nothing is cached. Concurrent
/// misses on the same key are not coalesced: each caller runs its own fetch.
pub async fn cache_aside<V, E, F, Fut>(
    cache: &HotCache<V>,
    key: &str,
    ttl: Duration,
    fetcher: F,
) -> Result<V, E>
where
    V: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V, E>>,
{
    if let Some(value) = cache.get(key) {
        return Ok(value);
    }

    let value = fetcher().await?;
    cache.set_with_ttl(key, value.clone(), ttl);
    Ok(value)
}

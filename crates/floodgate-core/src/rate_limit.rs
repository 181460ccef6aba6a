//! Per-client token bucket rate limiting.
//!
//! Each client key owns a bucket holding up to `max_tokens` tokens that
//! refills continuously at `refill_rate_per_second`. A request costs one
//! token (or an explicit amount). Buckets are tracked in insertion order and
//! capped at `max_clients`; admitting a new client into a full table evicts
//! the oldest-inserted bucket. Idle buckets are dropped by a background
//! cleanup.

use crate::config::RateLimiterConfig;
use crate::maintenance::BackgroundTask;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Key used by limiters that share one bucket across all callers.
pub const GLOBAL_KEY: &str = "__global__";

/// Outcome of a consume call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Whole tokens left after this request
    pub remaining: u64,
    /// Milliseconds until enough tokens will be available; 0 when allowed
    pub retry_after_ms: u64,
}

impl RateLimitDecision {
    fn allow(remaining: f64) -> Self {
        Self {
            allowed: true,
            remaining: remaining.max(0.0).floor() as u64,
            retry_after_ms: 0,
        }
    }

    fn deny(retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            retry_after_ms,
        }
    }

    /// `retry_after_ms` rounded up to whole seconds, for `Retry-After`.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after_ms.div_ceil(1000)
    }
}

/// Rate limiter statistics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterStats {
    /// Limiter name
    pub name: String,
    /// Tracked clients
    pub clients: usize,
    /// Client table capacity
    pub max_clients: usize,
    /// Admitted requests
    pub allowed: u64,
    /// Denied requests
    pub denied: u64,
    /// Buckets evicted to admit new clients
    pub evicted_clients: u64,
}

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(max_tokens: f64, now: Instant) -> Self {
        Self {
            tokens: max_tokens,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant, max_tokens: f64, rate: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(max_tokens);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }
}

/// Token bucket rate limiter keyed by client.
pub struct RateLimiter {
    config: RateLimiterConfig,
    // LruCache used purely as an insertion-ordered map: only `peek_mut` is
    // used for lookups so order never changes on access.
    buckets: Mutex<LruCache<String, Bucket>>,
    allowed: AtomicU64,
    denied: AtomicU64,
    evicted_clients: AtomicU64,
    cleaner: BackgroundTask,
}

impl RateLimiter {
    /// Create a limiter.
    pub fn new(config: RateLimiterConfig) -> Self {
        let cleaner = BackgroundTask::new(format!("rate-limit-cleanup-{}", config.name));
        Self {
            buckets: Mutex::new(LruCache::unbounded()),
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            evicted_clients: AtomicU64::new(0),
            cleaner,
            config,
        }
    }

    /// Limiter name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Limiter configuration.
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Take one token for `client_key`.
    pub fn consume(&self, client_key: &str) -> RateLimitDecision {
        self.consume_tokens(client_key, 1.0)
    }

    /// Take `tokens` tokens for `client_key`. An amount that is not a
    /// positive finite number is admitted without touching the bucket.
    pub fn consume_tokens(&self, client_key: &str, tokens: f64) -> RateLimitDecision {
        let now = Instant::now();
        let max_tokens = self.config.max_tokens;
        let rate = self.config.refill_rate_per_second;

        let mut buckets = self.buckets.lock();

        if !buckets.contains(client_key) {
            if buckets.len() >= self.config.max_clients {
                if let Some((evicted, _)) = buckets.pop_lru() {
                    self.evicted_clients.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        limiter = %self.config.name,
                        evicted = %evicted,
                        "Client table full, evicted oldest bucket"
                    );
                }
            }
            buckets.put(client_key.to_string(), Bucket::full(max_tokens, now));
        }

        let Some(bucket) = buckets.peek_mut(client_key) else {
            return RateLimitDecision::allow(max_tokens);
        };

        bucket.refill(now, max_tokens, rate);

        // Zero, negative and non-finite amounts take nothing.
        if !tokens.is_finite() || tokens <= 0.0 {
            let decision = RateLimitDecision::allow(bucket.tokens);
            drop(buckets);
            self.allowed.fetch_add(1, Ordering::Relaxed);
            return decision;
        }

        if bucket.tokens >= tokens {
            bucket.tokens -= tokens;
            let decision = RateLimitDecision::allow(bucket.tokens);
            drop(buckets);
            self.allowed.fetch_add(1, Ordering::Relaxed);
            decision
        } else {
            let deficit = tokens - bucket.tokens;
            let retry_after_ms = (deficit / rate * 1000.0).ceil() as u64;
            drop(buckets);
            self.denied.fetch_add(1, Ordering::Relaxed);
            trace!(
                limiter = %self.config.name,
                client = client_key,
                retry_after_ms,
                "Rate limit exceeded"
            );
            RateLimitDecision::deny(retry_after_ms)
        }
    }

    /// Forget `client_key`. Returns whether it was tracked.
    pub fn reset(&self, client_key: &str) -> bool {
        self.buckets.lock().pop(client_key).is_some()
    }

    /// Number of tracked clients.
    pub fn client_count(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Drop buckets idle longer than the configured timeout.
    pub fn cleanup_idle(&self) -> usize {
        self.cleanup_idle_older_than(self.config.idle_timeout())
    }

    fn cleanup_idle_older_than(&self, idle_timeout: Duration) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();

        let idle: Vec<String> = buckets
            .iter()
            .filter(|(_, b)| now.saturating_duration_since(b.last_refill) > idle_timeout)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &idle {
            buckets.pop(key);
        }
        drop(buckets);

        if !idle.is_empty() {
            debug!(
                limiter = %self.config.name,
                removed = idle.len(),
                "Removed idle rate limit buckets"
            );
        }
        idle.len()
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            name: self.config.name.clone(),
            clients: self.client_count(),
            max_clients: self.config.max_clients,
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            evicted_clients: self.evicted_clients.load(Ordering::Relaxed),
        }
    }

    /// Start the background idle cleanup.
    pub fn start(self: &Arc<Self>) -> bool {
        self.cleaner
            .spawn_periodic(self, self.config.cleanup_interval(), |limiter| async move {
                limiter.cleanup_idle();
            })
    }

    /// Stop the background cleanup.
    pub fn stop(&self) {
        self.cleaner.stop();
    }

    /// Stop the background cleanup and wait for it to exit.
    pub async fn shutdown(&self) {
        self.cleaner.stop();
        self.cleaner.join().await;
    }

    /// Whether the background cleanup is running.
    pub fn is_cleaning(&self) -> bool {
        self.cleaner.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_tokens: f64, rate: f64, max_clients: usize) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig::new("test", max_tokens, rate, max_clients))
    }

    #[test]
    fn test_burst_then_block() {
        let limiter = limiter(10.0, 1.0, 100);

        for i in 0..10 {
            let decision = limiter.consume("u");
            assert!(decision.allowed, "request {i} should be allowed");
            assert_eq!(decision.remaining, 9 - i);
        }

        let denied = limiter.consume("u");
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.retry_after_ms > 0);
        assert!(denied.retry_after_ms <= 1000);
    }

    #[test]
    fn test_invalid_amounts_leave_bucket_unchanged() {
        let limiter = limiter(10.0, 1.0, 100);
        assert_eq!(limiter.consume_tokens("u", 4.0).remaining, 6);

        for amount in [-100.0, 0.0, f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let decision = limiter.consume_tokens("u", amount);
            assert!(decision.allowed, "amount {amount} should be a no-op");
            assert_eq!(decision.remaining, 6);
            assert_eq!(decision.retry_after_ms, 0);
        }

        // Bucket never exceeds its capacity.
        for _ in 0..6 {
            assert!(limiter.consume("u").allowed);
        }
        assert!(!limiter.consume("u").allowed);
    }

    #[test]
    fn test_refill() {
        let limiter = limiter(5.0, 5.0, 100);
        for _ in 0..5 {
            assert!(limiter.consume("u").allowed);
        }
        assert!(!limiter.consume("u").allowed);

        std::thread::sleep(Duration::from_millis(500));

        let decision = limiter.consume("u");
        assert!(decision.allowed);
    }

    #[test]
    fn test_refill_caps_at_max() {
        let limiter = limiter(3.0, 1000.0, 100);
        limiter.consume("u");
        std::thread::sleep(Duration::from_millis(20));

        let decision = limiter.consume("u");
        assert_eq!(decision.remaining, 2);
    }

    #[test]
    fn test_clients_are_isolated() {
        let limiter = limiter(2.0, 0.1, 100);
        assert!(limiter.consume("a").allowed);
        assert!(limiter.consume("a").allowed);
        assert!(!limiter.consume("a").allowed);

        assert!(limiter.consume("b").allowed);
        assert_eq!(limiter.client_count(), 2);
    }

    #[test]
    fn test_client_eviction_is_fifo() {
        let limiter = limiter(5.0, 1.0, 3);
        limiter.consume("c1");
        limiter.consume("c2");
        limiter.consume("c3");

        // touching c1 must not protect it
        limiter.consume("c1");
        limiter.consume("c4");

        assert_eq!(limiter.client_count(), 3);
        assert_eq!(limiter.stats().evicted_clients, 1);

        // c1 was evicted, so it comes back with a full bucket
        assert_eq!(limiter.consume("c1").remaining, 4);
        // and c2 was evicted to make room for it
        assert_eq!(limiter.stats().evicted_clients, 2);
        assert_eq!(limiter.consume("c3").remaining, 3);
    }

    #[test]
    fn test_consume_tokens() {
        let limiter = limiter(10.0, 2.0, 10);
        let decision = limiter.consume_tokens("u", 8.0);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);

        let denied = limiter.consume_tokens("u", 4.0);
        assert!(!denied.allowed);
        // deficit of 2 tokens at 2/s
        assert!(denied.retry_after_ms > 900 && denied.retry_after_ms <= 1000);
        assert_eq!(denied.retry_after_secs(), 1);
    }

    #[test]
    fn test_denial_does_not_consume() {
        let limiter = limiter(3.0, 0.001, 10);
        assert!(limiter.consume_tokens("u", 2.0).allowed);
        assert!(!limiter.consume_tokens("u", 2.0).allowed);
        assert!(limiter.consume_tokens("u", 1.0).allowed);
    }

    #[test]
    fn test_global_key_shares_one_bucket() {
        let limiter = RateLimiter::new(RateLimiterConfig::new("global", 3.0, 0.001, 1));
        for _ in 0..3 {
            assert!(limiter.consume(GLOBAL_KEY).allowed);
        }
        assert!(!limiter.consume(GLOBAL_KEY).allowed);
        assert_eq!(limiter.client_count(), 1);
    }

    #[test]
    fn test_cleanup_idle() {
        let limiter = limiter(5.0, 1.0, 10);
        limiter.consume("old");
        std::thread::sleep(Duration::from_millis(30));
        limiter.consume("fresh");

        assert_eq!(limiter.cleanup_idle_older_than(Duration::from_millis(20)), 1);
        assert_eq!(limiter.client_count(), 1);
        assert_eq!(limiter.cleanup_idle(), 0);
    }

    #[test]
    fn test_reset() {
        let limiter = limiter(1.0, 0.001, 10);
        assert!(limiter.consume("u").allowed);
        assert!(!limiter.consume("u").allowed);

        assert!(limiter.reset("u"));
        assert!(!limiter.reset("u"));
        assert!(limiter.consume("u").allowed);
    }

    #[test]
    fn test_stats() {
        let limiter = limiter(1.0, 0.001, 10);
        limiter.consume("u");
        limiter.consume("u");

        let stats = limiter.stats();
        assert_eq!(stats.name, "test");
        assert_eq!(stats.allowed, 1);
        assert_eq!(stats.denied, 1);
        assert_eq!(stats.clients, 1);
        assert_eq!(stats.max_clients, 10);
    }

    #[tokio::test]
    async fn test_background_cleanup_lifecycle() {
        let limiter = Arc::new(limiter(5.0, 1.0, 10));
        assert!(limiter.start());
        assert!(limiter.is_cleaning());

        limiter.shutdown().await;
        assert!(!limiter.is_cleaning());
    }
}

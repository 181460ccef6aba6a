//! Resilience layer assembly.
//!
//! Builds the hot cache, the three rate limiters, the store circuit breaker
//! and the batch writer from one [`Config`], and drives their lifecycle:
//!
//! - `admit` before handling a request
//! - `read_document` for cache-aside reads through the breaker
//! - `write_document` / `update_document` / `delete_document` to queue writes
//! - `shutdown` to stop background tasks and flush what is buffered

use crate::cache::{cache_aside, HotCache, DEFAULT_CACHE_ASIDE_TTL};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::config::Config;
use crate::error::StoreError;
use crate::health::{HealthCheck, HealthStatus};
use crate::metrics::MetricsSnapshot;
use crate::rate_limit::{RateLimitDecision, RateLimiter, GLOBAL_KEY};
use crate::store::{Document, DocumentStore};
use crate::writer::BatchWriter;
use crate::Result;
use std::sync::Arc;
use tracing::{debug, info};

/// Health component names.
pub mod components {
    /// Hot cache
    pub const CACHE: &str = "cache";
    /// Rate limiters
    pub const RATE_LIMITER: &str = "rate_limiter";
    /// Batch writer
    pub const BATCH_WRITER: &str = "batch_writer";
    /// Downstream store (as seen through the breaker)
    pub const STORE: &str = "store";
}

/// Buffer pressure at which the writer reports degraded.
pub const WRITER_PRESSURE_DEGRADED: f64 = 0.8;

/// Cache key for a document.
pub fn cache_key(collection: &str, doc_id: &str) -> String {
    format!("{collection}/{doc_id}")
}

/// The assembled resilience layer.
pub struct ResilienceLayer {
    config: Config,
    store: Arc<dyn DocumentStore>,
    cache: Arc<HotCache<Option<Document>>>,
    endpoint_limiter: Arc<RateLimiter>,
    write_limiter: Arc<RateLimiter>,
    global_limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    writer: Arc<BatchWriter>,
    health: Arc<HealthCheck>,
}

impl ResilienceLayer {
    /// Build every component from `config` in front of `store`.
    pub fn new(config: Config, store: Arc<dyn DocumentStore>) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(HotCache::new(&config.cache));

        let endpoint_limiter = Arc::new(RateLimiter::new(config.rate_limits.endpoint.clone()));
        let write_limiter = Arc::new(RateLimiter::new(config.rate_limits.write.clone()));
        let global_limiter = Arc::new(RateLimiter::new(config.rate_limits.global.clone()));

        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::from_settings(
            components::STORE,
            &config.circuit_breaker,
        )));

        // Committed writes drop their keys again, so reads cached while the
        // write sat in the buffer do not outlive the commit.
        let committed_cache = Arc::clone(&cache);
        let writer = Arc::new(
            BatchWriter::new(
                config.batch_writer.clone(),
                Arc::clone(&store),
                Arc::clone(&breaker),
            )
            .with_commit_hook(move |chunk| {
                for op in chunk {
                    committed_cache.delete(&cache_key(&op.collection, &op.doc_id));
                }
            }),
        );

        let health = Arc::new(HealthCheck::new());
        for name in [
            components::CACHE,
            components::RATE_LIMITER,
            components::BATCH_WRITER,
            components::STORE,
        ] {
            health.register_component(name);
        }

        info!(
            cache_size = config.cache.max_size,
            max_buffer_size = config.batch_writer.max_buffer_size,
            max_batch_size = writer.max_batch_size(),
            "Resilience layer initialized"
        );

        Ok(Self {
            config,
            store,
            cache,
            endpoint_limiter,
            write_limiter,
            global_limiter,
            breaker,
            writer,
            health,
        })
    }

    /// Start every background task.
    pub fn start(&self) {
        self.cache.start();
        self.endpoint_limiter.start();
        self.write_limiter.start();
        self.global_limiter.start();
        self.writer.start();
        self.health.mark_serving();
        self.refresh_health();
        info!("Resilience layer started");
    }

    /// Stop background tasks and flush the writer.
    pub async fn shutdown(&self) {
        info!("Shutting down resilience layer");
        self.health.mark_stopped();

        self.cache.shutdown().await;
        self.endpoint_limiter.shutdown().await;
        self.write_limiter.shutdown().await;
        self.global_limiter.shutdown().await;
        self.writer.shutdown().await;

        let metrics = self.writer.metrics();
        info!(
            flushed_ops = metrics.flushed_ops,
            dropped_ops = metrics.dropped_ops,
            left_in_buffer = metrics.buffer_depth,
            "Resilience layer stopped"
        );
    }

    /// Admission check. Global limiter first, then the per-client endpoint
    /// limiter, then the write limiter for mutations. The first denial wins.
    pub fn admit(&self, client_key: &str, write: bool) -> RateLimitDecision {
        let global = self.global_limiter.consume(GLOBAL_KEY);
        if !global.allowed {
            return global;
        }

        let endpoint = self.endpoint_limiter.consume(client_key);
        if !endpoint.allowed || !write {
            return endpoint;
        }

        let write_decision = self.write_limiter.consume(client_key);
        if !write_decision.allowed {
            return write_decision;
        }

        RateLimitDecision {
            remaining: endpoint.remaining.min(write_decision.remaining),
            ..write_decision
        }
    }

    /// Read a document, from cache if possible. Missing documents are cached
    /// too, so repeated lookups of an absent id do not reach the store.
    pub async fn read_document(
        &self,
        collection: &str,
        doc_id: &str,
    ) -> std::result::Result<Option<Document>, StoreError> {
        let key = cache_key(collection, doc_id);
        let store = &self.store;
        let breaker = &self.breaker;

        cache_aside(&self.cache, &key, DEFAULT_CACHE_ASIDE_TTL, || async move {
            debug!(collection, doc_id, "Cache miss, reading from store");
            breaker
                .execute(|| store.get(collection, doc_id))
                .await
                .map_err(StoreError::from)
        })
        .await
    }

    /// Queue a set. Returns `false` under backpressure.
    pub fn write_document(&self, collection: &str, doc_id: &str, data: Document, merge: bool) -> bool {
        let accepted = self.writer.enqueue_set(collection, doc_id, data, merge);
        self.invalidate_if(accepted, collection, doc_id)
    }

    /// Queue an update. Returns `false` under backpressure.
    pub fn update_document(&self, collection: &str, doc_id: &str, data: Document) -> bool {
        let accepted = self.writer.enqueue_update(collection, doc_id, data);
        self.invalidate_if(accepted, collection, doc_id)
    }

    /// Queue a delete. Returns `false` under backpressure.
    pub fn delete_document(&self, collection: &str, doc_id: &str) -> bool {
        let accepted = self.writer.enqueue_delete(collection, doc_id);
        self.invalidate_if(accepted, collection, doc_id)
    }

    fn invalidate_if(&self, accepted: bool, collection: &str, doc_id: &str) -> bool {
        if accepted {
            self.cache.delete(&cache_key(collection, doc_id));
        }
        accepted
    }

    /// Re-derive component health from live state.
    pub fn refresh_health(&self) -> HealthStatus {
        self.health.mark_healthy(components::CACHE);
        self.health.mark_healthy(components::RATE_LIMITER);

        let writer = self.writer.metrics();
        if writer.buffer_pressure >= WRITER_PRESSURE_DEGRADED {
            self.health.mark_degraded(
                components::BATCH_WRITER,
                format!("buffer at {:.0}%", writer.buffer_pressure * 100.0),
            );
        } else {
            self.health.mark_healthy(components::BATCH_WRITER);
        }

        match self.breaker.state() {
            CircuitState::Closed => self.health.mark_healthy(components::STORE),
            CircuitState::HalfOpen => {
                self.health.mark_degraded(components::STORE, "circuit half-open")
            }
            CircuitState::Open => self.health.mark_unhealthy(components::STORE, "circuit open"),
        }

        self.health.overall_status()
    }

    /// Metrics of every component.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache: self.cache.stats(),
            limiters: vec![
                self.global_limiter.stats(),
                self.endpoint_limiter.stats(),
                self.write_limiter.stats(),
            ],
            writer: self.writer.metrics(),
            flush_duration: self.writer.flush_histogram(),
            circuit_breaker: self.breaker.stats(),
        }
    }

    /// Configuration the layer was built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Hot cache.
    pub fn cache(&self) -> &Arc<HotCache<Option<Document>>> {
        &self.cache
    }

    /// Batch writer.
    pub fn writer(&self) -> &Arc<BatchWriter> {
        &self.writer
    }

    /// Store circuit breaker.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Per-client endpoint limiter.
    pub fn endpoint_limiter(&self) -> &Arc<RateLimiter> {
        &self.endpoint_limiter
    }

    /// Per-client write limiter.
    pub fn write_limiter(&self) -> &Arc<RateLimiter> {
        &self.write_limiter
    }

    /// Shared global limiter.
    pub fn global_limiter(&self) -> &Arc<RateLimiter> {
        &self.global_limiter
    }

    /// Health registry.
    pub fn health(&self) -> &Arc<HealthCheck> {
        &self.health
    }
}

//! Floodgate Core - in-process resilience layer for document store backends
//!
//! This library keeps a single long-lived server process standing under load
//! spikes without overwhelming the downstream document store:
//!
//! - LRU + TTL hot cache with cache-aside reads
//! - Per-client token bucket rate limiting
//! - Buffered batch writes with backpressure and bounded retry
//! - Circuit breaker around every store call

pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod health;
pub mod layer;
pub mod maintenance;
pub mod metrics;
pub mod rate_limit;
pub mod store;
pub mod writer;

// Re-export commonly used types
pub use cache::{cache_aside, HotCache};
pub use config::Config;
pub use error::{Error, Result, StoreError};
pub use layer::ResilienceLayer;
pub use rate_limit::{RateLimitDecision, RateLimiter};
pub use store::{Document, DocumentStore, InMemoryStore, LazyStore};
pub use writer::BatchWriter;

//! Lazily constructed store.
//!
//! The real store client is built on first use. Until construction succeeds
//! every call fails with [`StoreError::NotConfigured`].

use super::{Document, DocumentStore, WriteOp, MAX_BATCH_WRITES};
use crate::error::StoreError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Builds the underlying store.
#[async_trait]
pub trait StoreFactory: Send + Sync {
    /// Construct the store client.
    async fn create(&self) -> Result<Arc<dyn DocumentStore>, StoreError>;
}

#[async_trait]
impl<F> StoreFactory for F
where
    F: Fn() -> Result<Arc<dyn DocumentStore>, StoreError> + Send + Sync,
{
    async fn create(&self) -> Result<Arc<dyn DocumentStore>, StoreError> {
        (self)()
    }
}

/// Store proxy that constructs its target on first call.
pub struct LazyStore {
    factory: Box<dyn StoreFactory>,
    inner: OnceCell<Arc<dyn DocumentStore>>,
}

impl LazyStore {
    /// Create a proxy around `factory`.
    pub fn new(factory: impl StoreFactory + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            inner: OnceCell::new(),
        }
    }

    /// Whether the underlying store has been built.
    pub fn is_initialized(&self) -> bool {
        self.inner.initialized()
    }

    async fn store(&self) -> Result<&Arc<dyn DocumentStore>, StoreError> {
        self.inner
            .get_or_try_init(|| async {
                match self.factory.create().await {
                    Ok(store) => {
                        info!("Document store initialized");
                        Ok(store)
                    }
                    Err(e) => {
                        warn!(error = %e, "Document store construction failed");
                        Err(match e {
                            StoreError::NotConfigured(msg) => StoreError::NotConfigured(msg),
                            other => StoreError::NotConfigured(other.to_string()),
                        })
                    }
                }
            })
            .await
    }
}

#[async_trait]
impl DocumentStore for LazyStore {
    async fn get(&self, collection: &str, doc_id: &str) -> Result<Option<Document>, StoreError> {
        self.store().await?.get(collection, doc_id).await
    }

    async fn commit(&self, writes: &[WriteOp]) -> Result<(), StoreError> {
        self.store().await?.commit(writes).await
    }

    fn max_batch_size(&self) -> usize {
        self.inner
            .get()
            .map(|store| store.max_batch_size())
            .unwrap_or(MAX_BATCH_WRITES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_builds_once_on_first_use() {
        let builds = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&builds);
        let store = LazyStore::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, StoreError>(Arc::new(InMemoryStore::new()) as Arc<dyn DocumentStore>)
        });

        assert!(!store.is_initialized());
        assert_eq!(store.get("c", "1").await.unwrap(), None);
        store.commit(&[]).await.unwrap();

        assert!(store.is_initialized());
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_factory_error_surfaces_as_not_configured() {
        let store = LazyStore::new(|| {
            Err::<Arc<dyn DocumentStore>, _>(StoreError::Unavailable("no credentials".into()))
        });

        let err = store.get("c", "1").await.unwrap_err();
        assert!(matches!(err, StoreError::NotConfigured(ref m) if m.contains("no credentials")));

        let err = store.commit(&[]).await.unwrap_err();
        assert!(matches!(err, StoreError::NotConfigured(_)));
        assert!(!store.is_initialized());
        assert_eq!(store.max_batch_size(), MAX_BATCH_WRITES);
    }

    #[tokio::test]
    async fn test_reports_inner_batch_size() {
        let store = LazyStore::new(|| {
            Ok::<_, StoreError>(
                Arc::new(InMemoryStore::new().with_max_batch_size(10)) as Arc<dyn DocumentStore>
            )
        });
        store.commit(&[]).await.unwrap();
        assert_eq!(store.max_batch_size(), 10);
    }
}

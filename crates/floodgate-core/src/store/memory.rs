//! In-memory document store.
//!
//! Used by the gateway when no external store is wired in, and by tests. It
//! honours the same contract as a real store (atomic bounded commits) and can
//! be told to fail.

use super::{Document, DocumentStore, WriteOp, MAX_BATCH_WRITES};
use crate::error::StoreError;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

type DocKey = (String, String);

/// Document store backed by a `HashMap`.
pub struct InMemoryStore {
    documents: RwLock<HashMap<DocKey, Document>>,
    max_batch_size: usize,
    latency: Option<Duration>,
    available: AtomicBool,
    fail_next: AtomicU32,
    commits: AtomicU64,
    committed_writes: AtomicU64,
    history: Option<Mutex<Vec<Vec<WriteOp>>>>,
}

impl InMemoryStore {
    /// Create an empty store with the standard batch limit.
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            max_batch_size: MAX_BATCH_WRITES,
            latency: None,
            available: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
            commits: AtomicU64::new(0),
            committed_writes: AtomicU64::new(0),
            history: None,
        }
    }

    /// Set the per-commit write limit.
    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = max;
        self
    }

    /// Keep a copy of every successful commit for
    /// [`committed_batches`](Self::committed_batches). Off by default; the
    /// log grows without bound.
    pub fn with_history(mut self) -> Self {
        self.history = Some(Mutex::new(Vec::new()));
        self
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Seed a document directly.
    pub fn insert(&self, collection: &str, doc_id: &str, data: Document) {
        self.documents
            .write()
            .insert((collection.to_string(), doc_id.to_string()), data);
    }

    /// Read a document without going through the async interface.
    pub fn document(&self, collection: &str, doc_id: &str) -> Option<Document> {
        self.documents
            .read()
            .get(&(collection.to_string(), doc_id.to_string()))
            .cloned()
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the next `n` commits fail with `Unavailable`.
    pub fn fail_next_commits(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Take the store down or bring it back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Successful commits so far.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Writes applied by successful commits.
    pub fn committed_writes(&self) -> u64 {
        self.committed_writes.load(Ordering::SeqCst)
    }

    /// Every successful commit, oldest first. Empty unless built
    /// [`with_history`](Self::with_history).
    pub fn committed_batches(&self) -> Vec<Vec<WriteOp>> {
        self.history
            .as_ref()
            .map(|history| history.lock().clone())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("store is offline".into()))
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn merge_into(target: &mut Document, fields: &Document) {
    for (k, v) in fields {
        target.insert(k.clone(), v.clone());
    }
}

/// Apply `writes` to a staged copy of the touched documents.
fn stage(
    documents: &HashMap<DocKey, Document>,
    writes: &[WriteOp],
) -> Result<HashMap<DocKey, Option<Document>>, StoreError> {
    let mut staged: HashMap<DocKey, Option<Document>> = HashMap::new();

    for write in writes {
        let key = (write.collection().to_string(), write.doc_id().to_string());
        let current = staged
            .entry(key.clone())
            .or_insert_with(|| documents.get(&key).cloned());

        match write {
            WriteOp::Set { data, merge, .. } => {
                match current.as_mut() {
                    Some(existing) if *merge => merge_into(existing, data),
                    Some(existing) => *existing = data.clone(),
                    None => *current = Some(data.clone()),
                }
            }
            WriteOp::Update { data, .. } => {
                let Some(existing) = current.as_mut() else {
                    return Err(StoreError::NotFound {
                        collection: key.0,
                        doc_id: key.1,
                    });
                };
                merge_into(existing, data);
            }
            WriteOp::Delete { .. } => *current = None,
        }
    }

    Ok(staged)
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn get(&self, collection: &str, doc_id: &str) -> Result<Option<Document>, StoreError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.check_available()?;
        Ok(self.document(collection, doc_id))
    }

    async fn commit(&self, writes: &[WriteOp]) -> Result<(), StoreError> {
        if writes.len() > self.max_batch_size {
            return Err(StoreError::BatchTooLarge {
                size: writes.len(),
                max: self.max_batch_size,
            });
        }

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        self.check_available()?;
        if self.take_injected_failure() {
            debug!(writes = writes.len(), "Injected commit failure");
            return Err(StoreError::Unavailable("injected failure".into()));
        }

        let mut documents = self.documents.write();
        let staged = stage(&documents, writes)?;
        for (key, doc) in staged {
            match doc {
                Some(doc) => {
                    documents.insert(key, doc);
                }
                None => {
                    documents.remove(&key);
                }
            }
        }
        drop(documents);

        if let Some(history) = &self.history {
            history.lock().push(writes.to_vec());
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.committed_writes
            .fetch_add(writes.len() as u64, Ordering::SeqCst);
        trace!(writes = writes.len(), "Commit applied");
        Ok(())
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}

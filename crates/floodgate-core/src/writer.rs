//! Buffered batch writer.
//!
//! Mutations are queued in a bounded FIFO buffer instead of being sent to the
//! store one by one. A timer (or a full batch) drains the buffer into atomic
//! commits of at most `max_batch_size` writes, each routed through the
//! circuit breaker with a timeout.
//!
//! ## Overload and failure policy
//!
//! - A full buffer rejects new operations (`enqueue_*` returns `false`).
//! - A failed commit stops the flush. Operations from that chunk go back to
//!   the front of the buffer once; an operation that fails a second time, or
//!   that no longer fits, is dropped and counted.

use crate::circuit_breaker::CircuitBreaker;
use crate::config::BatchWriterConfig;
use crate::error::StoreError;
use crate::maintenance::BackgroundTask;
use crate::metrics::{FlushDurationHistogram, FlushHistogram};
use crate::store::{Document, DocumentStore, WriteOp, MAX_BATCH_WRITES};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Kind of buffered mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Create, overwrite or merge
    Set,
    /// Merge into an existing document
    Update,
    /// Remove
    Delete,
}

/// A mutation waiting to be committed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOperation {
    /// Mutation kind
    pub kind: OperationKind,
    /// Target collection
    pub collection: String,
    /// Target document
    pub doc_id: String,
    /// Payload for set and update
    pub data: Option<Document>,
    /// Merge flag for set
    pub merge: bool,
    /// Whether this operation already failed one commit
    pub retried: bool,
}

impl BatchOperation {
    /// A set operation.
    pub fn set(collection: &str, doc_id: &str, data: Document, merge: bool) -> Self {
        Self::new(OperationKind::Set, collection, doc_id, Some(data), merge)
    }

    /// An update operation.
    pub fn update(collection: &str, doc_id: &str, data: Document) -> Self {
        Self::new(OperationKind::Update, collection, doc_id, Some(data), false)
    }

    /// A delete operation.
    pub fn delete(collection: &str, doc_id: &str) -> Self {
        Self::new(OperationKind::Delete, collection, doc_id, None, false)
    }

    fn new(
        kind: OperationKind,
        collection: &str,
        doc_id: &str,
        data: Option<Document>,
        merge: bool,
    ) -> Self {
        Self {
            kind,
            collection: collection.to_string(),
            doc_id: doc_id.to_string(),
            data,
            merge,
            retried: false,
        }
    }

    /// Store-facing form of this operation.
    pub fn to_write(&self) -> WriteOp {
        let collection = self.collection.clone();
        let doc_id = self.doc_id.clone();
        match self.kind {
            OperationKind::Set => WriteOp::Set {
                collection,
                doc_id,
                data: self.data.clone().unwrap_or_default(),
                merge: self.merge,
            },
            OperationKind::Update => WriteOp::Update {
                collection,
                doc_id,
                data: self.data.clone().unwrap_or_default(),
            },
            OperationKind::Delete => WriteOp::Delete { collection, doc_id },
        }
    }
}

/// Batch writer metrics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchWriterMetrics {
    /// Operations currently buffered
    pub buffer_depth: usize,
    /// Buffer capacity
    pub max_buffer_size: usize,
    /// buffer_depth / max_buffer_size
    pub buffer_pressure: f64,
    /// Operations accepted by enqueue
    pub total_ops: u64,
    /// Operations committed
    pub flushed_ops: u64,
    /// Commits that failed
    pub failed_flushes: u64,
    /// Operations rejected or discarded
    pub dropped_ops: u64,
    /// Operations put back for a second attempt
    pub retried_ops: u64,
    /// Whether a flush is in progress
    pub flushing: bool,
}

/// Resets the in-flight flag when a flush ends, even if it is cancelled.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Called with each chunk after the store has committed it.
pub type CommitHook = Box<dyn Fn(&[BatchOperation]) + Send + Sync>;

/// Buffered writer in front of a [`DocumentStore`].
pub struct BatchWriter {
    config: BatchWriterConfig,
    max_batch_size: usize,
    store: Arc<dyn DocumentStore>,
    breaker: Arc<CircuitBreaker>,
    buffer: Mutex<VecDeque<BatchOperation>>,
    flushing: AtomicBool,
    wake: Arc<Notify>,
    total_ops: AtomicU64,
    flushed_ops: AtomicU64,
    failed_flushes: AtomicU64,
    dropped_ops: AtomicU64,
    retried_ops: AtomicU64,
    histogram: FlushHistogram,
    on_commit: Option<CommitHook>,
    timer: BackgroundTask,
}

impl BatchWriter {
    /// Create a writer. The batch size is capped by the store's own limit.
    pub fn new(
        config: BatchWriterConfig,
        store: Arc<dyn DocumentStore>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        let store_limit = store.max_batch_size().clamp(1, MAX_BATCH_WRITES);
        let max_batch_size = config.max_batch_size.clamp(1, store_limit);
        if max_batch_size != config.max_batch_size {
            warn!(
                configured = config.max_batch_size,
                effective = max_batch_size,
                "Batch size capped to store limit"
            );
        }

        Self {
            max_batch_size,
            store,
            breaker,
            buffer: Mutex::new(VecDeque::with_capacity(config.max_buffer_size.min(1024))),
            flushing: AtomicBool::new(false),
            wake: Arc::new(Notify::new()),
            total_ops: AtomicU64::new(0),
            flushed_ops: AtomicU64::new(0),
            failed_flushes: AtomicU64::new(0),
            dropped_ops: AtomicU64::new(0),
            retried_ops: AtomicU64::new(0),
            histogram: FlushHistogram::new(),
            on_commit: None,
            timer: BackgroundTask::new("batch-writer-flush"),
            config,
        }
    }

    /// Run `hook` after every successful commit.
    pub fn with_commit_hook(
        mut self,
        hook: impl Fn(&[BatchOperation]) + Send + Sync + 'static,
    ) -> Self {
        self.on_commit = Some(Box::new(hook));
        self
    }

    /// Queue a set. Returns `false` if the buffer is full.
    pub fn enqueue_set(&self, collection: &str, doc_id: &str, data: Document, merge: bool) -> bool {
        self.enqueue(BatchOperation::set(collection, doc_id, data, merge))
    }

    /// Queue an update. Returns `false` if the buffer is full.
    pub fn enqueue_update(&self, collection: &str, doc_id: &str, data: Document) -> bool {
        self.enqueue(BatchOperation::update(collection, doc_id, data))
    }

    /// Queue a delete. Returns `false` if the buffer is full.
    pub fn enqueue_delete(&self, collection: &str, doc_id: &str) -> bool {
        self.enqueue(BatchOperation::delete(collection, doc_id))
    }

    /// Queue an operation. Returns `false` if the buffer is full.
    pub fn enqueue(&self, op: BatchOperation) -> bool {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.config.max_buffer_size {
            drop(buffer);
            self.dropped_ops.fetch_add(1, Ordering::Relaxed);
            warn!(
                collection = %op.collection,
                doc_id = %op.doc_id,
                max_buffer_size = self.config.max_buffer_size,
                "Write buffer full, operation rejected"
            );
            return false;
        }

        buffer.push_back(op);
        let depth = buffer.len();
        drop(buffer);

        self.total_ops.fetch_add(1, Ordering::Relaxed);
        if depth >= self.max_batch_size {
            self.wake.notify_one();
        }
        true
    }

    /// Drain the buffer into commits. Returns the number of operations
    /// committed by this call; 0 if another flush is already running.
    pub async fn flush(&self) -> usize {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Flush already in progress");
            return 0;
        }
        let _guard = FlushGuard(&self.flushing);

        let mut committed = 0;
        loop {
            let chunk: Vec<BatchOperation> = {
                let mut buffer = self.buffer.lock();
                if buffer.is_empty() {
                    break;
                }
                let n = buffer.len().min(self.max_batch_size);
                buffer.drain(..n).collect()
            };

            let writes: Vec<WriteOp> = chunk.iter().map(BatchOperation::to_write).collect();
            let started = Instant::now();
            let ok = self.commit(&writes).await;
            self.histogram.observe(started.elapsed());

            if ok {
                if let Some(hook) = &self.on_commit {
                    hook(&chunk);
                }
                committed += chunk.len();
                self.flushed_ops
                    .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                debug!(
                    writes = chunk.len(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Batch committed"
                );
            } else {
                self.failed_flushes.fetch_add(1, Ordering::Relaxed);
                self.requeue(chunk);
                break;
            }
        }

        committed
    }

    async fn commit(&self, writes: &[WriteOp]) -> bool {
        let timeout = self.config.commit_timeout();
        let store = &self.store;

        self.breaker
            .execute_with_fallback(
                || async move {
                    match tokio::time::timeout(timeout, store.commit(writes)).await {
                        Ok(result) => result.map(|()| true),
                        Err(_) => Err(StoreError::Timeout(timeout)),
                    }
                },
                |err| {
                    let err = StoreError::from(err);
                    warn!(
                        error = %err,
                        transient = err.is_transient(),
                        writes = writes.len(),
                        "Batch commit failed"
                    );
                    false
                },
            )
            .await
    }

    /// Put a failed chunk back at the front of the buffer, at most once per
    /// operation and only as far as there is room.
    fn requeue(&self, chunk: Vec<BatchOperation>) {
        let (exhausted, retryable): (Vec<_>, Vec<_>) =
            chunk.into_iter().partition(|op| op.retried);

        let mut buffer = self.buffer.lock();
        let room = self.config.max_buffer_size.saturating_sub(buffer.len());
        let requeued = retryable.len().min(room);
        let overflow = retryable.len() - requeued;

        for mut op in retryable.into_iter().take(requeued).rev() {
            op.retried = true;
            buffer.push_front(op);
        }
        drop(buffer);

        let dropped = exhausted.len() + overflow;
        self.retried_ops
            .fetch_add(requeued as u64, Ordering::Relaxed);
        self.dropped_ops.fetch_add(dropped as u64, Ordering::Relaxed);

        warn!(
            requeued,
            dropped_after_retry = exhausted.len(),
            dropped_no_room = overflow,
            "Failed batch returned to buffer"
        );
    }

    /// Start the flush timer.
    pub fn start(self: &Arc<Self>) -> bool {
        self.timer.spawn_periodic_or_notified(
            self,
            self.config.flush_interval(),
            Arc::clone(&self.wake),
            |writer| async move {
                writer.flush().await;
            },
        )
    }

    /// Stop the flush timer. Buffered operations are kept.
    pub fn stop(&self) {
        self.timer.stop();
    }

    /// Stop the timer, wait for it, then flush what is left.
    pub async fn shutdown(&self) {
        self.timer.stop();
        self.timer.join().await;

        let remaining = self.buffer.lock().len();
        let committed = self.flush().await;
        info!(
            remaining,
            committed,
            left_behind = self.buffer.lock().len(),
            "Batch writer shut down"
        );
    }

    /// Whether the flush timer is running.
    pub fn is_running(&self) -> bool {
        self.timer.is_running()
    }

    /// Effective batch size.
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Metrics snapshot.
    pub fn metrics(&self) -> BatchWriterMetrics {
        let buffer_depth = self.buffer.lock().len();
        let max_buffer_size = self.config.max_buffer_size;
        BatchWriterMetrics {
            buffer_depth,
            max_buffer_size,
            buffer_pressure: if max_buffer_size == 0 {
                0.0
            } else {
                buffer_depth as f64 / max_buffer_size as f64
            },
            total_ops: self.total_ops.load(Ordering::Relaxed),
            flushed_ops: self.flushed_ops.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
            dropped_ops: self.dropped_ops.load(Ordering::Relaxed),
            retried_ops: self.retried_ops.load(Ordering::Relaxed),
            flushing: self.flushing.load(Ordering::Acquire),
        }
    }

    /// Commit duration histogram.
    pub fn flush_histogram(&self) -> FlushDurationHistogram {
        self.histogram.snapshot()
    }

    /// Buffered operations, oldest first.
    pub fn pending_operations(&self) -> Vec<BatchOperation> {
        self.buffer.lock().iter().cloned().collect()
    }
}

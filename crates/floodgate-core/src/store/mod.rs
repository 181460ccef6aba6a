//! Document store seam.
//!
//! The batch writer and the read path talk to the downstream document store
//! only through [`DocumentStore`]. Commits are atomic and bounded by
//! [`DocumentStore::max_batch_size`].

mod lazy;
mod memory;

pub use lazy::{LazyStore, StoreFactory};
pub use memory::InMemoryStore;

use crate::error::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Hard per-commit write limit of the downstream store.
pub const MAX_BATCH_WRITES: usize = 500;

/// A stored document: a JSON object.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// One write inside an atomic commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteOp {
    /// Create or overwrite a document, or merge top-level fields into it
    Set {
        collection: String,
        doc_id: String,
        data: Document,
        merge: bool,
    },
    /// Merge top-level fields into an existing document
    Update {
        collection: String,
        doc_id: String,
        data: Document,
    },
    /// Remove a document
    Delete { collection: String, doc_id: String },
}

impl WriteOp {
    /// Target collection.
    pub fn collection(&self) -> &str {
        match self {
            WriteOp::Set { collection, .. }
            | WriteOp::Update { collection, .. }
            | WriteOp::Delete { collection, .. } => collection,
        }
    }

    /// Target document id.
    pub fn doc_id(&self) -> &str {
        match self {
            WriteOp::Set { doc_id, .. }
            | WriteOp::Update { doc_id, .. }
            | WriteOp::Delete { doc_id, .. } => doc_id,
        }
    }

    /// Operation kind for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WriteOp::Set { .. } => "set",
            WriteOp::Update { .. } => "update",
            WriteOp::Delete { .. } => "delete",
        }
    }
}

/// Downstream document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read one document. `Ok(None)` when it does not exist.
    async fn get(&self, collection: &str, doc_id: &str) -> Result<Option<Document>, StoreError>;

    /// Apply all `writes` atomically: either every write lands or none does.
    async fn commit(&self, writes: &[WriteOp]) -> Result<(), StoreError>;

    /// Maximum number of writes accepted by one commit.
    fn max_batch_size(&self) -> usize {
        MAX_BATCH_WRITES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_write_op_accessors() {
        let op = WriteOp::Delete {
            collection: "orders".into(),
            doc_id: "o-1".into(),
        };
        assert_eq!(op.collection(), "orders");
        assert_eq!(op.doc_id(), "o-1");
        assert_eq!(op.kind(), "delete");
    }

    #[test]
    fn test_write_op_serialization() {
        let data = json!({"status": "delivered"}).as_object().cloned().unwrap();
        let op = WriteOp::Update {
            collection: "orders".into(),
            doc_id: "o-1".into(),
            data,
        };

        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["op"], "update");
        assert_eq!(value["data"]["status"], "delivered");
    }
}

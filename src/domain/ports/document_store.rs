//! Document Store Port
//!
//! Read access to the source collection. Implementations may be an
//! in-process store, SQLite, or a client for a remote database.

use crate::domain::value_objects::{DocumentId, Namespace};
use async_trait::async_trait;
use serde_json::Value;

/// Errors surfaced by the source store and its replication log.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// The log discarded entries the cursor had not consumed yet.
    #[error("replication log cursor invalidated: entries after {position} were discarded")]
    CursorInvalidated { position: String },
    #[error("connection to source store lost: {0}")]
    ConnectionLost(String),
    #[error("source store error: {0}")]
    Backend(String),
}

/// Source of the documents being mirrored.
///
/// This is an outbound port. Records are returned as self-describing JSON
/// values carrying at least an `_id` field; decoding them is the caller's job.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Every document currently in the collection, in no particular order.
    async fn scan(&self, namespace: &Namespace) -> Result<Vec<Value>, StoreError>;

    /// Point lookup by identity.
    async fn find_by_id(
        &self,
        namespace: &Namespace,
        id: &DocumentId,
    ) -> Result<Option<Value>, StoreError>;
}

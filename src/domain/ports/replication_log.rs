//! Replication Log Port
//!
//! Defines how the engine tails the source store's log of write operations.

use crate::domain::entities::{op, RawLogRecord};
use crate::domain::ports::StoreError;
use crate::domain::value_objects::LogTimestamp;
use async_trait::async_trait;
use std::time::Duration;

/// Which log records a cursor yields and how long a read may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogFilter {
    /// Only records with a timestamp strictly greater than this are returned
    pub after: LogTimestamp,
    /// Upper bound on a single blocking read before it returns empty
    pub max_await: Duration,
}

impl LogFilter {
    pub fn new(after: LogTimestamp, max_await: Duration) -> Self {
        Self { after, max_await }
    }

    /// `ts > after AND (op in {i, u, d} OR (op == c AND o.drop exists))`
    pub fn matches(&self, record: &RawLogRecord) -> bool {
        if record.ts <= self.after {
            return false;
        }
        match record.op.as_str() {
            op::INSERT | op::UPDATE | op::DELETE => true,
            _ => record.is_drop_command(),
        }
    }
}

/// A tailable cursor over the replication log.
///
/// Never terminates on its own: when no record arrives within the filter's
/// `max_await` window, `next` returns `Ok(None)` and may be called again.
/// Dropping the cursor releases any server-side resources.
#[async_trait]
pub trait LogCursor: Send {
    /// Next matching record in log order.
    ///
    /// Returns `StoreError::CursorInvalidated` when the log discarded records
    /// this cursor had not yet read.
    async fn next(&mut self) -> Result<Option<RawLogRecord>, StoreError>;
}

/// The source store's replication log.
#[async_trait]
pub trait ReplicationLog: Send + Sync {
    /// Open a cursor positioned just after `filter.after`.
    async fn open_cursor(&self, filter: LogFilter) -> Result<Box<dyn LogCursor>, StoreError>;
}

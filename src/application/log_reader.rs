//! Log Reader
//!
//! Tails the replication log from a snapshot mark and yields decoded
//! entries one at a time, in log order.

use crate::domain::entities::LogEntry;
use crate::domain::ports::{LogCursor, LogFilter, ReplicationLog};
use crate::domain::value_objects::{LogTimestamp, SnapshotMark};
use crate::error::Result;
use std::time::Duration;

/// Sequential reader over a tailable log cursor.
///
/// The sequence never ends on its own: `next` keeps polling through empty
/// await windows. It cannot be restarted; a fresh reader needs a fresh mark.
pub struct LogReader {
    cursor: Box<dyn LogCursor>,
    filter: LogFilter,
    position: LogTimestamp,
    skipped: u64,
}

impl LogReader {
    /// Open a cursor over entries strictly after `mark`.
    pub async fn open(
        log: &dyn ReplicationLog,
        mark: SnapshotMark,
        max_await: Duration,
    ) -> Result<Self> {
        let filter = LogFilter::new(mark.timestamp(), max_await);
        let cursor = log.open_cursor(filter).await?;
        tracing::debug!("opened log cursor after {} (await {:?})", mark, max_await);
        Ok(Self {
            cursor,
            filter,
            position: mark.timestamp(),
            skipped: 0,
        })
    }

    /// Timestamp of the last record consumed.
    pub fn position(&self) -> LogTimestamp {
        self.position
    }

    /// Records dropped because they did not decode or went back in time.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Wait for the next entry.
    ///
    /// Only a cursor failure ends the sequence; a cursor invalidated by the
    /// store surfaces as `MirrorError::CursorInvalidated`.
    pub async fn next(&mut self) -> Result<LogEntry> {
        loop {
            let record = match self.cursor.next().await? {
                Some(record) => record,
                None => {
                    tracing::trace!("no log entries after {}", self.position);
                    continue;
                }
            };

            // stores without server-side filtering hand us everything
            if !self.filter.matches(&record) {
                continue;
            }

            // timestamps may repeat but never go backwards
            if record.ts < self.position {
                tracing::warn!(
                    "log entry at {} precedes {}, skipping",
                    record.ts,
                    self.position
                );
                self.skipped += 1;
                continue;
            }
            self.position = record.ts;

            match LogEntry::try_from(record) {
                Ok(entry) => return Ok(entry),
                Err(e) => {
                    tracing::warn!("undecodable log entry at {}: {}", self.position, e);
                    self.skipped += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::MemoryDocumentStore;
    use crate::domain::entities::{Operation, RawLogRecord};
    use crate::domain::ports::StoreError;
    use crate::domain::value_objects::{DocumentId, Namespace};
    use crate::error::MirrorError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;

    /// Cursor replaying a fixed script, with no server-side filtering.
    struct ScriptedCursor {
        script: VecDeque<std::result::Result<Option<RawLogRecord>, StoreError>>,
    }

    #[async_trait]
    impl LogCursor for ScriptedCursor {
        async fn next(&mut self) -> std::result::Result<Option<RawLogRecord>, StoreError> {
            match self.script.pop_front() {
                Some(step) => step,
                None => std::future::pending().await,
            }
        }
    }

    fn reader(script: Vec<std::result::Result<Option<RawLogRecord>, StoreError>>) -> LogReader {
        LogReader {
            cursor: Box::new(ScriptedCursor {
                script: script.into(),
            }),
            filter: LogFilter::new(LogTimestamp::new(100, 0), Duration::from_millis(10)),
            position: LogTimestamp::new(100, 0),
            skipped: 0,
        }
    }

    fn ns() -> Namespace {
        Namespace::new("shop", "orders")
    }

    #[tokio::test]
    async fn test_skips_empty_windows() {
        let insert = RawLogRecord::insert(LogTimestamp::new(100, 1), &ns(), json!({"_id": "A1"}));
        let mut reader = reader(vec![Ok(None), Ok(None), Ok(Some(insert))]);

        let entry = reader.next().await.unwrap();
        assert_eq!(entry.timestamp, LogTimestamp::new(100, 1));
        assert_eq!(reader.position(), LogTimestamp::new(100, 1));
    }

    #[tokio::test]
    async fn test_filters_client_side() {
        let old = RawLogRecord::insert(LogTimestamp::new(99, 1), &ns(), json!({"_id": "old"}));
        let noop = RawLogRecord::noop(LogTimestamp::new(100, 1), "noop");
        let rename = RawLogRecord::command(
            LogTimestamp::new(100, 2),
            "shop",
            json!({"renameCollection": "shop.orders"}),
        );
        let delete = RawLogRecord::delete(LogTimestamp::new(100, 3), &ns(), json!("A1"));
        let mut reader = reader(vec![Ok(Some(old)), Ok(Some(noop)), Ok(Some(rename)), Ok(Some(delete))]);

        let entry = reader.next().await.unwrap();
        assert!(matches!(entry.operation, Operation::Delete { .. }));
        assert_eq!(reader.skipped(), 0);
    }

    #[tokio::test]
    async fn test_skips_undecodable_entries() {
        let broken = RawLogRecord::insert(LogTimestamp::new(100, 1), &ns(), json!({"no_id": true}));
        let good = RawLogRecord::insert(LogTimestamp::new(100, 2), &ns(), json!({"_id": "A1"}));
        let mut reader = reader(vec![Ok(Some(broken)), Ok(Some(good))]);

        let entry = reader.next().await.unwrap();
        assert_eq!(entry.timestamp, LogTimestamp::new(100, 2));
        assert_eq!(reader.skipped(), 1);
    }

    #[tokio::test]
    async fn test_skips_entries_that_go_backwards() {
        let first = RawLogRecord::insert(LogTimestamp::new(100, 2), &ns(), json!({"_id": "A1"}));
        let stale = RawLogRecord::insert(LogTimestamp::new(100, 1), &ns(), json!({"_id": "A0"}));
        let next = RawLogRecord::delete(LogTimestamp::new(100, 3), &ns(), json!("A1"));
        let mut reader = reader(vec![Ok(Some(first)), Ok(Some(stale)), Ok(Some(next))]);

        reader.next().await.unwrap();
        let entry = reader.next().await.unwrap();
        assert!(matches!(entry.operation, Operation::Delete { .. }));
        assert_eq!(reader.skipped(), 1);
    }

    #[tokio::test]
    async fn test_delivers_entries_sharing_a_timestamp() {
        let ts = LogTimestamp::new(100, 1);
        let a = RawLogRecord::insert(ts, &ns(), json!({"_id": "A"}));
        let b = RawLogRecord::insert(ts, &ns(), json!({"_id": "B"}));
        let mut reader = reader(vec![Ok(Some(a)), Ok(Some(b))]);

        let first = reader.next().await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), reader.next())
            .await
            .unwrap()
            .unwrap();

        match (first.operation, second.operation) {
            (Operation::Insert { document: a }, Operation::Insert { document: b }) => {
                assert_eq!(a.id, DocumentId::from("A"));
                assert_eq!(b.id, DocumentId::from("B"));
            }
            other => panic!("unexpected operations {:?}", other),
        }
        assert_eq!(reader.skipped(), 0);
    }

    #[tokio::test]
    async fn test_invalidated_cursor_is_fatal() {
        let mut reader = reader(vec![Err(StoreError::CursorInvalidated {
            position: "Timestamp(100, 0)".to_string(),
        })]);

        let err = reader.next().await.unwrap_err();
        assert!(matches!(err, MirrorError::CursorInvalidated(_)));
    }

    #[tokio::test]
    async fn test_open_against_memory_store() {
        let store = MemoryDocumentStore::new();
        let mark = SnapshotMark::now();
        let mut reader = LogReader::open(&store, mark, Duration::from_millis(20)).await.unwrap();

        store.insert(&ns(), json!({"_id": "A1", "value": 1})).unwrap();

        let entry = tokio::time::timeout(Duration::from_secs(1), reader.next())
            .await
            .unwrap()
            .unwrap();
        assert!(entry.timestamp > mark.timestamp());
        assert_eq!(entry.namespace, ns());
    }
}

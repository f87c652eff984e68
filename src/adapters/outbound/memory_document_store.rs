//! In-Memory Document Store
//!
//! Implements DocumentStore and ReplicationLog in process. Every write
//! appends a record to a capped replication log; tailing cursors wake on
//! appends and are invalidated when the cap discards records they have not
//! read yet.

use crate::domain::entities::RawLogRecord;
use crate::domain::ports::{DocumentStore, LogCursor, LogFilter, ReplicationLog, StoreError};
use crate::domain::value_objects::{DocumentId, LogTimestamp, Namespace};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Default number of records the log retains.
pub const DEFAULT_LOG_CAPACITY: usize = 100_000;

#[derive(Default)]
struct MemoryState {
    collections: HashMap<Namespace, BTreeMap<DocumentId, Value>>,
    log: VecDeque<(u64, RawLogRecord)>,
    next_seq: u64,
    /// Highest sequence number dropped by the cap (0 = none)
    discarded_through: u64,
    /// Timestamp of the last dropped record
    discarded_latest: Option<LogTimestamp>,
    clock: LogTimestamp,
}

struct Shared {
    state: RwLock<MemoryState>,
    appended: Notify,
    disconnected: AtomicBool,
    log_capacity: usize,
}

/// In-process document store with a replication log.
///
/// Cheap to clone; clones share the same data.
#[derive(Clone)]
pub struct MemoryDocumentStore {
    shared: Arc<Shared>,
}

impl MemoryDocumentStore {
    /// Create an empty store with the default log capacity.
    pub fn new() -> Self {
        Self::with_log_capacity(DEFAULT_LOG_CAPACITY)
    }

    /// Create an empty store whose log keeps at most `capacity` records.
    pub fn with_log_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(MemoryState {
                    next_seq: 1,
                    ..Default::default()
                }),
                appended: Notify::new(),
                disconnected: AtomicBool::new(false),
                log_capacity: capacity.max(1),
            }),
        }
    }

    /// Bulk-load documents without logging them, as if they predate the log.
    ///
    /// Documents without a usable `_id` are skipped.
    pub fn load(&self, namespace: &Namespace, documents: Vec<Value>) -> Result<usize, StoreError> {
        self.check_connected()?;
        let mut state = self.shared.state.write();
        let collection = state.collections.entry(namespace.clone()).or_default();
        let mut loaded = 0;
        for document in documents {
            let Some(id) = DocumentId::of_record(&document) else {
                continue;
            };
            collection.insert(id, document);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Load a JSON array of documents from a file.
    pub fn load_json_file(&self, namespace: &Namespace, path: &Path) -> anyhow::Result<usize> {
        let file = std::fs::File::open(path)?;
        let documents: Vec<Value> = serde_json::from_reader(std::io::BufReader::new(file))?;
        Ok(self.load(namespace, documents)?)
    }

    /// Insert a new document. An `_id` is generated when absent.
    pub fn insert(&self, namespace: &Namespace, mut document: Value) -> Result<DocumentId, StoreError> {
        self.check_connected()?;
        let object = document
            .as_object_mut()
            .ok_or_else(|| StoreError::Backend("document must be an object".to_string()))?;
        if !object.contains_key("_id") {
            object.insert("_id".to_string(), json!(uuid::Uuid::new_v4().simple().to_string()));
        }
        let id = DocumentId::of_record(&document)
            .ok_or_else(|| StoreError::Backend("unusable _id".to_string()))?;

        let mut state = self.shared.state.write();
        let collection = state.collections.entry(namespace.clone()).or_default();
        if collection.contains_key(&id) {
            return Err(StoreError::Backend(format!("duplicate key {}", id)));
        }
        collection.insert(id.clone(), document.clone());
        self.append(&mut state, |ts| RawLogRecord::insert(ts, namespace, document));
        Ok(id)
    }

    /// Set top-level fields of a document. Returns false if it does not exist.
    ///
    /// The log records only the changed fields, not the full document.
    pub fn update(&self, namespace: &Namespace, id: &DocumentId, fields: Value) -> Result<bool, StoreError> {
        self.check_connected()?;
        let changes = fields
            .as_object()
            .ok_or_else(|| StoreError::Backend("update fields must be an object".to_string()))?
            .clone();

        let mut state = self.shared.state.write();
        let Some(document) = state
            .collections
            .get_mut(namespace)
            .and_then(|c| c.get_mut(id))
        else {
            return Ok(false);
        };
        let raw_id = document["_id"].clone();
        if let Some(object) = document.as_object_mut() {
            for (key, value) in changes.iter().filter(|(k, _)| k.as_str() != "_id") {
                object.insert(key.clone(), value.clone());
            }
        }
        self.append(&mut state, |ts| {
            RawLogRecord::update(ts, namespace, raw_id, json!({ "$set": Value::Object(changes) }))
        });
        Ok(true)
    }

    /// Replace a whole document, keyed by its `_id`. Returns false if it does not exist.
    pub fn replace(&self, namespace: &Namespace, document: Value) -> Result<bool, StoreError> {
        self.check_connected()?;
        let id = DocumentId::of_record(&document)
            .ok_or_else(|| StoreError::Backend("document without _id".to_string()))?;

        let mut state = self.shared.state.write();
        let Some(existing) = state
            .collections
            .get_mut(namespace)
            .and_then(|c| c.get_mut(&id))
        else {
            return Ok(false);
        };
        *existing = document.clone();
        let raw_id = document["_id"].clone();
        self.append(&mut state, |ts| RawLogRecord::update(ts, namespace, raw_id, document));
        Ok(true)
    }

    /// Delete a document. Returns false if it did not exist.
    pub fn delete(&self, namespace: &Namespace, id: &DocumentId) -> Result<bool, StoreError> {
        self.check_connected()?;
        let mut state = self.shared.state.write();
        let Some(document) = state
            .collections
            .get_mut(namespace)
            .and_then(|c| c.remove(id))
        else {
            return Ok(false);
        };
        let raw_id = document["_id"].clone();
        self.append(&mut state, |ts| RawLogRecord::delete(ts, namespace, raw_id));
        Ok(true)
    }

    /// Drop a whole collection. Returns false if it did not exist.
    pub fn drop_collection(&self, namespace: &Namespace) -> Result<bool, StoreError> {
        self.check_connected()?;
        let mut state = self.shared.state.write();
        if state.collections.remove(namespace).is_none() {
            return Ok(false);
        }
        self.append(&mut state, |ts| RawLogRecord::drop_collection(ts, namespace));
        Ok(true)
    }

    /// Record a collection-level command that changes no documents.
    pub fn log_command(&self, database: &str, body: Value) -> Result<(), StoreError> {
        self.check_connected()?;
        let mut state = self.shared.state.write();
        self.append(&mut state, |ts| RawLogRecord::command(ts, database, body));
        Ok(())
    }

    /// Simulate losing the connection: every later call fails.
    pub fn disconnect(&self) {
        self.shared.disconnected.store(true, Ordering::SeqCst);
        self.shared.appended.notify_waiters();
    }

    pub fn document_count(&self, namespace: &Namespace) -> usize {
        self.shared
            .state
            .read()
            .collections
            .get(namespace)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    pub fn log_len(&self) -> usize {
        self.shared.state.read().log.len()
    }

    fn check_connected(&self) -> Result<(), StoreError> {
        check_connected(&self.shared)
    }

    /// Stamp and append a record, enforcing the cap, then wake tailing cursors.
    fn append(&self, state: &mut MemoryState, make: impl FnOnce(LogTimestamp) -> RawLogRecord) {
        let ts = state.clock.successor(LogTimestamp::unix_seconds());
        state.clock = ts;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.log.push_back((seq, make(ts)));

        while state.log.len() > self.shared.log_capacity {
            if let Some((seq, record)) = state.log.pop_front() {
                state.discarded_through = seq;
                state.discarded_latest = Some(record.ts);
            }
        }

        self.shared.appended.notify_waiters();
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

fn check_connected(shared: &Shared) -> Result<(), StoreError> {
    if shared.disconnected.load(Ordering::SeqCst) {
        return Err(StoreError::ConnectionLost("store disconnected".to_string()));
    }
    Ok(())
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn scan(&self, namespace: &Namespace) -> Result<Vec<Value>, StoreError> {
        self.check_connected()?;
        Ok(self
            .shared
            .state
            .read()
            .collections
            .get(namespace)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn find_by_id(
        &self,
        namespace: &Namespace,
        id: &DocumentId,
    ) -> Result<Option<Value>, StoreError> {
        self.check_connected()?;
        Ok(self
            .shared
            .state
            .read()
            .collections
            .get(namespace)
            .and_then(|c| c.get(id))
            .cloned())
    }
}

#[async_trait]
impl ReplicationLog for MemoryDocumentStore {
    async fn open_cursor(&self, filter: LogFilter) -> Result<Box<dyn LogCursor>, StoreError> {
        self.check_connected()?;
        let state = self.shared.state.read();

        if matches!(state.discarded_latest, Some(ts) if ts > filter.after) {
            return Err(StoreError::CursorInvalidated {
                position: filter.after.to_string(),
            });
        }

        let last_seq = state
            .log
            .iter()
            .take_while(|(_, record)| record.ts <= filter.after)
            .last()
            .map(|(seq, _)| *seq)
            .unwrap_or(state.discarded_through);

        Ok(Box::new(MemoryLogCursor {
            shared: self.shared.clone(),
            filter,
            last_seq,
        }))
    }
}

/// Tailing cursor over the in-memory log.
struct MemoryLogCursor {
    shared: Arc<Shared>,
    filter: LogFilter,
    last_seq: u64,
}

impl MemoryLogCursor {
    /// Advance over already-appended records, returning the first match.
    fn poll(&mut self) -> Result<Option<RawLogRecord>, StoreError> {
        check_connected(&self.shared)?;
        let state = self.shared.state.read();

        if state.discarded_through > self.last_seq {
            return Err(StoreError::CursorInvalidated {
                position: format!("sequence {}", self.last_seq),
            });
        }

        let Some(front_seq) = state.log.front().map(|(seq, _)| *seq) else {
            return Ok(None);
        };
        let start = (self.last_seq + 1).saturating_sub(front_seq) as usize;

        for (seq, record) in state.log.iter().skip(start) {
            self.last_seq = *seq;
            if self.filter.matches(record) {
                return Ok(Some(record.clone()));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl LogCursor for MemoryLogCursor {
    async fn next(&mut self) -> Result<Option<RawLogRecord>, StoreError> {
        let deadline = tokio::time::Instant::now() + self.filter.max_await;
        loop {
            let shared = self.shared.clone();
            let notified = shared.appended.notified();
            tokio::pin!(notified);
            // register before polling so an append in between is not missed
            notified.as_mut().enable();

            if let Some(record) = self.poll()? {
                return Ok(Some(record));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::op;
    use std::time::Duration;

    fn ns() -> Namespace {
        Namespace::new("shop", "orders")
    }

    fn filter_from_start() -> LogFilter {
        LogFilter::new(LogTimestamp::default(), Duration::from_millis(50))
    }

    // ===== Document Tests =====

    #[tokio::test]
    async fn test_insert_and_find() {
        let store = MemoryDocumentStore::new();
        let id = store.insert(&ns(), json!({"_id": "A1", "value": 1})).unwrap();

        let found = store.find_by_id(&ns(), &id).await.unwrap();
        assert_eq!(found, Some(json!({"_id": "A1", "value": 1})));
        assert_eq!(store.scan(&ns()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ids_of_different_kinds_are_separate_documents() {
        let store = MemoryDocumentStore::new();
        let int = store.insert(&ns(), json!({"_id": 42, "kind": "int"})).unwrap();
        let string = store.insert(&ns(), json!({"_id": "42", "kind": "str"})).unwrap();
        assert_ne!(int, string);

        assert!(store.delete(&ns(), &int).unwrap());
        assert!(store.find_by_id(&ns(), &int).await.unwrap().is_none());
        let found = store.find_by_id(&ns(), &string).await.unwrap().unwrap();
        assert_eq!(found["kind"], "str");
    }

    #[tokio::test]
    async fn test_insert_generates_id() {
        let store = MemoryDocumentStore::new();
        let id = store.insert(&ns(), json!({"value": 1})).unwrap();

        let found = store.find_by_id(&ns(), &id).await.unwrap().unwrap();
        assert_eq!(DocumentId::of_record(&found), Some(id));
    }

    #[test]
    fn test_duplicate_insert_fails() {
        let store = MemoryDocumentStore::new();
        store.insert(&ns(), json!({"_id": "A1"})).unwrap();
        assert!(store.insert(&ns(), json!({"_id": "A1"})).is_err());
    }

    #[tokio::test]
    async fn test_update_merges_fields_and_logs_delta() {
        let store = MemoryDocumentStore::new();
        let id = store.insert(&ns(), json!({"_id": "A1", "value": 1, "name": "a"})).unwrap();

        assert!(store.update(&ns(), &id, json!({"value": 2})).unwrap());

        let found = store.find_by_id(&ns(), &id).await.unwrap().unwrap();
        assert_eq!(found, json!({"_id": "A1", "value": 2, "name": "a"}));

        let mut cursor = store.open_cursor(filter_from_start()).await.unwrap();
        cursor.next().await.unwrap().unwrap(); // insert
        let update = cursor.next().await.unwrap().unwrap();
        assert_eq!(update.op, op::UPDATE);
        assert_eq!(update.o, json!({"$set": {"value": 2}}));
        assert_eq!(update.o2, Some(json!({"_id": "A1"})));
    }

    #[test]
    fn test_update_missing_document() {
        let store = MemoryDocumentStore::new();
        assert!(!store.update(&ns(), &DocumentId::from("nope"), json!({"v": 1})).unwrap());
        assert_eq!(store.log_len(), 0);
    }

    #[tokio::test]
    async fn test_delete_and_drop() {
        let store = MemoryDocumentStore::new();
        let id = store.insert(&ns(), json!({"_id": "A1"})).unwrap();
        store.insert(&ns(), json!({"_id": "A2"})).unwrap();

        assert!(store.delete(&ns(), &id).unwrap());
        assert!(!store.delete(&ns(), &id).unwrap());
        assert_eq!(store.document_count(&ns()), 1);

        assert!(store.drop_collection(&ns()).unwrap());
        assert_eq!(store.document_count(&ns()), 0);
        assert!(!store.drop_collection(&ns()).unwrap());
    }

    #[tokio::test]
    async fn test_load_does_not_log() {
        let store = MemoryDocumentStore::new();
        let loaded = store
            .load(&ns(), vec![json!({"_id": "A1"}), json!({"_id": "A2"}), json!({"x": 1})])
            .unwrap();
        assert_eq!(loaded, 2);
        assert_eq!(store.log_len(), 0);
        assert_eq!(store.scan(&ns()).await.unwrap().len(), 2);
    }

    #[test]
    fn test_load_json_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), r#"[{"_id": "A1", "value": 1}, {"_id": 7}]"#).unwrap();

        let store = MemoryDocumentStore::new();
        assert_eq!(store.load_json_file(&ns(), file.path()).unwrap(), 2);
        assert_eq!(store.document_count(&ns()), 2);
    }

    // ===== Log Tests =====

    #[tokio::test]
    async fn test_timestamps_are_strictly_increasing() {
        let store = MemoryDocumentStore::new();
        for i in 0..5 {
            store.insert(&ns(), json!({"_id": i})).unwrap();
        }

        let mut cursor = store.open_cursor(filter_from_start()).await.unwrap();
        let mut last = LogTimestamp::default();
        for _ in 0..5 {
            let record = cursor.next().await.unwrap().unwrap();
            assert!(record.ts > last);
            last = record.ts;
        }
    }

    #[tokio::test]
    async fn test_cursor_returns_none_when_idle() {
        let store = MemoryDocumentStore::new();
        let mut cursor = store.open_cursor(filter_from_start()).await.unwrap();
        assert!(cursor.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cursor_wakes_on_append() {
        let store = MemoryDocumentStore::new();
        let filter = LogFilter::new(LogTimestamp::default(), Duration::from_secs(5));
        let mut cursor = store.open_cursor(filter).await.unwrap();

        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.insert(&ns(), json!({"_id": "late"})).unwrap();
        });

        let record = tokio::time::timeout(Duration::from_secs(1), cursor.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(record.o["_id"], "late");
    }

    #[tokio::test]
    async fn test_cursor_starts_after_filter_timestamp() {
        let store = MemoryDocumentStore::new();
        store.insert(&ns(), json!({"_id": "before"})).unwrap();
        let mut probe = store.open_cursor(filter_from_start()).await.unwrap();
        let first_ts = probe.next().await.unwrap().unwrap().ts;

        store.insert(&ns(), json!({"_id": "after"})).unwrap();

        let filter = LogFilter::new(first_ts, Duration::from_millis(50));
        let mut cursor = store.open_cursor(filter).await.unwrap();
        let record = cursor.next().await.unwrap().unwrap();
        assert_eq!(record.o["_id"], "after");
    }

    #[tokio::test]
    async fn test_cursor_skips_filtered_records() {
        let store = MemoryDocumentStore::new();
        store
            .log_command("shop", json!({"createIndexes": "orders"}))
            .unwrap();
        store.insert(&ns(), json!({"_id": "A1"})).unwrap();

        let mut cursor = store.open_cursor(filter_from_start()).await.unwrap();
        let record = cursor.next().await.unwrap().unwrap();
        assert_eq!(record.op, op::INSERT);
    }

    #[tokio::test]
    async fn test_cursor_invalidated_when_log_wraps() {
        let store = MemoryDocumentStore::with_log_capacity(2);
        let mut cursor = store.open_cursor(filter_from_start()).await.unwrap();

        for i in 0..4 {
            store.insert(&ns(), json!({"_id": i})).unwrap();
        }

        let err = cursor.next().await.unwrap_err();
        assert!(matches!(err, StoreError::CursorInvalidated { .. }));
    }

    #[tokio::test]
    async fn test_open_fails_when_window_already_discarded() {
        let store = MemoryDocumentStore::with_log_capacity(1);
        store.insert(&ns(), json!({"_id": 1})).unwrap();
        store.insert(&ns(), json!({"_id": 2})).unwrap();

        let result = store.open_cursor(filter_from_start()).await;
        assert!(matches!(result, Err(StoreError::CursorInvalidated { .. })));
    }

    #[tokio::test]
    async fn test_disconnect_fails_everything() {
        let store = MemoryDocumentStore::new();
        let mut cursor = store.open_cursor(filter_from_start()).await.unwrap();
        store.disconnect();

        assert!(matches!(
            store.scan(&ns()).await,
            Err(StoreError::ConnectionLost(_))
        ));
        assert!(matches!(cursor.next().await, Err(StoreError::ConnectionLost(_))));
        assert!(store.insert(&ns(), json!({"_id": 1})).is_err());
    }
}

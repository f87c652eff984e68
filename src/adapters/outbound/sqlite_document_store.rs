//! SQLite Document Store
//!
//! Implements DocumentStore and ReplicationLog on a SQLite file. Documents
//! live in one table keyed by namespace and id; every write appends a row
//! to an `oplog` table in the same transaction. The log can be trimmed,
//! which invalidates cursors that have not read the trimmed rows.

use crate::domain::entities::RawLogRecord;
use crate::domain::ports::{DocumentStore, LogCursor, LogFilter, ReplicationLog, StoreError};
use crate::domain::value_objects::{DocumentId, LogTimestamp, Namespace};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};

/// Default interval between log polls while a cursor awaits data.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS documents (
    namespace TEXT NOT NULL,
    id        TEXT NOT NULL,
    body      TEXT NOT NULL,
    PRIMARY KEY (namespace, id)
);
CREATE TABLE IF NOT EXISTS oplog (
    seq     INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_secs INTEGER NOT NULL,
    ts_inc  INTEGER NOT NULL,
    op      TEXT NOT NULL,
    ns      TEXT NOT NULL,
    o       TEXT NOT NULL,
    o2      TEXT
);
CREATE TABLE IF NOT EXISTS oplog_meta (
    id           INTEGER PRIMARY KEY CHECK (id = 1),
    trimmed_seq  INTEGER NOT NULL DEFAULT 0,
    trimmed_secs INTEGER,
    trimmed_inc  INTEGER
);
INSERT OR IGNORE INTO oplog_meta (id, trimmed_seq) VALUES (1, 0);
";

/// Server-side equivalent of `LogFilter::matches` on the op kind.
const MATCHING_OPS: &str =
    "(op IN ('i', 'u', 'd') OR (op = 'c' AND json_extract(o, '$.drop') IS NOT NULL))";

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Document store backed by a SQLite database.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    conn: Arc<Mutex<Connection>>,
    poll_interval: Duration,
}

impl SqliteDocumentStore {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(backend)?;
        Self::with_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Change how often waiting cursors poll the log.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Insert a new document. An `_id` is generated when absent.
    pub fn insert(&self, namespace: &Namespace, mut document: Value) -> Result<DocumentId, StoreError> {
        let object = document
            .as_object_mut()
            .ok_or_else(|| backend("document must be an object"))?;
        if !object.contains_key("_id") {
            object.insert("_id".to_string(), json!(uuid::Uuid::new_v4().simple().to_string()));
        }
        let id = DocumentId::of_record(&document).ok_or_else(|| backend("unusable _id"))?;

        self.write(|tx| {
            tx.execute(
                "INSERT INTO documents (namespace, id, body) VALUES (?1, ?2, ?3)",
                params![namespace.to_string(), id.segment(), document.to_string()],
            )?;
            append(tx, RawLogRecord::insert(next_timestamp(tx)?, namespace, document.clone()))?;
            Ok(())
        })?;
        Ok(id)
    }

    /// Set top-level fields of a document. Returns false if it does not exist.
    pub fn update(&self, namespace: &Namespace, id: &DocumentId, fields: Value) -> Result<bool, StoreError> {
        let changes = fields
            .as_object()
            .ok_or_else(|| backend("update fields must be an object"))?
            .clone();

        self.write(|tx| {
            let Some(mut document) = load_document(tx, namespace, id)? else {
                return Ok(false);
            };
            if let Some(object) = document.as_object_mut() {
                for (key, value) in changes.iter().filter(|(k, _)| k.as_str() != "_id") {
                    object.insert(key.clone(), value.clone());
                }
            }
            store_document(tx, namespace, id, &document)?;
            let delta = json!({ "$set": Value::Object(changes.clone()) });
            append(
                tx,
                RawLogRecord::update(next_timestamp(tx)?, namespace, document["_id"].clone(), delta),
            )?;
            Ok(true)
        })
    }

    /// Replace a whole document, keyed by its `_id`. Returns false if it does not exist.
    pub fn replace(&self, namespace: &Namespace, document: Value) -> Result<bool, StoreError> {
        let id = DocumentId::of_record(&document).ok_or_else(|| backend("document without _id"))?;

        self.write(|tx| {
            if load_document(tx, namespace, &id)?.is_none() {
                return Ok(false);
            }
            store_document(tx, namespace, &id, &document)?;
            append(
                tx,
                RawLogRecord::update(
                    next_timestamp(tx)?,
                    namespace,
                    document["_id"].clone(),
                    document.clone(),
                ),
            )?;
            Ok(true)
        })
    }

    /// Delete a document. Returns false if it did not exist.
    pub fn delete(&self, namespace: &Namespace, id: &DocumentId) -> Result<bool, StoreError> {
        self.write(|tx| {
            let Some(document) = load_document(tx, namespace, id)? else {
                return Ok(false);
            };
            tx.execute(
                "DELETE FROM documents WHERE namespace = ?1 AND id = ?2",
                params![namespace.to_string(), id.segment()],
            )?;
            append(
                tx,
                RawLogRecord::delete(next_timestamp(tx)?, namespace, document["_id"].clone()),
            )?;
            Ok(true)
        })
    }

    /// Drop a whole collection. Returns false if it held no documents.
    pub fn drop_collection(&self, namespace: &Namespace) -> Result<bool, StoreError> {
        self.write(|tx| {
            let removed = tx.execute(
                "DELETE FROM documents WHERE namespace = ?1",
                params![namespace.to_string()],
            )?;
            if removed == 0 {
                return Ok(false);
            }
            append(tx, RawLogRecord::drop_collection(next_timestamp(tx)?, namespace))?;
            Ok(true)
        })
    }

    /// Record a collection-level command that changes no documents.
    pub fn log_command(&self, database: &str, body: Value) -> Result<(), StoreError> {
        self.write(|tx| {
            append(tx, RawLogRecord::command(next_timestamp(tx)?, database, body.clone()))?;
            Ok(())
        })
    }

    /// Bulk-load documents without logging them. Documents without a usable
    /// `_id` are skipped.
    pub fn load(&self, namespace: &Namespace, documents: Vec<Value>) -> Result<usize, StoreError> {
        self.write(|tx| {
            let mut loaded = 0;
            for document in &documents {
                let Some(id) = DocumentId::of_record(document) else {
                    continue;
                };
                store_document(tx, namespace, &id, document)?;
                loaded += 1;
            }
            Ok(loaded)
        })
    }

    /// Discard all but the newest `keep` log records.
    ///
    /// Returns the number of records removed.
    pub fn trim_log(&self, keep: usize) -> Result<usize, StoreError> {
        self.write(|tx| {
            let cutoff: Option<(i64, u32, u32)> = tx
                .query_row(
                    "SELECT seq, ts_secs, ts_inc FROM oplog ORDER BY seq DESC LIMIT 1 OFFSET ?1",
                    params![keep as i64],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let Some((seq, secs, inc)) = cutoff else {
                return Ok(0);
            };
            let removed = tx.execute("DELETE FROM oplog WHERE seq <= ?1", params![seq])?;
            tx.execute(
                "UPDATE oplog_meta SET trimmed_seq = ?1, trimmed_secs = ?2, trimmed_inc = ?3 WHERE id = 1",
                params![seq, secs, inc],
            )?;
            tracing::debug!("trimmed {} log records through sequence {}", removed, seq);
            Ok(removed)
        })
    }

    pub fn log_len(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM oplog", [], |row| row.get::<_, i64>(0))
            .map(|n| n as usize)
            .map_err(backend)
    }

    fn write<T>(&self, f: impl FnOnce(&Transaction) -> rusqlite::Result<T>) -> Result<T, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(backend)?;
        let result = f(&tx).map_err(backend)?;
        tx.commit().map_err(backend)?;
        Ok(result)
    }

    /// Run a read on the blocking pool.
    async fn read<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || f(&*conn.lock()))
            .await
            .map_err(|e| StoreError::ConnectionLost(format!("blocking task failed: {}", e)))?
    }
}

fn load_document(tx: &Transaction, namespace: &Namespace, id: &DocumentId) -> rusqlite::Result<Option<Value>> {
    let body: Option<String> = tx
        .query_row(
            "SELECT body FROM documents WHERE namespace = ?1 AND id = ?2",
            params![namespace.to_string(), id.segment()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(body.and_then(|b| serde_json::from_str(&b).ok()))
}

fn store_document(tx: &Transaction, namespace: &Namespace, id: &DocumentId, document: &Value) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT OR REPLACE INTO documents (namespace, id, body) VALUES (?1, ?2, ?3)",
        params![namespace.to_string(), id.segment(), document.to_string()],
    )?;
    Ok(())
}

/// Timestamp for the next record: strictly after the newest one, trimmed or not.
fn next_timestamp(tx: &Transaction) -> rusqlite::Result<LogTimestamp> {
    let newest: Option<(u32, u32)> = tx
        .query_row(
            "SELECT ts_secs, ts_inc FROM oplog ORDER BY seq DESC LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let newest = match newest {
        Some((secs, inc)) => LogTimestamp::new(secs, inc),
        None => trimmed_timestamp(tx)?.unwrap_or_default(),
    };
    Ok(newest.successor(LogTimestamp::unix_seconds()))
}

fn trimmed_timestamp(conn: &Connection) -> rusqlite::Result<Option<LogTimestamp>> {
    conn.query_row(
        "SELECT trimmed_secs, trimmed_inc FROM oplog_meta WHERE id = 1",
        [],
        |row| {
            let secs: Option<u32> = row.get(0)?;
            let inc: Option<u32> = row.get(1)?;
            Ok(secs.zip(inc).map(|(s, i)| LogTimestamp::new(s, i)))
        },
    )
}

fn append(tx: &Transaction, record: RawLogRecord) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO oplog (ts_secs, ts_inc, op, ns, o, o2) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record.ts.seconds,
            record.ts.increment,
            record.op,
            record.ns,
            record.o.to_string(),
            record.o2.map(|v| v.to_string()),
        ],
    )?;
    Ok(())
}

fn row_to_record(row: &Row) -> rusqlite::Result<(i64, RawLogRecord)> {
    let o: String = row.get(5)?;
    let o2: Option<String> = row.get(6)?;
    Ok((
        row.get(0)?,
        RawLogRecord {
            ts: LogTimestamp::new(row.get(1)?, row.get(2)?),
            op: row.get(3)?,
            ns: row.get(4)?,
            o: serde_json::from_str(&o).unwrap_or(Value::Null),
            o2: o2.and_then(|v| serde_json::from_str(&v).ok()),
        },
    ))
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn scan(&self, namespace: &Namespace) -> Result<Vec<Value>, StoreError> {
        let namespace = namespace.to_string();
        self.read(move |conn| {
            let mut stmt = conn
                .prepare("SELECT body FROM documents WHERE namespace = ?1 ORDER BY id")
                .map_err(backend)?;
            let bodies = stmt
                .query_map(params![namespace], |row| row.get::<_, String>(0))
                .map_err(backend)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(backend)?;
            bodies
                .iter()
                .map(|b| serde_json::from_str::<Value>(b).map_err(backend))
                .collect()
        })
        .await
    }

    async fn find_by_id(
        &self,
        namespace: &Namespace,
        id: &DocumentId,
    ) -> Result<Option<Value>, StoreError> {
        let namespace = namespace.to_string();
        let id = id.segment();
        self.read(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM documents WHERE namespace = ?1 AND id = ?2",
                    params![namespace, id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(backend)?;
            body.map(|b| serde_json::from_str::<Value>(&b).map_err(backend))
                .transpose()
        })
        .await
    }
}

#[async_trait]
impl ReplicationLog for SqliteDocumentStore {
    async fn open_cursor(&self, filter: LogFilter) -> Result<Box<dyn LogCursor>, StoreError> {
        let after = filter.after;
        let last_seq = self
            .read(move |conn| {
                if matches!(trimmed_timestamp(conn).map_err(backend)?, Some(ts) if ts > after) {
                    return Err(StoreError::CursorInvalidated {
                        position: after.to_string(),
                    });
                }
                conn.query_row(
                    "SELECT COALESCE(MAX(seq), (SELECT trimmed_seq FROM oplog_meta WHERE id = 1))
                     FROM oplog WHERE ts_secs < ?1 OR (ts_secs = ?1 AND ts_inc <= ?2)",
                    params![after.seconds, after.increment],
                    |row| row.get::<_, i64>(0),
                )
                .map_err(backend)
            })
            .await?;

        Ok(Box::new(SqliteLogCursor {
            store: self.clone(),
            filter,
            last_seq,
        }))
    }
}

/// Polling cursor over the `oplog` table.
struct SqliteLogCursor {
    store: SqliteDocumentStore,
    filter: LogFilter,
    last_seq: i64,
}

impl SqliteLogCursor {
    /// Next matching record after `last_seq`, or the highest sequence
    /// scanned past when there is none.
    async fn poll(&self) -> Result<(i64, Option<RawLogRecord>), StoreError> {
        let last_seq = self.last_seq;
        let after = self.filter.after;
        self.store
            .read(move |conn| {
                let trimmed_seq: i64 = conn
                    .query_row("SELECT trimmed_seq FROM oplog_meta WHERE id = 1", [], |row| {
                        row.get(0)
                    })
                    .map_err(backend)?;
                if trimmed_seq > last_seq {
                    return Err(StoreError::CursorInvalidated {
                        position: format!("sequence {}", last_seq),
                    });
                }
                let sql = format!(
                    "SELECT seq, ts_secs, ts_inc, op, ns, o, o2 FROM oplog
                     WHERE seq > ?1 AND (ts_secs > ?2 OR (ts_secs = ?2 AND ts_inc > ?3))
                     AND {}
                     ORDER BY seq LIMIT 1",
                    MATCHING_OPS
                );
                let found = conn
                    .query_row(
                        &sql,
                        params![last_seq, after.seconds, after.increment],
                        row_to_record,
                    )
                    .optional()
                    .map_err(backend)?;
                if let Some((seq, record)) = found {
                    return Ok((seq, Some(record)));
                }
                let newest: i64 = conn
                    .query_row(
                        "SELECT COALESCE(MAX(seq), ?1) FROM oplog",
                        params![last_seq],
                        |row| row.get(0),
                    )
                    .map_err(backend)?;
                Ok((newest.max(last_seq), None))
            })
            .await
    }
}

#[async_trait]
impl LogCursor for SqliteLogCursor {
    async fn next(&mut self) -> Result<Option<RawLogRecord>, StoreError> {
        let deadline = Instant::now() + self.filter.max_await;
        loop {
            let (seq, record) = self.poll().await?;
            self.last_seq = seq;
            if record.is_some() {
                return Ok(record);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep(self.store.poll_interval.min(deadline - now)).await;
        }
    }
}

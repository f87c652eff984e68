//! Domain Entities - Documents and replication log entries
//!
//! `RawLogRecord` is the shape records have on the wire; `LogEntry` is the
//! decoded form the engine works with, carrying a closed `Operation` sum
//! type so each kind only exposes the fields relevant to it.

use crate::domain::value_objects::{DocumentId, LogTimestamp, Namespace};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Operation codes used by replication log records.
pub mod op {
    pub const INSERT: &str = "i";
    pub const UPDATE: &str = "u";
    pub const DELETE: &str = "d";
    pub const COMMAND: &str = "c";
    pub const NOOP: &str = "n";
}

/// Errors raised while decoding records coming from the source store.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("record has no usable _id field")]
    MissingId,
    #[error("invalid namespace: {0:?}")]
    InvalidNamespace(String),
    #[error("{op} record has no payload")]
    MissingPayload { op: String },
}

/// A document read from the source collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Identity taken from the `_id` field
    pub id: DocumentId,
    /// The full record, `_id` included; this is what the topic holds
    pub body: Value,
}

impl Document {
    /// Decode a self-describing record. Fails when `_id` is absent or unusable.
    pub fn from_record(body: Value) -> Result<Self, DecodeError> {
        let id = DocumentId::of_record(&body).ok_or(DecodeError::MissingId)?;
        Ok(Self { id, body })
    }
}

/// A record as stored in the replication log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLogRecord {
    /// Log timestamp
    pub ts: LogTimestamp,
    /// Operation code (`i`, `u`, `d`, `c`, `n`, ...)
    pub op: String,
    /// Originating namespace, `database.collection`
    pub ns: String,
    /// Kind-specific payload
    #[serde(default)]
    pub o: Value,
    /// Update target, `{"_id": ...}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o2: Option<Value>,
}

impl RawLogRecord {
    pub fn insert(ts: LogTimestamp, ns: &Namespace, document: Value) -> Self {
        Self {
            ts,
            op: op::INSERT.to_string(),
            ns: ns.to_string(),
            o: document,
            o2: None,
        }
    }

    pub fn update(ts: LogTimestamp, ns: &Namespace, id: Value, delta: Value) -> Self {
        Self {
            ts,
            op: op::UPDATE.to_string(),
            ns: ns.to_string(),
            o: delta,
            o2: Some(json!({ "_id": id })),
        }
    }

    pub fn delete(ts: LogTimestamp, ns: &Namespace, id: Value) -> Self {
        Self {
            ts,
            op: op::DELETE.to_string(),
            ns: ns.to_string(),
            o: json!({ "_id": id }),
            o2: None,
        }
    }

    /// A `drop` command for `ns`, recorded against the database's `$cmd` namespace.
    pub fn drop_collection(ts: LogTimestamp, ns: &Namespace) -> Self {
        Self {
            ts,
            op: op::COMMAND.to_string(),
            ns: ns.command_namespace().to_string(),
            o: json!({ "drop": ns.collection }),
            o2: None,
        }
    }

    pub fn command(ts: LogTimestamp, database: &str, body: Value) -> Self {
        Self {
            ts,
            op: op::COMMAND.to_string(),
            ns: Namespace::new(database, "").command_namespace().to_string(),
            o: body,
            o2: None,
        }
    }

    pub fn noop(ts: LogTimestamp, message: &str) -> Self {
        Self {
            ts,
            op: op::NOOP.to_string(),
            ns: String::new(),
            o: json!({ "msg": message }),
            o2: None,
        }
    }

    /// Whether this is a command record whose body names a dropped collection.
    pub fn is_drop_command(&self) -> bool {
        self.op == op::COMMAND && self.o.get("drop").is_some()
    }
}

/// Collection-level command carried by a command entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// The named collection was dropped
    Drop { collection: String },
    /// Any other command (rename, index builds, ...), identified by its first key
    Other { name: String },
}

/// What a log entry did, with only the fields relevant to that kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Insert { document: Document },
    /// Only the identity is trusted; the delta may be partial.
    Update { id: DocumentId, delta: Value },
    Delete { id: DocumentId },
    Command(Command),
    Other { kind: String },
}

impl Operation {
    /// Short name for logging.
    pub fn kind(&self) -> &str {
        match self {
            Operation::Insert { .. } => "insert",
            Operation::Update { .. } => "update",
            Operation::Delete { .. } => "delete",
            Operation::Command(_) => "command",
            Operation::Other { kind } => kind,
        }
    }
}

/// A decoded replication log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub timestamp: LogTimestamp,
    pub namespace: Namespace,
    pub operation: Operation,
}

impl TryFrom<RawLogRecord> for LogEntry {
    type Error = DecodeError;

    fn try_from(record: RawLogRecord) -> Result<Self, Self::Error> {
        let namespace =
            Namespace::parse(&record.ns).ok_or_else(|| DecodeError::InvalidNamespace(record.ns.clone()))?;

        let operation = match record.op.as_str() {
            op::INSERT => Operation::Insert {
                document: Document::from_record(record.o)?,
            },
            op::UPDATE => {
                let target = record.o2.as_ref().ok_or_else(|| DecodeError::MissingPayload {
                    op: record.op.clone(),
                })?;
                Operation::Update {
                    id: DocumentId::of_record(target).ok_or(DecodeError::MissingId)?,
                    delta: record.o,
                }
            }
            op::DELETE => Operation::Delete {
                id: DocumentId::of_record(&record.o).ok_or(DecodeError::MissingId)?,
            },
            op::COMMAND => Operation::Command(decode_command(&record.o)?),
            other => Operation::Other {
                kind: other.to_string(),
            },
        };

        Ok(Self {
            timestamp: record.ts,
            namespace,
            operation,
        })
    }
}

fn decode_command(body: &Value) -> Result<Command, DecodeError> {
    let map = body.as_object().ok_or_else(|| DecodeError::MissingPayload {
        op: op::COMMAND.to_string(),
    })?;

    if let Some(Value::String(collection)) = map.get("drop") {
        return Ok(Command::Drop {
            collection: collection.clone(),
        });
    }

    Ok(Command::Other {
        name: map.keys().next().cloned().unwrap_or_default(),
    })
}

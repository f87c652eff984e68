//! Value Objects - Immutable domain primitives
//!
//! Identities, namespaces, timestamps and topic paths. They are compared
//! by value and can be freely cloned and shared.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Delimiter between topic path segments.
pub const PATH_DELIMITER: char = '/';

/// Collection name of a database's administrative namespace.
pub const COMMAND_COLLECTION: &str = "$cmd";

/// Identity assigned by the source store to a document.
///
/// The kind of `_id` is part of the identity: the integer `42`, the string
/// `"42"` and the object id `{"$oid": "42"}` are three different documents.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DocumentId {
    ObjectId(String),
    Str(String),
    Int(i64),
}

/// Leaf prefix of integer identities.
const INT_MARKER: char = '#';
/// Leaf prefix of object identities.
const OBJECT_ID_MARKER: char = '$';

impl DocumentId {
    /// Decode an identity from the value of an `_id` field.
    ///
    /// Accepts plain strings, extended-JSON object ids (`{"$oid": "..."}`)
    /// and integers that fit in an `i64`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Self::Str(s.clone())),
            Value::Number(n) => n.as_i64().map(Self::Int),
            Value::Object(map) => match map.get("$oid") {
                Some(Value::String(hex)) if !hex.is_empty() => Some(Self::ObjectId(hex.clone())),
                _ => None,
            },
            _ => None,
        }
    }

    /// Extract the identity from a record's `_id` field.
    pub fn of_record(record: &Value) -> Option<Self> {
        record.get("_id").and_then(Self::from_value)
    }

    /// Single path segment naming this identity.
    ///
    /// Distinct identities always give distinct segments, and a segment
    /// never contains the path delimiter. Strings are percent-escaped so
    /// they cannot collide with the `#` and `$` prefixes of the other kinds.
    pub fn segment(&self) -> String {
        match self {
            Self::Int(n) => format!("{}{}", INT_MARKER, n),
            Self::ObjectId(hex) => format!("{}{}", OBJECT_ID_MARKER, escape_segment(hex)),
            Self::Str(s) => escape_segment(s),
        }
    }
}

/// Percent-escape the characters that would break a path segment or
/// collide with the identity-kind prefixes.
fn escape_segment(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' | PATH_DELIMITER | INT_MARKER | OBJECT_ID_MARKER => {
                escaped.push_str(&format!("%{:02X}", c as u32));
            }
            _ => escaped.push(c),
        }
    }
    escaped
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<i64> for DocumentId {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ObjectId(hex) => write!(f, "ObjectId({})", hex),
            Self::Str(s) => write!(f, "{:?}", s),
            Self::Int(n) => write!(f, "{}", n),
        }
    }
}

/// A `database.collection` pair identifying where a log entry originated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Parse `database.collection`. The collection part may itself contain dots.
    pub fn parse(s: &str) -> Option<Self> {
        let (database, collection) = s.split_once('.')?;
        if database.is_empty() || collection.is_empty() {
            return None;
        }
        Some(Self::new(database, collection))
    }

    /// The administrative namespace used for collection-level commands.
    pub fn command_namespace(&self) -> Self {
        Self::new(self.database.clone(), COMMAND_COLLECTION)
    }

    pub fn is_command(&self) -> bool {
        self.collection == COMMAND_COLLECTION
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// Replication log timestamp: seconds since the epoch plus an ordinal
/// distinguishing operations within the same second.
///
/// Ordering is lexicographic on `(seconds, increment)`. Stores hand out
/// increments starting at 1, so `(s, 0)` sorts before every entry of second `s`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogTimestamp {
    #[serde(rename = "t")]
    pub seconds: u32,
    #[serde(rename = "i")]
    pub increment: u32,
}

impl LogTimestamp {
    pub fn new(seconds: u32, increment: u32) -> Self {
        Self { seconds, increment }
    }

    /// Wall-clock seconds since the UNIX epoch.
    pub fn unix_seconds() -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0)
    }

    /// The timestamp that follows `self` if the next write happens at `now_secs`.
    pub fn successor(&self, now_secs: u32) -> Self {
        if now_secs > self.seconds {
            Self::new(now_secs, 1)
        } else {
            Self::new(self.seconds, self.increment + 1)
        }
    }
}

impl std::fmt::Display for LogTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Timestamp({}, {})", self.seconds, self.increment)
    }
}

/// Lower bound of the replay window, captured before the initial scan.
///
/// The mark sits at increment 0 of the current second, so every log entry
/// written during that second is replayed. Replaying a write the scan
/// already saw is harmless; missing one is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SnapshotMark(LogTimestamp);

impl SnapshotMark {
    /// Capture the mark from the wall clock.
    pub fn now() -> Self {
        Self::at(LogTimestamp::unix_seconds())
    }

    pub fn at(seconds: u32) -> Self {
        Self(LogTimestamp::new(seconds, 0))
    }

    pub fn timestamp(&self) -> LogTimestamp {
        self.0
    }
}

impl std::fmt::Display for SnapshotMark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Root of the mirrored subtree in the topic tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicRoot(String);

impl TopicRoot {
    /// Build a root from a path, trimming surrounding delimiters.
    pub fn new(path: &str) -> Option<Self> {
        let trimmed = path.trim_matches(PATH_DELIMITER);
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    /// `<topic>/<database>/<collection>`
    pub fn compose(topic: &str, namespace: &Namespace) -> Option<Self> {
        Self::new(&format!(
            "{}{}{}{}{}",
            topic.trim_matches(PATH_DELIMITER),
            PATH_DELIMITER,
            namespace.database,
            PATH_DELIMITER,
            namespace.collection
        ))
    }

    /// Derive the topic path of a document under this root.
    pub fn child(&self, id: &DocumentId) -> TopicPath {
        TopicPath(format!("{}{}{}", self.0, PATH_DELIMITER, id.segment()))
    }

    /// Whether `path` is this root or lies below it.
    pub fn contains(&self, path: &str) -> bool {
        is_at_or_below(path, &self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TopicRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Path of a single mirrored document topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPath(String);

impl TopicPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TopicPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Segment-aware prefix test: `a/b` is below `a` but `ab` is not.
pub fn is_at_or_below(path: &str, ancestor: &str) -> bool {
    match path.strip_prefix(ancestor) {
        Some("") => true,
        Some(rest) => rest.starts_with(PATH_DELIMITER),
        None => false,
    }
}

/// Strictly below `ancestor`, excluding the ancestor itself.
pub fn is_below(path: &str, ancestor: &str) -> bool {
    is_at_or_below(path, ancestor) && path.len() > ancestor.len()
}

//! Domain Layer
//!
//! Documents, log entries and the pure rules that map them onto the topic
//! tree. Talks to the outside world only through the ports.

pub mod entities;
pub mod ports;
pub mod services;
pub mod value_objects;

pub use entities::{Command, DecodeError, Document, LogEntry, Operation, RawLogRecord};
pub use value_objects::{DocumentId, LogTimestamp, Namespace, SnapshotMark, TopicPath, TopicRoot};

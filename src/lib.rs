//! doc-mirror Library
//!
//! Mirrors a document collection into a hierarchical topic tree: a
//! snapshot of the collection followed by a tail of its replication log.
//! Exposed as a library for the binary and the integration tests.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{acquire_update_lease, MirrorService, MirrorStats, UpdateLease};
pub use config::{load_config, Config, MirrorSettings};
pub use domain::entities::{Document, LogEntry, Operation, RawLogRecord};
pub use domain::ports::{DocumentStore, ReplicationLog, StoreError, TopicTree, TreeError};
pub use domain::value_objects::{DocumentId, LogTimestamp, Namespace, SnapshotMark, TopicRoot};
pub use error::{MirrorError, Result};
pub use infrastructure::ShutdownController;

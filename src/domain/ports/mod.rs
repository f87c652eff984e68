mod document_store;
mod replication_log;
mod topic_tree;

pub use document_store::{DocumentStore, StoreError};
pub use replication_log::{LogCursor, LogFilter, ReplicationLog};
pub use topic_tree::{PendingUpdateSource, TopicSelector, TopicTree, TreeError, UpdateSourceId};

mod dashmap_topic_tree;
mod memory_document_store;
mod sqlite_document_store;

pub use dashmap_topic_tree::{DashMapTopicTree, TopicEvent};
pub use memory_document_store::{MemoryDocumentStore, DEFAULT_LOG_CAPACITY};
pub use sqlite_document_store::{SqliteDocumentStore, DEFAULT_POLL_INTERVAL};

//! Topic Tree Port
//!
//! Defines the interface to the distribution service: a hierarchical
//! publish/subscribe namespace where each path holds a JSON value.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Errors reported by the topic tree.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TreeError {
    #[error("topic already exists: {0}")]
    TopicExists(String),
    #[error("no such topic: {0}")]
    NoSuchTopic(String),
    #[error("not the active update source for {0}")]
    NotUpdateSource(String),
    #[error("mutation rejected: {0}")]
    Rejected(String),
    #[error("session to the distribution service is closed")]
    SessionClosed,
}

impl TreeError {
    /// Only a lost session is fatal; every other error rejects a single mutation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TreeError::SessionClosed)
    }
}

/// Identifies one update-source registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UpdateSourceId(Uuid);

impl UpdateSourceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UpdateSourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UpdateSourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registration waiting to become the active update source.
///
/// `active` resolves once the tree grants exclusive update rights. It never
/// resolves while another source holds an overlapping root.
#[derive(Debug)]
pub struct PendingUpdateSource {
    pub id: UpdateSourceId,
    pub active: oneshot::Receiver<()>,
}

/// Which topics a removal applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicSelector {
    /// The path itself and everything below it
    PathAndDescendants(String),
    /// Everything below the path, leaving the path itself
    Descendants(String),
}

impl std::fmt::Display for TopicSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopicSelector::PathAndDescendants(path) => write!(f, ">{}", path),
            TopicSelector::Descendants(path) => write!(f, "?{}/", path),
        }
    }
}

/// The distribution service that holds the mirror.
///
/// This is an outbound port. Mutations are applied in the order they are
/// awaited.
#[async_trait]
pub trait TopicTree: Send + Sync {
    /// Ask for exclusive update rights over `root`.
    async fn register_update_source(&self, root: &str) -> Result<PendingUpdateSource, TreeError>;

    /// Give up a registration, active or pending. Unknown ids are ignored.
    async fn deregister_update_source(&self, id: UpdateSourceId) -> Result<(), TreeError>;

    /// Create a topic. Fails with `TopicExists` if the path is taken.
    async fn add_topic(&self, path: &str, value: &Value) -> Result<(), TreeError>;

    /// Set the value of an existing topic under the source's root.
    async fn update_topic(
        &self,
        source: UpdateSourceId,
        path: &str,
        value: &Value,
    ) -> Result<(), TreeError>;

    /// Remove the selected topics, returning how many were removed.
    /// Selecting nothing is not an error.
    async fn remove_topics(&self, selector: &TopicSelector) -> Result<usize, TreeError>;
}

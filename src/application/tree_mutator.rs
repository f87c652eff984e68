//! Tree Mutator
//!
//! Uniform create/update/remove interface over the topic tree. Rejected
//! mutations are logged and reported as an outcome; only a lost session
//! is returned as an error.

use crate::application::bootstrap::UpdateLease;
use crate::domain::ports::{TopicSelector, TreeError};
use crate::domain::value_objects::{TopicPath, TopicRoot};
use crate::error::{MirrorError, Result};
use serde_json::Value;

/// What happened to a single mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    Applied,
    Rejected(TreeError),
}

impl MutationOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, MutationOutcome::Applied)
    }
}

/// Applies mirror mutations under the rights granted by an `UpdateLease`.
pub struct TreeMutator {
    lease: UpdateLease,
}

impl TreeMutator {
    pub fn new(lease: UpdateLease) -> Self {
        Self { lease }
    }

    pub fn root(&self) -> &TopicRoot {
        self.lease.root()
    }

    /// Give back the lease so it can be released.
    pub fn into_lease(self) -> UpdateLease {
        self.lease
    }

    pub async fn create(&self, path: &TopicPath, value: &Value) -> Result<MutationOutcome> {
        tracing::debug!("creating {}", path);
        let result = self.lease.tree().add_topic(path.as_str(), value).await;
        settle("create", path.as_str(), result).map(|(outcome, _)| outcome)
    }

    pub async fn update(&self, path: &TopicPath, value: &Value) -> Result<MutationOutcome> {
        tracing::debug!("updating {}", path);
        let result = self
            .lease
            .tree()
            .update_topic(self.lease.source(), path.as_str(), value)
            .await;
        settle("update", path.as_str(), result).map(|(outcome, _)| outcome)
    }

    /// Remove `path` and everything below it. Removing nothing is not a rejection.
    pub async fn remove(&self, path: &TopicPath) -> Result<MutationOutcome> {
        let selector = TopicSelector::PathAndDescendants(path.to_string());
        self.remove_selected(&selector).await
    }

    /// Remove everything below the root, keeping the root itself.
    pub async fn remove_descendants(&self) -> Result<MutationOutcome> {
        let selector = TopicSelector::Descendants(self.root().to_string());
        self.remove_selected(&selector).await
    }

    async fn remove_selected(&self, selector: &TopicSelector) -> Result<MutationOutcome> {
        let result = self.lease.tree().remove_topics(selector).await;
        let (outcome, removed) = settle("remove", &selector.to_string(), result)?;
        if let Some(removed) = removed {
            tracing::debug!("removed {} topics for {}", removed, selector);
        }
        Ok(outcome)
    }
}

/// Split a tree result into an outcome, escalating only fatal errors.
fn settle<T>(
    action: &str,
    target: &str,
    result: std::result::Result<T, TreeError>,
) -> Result<(MutationOutcome, Option<T>)> {
    match result {
        Ok(value) => Ok((MutationOutcome::Applied, Some(value))),
        Err(e) if e.is_fatal() => {
            tracing::error!("{} {} failed: {}", action, target, e);
            Err(MirrorError::Tree(e))
        }
        Err(e) => {
            tracing::warn!("{} {} rejected: {}", action, target, e);
            Ok((MutationOutcome::Rejected(e), None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::DashMapTopicTree;
    use crate::application::bootstrap::acquire_update_lease;
    use crate::config::MirrorSettings;
    use crate::domain::ports::TopicTree;
    use crate::domain::value_objects::DocumentId;
    use serde_json::json;
    use std::sync::Arc;
    use tracing_test::traced_test;

    async fn mutator(tree: &Arc<DashMapTopicTree>) -> TreeMutator {
        let root = TopicRoot::new("root").unwrap();
        let lease = acquire_update_lease(tree.clone(), root, &MirrorSettings::default())
            .await
            .unwrap();
        TreeMutator::new(lease)
    }

    fn path(id: &str) -> TopicPath {
        TopicRoot::new("root").unwrap().child(&DocumentId::from(id))
    }

    #[tokio::test]
    async fn test_create_then_update() {
        let tree = Arc::new(DashMapTopicTree::new());
        let m = mutator(&tree).await;

        assert!(m.create(&path("A1"), &json!({"value": 1})).await.unwrap().is_applied());
        assert!(m.update(&path("A1"), &json!({"value": 2})).await.unwrap().is_applied());
        assert_eq!(tree.value("root/A1"), Some(json!({"value": 2})));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_duplicate_create_is_rejected_not_fatal() {
        let tree = Arc::new(DashMapTopicTree::new());
        let m = mutator(&tree).await;

        m.create(&path("A1"), &json!({"value": 1})).await.unwrap();
        let outcome = m.create(&path("A1"), &json!({"value": 9})).await.unwrap();

        assert_eq!(
            outcome,
            MutationOutcome::Rejected(TreeError::TopicExists("root/A1".to_string()))
        );
        assert_eq!(tree.value("root/A1"), Some(json!({"value": 1})));
        assert!(logs_contain("rejected"));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let tree = Arc::new(DashMapTopicTree::new());
        let m = mutator(&tree).await;
        m.create(&path("A1"), &json!({})).await.unwrap();

        assert!(m.remove(&path("A1")).await.unwrap().is_applied());
        assert!(m.remove(&path("A1")).await.unwrap().is_applied());
        assert!(tree.value("root/A1").is_none());
    }

    #[tokio::test]
    async fn test_remove_takes_descendants() {
        let tree = Arc::new(DashMapTopicTree::new());
        let m = mutator(&tree).await;
        m.create(&path("A1"), &json!({})).await.unwrap();
        tree.add_topic("root/A1/child", &json!({})).await.unwrap();
        tree.add_topic("root/A10", &json!({})).await.unwrap();

        m.remove(&path("A1")).await.unwrap();

        assert!(tree.value("root/A1/child").is_none());
        assert!(tree.value("root/A10").is_some());
    }

    #[tokio::test]
    async fn test_remove_descendants_keeps_root() {
        let tree = Arc::new(DashMapTopicTree::new());
        let m = mutator(&tree).await;
        tree.add_topic("root", &json!({})).await.unwrap();
        m.create(&path("B1"), &json!({})).await.unwrap();
        m.create(&path("B2"), &json!({})).await.unwrap();

        m.remove_descendants().await.unwrap();

        assert!(tree.value("root").is_some());
        assert_eq!(tree.paths_under("root").len(), 1);
    }

    #[tokio::test]
    async fn test_closed_session_is_fatal() {
        let tree = Arc::new(DashMapTopicTree::new());
        let m = mutator(&tree).await;
        tree.close();

        let err = m.create(&path("A1"), &json!({})).await.unwrap_err();
        assert!(matches!(err, MirrorError::Tree(TreeError::SessionClosed)));
    }
}

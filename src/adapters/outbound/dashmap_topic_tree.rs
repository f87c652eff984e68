//! DashMap Topic Tree
//!
//! Implements TopicTree in process using DashMap for concurrent access to
//! topic values. Update-source registrations are exclusive per subtree:
//! a registration whose root overlaps an active one waits on standby and is
//! promoted when the active source deregisters.

use crate::domain::ports::{
    PendingUpdateSource, TopicSelector, TopicTree, TreeError, UpdateSourceId,
};
use crate::domain::value_objects::{is_at_or_below, is_below, PATH_DELIMITER};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};

/// Change notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum TopicEvent {
    Added { path: String, value: Value },
    Updated { path: String, value: Value },
    Removed { path: String },
}

impl TopicEvent {
    pub fn path(&self) -> &str {
        match self {
            TopicEvent::Added { path, .. }
            | TopicEvent::Updated { path, .. }
            | TopicEvent::Removed { path } => path,
        }
    }
}

struct Standby {
    id: UpdateSourceId,
    root: String,
    activate: oneshot::Sender<()>,
}

#[derive(Default)]
struct Registry {
    active: Vec<(UpdateSourceId, String)>,
    standby: VecDeque<Standby>,
}

impl Registry {
    fn overlaps_active(&self, root: &str) -> bool {
        self.active.iter().any(|(_, r)| roots_overlap(r, root))
    }

    /// Activate standby registrations that no longer conflict, oldest first.
    fn promote(&mut self) {
        let mut waiting = std::mem::take(&mut self.standby);
        while let Some(candidate) = waiting.pop_front() {
            if self.overlaps_active(&candidate.root) {
                self.standby.push_back(candidate);
                continue;
            }
            // a receiver that went away belongs to an abandoned registration
            if candidate.activate.send(()).is_ok() {
                tracing::debug!("update source {} promoted for {}", candidate.id, candidate.root);
                self.active.push((candidate.id, candidate.root));
            }
        }
    }
}

fn roots_overlap(a: &str, b: &str) -> bool {
    is_at_or_below(a, b) || is_at_or_below(b, a)
}

fn normalize(path: &str) -> &str {
    path.trim_matches(PATH_DELIMITER)
}

/// DashMap-backed topic tree.
///
/// Stands in for a remote distribution service. `close` simulates losing
/// the session: every later call fails with `TreeError::SessionClosed`.
pub struct DashMapTopicTree {
    topics: Arc<DashMap<String, Value>>,
    sources: Mutex<Registry>,
    events: broadcast::Sender<TopicEvent>,
    closed: AtomicBool,
}

impl DashMapTopicTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            topics: Arc::new(DashMap::new()),
            sources: Mutex::new(Registry::default()),
            events,
            closed: AtomicBool::new(false),
        }
    }

    /// Receive change notifications for every topic.
    pub fn subscribe(&self) -> broadcast::Receiver<TopicEvent> {
        self.events.subscribe()
    }

    /// Close the session and drop all registrations.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut registry = self.sources.lock();
            registry.active.clear();
            registry.standby.clear();
            tracing::info!("topic tree session closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Current value of a topic.
    pub fn value(&self, path: &str) -> Option<Value> {
        self.topics.get(normalize(path)).map(|e| e.value().clone())
    }

    /// Whether `id` currently holds update rights.
    pub fn is_active_source(&self, id: UpdateSourceId) -> bool {
        self.sources.lock().active.iter().any(|(a, _)| *a == id)
    }

    /// Sorted paths at or below `ancestor`.
    pub fn paths_under(&self, ancestor: &str) -> Vec<String> {
        let ancestor = normalize(ancestor);
        let mut paths: Vec<String> = self
            .topics
            .iter()
            .filter(|e| is_at_or_below(e.key(), ancestor))
            .map(|e| e.key().clone())
            .collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    fn check_open(&self) -> Result<(), TreeError> {
        if self.is_closed() {
            return Err(TreeError::SessionClosed);
        }
        Ok(())
    }

    fn publish(&self, event: TopicEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Default for DashMapTopicTree {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TopicTree for DashMapTopicTree {
    async fn register_update_source(&self, root: &str) -> Result<PendingUpdateSource, TreeError> {
        self.check_open()?;
        let root = normalize(root);
        if root.is_empty() {
            return Err(TreeError::Rejected("empty update source root".to_string()));
        }

        let id = UpdateSourceId::new();
        let (activate, active) = oneshot::channel();
        let mut registry = self.sources.lock();

        if registry.overlaps_active(root) {
            tracing::debug!("update source {} on standby for {}", id, root);
            registry.standby.push_back(Standby {
                id,
                root: root.to_string(),
                activate,
            });
        } else {
            let _ = activate.send(());
            tracing::debug!("update source {} active for {}", id, root);
            registry.active.push((id, root.to_string()));
        }

        Ok(PendingUpdateSource { id, active })
    }

    async fn deregister_update_source(&self, id: UpdateSourceId) -> Result<(), TreeError> {
        // a closed session has already dropped every registration
        if self.is_closed() {
            return Ok(());
        }
        let mut registry = self.sources.lock();
        let before = registry.active.len();
        registry.active.retain(|(a, _)| *a != id);
        if registry.active.len() < before {
            tracing::debug!("update source {} deregistered", id);
            registry.promote();
        } else {
            registry.standby.retain(|s| s.id != id);
        }
        Ok(())
    }

    async fn add_topic(&self, path: &str, value: &Value) -> Result<(), TreeError> {
        self.check_open()?;
        let path = normalize(path);
        if path.is_empty() {
            return Err(TreeError::Rejected("empty topic path".to_string()));
        }

        match self.topics.entry(path.to_string()) {
            Entry::Occupied(_) => return Err(TreeError::TopicExists(path.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(value.clone());
            }
        }
        self.publish(TopicEvent::Added {
            path: path.to_string(),
            value: value.clone(),
        });
        Ok(())
    }

    async fn update_topic(
        &self,
        source: UpdateSourceId,
        path: &str,
        value: &Value,
    ) -> Result<(), TreeError> {
        self.check_open()?;
        let path = normalize(path);

        let authorized = self
            .sources
            .lock()
            .active
            .iter()
            .any(|(id, root)| *id == source && is_at_or_below(path, root));
        if !authorized {
            return Err(TreeError::NotUpdateSource(path.to_string()));
        }

        match self.topics.get_mut(path) {
            Some(mut entry) => *entry.value_mut() = value.clone(),
            None => return Err(TreeError::NoSuchTopic(path.to_string())),
        }
        self.publish(TopicEvent::Updated {
            path: path.to_string(),
            value: value.clone(),
        });
        Ok(())
    }

    async fn remove_topics(&self, selector: &TopicSelector) -> Result<usize, TreeError> {
        self.check_open()?;
        let selected: Vec<String> = match selector {
            TopicSelector::PathAndDescendants(path) => {
                let path = normalize(path);
                self.topics
                    .iter()
                    .filter(|e| is_at_or_below(e.key(), path))
                    .map(|e| e.key().clone())
                    .collect()
            }
            TopicSelector::Descendants(path) => {
                let path = normalize(path);
                self.topics
                    .iter()
                    .filter(|e| is_below(e.key(), path))
                    .map(|e| e.key().clone())
                    .collect()
            }
        };

        let mut removed = 0;
        for path in selected {
            if self.topics.remove(&path).is_some() {
                removed += 1;
                self.publish(TopicEvent::Removed { path });
            }
        }
        Ok(removed)
    }
}

//! Identity Map
//!
//! Bijection between source document identities and topic paths. It is a
//! cache derived from the source collection and rebuilt on every start.

use crate::domain::value_objects::{DocumentId, TopicPath, TopicRoot};
use std::collections::HashMap;

/// Result of assigning a topic path to a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    /// First sighting: the topic must be created at this path
    Created(TopicPath),
    /// Already mirrored: the topic at this path must be updated
    Existing(TopicPath),
}

impl Assignment {
    pub fn path(&self) -> &TopicPath {
        match self {
            Assignment::Created(path) | Assignment::Existing(path) => path,
        }
    }
}

/// Maps each mirrored document to its topic.
///
/// A key is present exactly when a topic for it exists under the root.
/// Owned by the relay task; not shared, not persisted.
#[derive(Debug)]
pub struct IdentityMap {
    root: TopicRoot,
    paths: HashMap<DocumentId, TopicPath>,
}

impl IdentityMap {
    pub fn new(root: TopicRoot) -> Self {
        Self {
            root,
            paths: HashMap::new(),
        }
    }

    pub fn root(&self) -> &TopicRoot {
        &self.root
    }

    /// Decide between create and update for `id`, recording new mappings.
    pub fn assign(&mut self, id: &DocumentId) -> Assignment {
        if let Some(path) = self.paths.get(id) {
            return Assignment::Existing(path.clone());
        }
        let path = self.root.child(id);
        self.paths.insert(id.clone(), path.clone());
        Assignment::Created(path)
    }

    pub fn lookup(&self, id: &DocumentId) -> Option<&TopicPath> {
        self.paths.get(id)
    }

    pub fn contains(&self, id: &DocumentId) -> bool {
        self.paths.contains_key(id)
    }

    /// Forget a document, returning the path it was mapped to.
    pub fn remove(&mut self, id: &DocumentId) -> Option<TopicPath> {
        self.paths.remove(id)
    }

    /// Forget everything; returns how many entries were dropped.
    pub fn clear(&mut self) -> usize {
        let count = self.paths.len();
        self.paths.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

//! Bootstrap Handshake
//!
//! Acquires exclusive update rights over the mirror root before anything
//! is written, and hands them out as an `UpdateLease`.

use crate::config::MirrorSettings;
use crate::domain::ports::{PendingUpdateSource, TopicSelector, TopicTree, TreeError, UpdateSourceId};
use crate::domain::value_objects::TopicRoot;
use crate::error::{MirrorError, Result};
use std::sync::Arc;

/// Exclusive right to mutate the topics under one root.
///
/// Held for the lifetime of the mirror. `release` gives the rights back so
/// another process can take over; a lease dropped without being released
/// gives them back on a background task.
pub struct UpdateLease {
    tree: Arc<dyn TopicTree>,
    root: TopicRoot,
    source: UpdateSourceId,
    clear_on_release: bool,
    released: bool,
}

impl UpdateLease {
    pub fn root(&self) -> &TopicRoot {
        &self.root
    }

    pub fn source(&self) -> UpdateSourceId {
        self.source
    }

    pub fn tree(&self) -> &Arc<dyn TopicTree> {
        &self.tree
    }

    /// Remove the mirrored subtree (when configured) and deregister.
    pub async fn release(mut self) -> std::result::Result<(), TreeError> {
        self.released = true;
        tracing::info!("releasing update rights on {}", self.root);
        release_rights(self.tree.clone(), self.root.clone(), self.source, self.clear_on_release).await
    }
}

impl Drop for UpdateLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let tree = self.tree.clone();
        let root = self.root.clone();
        let source = self.source;
        let clear = self.clear_on_release;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = release_rights(tree, root.clone(), source, clear).await {
                        tracing::warn!("failed to release update rights on {}: {}", root, e);
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    "update lease on {} dropped outside a runtime; rights not released",
                    self.root
                );
            }
        }
    }
}

async fn release_rights(
    tree: Arc<dyn TopicTree>,
    root: TopicRoot,
    source: UpdateSourceId,
    clear: bool,
) -> std::result::Result<(), TreeError> {
    if clear {
        match tree
            .remove_topics(&TopicSelector::PathAndDescendants(root.to_string()))
            .await
        {
            Ok(removed) => tracing::debug!("removed {} topics under {}", removed, root),
            Err(e) => tracing::warn!("failed to remove topics under {}: {}", root, e),
        }
    }
    tree.deregister_update_source(source).await
}

/// Register as the update source for `root`, wait for activation, then
/// clear whatever a previous owner left under the root.
///
/// Fails with `MirrorError::BootstrapTimeout` if the tree does not grant
/// the rights within `settings.bootstrap_timeout`.
pub async fn acquire_update_lease(
    tree: Arc<dyn TopicTree>,
    root: TopicRoot,
    settings: &MirrorSettings,
) -> Result<UpdateLease> {
    tracing::info!("registering update source for {}", root);
    let PendingUpdateSource { id, active } = tree.register_update_source(root.as_str()).await?;

    match tokio::time::timeout(settings.bootstrap_timeout, active).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => {
            if let Err(e) = tree.deregister_update_source(id).await {
                tracing::warn!("failed to withdraw registration for {}: {}", root, e);
            }
            return Err(MirrorError::RegistrationAborted(root.to_string()));
        }
        Err(_) => {
            if let Err(e) = tree.deregister_update_source(id).await {
                tracing::warn!("failed to withdraw registration for {}: {}", root, e);
            }
            tracing::error!(
                "no update rights on {} after {:?}",
                root,
                settings.bootstrap_timeout
            );
            return Err(MirrorError::BootstrapTimeout {
                root: root.to_string(),
                waited: settings.bootstrap_timeout,
            });
        }
    }

    let lease = UpdateLease {
        tree: tree.clone(),
        root,
        source: id,
        clear_on_release: settings.clear_on_release,
        released: false,
    };

    let removed = tree
        .remove_topics(&TopicSelector::PathAndDescendants(lease.root.to_string()))
        .await?;
    tracing::info!(
        "update source {} active for {} (cleared {} stale topics)",
        id,
        lease.root,
        removed
    );

    Ok(lease)
}

//! Mirror Service - Main application use case
//!
//! Transcribes a snapshot of the source collection into the topic tree,
//! then relays the replication log so the tree follows every later change.

use crate::application::bootstrap::{acquire_update_lease, UpdateLease};
use crate::application::log_reader::LogReader;
use crate::application::tree_mutator::{MutationOutcome, TreeMutator};
use crate::config::MirrorSettings;
use crate::domain::entities::{Document, LogEntry};
use crate::domain::ports::{DocumentStore, ReplicationLog, TopicTree, TreeError};
use crate::domain::services::{Assignment, IdentityMap, IgnoreReason, OperationDispatcher, Route};
use crate::domain::value_objects::{DocumentId, Namespace, SnapshotMark, TopicRoot};
use crate::error::Result;
use crate::infrastructure::ShutdownController;
use std::sync::Arc;
use tracing::Instrument;

/// Counters describing what the mirror has done.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorStats {
    /// Documents passed through create-or-update
    pub transcribed: u64,
    pub created: u64,
    pub updated: u64,
    pub removed: u64,
    /// Collection drops seen for the mirrored namespace
    pub drops: u64,
    /// Log entries that required no mutation
    pub ignored: u64,
    /// Updates whose document was gone when re-read
    pub inconsistencies: u64,
    /// Mutations the topic tree refused
    pub rejected: u64,
    /// Log entries applied
    pub relayed: u64,
    /// Records dropped because they could not be decoded
    pub skipped: u64,
}

/// Result of the initial scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotReport {
    /// Log position the relay must start after
    pub mark: SnapshotMark,
    pub transcribed: u64,
    pub skipped: u64,
}

/// Mirror service - main application use case.
///
/// Owns the update lease (through its `TreeMutator`) and the identity map.
/// All work happens on the task that calls `run`, one log entry at a time.
pub struct MirrorService {
    store: Arc<dyn DocumentStore>,
    log: Arc<dyn ReplicationLog>,
    mutator: TreeMutator,
    identities: IdentityMap,
    dispatcher: OperationDispatcher,
    settings: MirrorSettings,
    stats: MirrorStats,
}

impl MirrorService {
    /// Create a service that mirrors `namespace` under the lease's root.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        log: Arc<dyn ReplicationLog>,
        lease: UpdateLease,
        namespace: Namespace,
        settings: MirrorSettings,
    ) -> Self {
        let identities = IdentityMap::new(lease.root().clone());
        Self {
            store,
            log,
            mutator: TreeMutator::new(lease),
            identities,
            dispatcher: OperationDispatcher::new(namespace),
            settings,
            stats: MirrorStats::default(),
        }
    }

    /// Acquire update rights over `root` and build the service.
    pub async fn start(
        store: Arc<dyn DocumentStore>,
        log: Arc<dyn ReplicationLog>,
        tree: Arc<dyn TopicTree>,
        namespace: Namespace,
        root: TopicRoot,
        settings: MirrorSettings,
    ) -> Result<Self> {
        let lease = acquire_update_lease(tree, root, &settings).await?;
        Ok(Self::new(store, log, lease, namespace, settings))
    }

    pub fn root(&self) -> &TopicRoot {
        self.mutator.root()
    }

    pub fn namespace(&self) -> &Namespace {
        self.dispatcher.namespace()
    }

    pub fn identities(&self) -> &IdentityMap {
        &self.identities
    }

    pub fn stats(&self) -> &MirrorStats {
        &self.stats
    }

    /// Create the document's topic, or update it if the identity is known.
    pub async fn transcribe(&mut self, document: Document) -> Result<MutationOutcome> {
        self.stats.transcribed += 1;

        let outcome = match self.identities.assign(&document.id) {
            Assignment::Created(path) => {
                let outcome = self.mutator.create(&path, &document.body).await?;
                match &outcome {
                    MutationOutcome::Applied => self.stats.created += 1,
                    // the node is there, so the mapping is still true
                    MutationOutcome::Rejected(TreeError::TopicExists(_)) => {}
                    MutationOutcome::Rejected(_) => {
                        self.identities.remove(&document.id);
                    }
                }
                outcome
            }
            Assignment::Existing(path) => {
                let outcome = self.mutator.update(&path, &document.body).await?;
                match &outcome {
                    MutationOutcome::Applied => self.stats.updated += 1,
                    MutationOutcome::Rejected(TreeError::NoSuchTopic(_)) => {
                        self.identities.remove(&document.id);
                    }
                    MutationOutcome::Rejected(_) => {}
                }
                outcome
            }
        };

        if !outcome.is_applied() {
            self.stats.rejected += 1;
        }
        Ok(outcome)
    }

    /// Take the snapshot mark, then transcribe every document in the collection.
    pub async fn snapshot(&mut self) -> Result<SnapshotReport> {
        let mark = SnapshotMark::now();
        let namespace = self.namespace().clone();
        let records = self.store.scan(&namespace).await?;
        tracing::info!("snapshot of {}: {} records (mark {})", namespace, records.len(), mark);

        let mut report = SnapshotReport {
            mark,
            transcribed: 0,
            skipped: 0,
        };
        for record in records {
            match Document::from_record(record) {
                Ok(document) => {
                    self.transcribe(document).await?;
                    report.transcribed += 1;
                }
                Err(e) => {
                    tracing::warn!("skipping snapshot record from {}: {}", namespace, e);
                    report.skipped += 1;
                }
            }
        }
        self.stats.skipped += report.skipped;

        tracing::info!(
            "snapshot of {} complete: {} transcribed, {} skipped, {} topics",
            namespace,
            report.transcribed,
            report.skipped,
            self.identities.len()
        );
        Ok(report)
    }

    /// Apply a single log entry to the tree.
    pub async fn apply(&mut self, entry: LogEntry) -> Result<()> {
        let timestamp = entry.timestamp;
        self.stats.relayed += 1;

        match self.dispatcher.route(entry) {
            Route::Transcribe(document) => {
                self.transcribe(document).await?;
            }
            Route::Refetch(id) => self.refetch(&id).await?,
            Route::Remove(id) => {
                let path = self
                    .identities
                    .remove(&id)
                    .unwrap_or_else(|| self.identities.root().child(&id));
                match self.mutator.remove(&path).await? {
                    MutationOutcome::Applied => self.stats.removed += 1,
                    MutationOutcome::Rejected(_) => self.stats.rejected += 1,
                }
            }
            Route::DropCollection => {
                self.stats.drops += 1;
                match self.mutator.remove_descendants().await? {
                    MutationOutcome::Applied => {
                        let forgotten = self.identities.clear();
                        tracing::info!(
                            "{} dropped at {}, cleared {} mirrored documents",
                            self.namespace(),
                            timestamp,
                            forgotten
                        );
                    }
                    MutationOutcome::Rejected(_) => {
                        // topics are still in the tree, so their mappings stay
                        self.stats.rejected += 1;
                        tracing::warn!(
                            "{} dropped at {} but its {} mirrored documents could not be removed",
                            self.namespace(),
                            timestamp,
                            self.identities.len()
                        );
                    }
                }
            }
            Route::Ignore(reason) => {
                self.stats.ignored += 1;
                match reason {
                    IgnoreReason::UnknownOperation(kind) => {
                        tracing::warn!("ignoring unknown operation {:?} at {}", kind, timestamp)
                    }
                    other => tracing::debug!("ignoring entry at {}: {:?}", timestamp, other),
                }
            }
        }
        Ok(())
    }

    /// Re-read a changed document and transcribe its current state.
    async fn refetch(&mut self, id: &DocumentId) -> Result<()> {
        let namespace = self.namespace().clone();
        let Some(record) = self.store.find_by_id(&namespace, id).await? else {
            tracing::warn!(
                "document {} in {} was updated but no longer exists",
                id,
                namespace
            );
            self.stats.inconsistencies += 1;
            return Ok(());
        };

        match Document::from_record(record) {
            Ok(document) => {
                self.transcribe(document).await?;
            }
            Err(e) => {
                tracing::warn!("re-read of {} in {} is unusable: {}", id, namespace, e);
                self.stats.inconsistencies += 1;
            }
        }
        Ok(())
    }

    /// Relay log entries after `mark` until shutdown or a fatal error.
    pub async fn relay(&mut self, mark: SnapshotMark, shutdown: &ShutdownController) -> Result<()> {
        let mut reader = LogReader::open(self.log.as_ref(), mark, self.settings.max_await).await?;
        let span = tracing::info_span!("relay", root = %self.root());

        let result = self.relay_from(&mut reader, shutdown).instrument(span).await;
        self.stats.skipped += reader.skipped();
        result
    }

    async fn relay_from(&mut self, reader: &mut LogReader, shutdown: &ShutdownController) -> Result<()> {
        tracing::info!("relaying {} from {}", self.namespace(), reader.position());
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                entry = reader.next() => Some(entry?),
            };
            let Some(entry) = next else {
                tracing::info!("relay stopped at {}", reader.position());
                return Ok(());
            };
            self.apply(entry).await?;
        }
    }

    /// Snapshot, then relay until shutdown. The update lease is released on
    /// every exit path.
    pub async fn run(mut self, shutdown: &ShutdownController) -> Result<MirrorStats> {
        let outcome = self.mirror(shutdown).await;
        let stats = self.stats.clone();

        if let Err(e) = self.mutator.into_lease().release().await {
            tracing::warn!("failed to release update rights: {}", e);
        }

        match outcome {
            Ok(()) => {
                tracing::info!("mirror stopped: {:?}", stats);
                Ok(stats)
            }
            Err(e) => {
                tracing::error!("mirror failed: {} ({:?})", e, stats);
                Err(e)
            }
        }
    }

    async fn mirror(&mut self, shutdown: &ShutdownController) -> Result<()> {
        let report = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            report = self.snapshot() => report?,
        };
        self.relay(report.mark, shutdown).await
    }
}

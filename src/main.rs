//! doc-mirror - Collection to topic tree mirror with Hexagonal Architecture
//!
//! This is the composition root that wires together all the components.

use doc_mirror::adapters::outbound::{DashMapTopicTree, MemoryDocumentStore, SqliteDocumentStore};
use doc_mirror::config::{load_config, Config, SourceAddress, TargetAddress};
use doc_mirror::domain::ports::{DocumentStore, ReplicationLog, TopicTree};
use doc_mirror::infrastructure::{shutdown_signal, ShutdownController};
use doc_mirror::{MirrorError, MirrorService};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::fmt::format::FmtSpan;

type Source = (Arc<dyn DocumentStore>, Arc<dyn ReplicationLog>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    if let Err(e) = cfg.validate() {
        tracing::error!("invalid configuration: {}", e);
        std::process::exit(MirrorError::from(e).exit_code());
    }

    let namespace = cfg.namespace();
    let root = match cfg.topic_root() {
        Ok(root) => root,
        Err(e) => {
            tracing::error!("invalid configuration: {}", e);
            std::process::exit(MirrorError::from(e).exit_code());
        }
    };

    tracing::info!(
        "starting doc-mirror source={} namespace={} root={}",
        cfg.source_url,
        namespace,
        root
    );

    // ===== COMPOSITION ROOT =====

    // 1. Source store and replication log
    let (store, log) = open_source(&cfg)?;

    // 2. Topic tree
    let tree = match cfg.target_address()? {
        TargetAddress::Memory => Arc::new(DashMapTopicTree::new()),
    };
    if cfg.target_principal.is_some() || cfg.target_credentials.is_some() {
        tracing::debug!("in-process topic tree ignores target credentials");
    }
    spawn_change_logger(&tree);

    // 3. Shutdown on Ctrl+C / SIGTERM
    let shutdown = ShutdownController::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    // 4. Acquire update rights, then mirror until shutdown
    let settings = cfg.settings();
    let started = tokio::select! {
        biased;
        _ = shutdown.cancelled() => {
            tracing::info!("shutdown before update rights were granted");
            return Ok(());
        }
        started = MirrorService::start(
            store,
            log,
            tree.clone() as Arc<dyn TopicTree>,
            namespace,
            root,
            settings,
        ) => started,
    };

    let result = match started {
        Ok(service) => service.run(&shutdown).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(stats) => {
            tracing::info!(
                "doc-mirror stopped: {} transcribed, {} relayed, {} rejected",
                stats.transcribed,
                stats.relayed,
                stats.rejected
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!("doc-mirror failed: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}

/// Open the configured source as both document store and replication log.
fn open_source(cfg: &Config) -> anyhow::Result<Source> {
    match cfg.source_address()? {
        SourceAddress::Sqlite(path) => {
            let store = SqliteDocumentStore::open(&path)?;
            tracing::info!("opened SQLite source {}", path);
            Ok((Arc::new(store.clone()), Arc::new(store)))
        }
        SourceAddress::Memory => {
            let store = MemoryDocumentStore::new();
            if let Some(seed) = &cfg.seed_path {
                let loaded = store.load_json_file(&cfg.namespace(), Path::new(seed))?;
                tracing::info!("seeded {} documents from {}", loaded, seed);
            }
            Ok((Arc::new(store.clone()), Arc::new(store)))
        }
    }
}

/// Log every change the mirror makes to the tree.
fn spawn_change_logger(tree: &DashMapTopicTree) {
    let mut events = tree.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::debug!("topic change: {:?}", event),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("topic change logger missed {} events", missed)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

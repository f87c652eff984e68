use crate::domain::value_objects::{Namespace, TopicRoot};
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_SOURCE_URL: &str = "sqlite://documents.db";
const DEFAULT_TARGET_URL: &str = "memory://";
const DEFAULT_TOPIC: &str = "mirror";
const DEFAULT_MAX_AWAIT_MS: u64 = 1000;
const DEFAULT_BOOTSTRAP_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // Source store
    pub source_url: String,
    pub source_database: String,
    pub source_collection: String,
    pub seed_path: Option<String>,

    // Distribution service
    pub target_url: String,
    pub target_principal: Option<String>,
    pub target_credentials: Option<String>,
    pub topic: String,

    // Relay tuning
    pub max_await_ms: u64,
    pub bootstrap_timeout_secs: u64,
    pub clear_on_release: bool,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_url: DEFAULT_SOURCE_URL.to_string(),
            source_database: String::new(),
            source_collection: String::new(),
            seed_path: None,
            target_url: DEFAULT_TARGET_URL.to_string(),
            target_principal: None,
            target_credentials: None,
            topic: DEFAULT_TOPIC.to_string(),
            max_await_ms: DEFAULT_MAX_AWAIT_MS,
            bootstrap_timeout_secs: DEFAULT_BOOTSTRAP_TIMEOUT_SECS,
            clear_on_release: true,
            debug: false,
        }
    }
}

/// Where the source documents live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceAddress {
    /// SQLite database file holding documents and the replication log
    Sqlite(String),
    /// In-process store, optionally seeded from a JSON file
    Memory,
}

/// Where the mirror is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddress {
    /// In-process topic tree
    Memory,
}

impl Config {
    /// Check required settings and that the addresses are supported.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_database.is_empty() {
            return Err(ConfigError::MissingDatabase);
        }
        if self.source_collection.is_empty() {
            return Err(ConfigError::MissingCollection);
        }
        self.source_address()?;
        self.target_address()?;
        self.topic_root()?;
        Ok(())
    }

    pub fn namespace(&self) -> Namespace {
        Namespace::new(self.source_database.clone(), self.source_collection.clone())
    }

    /// `<topic>/<database>/<collection>`
    pub fn topic_root(&self) -> Result<TopicRoot, ConfigError> {
        TopicRoot::compose(&self.topic, &self.namespace())
            .ok_or_else(|| ConfigError::InvalidTopic(self.topic.clone()))
    }

    pub fn source_address(&self) -> Result<SourceAddress, ConfigError> {
        if let Some(path) = self.source_url.strip_prefix("sqlite://") {
            if path.is_empty() {
                return Err(ConfigError::UnsupportedSource(self.source_url.clone()));
            }
            return Ok(SourceAddress::Sqlite(path.to_string()));
        }
        if self.source_url == "memory://" {
            return Ok(SourceAddress::Memory);
        }
        Err(ConfigError::UnsupportedSource(self.source_url.clone()))
    }

    pub fn target_address(&self) -> Result<TargetAddress, ConfigError> {
        if self.target_url == "memory://" {
            return Ok(TargetAddress::Memory);
        }
        Err(ConfigError::UnsupportedTarget(self.target_url.clone()))
    }

    pub fn settings(&self) -> MirrorSettings {
        MirrorSettings::default()
            .max_await(Duration::from_millis(self.max_await_ms))
            .bootstrap_timeout(Duration::from_secs(self.bootstrap_timeout_secs))
            .clear_on_release(self.clear_on_release)
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("source database name is required")]
    MissingDatabase,
    #[error("source collection name is required")]
    MissingCollection,
    #[error("topic root {0:?} is empty")]
    InvalidTopic(String),
    #[error("unsupported source store address: {0}")]
    UnsupportedSource(String),
    #[error("unsupported distribution service address: {0}")]
    UnsupportedTarget(String),
}

/// Engine-level knobs handed to the bootstrap and the relay loop.
#[derive(Debug, Clone, Copy)]
pub struct MirrorSettings {
    /// Longest a single log read blocks before polling again (default: 1s)
    pub max_await: Duration,

    /// Bound on the wait for exclusive update rights (default: 10s)
    pub bootstrap_timeout: Duration,

    /// Remove the mirrored subtree when update rights are released (default: true)
    pub clear_on_release: bool,
}

impl Default for MirrorSettings {
    fn default() -> Self {
        Self {
            max_await: Duration::from_millis(DEFAULT_MAX_AWAIT_MS),
            bootstrap_timeout: Duration::from_secs(DEFAULT_BOOTSTRAP_TIMEOUT_SECS),
            clear_on_release: true,
        }
    }
}

impl MirrorSettings {
    /// Set the log read await window.
    pub fn max_await(mut self, max_await: Duration) -> Self {
        self.max_await = max_await;
        self
    }

    /// Set the bootstrap timeout.
    pub fn bootstrap_timeout(mut self, timeout: Duration) -> Self {
        self.bootstrap_timeout = timeout;
        self
    }

    /// Set whether the subtree is removed on release.
    pub fn clear_on_release(mut self, clear: bool) -> Self {
        self.clear_on_release = clear;
        self
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}

pub fn load_config() -> anyhow::Result<Config> {
    let source_url = std::env::var("DOCMIRROR_SOURCE_URL")
        .unwrap_or_else(|_| DEFAULT_SOURCE_URL.to_string());

    let source_database = std::env::var("DOCMIRROR_SOURCE_DATABASE").unwrap_or_default();

    let source_collection = std::env::var("DOCMIRROR_SOURCE_COLLECTION").unwrap_or_default();

    let seed_path = std::env::var("DOCMIRROR_SEED_PATH").ok();

    let target_url = std::env::var("DOCMIRROR_TARGET_URL")
        .unwrap_or_else(|_| DEFAULT_TARGET_URL.to_string());

    let target_principal = std::env::var("DOCMIRROR_TARGET_PRINCIPAL").ok();
    let target_credentials = std::env::var("DOCMIRROR_TARGET_CREDENTIALS").ok();

    let topic = std::env::var("DOCMIRROR_TOPIC").unwrap_or_else(|_| DEFAULT_TOPIC.to_string());

    let max_await_ms = std::env::var("DOCMIRROR_MAX_AWAIT_MS")
        .unwrap_or_else(|_| DEFAULT_MAX_AWAIT_MS.to_string())
        .parse()
        .unwrap_or(DEFAULT_MAX_AWAIT_MS);

    let bootstrap_timeout_secs = std::env::var("DOCMIRROR_BOOTSTRAP_TIMEOUT_SECS")
        .unwrap_or_else(|_| DEFAULT_BOOTSTRAP_TIMEOUT_SECS.to_string())
        .parse()
        .unwrap_or(DEFAULT_BOOTSTRAP_TIMEOUT_SECS);

    let clear_on_release = env_flag("DOCMIRROR_CLEAR_ON_RELEASE", true);

    let debug = std::env::var("DEBUG").is_ok();

    Ok(Config {
        source_url,
        source_database,
        source_collection,
        seed_path,
        target_url,
        target_principal,
        target_credentials,
        topic,
        max_await_ms,
        bootstrap_timeout_secs,
        clear_on_release,
        debug,
    })
}

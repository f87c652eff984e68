//! Mirror Errors
//!
//! Errors that stop the mirror. Recoverable conditions (rejected
//! mutations, vanished documents, unknown operations) are logged where they
//! happen and never reach this type.

use crate::config::ConfigError;
use crate::domain::ports::{StoreError, TreeError};
use std::time::Duration;

/// Result alias used across the application layer.
pub type Result<T> = std::result::Result<T, MirrorError>;

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("timed out after {waited:?} waiting for update rights on {root}")]
    BootstrapTimeout { root: String, waited: Duration },

    #[error("topic tree never confirmed update rights on {0}")]
    RegistrationAborted(String),

    #[error("replication log can no longer be trusted: {0}")]
    CursorInvalidated(String),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl MirrorError {
    /// Process exit code to use when this error ends the mirror.
    pub fn exit_code(&self) -> i32 {
        match self {
            MirrorError::Config(_) => 2,
            _ => 1,
        }
    }
}

impl From<StoreError> for MirrorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::CursorInvalidated { position } => MirrorError::CursorInvalidated(position),
            other => MirrorError::Store(other),
        }
    }
}

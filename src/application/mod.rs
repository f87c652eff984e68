//! Application Layer
//!
//! Use cases that drive the mirror: the bootstrap handshake, the log
//! reader, the tree mutator and the service that runs them in sequence.

pub mod bootstrap;
pub mod log_reader;
pub mod mirror_service;
pub mod tree_mutator;

pub use bootstrap::{acquire_update_lease, UpdateLease};
pub use log_reader::LogReader;
pub use mirror_service::{MirrorService, MirrorStats, SnapshotReport};
pub use tree_mutator::{MutationOutcome, TreeMutator};

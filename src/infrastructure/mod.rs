//! Infrastructure Layer
//!
//! Cross-cutting concerns shared by the binary and the application layer.

pub mod shutdown;

pub use shutdown::{shutdown_signal, ShutdownController};

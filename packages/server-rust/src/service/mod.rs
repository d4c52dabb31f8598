//! Server runtime plumbing: background workers and graceful shutdown.

pub mod shutdown;
pub mod worker;

pub use shutdown::{InFlightGuard, ServerState, ShutdownController};
pub use worker::{BackgroundRunnable, BackgroundWorker};

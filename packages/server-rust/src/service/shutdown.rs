//! Graceful shutdown controller with in-flight handler tracking.
//!
//! The registry accepts work from the bus until told to stop; a clean stop
//! must let already-accepted messages finish while refusing new ones. State
//! lives in an `ArcSwap` for lock-free reads on the hot path, and in-flight
//! handlers are counted through RAII guards so the count stays accurate
//! even when a handler panics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Lifecycle of the registry server.
///
/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Subscriptions are being set up; nothing is served yet.
    Starting,
    /// Fully operational.
    Ready,
    /// Shutdown requested; in-flight handlers run to completion, new
    /// submissions are refused.
    Draining,
    /// All in-flight handlers finished.
    Stopped,
}

/// Coordinates shutdown between the message handlers and the server owner.
///
/// Handlers take an [`InFlightGuard`] per message and consult [`Self::state`]
/// before accepting new work; the owner calls [`Self::trigger_shutdown`] and
/// then [`Self::wait_for_drain`].
#[derive(Debug)]
pub struct ShutdownController {
    shutdown_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    state: Arc<ArcSwap<ServerState>>,
}

impl ShutdownController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            state: Arc::new(ArcSwap::from_pointee(ServerState::Starting)),
        }
    }

    /// Marks the server operational.
    pub fn set_ready(&self) {
        self.state.store(Arc::new(ServerState::Ready));
    }

    /// Returns a receiver notified once shutdown is triggered. Background
    /// loops select on it alongside their main work.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Moves to `Draining` and signals every receiver.
    pub fn trigger_shutdown(&self) {
        self.state.store(Arc::new(ServerState::Draining));
        // Receivers may already be gone; that is fine.
        let _ = self.shutdown_signal.send(true);
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        **self.state.load()
    }

    /// Whether new work should still be accepted.
    #[must_use]
    pub fn accepting_work(&self) -> bool {
        self.state() == ServerState::Ready
    }

    /// Registers one in-flight handler. The count drops when the returned
    /// guard does, including during unwinding.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Current number of in-flight handlers.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits until every in-flight handler finished, up to `timeout`.
    ///
    /// Returns `true` and moves to `Stopped` on a clean drain; returns
    /// `false` with the state left at `Draining` when the timeout expires.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                self.state.store(Arc::new(ServerState::Stopped));
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for one in-flight handler.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

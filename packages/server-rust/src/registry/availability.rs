//! Live pool of execution clients and their availability.
//!
//! Clients enter the pool by announcing themselves after registration and
//! leave when the health monitor declares them lost. Matching reads go
//! through an `ArcSwap` snapshot so dispatch never contends with
//! announcements, and the available/busy flip is a CAS on the handle so two
//! concurrent dispatches can never acquire the same client.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

// ---------------------------------------------------------------------------
// Client handles
// ---------------------------------------------------------------------------

const STATE_AVAILABLE: u8 = 0;
const STATE_BUSY: u8 = 1;

/// Whether a client can take work right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityState {
    Available,
    Busy,
}

/// Shared, lock-free view of one announced client.
///
/// Identity fields are immutable for the lifetime of the handle; the
/// availability flag and the announce sequence are atomics so dispatch and
/// announcements never block each other.
#[derive(Debug)]
pub struct ClientHandle {
    pub client_id: String,
    pub application_slug: String,
    pub application_version: String,
    pub command_names: Vec<String>,
    /// The client's private inbox subject; dispatches, cancels, and health
    /// probes all go here.
    pub inbox_prefix: String,
    state: AtomicU8,
    announce_seq: AtomicU64,
}

impl ClientHandle {
    fn new(
        client_id: String,
        application_slug: String,
        application_version: String,
        command_names: Vec<String>,
        inbox_prefix: String,
        seq: u64,
    ) -> Self {
        Self {
            client_id,
            application_slug,
            application_version,
            command_names,
            inbox_prefix,
            state: AtomicU8::new(STATE_AVAILABLE),
            announce_seq: AtomicU64::new(seq),
        }
    }

    #[must_use]
    pub fn availability(&self) -> AvailabilityState {
        match self.state.load(Ordering::Acquire) {
            STATE_BUSY => AvailabilityState::Busy,
            _ => AvailabilityState::Available,
        }
    }

    /// Atomically claims the client for one dispatch. Returns `false` when
    /// another dispatch got there first.
    pub fn try_acquire(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_AVAILABLE,
                STATE_BUSY,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Returns the client to the pool.
    pub fn release(&self) {
        self.state.store(STATE_AVAILABLE, Ordering::Release);
    }

    /// Position in the arrival order; re-announcing moves a client to the
    /// back of the queue.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.announce_seq.load(Ordering::Acquire)
    }

    /// Whether this client serves the given application command.
    #[must_use]
    pub fn serves(&self, slug: &str, version: &str, command: &str) -> bool {
        self.application_slug == slug
            && self.application_version == version
            && self.command_names.iter().any(|c| c == command)
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Pool membership changes, consumed by the server's event loop.
#[derive(Debug, Clone)]
pub enum AvailabilityEvent {
    /// A client announced itself for the first time (or came back with a
    /// different identity).
    Joined(Arc<ClientHandle>),
    /// A client was removed, typically by the health monitor.
    Lost(Arc<ClientHandle>),
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Registry of announced clients with FIFO candidate matching.
pub struct ClientAvailabilityTracker {
    clients: DashMap<String, Arc<ClientHandle>>,
    /// Point-in-time view used by matching and probing. Swapped whole on
    /// membership change.
    snapshot: ArcSwap<Vec<Arc<ClientHandle>>>,
    /// Serializes snapshot rebuilds; without it two concurrent announces
    /// could publish a snapshot missing the other's client.
    rebuild: Mutex<()>,
    next_seq: AtomicU64,
    epoch: watch::Sender<u64>,
    events: mpsc::UnboundedSender<AvailabilityEvent>,
}

impl ClientAvailabilityTracker {
    /// Creates an empty tracker and the membership event receiver.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AvailabilityEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (epoch, _) = watch::channel(0);
        let tracker = Self {
            clients: DashMap::new(),
            snapshot: ArcSwap::from_pointee(Vec::new()),
            rebuild: Mutex::new(()),
            next_seq: AtomicU64::new(1),
            epoch,
            events,
        };
        (tracker, events_rx)
    }

    /// Records an availability announcement.
    ///
    /// A first announcement adds the client to the pool; a repeat
    /// announcement from the same client re-marks it available and moves it
    /// to the back of the FIFO order. A repeat with a different application
    /// identity replaces the old handle.
    pub fn announce(
        &self,
        client_id: &str,
        application_slug: &str,
        application_version: &str,
        command_names: Vec<String>,
        inbox_prefix: &str,
    ) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        let mut joined: Option<Arc<ClientHandle>> = None;
        {
            let _guard = self.rebuild.lock();
            match self.clients.get(client_id) {
                Some(existing)
                    if existing.application_slug == application_slug
                        && existing.application_version == application_version
                        && existing.inbox_prefix == inbox_prefix =>
                {
                    existing.announce_seq.store(seq, Ordering::Release);
                    existing.release();
                }
                prior => {
                    if prior.is_some() {
                        tracing::info!(
                            client_id,
                            application_slug,
                            "client re-announced with a new identity; replacing handle"
                        );
                    }
                    drop(prior);
                    let handle = Arc::new(ClientHandle::new(
                        client_id.to_string(),
                        application_slug.to_string(),
                        application_version.to_string(),
                        command_names,
                        inbox_prefix.to_string(),
                        seq,
                    ));
                    self.clients.insert(client_id.to_string(), Arc::clone(&handle));
                    joined = Some(handle);
                }
            }
            self.rebuild_snapshot();
        }
        self.bump_epoch();

        if let Some(handle) = joined {
            tracing::info!(
                client_id = %handle.client_id,
                application_slug = %handle.application_slug,
                application_version = %handle.application_version,
                "client joined the availability pool"
            );
            let _ = self.events.send(AvailabilityEvent::Joined(handle));
        }
    }

    /// Removes a client from the pool and reports it lost.
    pub fn remove(&self, client_id: &str) -> Option<Arc<ClientHandle>> {
        let removed = {
            let _guard = self.rebuild.lock();
            let removed = self.clients.remove(client_id).map(|(_, h)| h);
            if removed.is_some() {
                self.rebuild_snapshot();
            }
            removed
        };

        if let Some(handle) = &removed {
            tracing::warn!(client_id, "client removed from the availability pool");
            self.bump_epoch();
            let _ = self.events.send(AvailabilityEvent::Lost(Arc::clone(handle)));
        }
        removed
    }

    /// Earliest-announced available client serving the command, if any.
    ///
    /// The result is a moment-in-time reading; callers must still win
    /// [`ClientHandle::try_acquire`] before dispatching to it.
    #[must_use]
    pub fn find_candidate(
        &self,
        slug: &str,
        version: &str,
        command: &str,
    ) -> Option<Arc<ClientHandle>> {
        self.snapshot
            .load()
            .iter()
            .filter(|h| {
                h.availability() == AvailabilityState::Available && h.serves(slug, version, command)
            })
            .min_by_key(|h| h.seq())
            .cloned()
    }

    /// Finds and atomically claims the first matching candidate, retrying
    /// past races until no available candidate remains.
    #[must_use]
    pub fn acquire_candidate(
        &self,
        slug: &str,
        version: &str,
        command: &str,
    ) -> Option<Arc<ClientHandle>> {
        while let Some(candidate) = self.find_candidate(slug, version, command) {
            if candidate.try_acquire() {
                return Some(candidate);
            }
            // Lost the race; the rescan will see the claimed handle as busy.
        }
        None
    }

    /// Marks a previously claimed client available again and wakes queued
    /// matchers.
    pub fn release(&self, handle: &ClientHandle) {
        handle.release();
        self.bump_epoch();
    }

    /// Current pool snapshot, cheap to load.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Arc<ClientHandle>>> {
        self.snapshot.load_full()
    }

    #[must_use]
    pub fn client(&self, client_id: &str) -> Option<Arc<ClientHandle>> {
        self.clients.get(client_id).map(|h| Arc::clone(&h))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Receiver ticked on every availability change; queued dispatches wait
    /// on it instead of polling.
    #[must_use]
    pub fn epoch_receiver(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }

    fn rebuild_snapshot(&self) {
        let view: Vec<Arc<ClientHandle>> =
            self.clients.iter().map(|e| Arc::clone(e.value())).collect();
        self.snapshot.store(Arc::new(view));
    }

    fn bump_epoch(&self) {
        self.epoch.send_modify(|e| *e += 1);
    }
}

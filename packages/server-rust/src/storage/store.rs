//! Registry store trait and the records it persists.
//!
//! The registry keeps two kinds of durable state: the application specs
//! accepted at registration, and the append-only status history of every
//! calculation. Both live behind [`RegistryStore`] so an embedded in-memory
//! backend and a future database backend are interchangeable.
//!
//! All operations are synchronous; implementations are wrapped in
//! `Arc<dyn RegistryStore>` for sharing across async boundaries.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use xtalhub_core::calculation::{CalculationStatus, ExecutionDetails};
use xtalhub_core::spec::ApplicationSpec;

/// Milliseconds since the Unix epoch, used for every stored timestamp.
#[must_use]
pub fn now_ms() -> u64 {
    let millis = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    u64::try_from(millis).unwrap_or(u64::MAX)
}

/// Errors surfaced by store implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend failure: {0}")]
    Backend(String),
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One registered application spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub spec: ApplicationSpec,
    pub registered_at_ms: u64,
}

impl ApplicationRecord {
    #[must_use]
    pub fn new(spec: ApplicationSpec) -> Self {
        Self {
            spec,
            registered_at_ms: now_ms(),
        }
    }
}

/// One entry in a calculation's status history.
///
/// Server-side steps (attempt timeouts, budget exhaustion) and client-side
/// reports land in the same log, so the full trail of a calculation can be
/// reconstructed from its events alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEventRecord {
    pub calculation_id: String,
    pub correlation_id: String,
    /// Reporting party; the server itself uses its own name here.
    pub client_id: String,
    pub status: CalculationStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub details: Option<ExecutionDetails>,
    pub recorded_at_ms: u64,
}

// ---------------------------------------------------------------------------
// RegistryStore
// ---------------------------------------------------------------------------

/// Persistence boundary of the registry server.
pub trait RegistryStore: Send + Sync + 'static {
    /// Inserts or replaces the spec stored under its slug and version.
    fn put_application(&self, record: ApplicationRecord) -> Result<(), StoreError>;

    /// Looks up one registered application.
    fn get_application(
        &self,
        slug: &str,
        version: &str,
    ) -> Result<Option<ApplicationRecord>, StoreError>;

    /// All registered applications, ordered by slug then version.
    fn list_applications(&self) -> Result<Vec<ApplicationRecord>, StoreError>;

    /// Appends one event to a calculation's status history.
    fn append_status_event(&self, event: StatusEventRecord) -> Result<(), StoreError>;

    /// Full status history of a calculation, in append order.
    fn status_events(&self, calculation_id: &str) -> Result<Vec<StatusEventRecord>, StoreError>;

    /// Drops the status history of a calculation, returning the number of
    /// events removed.
    fn remove_status_events(&self, calculation_id: &str) -> Result<usize, StoreError>;
}

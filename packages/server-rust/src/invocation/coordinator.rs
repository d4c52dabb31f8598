//! Calculation lifecycle bookkeeping.
//!
//! One [`CalculationRecord`] exists per accepted invocation, keyed by
//! calculation id with a secondary correlation-id index. All status moves
//! funnel through here so the forward-only rule is enforced in exactly one
//! place: a status may only advance to a strictly later stage, terminals are
//! immutable, and reports from the wrong client or an unknown correlation
//! are discarded. Every applied move is also appended to the status history
//! in the store.

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use xtalhub_core::calculation::{CalculationStatus, ExecutionDetails, FailureCause};
use xtalhub_core::messages::{
    CalculationStatusPayload, InvocationPayload, InvocationRequestPayload, StatusEventPayload,
};

use crate::error::RegistryError;
use crate::service::BackgroundRunnable;
use crate::storage::{now_ms, RegistryStore, StatusEventRecord};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Server-side state of one calculation.
#[derive(Debug, Clone)]
pub struct CalculationRecord {
    pub payload: InvocationPayload,
    pub status: CalculationStatus,
    pub failure_cause: Option<FailureCause>,
    pub details: Option<ExecutionDetails>,
    /// Set when a client takes the work; later reports from any other
    /// client are discarded.
    pub assigned_client_id: Option<String>,
    pub created_at_ms: u64,
    pub finished_at_ms: Option<u64>,
}

impl CalculationRecord {
    fn new(payload: InvocationPayload) -> Self {
        Self {
            payload,
            status: CalculationStatus::Pending,
            failure_cause: None,
            details: None,
            assigned_client_id: None,
            created_at_ms: now_ms(),
            finished_at_ms: None,
        }
    }

    /// Wire form used by `calculation_status_response`.
    #[must_use]
    pub fn status_payload(&self) -> CalculationStatusPayload {
        CalculationStatusPayload {
            calculation_id: self.payload.calculation_id.clone(),
            status: self.status,
            details: self.details.clone(),
        }
    }
}

/// What happened to one client status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    UnknownCalculation,
    CorrelationMismatch,
    /// Report came from a client other than the assigned one.
    ClientMismatch,
    /// Duplicate, backward, or post-terminal report; dropped as a no-op.
    Stale,
}

/// Result of a cancellation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    NotFound,
    AlreadyTerminal,
    /// Record is now cancelled; carries the client to forward the cancel
    /// to, when one had taken the work.
    Cancelled { assigned_client_id: Option<String> },
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Owns every live calculation record.
pub struct InvocationCoordinator {
    records: DashMap<String, CalculationRecord>,
    by_correlation: DashMap<String, String>,
    store: Arc<dyn RegistryStore>,
    /// Author name stamped on server-side entries in the status history.
    server_name: String,
}

impl InvocationCoordinator {
    #[must_use]
    pub fn new(store: Arc<dyn RegistryStore>, server_name: impl Into<String>) -> Self {
        Self {
            records: DashMap::new(),
            by_correlation: DashMap::new(),
            store,
            server_name: server_name.into(),
        }
    }

    /// Admits one invocation request: assigns identifiers, creates the
    /// pending record, and logs the first history entry.
    ///
    /// `parameters` must already be resolved against the command spec.
    pub fn open(
        &self,
        request: &InvocationRequestPayload,
        parameters: std::collections::HashMap<String, rmpv::Value>,
    ) -> Result<InvocationPayload, RegistryError> {
        let calculation_id = match &request.calculation_id {
            Some(id) => {
                if self.records.contains_key(id) {
                    return Err(RegistryError::DuplicateCalculation(id.clone()));
                }
                id.clone()
            }
            None => format!("calc-{}", Uuid::new_v4().simple()),
        };
        let correlation_id = Uuid::new_v4().simple().to_string();

        let payload = InvocationPayload {
            calculation_id: calculation_id.clone(),
            application_slug: request.application_slug.clone(),
            application_version: request.application_version.clone(),
            command_name: request.command_name.clone(),
            parameters,
            correlation_id: correlation_id.clone(),
        };

        self.records
            .insert(calculation_id.clone(), CalculationRecord::new(payload.clone()));
        self.by_correlation.insert(correlation_id, calculation_id.clone());

        self.log_server_event(
            &payload,
            CalculationStatus::Pending,
            Some("invocation request accepted".to_string()),
            None,
        );
        tracing::info!(
            calculation_id = %calculation_id,
            application_slug = %payload.application_slug,
            command = %payload.command_name,
            "calculation opened"
        );
        Ok(payload)
    }

    /// Binds the calculation to the client that accepted the dispatch.
    ///
    /// Returns `false` when the record is gone, terminal, or already bound
    /// to a different client; the dispatcher must then stand down.
    pub fn mark_accepted(&self, calculation_id: &str, client_id: &str) -> bool {
        let mut applied = false;
        let mut event: Option<StatusEventRecord> = None;

        if let Some(mut record) = self.records.get_mut(calculation_id) {
            match &record.assigned_client_id {
                Some(existing) if existing != client_id => return false,
                _ if record.status.is_terminal() => return false,
                _ => {}
            }
            record.assigned_client_id = Some(client_id.to_string());
            if record.status.can_transition_to(CalculationStatus::Accepted) {
                record.status = CalculationStatus::Accepted;
                event = Some(self.server_event(
                    &record,
                    CalculationStatus::Accepted,
                    Some(format!("dispatch accepted by '{client_id}'")),
                    None,
                ));
            }
            applied = true;
        }

        if let Some(event) = event {
            self.append_event(event);
        }
        applied
    }

    /// Applies one client status report under the forward-only rule.
    pub fn apply_client_status(&self, event: &StatusEventPayload) -> ApplyOutcome {
        let mut stored: Option<StatusEventRecord> = None;

        let outcome = match self.records.get_mut(&event.calculation_id) {
            None => ApplyOutcome::UnknownCalculation,
            Some(mut record) => {
                if record.payload.correlation_id != event.correlation_id {
                    ApplyOutcome::CorrelationMismatch
                } else if record
                    .assigned_client_id
                    .as_deref()
                    .is_some_and(|assigned| assigned != event.client_id)
                {
                    ApplyOutcome::ClientMismatch
                } else if !record.status.can_transition_to(event.status) {
                    ApplyOutcome::Stale
                } else {
                    // First report from an otherwise unassigned client binds
                    // it; the dispatch ack may still be in flight.
                    if record.assigned_client_id.is_none() {
                        record.assigned_client_id = Some(event.client_id.clone());
                    }
                    record.status = event.status;
                    if event.status.is_terminal() {
                        record.details = event.details.clone();
                        record.finished_at_ms = Some(now_ms());
                        if event.status == CalculationStatus::Failed {
                            record.failure_cause = Some(FailureCause::ExecutionError);
                        }
                    }
                    stored = Some(StatusEventRecord {
                        calculation_id: event.calculation_id.clone(),
                        correlation_id: event.correlation_id.clone(),
                        client_id: event.client_id.clone(),
                        status: event.status,
                        comment: event.comment.clone(),
                        details: event.details.clone(),
                        recorded_at_ms: now_ms(),
                    });
                    ApplyOutcome::Applied
                }
            }
        };

        match outcome {
            ApplyOutcome::Applied => {
                if let Some(record) = stored {
                    self.append_event(record);
                }
                tracing::debug!(
                    calculation_id = %event.calculation_id,
                    status = %event.status,
                    client_id = %event.client_id,
                    "status applied"
                );
            }
            ApplyOutcome::Stale => {
                tracing::debug!(
                    calculation_id = %event.calculation_id,
                    status = %event.status,
                    "stale status report ignored"
                );
            }
            other => {
                tracing::warn!(
                    calculation_id = %event.calculation_id,
                    client_id = %event.client_id,
                    outcome = ?other,
                    "status report discarded"
                );
            }
        }
        outcome
    }

    /// Terminally fails a calculation from the server side. No-op when the
    /// record is already terminal.
    pub fn fail(&self, calculation_id: &str, cause: FailureCause, comment: &str) -> bool {
        let mut event: Option<StatusEventRecord> = None;

        let failed = match self.records.get_mut(calculation_id) {
            None => false,
            Some(mut record) => {
                if record.status.is_terminal() {
                    false
                } else {
                    record.status = CalculationStatus::Failed;
                    record.failure_cause = Some(cause);
                    record.finished_at_ms = Some(now_ms());
                    event = Some(self.server_event(
                        &record,
                        CalculationStatus::Failed,
                        Some(format!("{cause}: {comment}")),
                        None,
                    ));
                    true
                }
            }
        };

        if let Some(event) = event {
            self.append_event(event);
            tracing::warn!(calculation_id, %cause, comment, "calculation failed");
        }
        failed
    }

    /// Cancels a calculation if it has not already finished.
    pub fn cancel(&self, calculation_id: &str) -> CancelOutcome {
        let mut event: Option<StatusEventRecord> = None;

        let outcome = match self.records.get_mut(calculation_id) {
            None => CancelOutcome::NotFound,
            Some(mut record) => {
                if record.status.is_terminal() {
                    CancelOutcome::AlreadyTerminal
                } else {
                    record.status = CalculationStatus::Cancelled;
                    record.finished_at_ms = Some(now_ms());
                    event = Some(self.server_event(
                        &record,
                        CalculationStatus::Cancelled,
                        Some("cancelled on caller request".to_string()),
                        None,
                    ));
                    CancelOutcome::Cancelled {
                        assigned_client_id: record.assigned_client_id.clone(),
                    }
                }
            }
        };

        if let Some(event) = event {
            self.append_event(event);
            tracing::info!(calculation_id, "calculation cancelled");
        }
        outcome
    }

    /// Appends a non-transition note (attempt timeouts, declines) to the
    /// status history without touching the record.
    pub fn append_note(&self, calculation_id: &str, comment: impl Into<String>) {
        if let Some(record) = self.records.get(calculation_id) {
            let event = self.server_event(&record, record.status, Some(comment.into()), None);
            drop(record);
            self.append_event(event);
        }
    }

    /// Fails every non-terminal calculation bound to a lost client.
    pub fn on_client_lost(&self, client_id: &str) -> Vec<String> {
        let affected: Vec<String> = self
            .records
            .iter()
            .filter(|r| {
                !r.status.is_terminal() && r.assigned_client_id.as_deref() == Some(client_id)
            })
            .map(|r| r.payload.calculation_id.clone())
            .collect();

        for calculation_id in &affected {
            self.fail(
                calculation_id,
                FailureCause::ClientLost,
                &format!("client '{client_id}' stopped answering health probes"),
            );
        }
        affected
    }

    #[must_use]
    pub fn get(&self, calculation_id: &str) -> Option<CalculationRecord> {
        self.records.get(calculation_id).map(|r| r.clone())
    }

    #[must_use]
    pub fn find_by_correlation(&self, correlation_id: &str) -> Option<CalculationRecord> {
        let calculation_id = self.by_correlation.get(correlation_id)?;
        self.get(&calculation_id)
    }

    /// `get_calculation_status` read.
    pub fn status_of(&self, calculation_id: &str) -> Result<CalculationStatusPayload, RegistryError> {
        self.get(calculation_id)
            .map(|r| r.status_payload())
            .ok_or_else(|| RegistryError::UnknownCalculation(calculation_id.to_string()))
    }

    /// `poll_calculation_status` read; same data, keyed by correlation id.
    pub fn poll(&self, correlation_id: &str) -> Result<CalculationStatusPayload, RegistryError> {
        self.find_by_correlation(correlation_id)
            .map(|r| r.status_payload())
            .ok_or_else(|| RegistryError::UnknownCorrelation(correlation_id.to_string()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drops terminal records whose retention window has passed, along with
    /// their correlation index entries and stored history. Returns the
    /// number of records removed.
    pub fn sweep_terminals(&self, retention_ms: u64) -> usize {
        let cutoff = now_ms().saturating_sub(retention_ms);
        let expired: Vec<(String, String)> = self
            .records
            .iter()
            .filter(|r| {
                r.status.is_terminal() && r.finished_at_ms.is_some_and(|at| at <= cutoff)
            })
            .map(|r| {
                (
                    r.payload.calculation_id.clone(),
                    r.payload.correlation_id.clone(),
                )
            })
            .collect();

        for (calculation_id, correlation_id) in &expired {
            self.records.remove(calculation_id);
            self.by_correlation.remove(correlation_id);
            if let Err(error) = self.store.remove_status_events(calculation_id) {
                tracing::warn!(calculation_id, %error, "failed to drop status history");
            }
        }

        if !expired.is_empty() {
            tracing::debug!(swept = expired.len(), "terminal records swept");
        }
        expired.len()
    }

    fn server_event(
        &self,
        record: &CalculationRecord,
        status: CalculationStatus,
        comment: Option<String>,
        details: Option<ExecutionDetails>,
    ) -> StatusEventRecord {
        StatusEventRecord {
            calculation_id: record.payload.calculation_id.clone(),
            correlation_id: record.payload.correlation_id.clone(),
            client_id: self.server_name.clone(),
            status,
            comment,
            details,
            recorded_at_ms: now_ms(),
        }
    }

    fn log_server_event(
        &self,
        payload: &InvocationPayload,
        status: CalculationStatus,
        comment: Option<String>,
        details: Option<ExecutionDetails>,
    ) {
        self.append_event(StatusEventRecord {
            calculation_id: payload.calculation_id.clone(),
            correlation_id: payload.correlation_id.clone(),
            client_id: self.server_name.clone(),
            status,
            comment,
            details,
            recorded_at_ms: now_ms(),
        });
    }

    fn append_event(&self, event: StatusEventRecord) {
        if let Err(error) = self.store.append_status_event(event) {
            tracing::warn!(%error, "failed to append status event");
        }
    }
}

// ---------------------------------------------------------------------------
// Retention sweeper
// ---------------------------------------------------------------------------

/// On-demand sweep trigger; periodic sweeps come from the tick.
#[derive(Debug)]
pub enum SweepTask {
    Now,
}

/// Background runnable that enforces terminal-record retention.
pub struct RecordSweeper {
    coordinator: Arc<InvocationCoordinator>,
    retention_ms: u64,
}

impl RecordSweeper {
    #[must_use]
    pub fn new(coordinator: Arc<InvocationCoordinator>, retention_ms: u64) -> Self {
        Self {
            coordinator,
            retention_ms,
        }
    }
}

#[async_trait::async_trait]
impl BackgroundRunnable for RecordSweeper {
    type Task = SweepTask;

    async fn run(&mut self, task: SweepTask) {
        match task {
            SweepTask::Now => {
                self.coordinator.sweep_terminals(self.retention_ms);
            }
        }
    }

    async fn on_tick(&mut self) {
        self.coordinator.sweep_terminals(self.retention_ms);
    }
}

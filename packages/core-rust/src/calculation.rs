//! Calculation lifecycle types: the status state machine, failure causes,
//! and captured execution details.
//!
//! A calculation moves `pending → accepted → running → {successful | failed
//! | cancelled}`. Transitions are monotonic: a status may only advance to a
//! strictly later stage, and terminal statuses are immutable. Status
//! messages can arrive out of order (accept acknowledgements and client
//! status events travel on different subjects), so skipping forward over an
//! intermediate stage is legal while any backward move is rejected.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Status state machine
// ---------------------------------------------------------------------------

/// Lifecycle status of one calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalculationStatus {
    /// Request received; no client has acknowledged the dispatch yet.
    Pending,
    /// The assigned client acknowledged the dispatch.
    Accepted,
    /// The client reported that execution has started.
    Running,
    /// Terminal: the command finished with a success outcome.
    Successful,
    /// Terminal: the command failed, or the protocol gave up on it.
    Failed,
    /// Terminal: the calculation was cancelled before completion.
    Cancelled,
}

impl CalculationStatus {
    /// Position of the status in the forward ordering. All terminal
    /// statuses share the highest stage so no terminal can replace another.
    #[must_use]
    pub fn stage(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Accepted => 1,
            Self::Running => 2,
            Self::Successful | Self::Failed | Self::Cancelled => 3,
        }
    }

    /// Whether the status is one of the three terminal outcomes.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self.stage() == 3
    }

    /// Whether a transition from `self` to `next` moves strictly forward.
    ///
    /// Duplicate statuses and backward moves both return `false`; callers
    /// treat such messages as no-ops rather than errors.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        next.stage() > self.stage()
    }

    /// Wire/display name of the status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Running => "running",
            Self::Successful => "successful",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for CalculationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Failure causes
// ---------------------------------------------------------------------------

/// Why a calculation ended in `failed` (or why an attempt was abandoned).
///
/// Recorded in status-event comments so a poll can distinguish "nobody could
/// take the work" from "the work itself broke".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// No client accepted the dispatch within the retry budget.
    NoClientAvailable,
    /// A contacted client never acknowledged one dispatch attempt.
    DispatchTimeout,
    /// The assigned client stopped answering health probes mid-flight.
    ClientLost,
    /// The client executed the command and reported a failure.
    ExecutionError,
}

impl FailureCause {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoClientAvailable => "no_client_available",
            Self::DispatchTimeout => "dispatch_timeout",
            Self::ClientLost => "client_lost",
            Self::ExecutionError => "execution_error",
        }
    }
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Execution details
// ---------------------------------------------------------------------------

/// Output captured from an executed command, attached to terminal status
/// events and surfaced through status responses.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionDetails {
    /// Exit code of the spawned process; `None` when the process was killed
    /// by a signal or the command ran in-process.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub returncode: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutionDetails {
    /// Details for an in-process handler error, with the message on stderr.
    #[must_use]
    pub fn from_error(msg: impl Into<String>) -> Self {
        Self {
            returncode: None,
            stdout: String::new(),
            stderr: msg.into(),
        }
    }
}

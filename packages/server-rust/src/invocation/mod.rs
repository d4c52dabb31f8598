//! Invocation lifecycle: admission, dispatch, and terminal-record retention.

pub mod coordinator;
pub mod dispatch;

pub use coordinator::{
    ApplyOutcome, CalculationRecord, CancelOutcome, InvocationCoordinator, RecordSweeper,
    SweepTask,
};
pub use dispatch::CommandDispatcher;

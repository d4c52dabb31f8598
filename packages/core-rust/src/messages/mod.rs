//! Bus message schemas.
//!
//! The envelope ([`BusMessage`]) is the single tagged union every component
//! encodes and decodes; payload structs live in [`payloads`]. All types use
//! named `MsgPack` serialization (`rmp_serde::to_vec_named()`) with
//! snake_case field names. Adding an action means adding a variant, its
//! payload struct, and its entry in `envelope::actions`; nothing else
//! routes on message content.

pub mod envelope;
pub mod payloads;

// ---------------------------------------------------------------------------
// Re-exports — flat public API
// ---------------------------------------------------------------------------

pub use envelope::{actions, BusMessage, MessageError};
pub use payloads::{
    CalculationStatusPayload, CancelCalculationPayload, ClientAvailabilityPayload,
    CommandDispatchPayload, GenericResponsePayload, GetCalculationStatusPayload, HealthStatus,
    HealthStatusPayload, InvocationAcceptedPayload, InvocationPayload, InvocationRequestPayload,
    PollCalculationStatusPayload, RegisterApplicationPayload, ResponseStatus, StatusEventPayload,
};

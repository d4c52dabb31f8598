//! The bus message envelope: one tagged union over every action.
//!
//! Wire format is MsgPack with string keys; the `action` field is the
//! discriminator. [`BusMessage::decode`] is the only decode entry point and
//! classifies failures into [`MessageError::UnknownAction`] (discriminator
//! not in the registry) versus [`MessageError::SchemaMismatch`] (known
//! action, payload does not validate). Handlers that demand one specific
//! action use [`BusMessage::expect`], which yields
//! [`MessageError::ActionMismatch`] for valid-but-misdirected messages.

use serde::{Deserialize, Serialize};

use super::payloads::{
    CalculationStatusPayload, CancelCalculationPayload, ClientAvailabilityPayload,
    CommandDispatchPayload, GenericResponsePayload, GetCalculationStatusPayload,
    HealthStatusPayload, InvocationAcceptedPayload, InvocationRequestPayload,
    PollCalculationStatusPayload, RegisterApplicationPayload, StatusEventPayload,
};

// ---------------------------------------------------------------------------
// Action names
// ---------------------------------------------------------------------------

/// Canonical action strings, usable for `response_to` fields and
/// [`BusMessage::expect`] without repeating literals.
pub mod actions {
    pub const REGISTER_APPLICATION: &str = "register_application";
    pub const CLIENT_IS_AVAILABLE_TO_EXECUTE_COMMAND: &str =
        "client_is_available_to_execute_command";
    pub const COMMAND_INVOCATION_REQUEST: &str = "command_invocation_request";
    pub const COMMAND_INVOCATION_REQUEST_ACCEPTED: &str = "command_invocation_request_accepted";
    pub const COMMAND_INVOCATION_CLIENT_RESPONSE: &str = "command_invocation_client_response";
    pub const GET_CALCULATION_STATUS: &str = "get_calculation_status";
    pub const CALCULATION_STATUS_RESPONSE: &str = "calculation_status_response";
    pub const POLL_CALCULATION_STATUS: &str = "poll_calculation_status";
    pub const CALCULATION_STATUS_EVENT: &str = "calculation_status_event";
    pub const CANCEL_CALCULATION: &str = "cancel_calculation";
    pub const GENERIC_RESPONSE: &str = "generic_response";
    pub const HEALTH_CHECK: &str = "health_check";
    pub const HEALTH_CHECK_RESPONSE: &str = "health_check_response";
}

const KNOWN_ACTIONS: &[&str] = &[
    actions::REGISTER_APPLICATION,
    actions::CLIENT_IS_AVAILABLE_TO_EXECUTE_COMMAND,
    actions::COMMAND_INVOCATION_REQUEST,
    actions::COMMAND_INVOCATION_REQUEST_ACCEPTED,
    actions::COMMAND_INVOCATION_CLIENT_RESPONSE,
    actions::GET_CALCULATION_STATUS,
    actions::CALCULATION_STATUS_RESPONSE,
    actions::POLL_CALCULATION_STATUS,
    actions::CALCULATION_STATUS_EVENT,
    actions::CANCEL_CALCULATION,
    actions::GENERIC_RESPONSE,
    actions::HEALTH_CHECK,
    actions::HEALTH_CHECK_RESPONSE,
];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Decode/encode failures. Subscribers log these and drop the message; they
/// are never fatal to a subscription.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("unknown action '{action}'")]
    UnknownAction { action: String },
    #[error("schema mismatch: {detail}")]
    SchemaMismatch { detail: String },
    #[error("action mismatch: expected '{expected}', got '{actual}'")]
    ActionMismatch {
        expected: &'static str,
        actual: String,
    },
    #[error("message encoding failed: {0}")]
    Encode(String),
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Every message that travels over the bus, one variant per action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BusMessage {
    // Registration
    RegisterApplication { payload: RegisterApplicationPayload },

    // Invocation
    ClientIsAvailableToExecuteCommand { payload: CommandDispatchPayload },
    CommandInvocationRequest { payload: InvocationRequestPayload },
    CommandInvocationRequestAccepted { payload: InvocationAcceptedPayload },
    CommandInvocationClientResponse { payload: ClientAvailabilityPayload },

    // Status
    GetCalculationStatus { payload: GetCalculationStatusPayload },
    CalculationStatusResponse { payload: CalculationStatusPayload },
    PollCalculationStatus { payload: PollCalculationStatusPayload },
    CalculationStatusEvent { payload: StatusEventPayload },
    CancelCalculation { payload: CancelCalculationPayload },

    // Replies and liveness
    GenericResponse { payload: GenericResponsePayload },
    HealthCheck,
    HealthCheckResponse { payload: HealthStatusPayload },
}

impl BusMessage {
    /// The action string this message carries on the wire.
    #[must_use]
    pub fn action(&self) -> &'static str {
        match self {
            Self::RegisterApplication { .. } => actions::REGISTER_APPLICATION,
            Self::ClientIsAvailableToExecuteCommand { .. } => {
                actions::CLIENT_IS_AVAILABLE_TO_EXECUTE_COMMAND
            }
            Self::CommandInvocationRequest { .. } => actions::COMMAND_INVOCATION_REQUEST,
            Self::CommandInvocationRequestAccepted { .. } => {
                actions::COMMAND_INVOCATION_REQUEST_ACCEPTED
            }
            Self::CommandInvocationClientResponse { .. } => {
                actions::COMMAND_INVOCATION_CLIENT_RESPONSE
            }
            Self::GetCalculationStatus { .. } => actions::GET_CALCULATION_STATUS,
            Self::CalculationStatusResponse { .. } => actions::CALCULATION_STATUS_RESPONSE,
            Self::PollCalculationStatus { .. } => actions::POLL_CALCULATION_STATUS,
            Self::CalculationStatusEvent { .. } => actions::CALCULATION_STATUS_EVENT,
            Self::CancelCalculation { .. } => actions::CANCEL_CALCULATION,
            Self::GenericResponse { .. } => actions::GENERIC_RESPONSE,
            Self::HealthCheck => actions::HEALTH_CHECK,
            Self::HealthCheckResponse { .. } => actions::HEALTH_CHECK_RESPONSE,
        }
    }

    /// Serializes to MsgPack with string-keyed maps.
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        rmp_serde::to_vec_named(self).map_err(|e| MessageError::Encode(e.to_string()))
    }

    /// Single decode entry point for all bus traffic.
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let value: rmpv::Value =
            rmp_serde::from_slice(bytes).map_err(|e| MessageError::SchemaMismatch {
                detail: format!("not a msgpack envelope: {e}"),
            })?;

        let action = envelope_action(&value)?;
        if !KNOWN_ACTIONS.contains(&action) {
            return Err(MessageError::UnknownAction {
                action: action.to_string(),
            });
        }
        // The action is known, so any failure from here on is a payload
        // schema problem.
        let action = action.to_string();
        rmpv::ext::from_value(value).map_err(|e| MessageError::SchemaMismatch {
            detail: format!("invalid payload for '{action}': {e}"),
        })
    }

    /// Demands one specific action, turning misdirected traffic into
    /// [`MessageError::ActionMismatch`].
    pub fn expect(self, expected: &'static str) -> Result<Self, MessageError> {
        if self.action() == expected {
            Ok(self)
        } else {
            Err(MessageError::ActionMismatch {
                expected,
                actual: self.action().to_string(),
            })
        }
    }

    /// Unwraps a `generic_response`, the reply type of most request
    /// exchanges.
    pub fn into_generic_response(self) -> Result<GenericResponsePayload, MessageError> {
        match self {
            Self::GenericResponse { payload } => Ok(payload),
            other => Err(MessageError::ActionMismatch {
                expected: actions::GENERIC_RESPONSE,
                actual: other.action().to_string(),
            }),
        }
    }
}

/// Pulls the `action` discriminator out of a decoded envelope map.
fn envelope_action(value: &rmpv::Value) -> Result<&str, MessageError> {
    let map = value.as_map().ok_or_else(|| MessageError::SchemaMismatch {
        detail: "envelope is not a map".to_string(),
    })?;
    map.iter()
        .find_map(|(key, val)| (key.as_str() == Some("action")).then(|| val.as_str()))
        .flatten()
        .ok_or_else(|| MessageError::SchemaMismatch {
            detail: "envelope carries no string 'action' tag".to_string(),
        })
}

//! Payload structs for every bus action.
//!
//! Field names are the wire names (snake_case maps, string keys). Optional
//! fields are skipped when absent so older readers tolerate newer writers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::calculation::{CalculationStatus, ExecutionDetails};
use crate::spec::ApplicationSpec;

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// `register_application`: a client announces its application to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterApplicationPayload {
    pub application_spec: ApplicationSpec,
    /// The client's private inbox prefix; registration replies and later
    /// dispatches are addressed relative to it.
    pub private_routing_key: String,
}

/// Outcome carried by a `generic_response`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// `generic_response`: typed success/error reply to a bus request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericResponsePayload {
    /// Action string of the request this responds to.
    pub response_to: String,
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub msg: Option<String>,
    /// Free-form result data, e.g. `{calculation_id, correlation_id}` on a
    /// successful submission.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload: Option<rmpv::Value>,
}

impl GenericResponsePayload {
    #[must_use]
    pub fn success(response_to: impl Into<String>) -> Self {
        Self {
            response_to: response_to.into(),
            status: ResponseStatus::Success,
            msg: None,
            payload: None,
        }
    }

    #[must_use]
    pub fn error(response_to: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            response_to: response_to.into(),
            status: ResponseStatus::Error,
            msg: Some(msg.into()),
            payload: None,
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: rmpv::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// Looks up a string entry in the free-form result payload, e.g. the
    /// `calculation_id` of an accepted submission.
    #[must_use]
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        match &self.payload {
            Some(rmpv::Value::Map(entries)) => entries
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .and_then(|(_, v)| v.as_str()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// `command_invocation_request`: a caller asks for a command to be run.
///
/// `calculation_id` may be supplied by the caller; the coordinator generates
/// one otherwise. The correlation id is always coordinator-generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequestPayload {
    pub application_slug: String,
    pub application_version: String,
    pub command_name: String,
    #[serde(default)]
    pub parameters: HashMap<String, rmpv::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub calculation_id: Option<String>,
}

/// Fully-identified invocation as it travels inside dispatches and accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationPayload {
    pub calculation_id: String,
    pub application_slug: String,
    pub application_version: String,
    pub command_name: String,
    #[serde(default)]
    pub parameters: HashMap<String, rmpv::Value>,
    pub correlation_id: String,
}

impl InvocationPayload {
    /// Completes a caller request with the coordinator-assigned identifiers.
    #[must_use]
    pub fn from_request(
        request: InvocationRequestPayload,
        calculation_id: String,
        correlation_id: String,
    ) -> Self {
        Self {
            calculation_id,
            application_slug: request.application_slug,
            application_version: request.application_version,
            command_name: request.command_name,
            parameters: request.parameters,
            correlation_id,
        }
    }
}

/// `client_is_available_to_execute_command`: dispatch of one invocation to
/// the chosen client's private inbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDispatchPayload {
    pub cmd_invocation_payload: InvocationPayload,
    /// Status inbox the client must publish every update about this
    /// calculation to. Distinguishes concurrent calculations on one client
    /// from unrelated broadcast traffic.
    pub private_routing_key: String,
}

/// `command_invocation_request_accepted`: the client's acknowledgement that
/// it took a dispatched calculation, sent as the reply to the dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationAcceptedPayload {
    pub cmd_invocation_payload: InvocationPayload,
    /// Echo of the status subject the dispatch named.
    pub private_routing_key: String,
}

/// `command_invocation_client_response`: availability statement from a
/// client.
///
/// With `calculation_id = None` this is the unsolicited announcement sent
/// after successful registration; with a calculation id it is the explicit
/// rejection (or acceptance refusal) of one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientAvailabilityPayload {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub calculation_id: Option<String>,
    pub application_slug: String,
    pub application_version: String,
    pub client_id: String,
    pub client_is_available: bool,
    pub private_inbox_prefix: String,
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// `get_calculation_status`: pure read by calculation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetCalculationStatusPayload {
    pub calculation_id: String,
}

/// `poll_calculation_status`: pure read by correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollCalculationStatusPayload {
    pub correlation_id: String,
}

/// `calculation_status_response`: answer to either read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationStatusPayload {
    pub calculation_id: String,
    pub status: CalculationStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub details: Option<ExecutionDetails>,
}

/// `calculation_status_event`: client-reported transition, published on the
/// dispatch-supplied private routing key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEventPayload {
    pub calculation_id: String,
    pub correlation_id: String,
    pub client_id: String,
    pub status: CalculationStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub details: Option<ExecutionDetails>,
}

/// `cancel_calculation`: server asks the assigned client to stop one
/// calculation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelCalculationPayload {
    pub calculation_id: String,
    pub correlation_id: String,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Liveness verdict carried by `health_check_response`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// `health_check_response` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatusPayload {
    pub health_status: HealthStatus,
}

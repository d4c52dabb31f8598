//! End-to-end smoke run on the in-process bus.
//!
//! Starts a registry server and a scripted worker in one process, then
//! drives the full protocol from a caller connection: registration,
//! availability announcement, command dispatch, status polling, and
//! cancellation. Useful for eyeballing log output and wire behavior.
//!
//! Logs go to stderr at `info` by default; set `RUST_LOG` to change the
//! filter and `XTALHUB_LOG_JSON=1` for JSON lines.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use xtalhub_core::bus::{SubscriptionHandle, REGISTRY};
use xtalhub_core::messages::{
    CalculationStatusPayload, CancelCalculationPayload, ClientAvailabilityPayload, HealthStatus,
    HealthStatusPayload, InvocationAcceptedPayload, InvocationPayload, InvocationRequestPayload,
    PollCalculationStatusPayload, RegisterApplicationPayload, StatusEventPayload,
};
use xtalhub_core::spec::{ApplicationSpec, CommandSpec, ParameterSpec, ParameterType};
use xtalhub_core::{
    BusConnection, BusMessage, CalculationStatus, ExecutionDetails, MessageBus,
};
use xtalhub_server::telemetry::{self, LogFormat};
use xtalhub_server::{InMemoryStore, RegistryConfig, RegistryServer, RegistryStore};

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let format = if std::env::var_os("XTALHUB_LOG_JSON").is_some() {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    telemetry::init(format);

    let bus = MessageBus::new();
    let store = Arc::new(InMemoryStore::new());
    let server = RegistryServer::start(
        &bus,
        Arc::clone(&store) as Arc<dyn RegistryStore>,
        RegistryConfig::default(),
    );

    let _worker = start_worker(&bus, "smoke-worker").await?;
    let caller = bus.connect("smoke-caller");

    // Server answers liveness probes on the shared subject.
    let health = probe(&caller).await?;
    tracing::info!(status = ?health.health_status, "registry health probe");

    // A short calculation runs to completion.
    let accepted = submit(&caller, "open_file", params("struct.cif")).await?;
    tracing::info!(
        calculation_id = %accepted.calculation_id,
        correlation_id = %accepted.correlation_id,
        "submission accepted"
    );
    let done = poll_until(
        &caller,
        &accepted.correlation_id,
        CalculationStatus::Successful,
    )
    .await?;
    let stdout = done.details.map(|d| d.stdout).unwrap_or_default();
    tracing::info!(%stdout, "calculation finished");

    // A stuck calculation is cancelled while running.
    let accepted = submit(&caller, "stall", HashMap::new()).await?;
    poll_until(&caller, &accepted.correlation_id, CalculationStatus::Running).await?;
    cancel(&caller, &accepted.calculation_id, &accepted.correlation_id).await?;
    poll_until(
        &caller,
        &accepted.correlation_id,
        CalculationStatus::Cancelled,
    )
    .await?;
    tracing::info!(calculation_id = %accepted.calculation_id, "cancellation confirmed");

    if server.shutdown(Duration::from_secs(2)).await {
        tracing::info!("smoke run complete");
        Ok(())
    } else {
        anyhow::bail!("server did not drain within the grace period")
    }
}

fn smoke_spec() -> ApplicationSpec {
    ApplicationSpec::new("CrystalExplorer", "crystal_explorer", "21.5")
        .with_command(
            CommandSpec::new("open_file")
                .with_parameter(ParameterSpec::required("input_file", ParameterType::Str)),
        )
        .with_command(CommandSpec::new("stall"))
}

fn params(file: &str) -> HashMap<String, rmpv::Value> {
    HashMap::from([("input_file".to_string(), rmpv::Value::from(file))])
}

// ---------------------------------------------------------------------------
// Scripted worker
// ---------------------------------------------------------------------------

/// Registers a worker that accepts every dispatch. `open_file` completes
/// after a short pause; `stall` reports running and then waits for the
/// forwarded cancel.
async fn start_worker(bus: &MessageBus, client_id: &str) -> anyhow::Result<SubscriptionHandle> {
    let conn = bus.connect(client_id);
    let registration = BusMessage::RegisterApplication {
        payload: RegisterApplicationPayload {
            application_spec: smoke_spec(),
            private_routing_key: conn.inbox_prefix().to_string(),
        },
    };
    let reply = conn.request(REGISTRY, &registration, TIMEOUT).await?;
    let response = reply.into_generic_response()?;
    anyhow::ensure!(
        response.is_success(),
        "worker registration rejected: {:?}",
        response.msg
    );

    let inbox = {
        let handler_conn = conn.clone();
        let client_id = client_id.to_string();
        conn.subscribe_handler(conn.inbox_prefix(), move |delivery| {
            let conn = handler_conn.clone();
            let client_id = client_id.clone();
            async move {
                match delivery.message()? {
                    BusMessage::ClientIsAvailableToExecuteCommand { payload } => {
                        let routing_key = payload.private_routing_key;
                        let invocation = payload.cmd_invocation_payload;
                        let answer = BusMessage::CommandInvocationRequestAccepted {
                            payload: InvocationAcceptedPayload {
                                cmd_invocation_payload: invocation.clone(),
                                private_routing_key: routing_key.clone(),
                            },
                        };
                        conn.respond(&delivery, &answer).await?;
                        run_scripted(&conn, &client_id, &invocation, &routing_key).await?;
                    }
                    BusMessage::CancelCalculation { payload } => {
                        tracing::info!(
                            calculation_id = %payload.calculation_id,
                            "worker abandoning cancelled calculation"
                        );
                        announce(&conn, &client_id).await?;
                    }
                    BusMessage::HealthCheck => {
                        let answer = BusMessage::HealthCheckResponse {
                            payload: HealthStatusPayload {
                                health_status: HealthStatus::Healthy,
                            },
                        };
                        conn.respond(&delivery, &answer).await?;
                    }
                    other => {
                        tracing::warn!(action = other.action(), "unexpected message on worker inbox");
                    }
                }
                Ok(())
            }
        })
    };

    announce(&conn, client_id).await?;
    Ok(inbox)
}

async fn run_scripted(
    conn: &BusConnection,
    client_id: &str,
    invocation: &InvocationPayload,
    routing_key: &str,
) -> anyhow::Result<()> {
    publish_status(conn, routing_key, invocation, client_id, CalculationStatus::Running, None)
        .await?;
    if invocation.command_name != "open_file" {
        // The stall command never finishes on its own.
        return Ok(());
    }

    tokio::time::sleep(Duration::from_millis(150)).await;
    let file = invocation
        .parameters
        .get("input_file")
        .and_then(rmpv::Value::as_str)
        .unwrap_or_default();
    let details = ExecutionDetails {
        returncode: Some(0),
        stdout: format!("opened {file}\n"),
        stderr: String::new(),
    };
    publish_status(
        conn,
        routing_key,
        invocation,
        client_id,
        CalculationStatus::Successful,
        Some(details),
    )
    .await?;
    announce(conn, client_id).await
}

async fn announce(conn: &BusConnection, client_id: &str) -> anyhow::Result<()> {
    let msg = BusMessage::CommandInvocationClientResponse {
        payload: ClientAvailabilityPayload {
            calculation_id: None,
            application_slug: "crystal_explorer".to_string(),
            application_version: "21.5".to_string(),
            client_id: client_id.to_string(),
            client_is_available: true,
            private_inbox_prefix: conn.inbox_prefix().to_string(),
        },
    };
    conn.publish(REGISTRY, &msg).await?;
    Ok(())
}

async fn publish_status(
    conn: &BusConnection,
    subject: &str,
    invocation: &InvocationPayload,
    client_id: &str,
    status: CalculationStatus,
    details: Option<ExecutionDetails>,
) -> anyhow::Result<()> {
    let msg = BusMessage::CalculationStatusEvent {
        payload: StatusEventPayload {
            calculation_id: invocation.calculation_id.clone(),
            correlation_id: invocation.correlation_id.clone(),
            client_id: client_id.to_string(),
            status,
            comment: None,
            details,
        },
    };
    conn.publish(subject, &msg).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Caller helpers
// ---------------------------------------------------------------------------

async fn probe(conn: &BusConnection) -> anyhow::Result<HealthStatusPayload> {
    match conn.request(REGISTRY, &BusMessage::HealthCheck, TIMEOUT).await? {
        BusMessage::HealthCheckResponse { payload } => Ok(payload),
        other => anyhow::bail!("unexpected health reply: {}", other.action()),
    }
}

/// Identifiers the registry assigned to a submitted invocation.
struct Submission {
    calculation_id: String,
    correlation_id: String,
}

async fn submit(
    conn: &BusConnection,
    command: &str,
    parameters: HashMap<String, rmpv::Value>,
) -> anyhow::Result<Submission> {
    let msg = BusMessage::CommandInvocationRequest {
        payload: InvocationRequestPayload {
            application_slug: "crystal_explorer".to_string(),
            application_version: "21.5".to_string(),
            command_name: command.to_string(),
            parameters,
            calculation_id: None,
        },
    };
    match conn.request(REGISTRY, &msg, TIMEOUT).await? {
        BusMessage::GenericResponse { payload } => {
            anyhow::ensure!(payload.is_success(), "submission refused: {:?}", payload.msg);
            let Some(calculation_id) = payload.payload_str("calculation_id") else {
                anyhow::bail!("submission ack named no calculation_id");
            };
            let Some(correlation_id) = payload.payload_str("correlation_id") else {
                anyhow::bail!("submission ack named no correlation_id");
            };
            Ok(Submission {
                calculation_id: calculation_id.to_string(),
                correlation_id: correlation_id.to_string(),
            })
        }
        other => anyhow::bail!("unexpected submission reply: {}", other.action()),
    }
}

async fn poll_until(
    conn: &BusConnection,
    correlation_id: &str,
    wanted: CalculationStatus,
) -> anyhow::Result<CalculationStatusPayload> {
    for _ in 0..200 {
        let msg = BusMessage::PollCalculationStatus {
            payload: PollCalculationStatusPayload {
                correlation_id: correlation_id.to_string(),
            },
        };
        match conn.request(REGISTRY, &msg, TIMEOUT).await? {
            BusMessage::CalculationStatusResponse { payload } => {
                if payload.status == wanted {
                    return Ok(payload);
                }
                if payload.status.is_terminal() {
                    anyhow::bail!(
                        "calculation ended {} while waiting for {wanted}",
                        payload.status
                    );
                }
            }
            other => anyhow::bail!("unexpected poll reply: {}", other.action()),
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    anyhow::bail!("calculation never reached {wanted}")
}

async fn cancel(
    conn: &BusConnection,
    calculation_id: &str,
    correlation_id: &str,
) -> anyhow::Result<()> {
    let msg = BusMessage::CancelCalculation {
        payload: CancelCalculationPayload {
            calculation_id: calculation_id.to_string(),
            correlation_id: correlation_id.to_string(),
        },
    };
    match conn.request(REGISTRY, &msg, TIMEOUT).await? {
        BusMessage::GenericResponse { payload } => {
            anyhow::ensure!(payload.is_success(), "cancel refused: {:?}", payload.msg);
            Ok(())
        }
        other => anyhow::bail!("unexpected cancel reply: {}", other.action()),
    }
}

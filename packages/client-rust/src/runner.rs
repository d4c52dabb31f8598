//! Serves the client's private inbox.
//!
//! One runner executes at most one calculation at a time. A dispatch is
//! answered before any work starts: accept when the command is known, its
//! parameters validate, and the busy flag was free; decline otherwise.
//! Accepted work runs on its own task so the inbox loop stays responsive
//! to cancels and health probes, publishing `running` and then a terminal
//! status on the routing key the dispatch named.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use xtalhub_core::bus::REGISTRY;
use xtalhub_core::calculation::{CalculationStatus, ExecutionDetails};
use xtalhub_core::messages::{
    CancelCalculationPayload, ClientAvailabilityPayload, CommandDispatchPayload, HealthStatus,
    HealthStatusPayload, InvocationAcceptedPayload, InvocationPayload, StatusEventPayload,
};
use xtalhub_core::spec::{ApplicationSpec, SpecError};
use xtalhub_core::{BusConnection, BusMessage, Delivery, TransportError};

use crate::command::ExecutableCommand;
use crate::config::ClientConfig;

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Why a dispatch was declined.
#[derive(Debug, thiserror::Error)]
enum DeclineReason {
    #[error("client is busy")]
    Busy,
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("{0}")]
    Parameters(SpecError),
}

/// One accepted dispatch, ready to execute.
struct ClaimedWork {
    command: Arc<ExecutableCommand>,
    parameters: HashMap<String, rmpv::Value>,
    cancel: CancellationToken,
}

struct ActiveCalculation {
    calculation_id: String,
    cancel: CancellationToken,
}

/// Executes dispatches arriving on the client's private inbox.
pub struct CommandRunner {
    conn: BusConnection,
    client_id: String,
    application_slug: String,
    application_version: String,
    commands: HashMap<String, Arc<ExecutableCommand>>,
    output_cap: usize,
    /// Single-occupancy flag; claiming it is what accepts a dispatch.
    busy: watch::Sender<bool>,
    active: Mutex<Option<ActiveCalculation>>,
}

impl CommandRunner {
    #[must_use]
    pub fn new(
        conn: BusConnection,
        spec: &ApplicationSpec,
        config: &ClientConfig,
        commands: HashMap<String, Arc<ExecutableCommand>>,
    ) -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            conn,
            client_id: config.client_id.clone(),
            application_slug: spec.slug.clone(),
            application_version: spec.version.clone(),
            commands,
            output_cap: config.max_captured_output_bytes,
            busy,
            active: Mutex::new(None),
        }
    }

    /// Entry point for every delivery on the client's inbox.
    pub async fn handle(self: &Arc<Self>, delivery: Delivery) -> anyhow::Result<()> {
        match delivery.message()? {
            BusMessage::ClientIsAvailableToExecuteCommand { payload } => {
                self.handle_dispatch(&delivery, payload).await
            }
            BusMessage::CancelCalculation { payload } => {
                self.handle_cancel(&payload);
                Ok(())
            }
            BusMessage::HealthCheck => self.handle_health_probe(&delivery).await,
            other => {
                tracing::warn!(
                    action = other.action(),
                    subject = %delivery.subject,
                    "unexpected message on the client inbox"
                );
                Ok(())
            }
        }
    }

    /// Whether a calculation is currently claimed or running.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        *self.busy.borrow()
    }

    /// The inbox subject this runner serves.
    #[must_use]
    pub fn inbox_prefix(&self) -> &str {
        self.conn.inbox_prefix()
    }

    /// Tells the registry this client is ready for work. Called after
    /// registration and again after every finished calculation.
    pub async fn announce_available(&self) -> Result<(), TransportError> {
        self.announce(true).await
    }

    /// Tells the registry to stop offering work to this client.
    pub async fn withdraw(&self) -> Result<(), TransportError> {
        self.announce(false).await
    }

    /// Fires the cancellation token of the active calculation, if any.
    pub fn cancel_active(&self) {
        if let Some(active) = self.active.lock().as_ref() {
            active.cancel.cancel();
        }
    }

    /// Waits until no calculation is running, up to the timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut busy = self.busy.subscribe();
        loop {
            if !*busy.borrow_and_update() {
                return true;
            }
            match tokio::time::timeout_at(deadline, busy.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return !self.is_busy(),
            }
        }
    }

    // -- dispatch --------------------------------------------------------------

    async fn handle_dispatch(
        self: &Arc<Self>,
        delivery: &Delivery,
        dispatch: CommandDispatchPayload,
    ) -> anyhow::Result<()> {
        let invocation = dispatch.cmd_invocation_payload;
        let routing_key = dispatch.private_routing_key;

        // The answer goes out before any work starts.
        match self.try_claim(&invocation) {
            Ok(claim) => {
                let answer = BusMessage::CommandInvocationRequestAccepted {
                    payload: InvocationAcceptedPayload {
                        cmd_invocation_payload: invocation.clone(),
                        private_routing_key: routing_key.clone(),
                    },
                };
                self.conn.respond(delivery, &answer).await?;
                tracing::info!(
                    calculation_id = %invocation.calculation_id,
                    command = %invocation.command_name,
                    "dispatch accepted"
                );
                let runner = Arc::clone(self);
                tokio::spawn(async move {
                    runner.execute(claim, invocation, routing_key).await;
                });
            }
            Err(reason) => {
                let answer = BusMessage::CommandInvocationClientResponse {
                    payload: ClientAvailabilityPayload {
                        calculation_id: Some(invocation.calculation_id.clone()),
                        application_slug: invocation.application_slug.clone(),
                        application_version: invocation.application_version.clone(),
                        client_id: self.client_id.clone(),
                        client_is_available: false,
                        private_inbox_prefix: self.conn.inbox_prefix().to_string(),
                    },
                };
                self.conn.respond(delivery, &answer).await?;
                tracing::debug!(
                    calculation_id = %invocation.calculation_id,
                    command = %invocation.command_name,
                    %reason,
                    "dispatch declined"
                );
            }
        }
        Ok(())
    }

    /// Validates the dispatch and claims the busy flag, in that order, so a
    /// decline for a bad request never burns this client's availability.
    fn try_claim(&self, invocation: &InvocationPayload) -> Result<ClaimedWork, DeclineReason> {
        let Some(command) = self.commands.get(&invocation.command_name) else {
            return Err(DeclineReason::UnknownCommand(invocation.command_name.clone()));
        };
        let parameters = command
            .resolve(&invocation.parameters)
            .map_err(DeclineReason::Parameters)?;

        let claimed = self.busy.send_if_modified(|busy| {
            if *busy {
                false
            } else {
                *busy = true;
                true
            }
        });
        if !claimed {
            return Err(DeclineReason::Busy);
        }

        let cancel = CancellationToken::new();
        *self.active.lock() = Some(ActiveCalculation {
            calculation_id: invocation.calculation_id.clone(),
            cancel: cancel.clone(),
        });
        Ok(ClaimedWork {
            command: Arc::clone(command),
            parameters,
            cancel,
        })
    }

    async fn execute(&self, claim: ClaimedWork, invocation: InvocationPayload, routing_key: String) {
        self.publish_status(&routing_key, &invocation, CalculationStatus::Running, None)
            .await;

        let outcome = claim
            .command
            .execute(&claim.parameters, &claim.cancel, self.output_cap)
            .await;
        tracing::info!(
            calculation_id = %invocation.calculation_id,
            status = %outcome.status,
            returncode = outcome.details.returncode,
            "command finished"
        );
        self.publish_status(&routing_key, &invocation, outcome.status, Some(outcome.details))
            .await;

        *self.active.lock() = None;
        self.busy.send_replace(false);

        // Back into the pool for the next dispatch.
        if let Err(error) = self.announce_available().await {
            tracing::warn!(%error, "failed to re-announce availability");
        }
    }

    async fn publish_status(
        &self,
        routing_key: &str,
        invocation: &InvocationPayload,
        status: CalculationStatus,
        details: Option<ExecutionDetails>,
    ) {
        let msg = BusMessage::CalculationStatusEvent {
            payload: StatusEventPayload {
                calculation_id: invocation.calculation_id.clone(),
                correlation_id: invocation.correlation_id.clone(),
                client_id: self.client_id.clone(),
                status,
                comment: None,
                details,
            },
        };
        if let Err(error) = self.conn.publish(routing_key, &msg).await {
            tracing::warn!(
                calculation_id = %invocation.calculation_id,
                %status,
                %error,
                "failed to publish a status event"
            );
        }
    }

    // -- cancel and health -------------------------------------------------------

    fn handle_cancel(&self, payload: &CancelCalculationPayload) {
        let active = self.active.lock();
        match active.as_ref() {
            Some(active) if active.calculation_id == payload.calculation_id => {
                tracing::info!(
                    calculation_id = %payload.calculation_id,
                    "cancel received, stopping the running command"
                );
                active.cancel.cancel();
            }
            _ => {
                tracing::debug!(
                    calculation_id = %payload.calculation_id,
                    "cancel for an inactive calculation ignored"
                );
            }
        }
    }

    async fn handle_health_probe(&self, delivery: &Delivery) -> anyhow::Result<()> {
        // Busy is still healthy; only a dead process misses probes.
        self.conn
            .respond(
                delivery,
                &BusMessage::HealthCheckResponse {
                    payload: HealthStatusPayload {
                        health_status: HealthStatus::Healthy,
                    },
                },
            )
            .await?;
        Ok(())
    }

    async fn announce(&self, available: bool) -> Result<(), TransportError> {
        let msg = BusMessage::CommandInvocationClientResponse {
            payload: ClientAvailabilityPayload {
                calculation_id: None,
                application_slug: self.application_slug.clone(),
                application_version: self.application_version.clone(),
                client_id: self.client_id.clone(),
                client_is_available: available,
                private_inbox_prefix: self.conn.inbox_prefix().to_string(),
            },
        };
        self.conn.publish(REGISTRY, &msg).await
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use xtalhub_core::bus::SubscriptionHandle;
    use xtalhub_core::spec::{CommandSpec, ParameterSpec, ParameterType};
    use xtalhub_core::{MessageBus, Subscription};

    use crate::command::CommandHandler;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct EchoHandler;

    #[async_trait]
    impl CommandHandler for EchoHandler {
        async fn run(
            &self,
            parameters: HashMap<String, rmpv::Value>,
            _cancel: CancellationToken,
        ) -> anyhow::Result<ExecutionDetails> {
            let text = parameters
                .get("text")
                .and_then(rmpv::Value::as_str)
                .unwrap_or_default();
            Ok(ExecutionDetails {
                returncode: None,
                stdout: text.to_string(),
                stderr: String::new(),
            })
        }
    }

    struct StuckHandler;

    #[async_trait]
    impl CommandHandler for StuckHandler {
        async fn run(
            &self,
            _parameters: HashMap<String, rmpv::Value>,
            _cancel: CancellationToken,
        ) -> anyhow::Result<ExecutionDetails> {
            std::future::pending::<anyhow::Result<ExecutionDetails>>().await
        }
    }

    struct Fixture {
        bus: MessageBus,
        runner: Arc<CommandRunner>,
        inbox: String,
        _sub: SubscriptionHandle,
    }

    fn text_parameter() -> ParameterSpec {
        ParameterSpec::optional("text", ParameterType::Str, rmpv::Value::from(""))
    }

    fn fixture() -> Fixture {
        let bus = MessageBus::new();
        let conn = bus.connect("client-under-test");
        let inbox = conn.inbox_prefix().to_string();

        let open_file = CommandSpec::new("open_file").with_parameter(text_parameter());
        let stall = CommandSpec::new("stall").with_parameter(text_parameter());
        let spec = ApplicationSpec::new("CrystalExplorer", "crystal_explorer", "21.5")
            .with_command(open_file.clone())
            .with_command(stall.clone());

        let commands = HashMap::from([
            (
                "open_file".to_string(),
                Arc::new(ExecutableCommand::with_handler(&open_file, Arc::new(EchoHandler))),
            ),
            (
                "stall".to_string(),
                Arc::new(ExecutableCommand::with_handler(&stall, Arc::new(StuckHandler))),
            ),
        ]);

        let config = ClientConfig::named("client-under-test");
        let runner = Arc::new(CommandRunner::new(conn.clone(), &spec, &config, commands));

        let sub = {
            let runner = Arc::clone(&runner);
            conn.subscribe_handler(&inbox, move |delivery| {
                let runner = Arc::clone(&runner);
                async move { runner.handle(delivery).await }
            })
        };

        Fixture {
            bus,
            runner,
            inbox,
            _sub: sub,
        }
    }

    fn invocation(calculation_id: &str, command: &str) -> InvocationPayload {
        InvocationPayload {
            calculation_id: calculation_id.to_string(),
            application_slug: "crystal_explorer".to_string(),
            application_version: "21.5".to_string(),
            command_name: command.to_string(),
            parameters: HashMap::from([("text".to_string(), rmpv::Value::from("done"))]),
            correlation_id: format!("corr-{calculation_id}"),
        }
    }

    async fn offer(
        conn: &BusConnection,
        inbox: &str,
        invocation: InvocationPayload,
        routing_key: &str,
    ) -> BusMessage {
        let msg = BusMessage::ClientIsAvailableToExecuteCommand {
            payload: CommandDispatchPayload {
                cmd_invocation_payload: invocation,
                private_routing_key: routing_key.to_string(),
            },
        };
        conn.request(inbox, &msg, TIMEOUT).await.unwrap()
    }

    async fn offer_accepted(
        conn: &BusConnection,
        inbox: &str,
        invocation: InvocationPayload,
        routing_key: &str,
    ) -> InvocationAcceptedPayload {
        match offer(conn, inbox, invocation, routing_key).await {
            BusMessage::CommandInvocationRequestAccepted { payload } => payload,
            other => panic!("dispatch was not accepted: {}", other.action()),
        }
    }

    async fn offer_declined(
        conn: &BusConnection,
        inbox: &str,
        invocation: InvocationPayload,
        routing_key: &str,
    ) -> ClientAvailabilityPayload {
        match offer(conn, inbox, invocation, routing_key).await {
            BusMessage::CommandInvocationClientResponse { payload } => payload,
            other => panic!("dispatch was not declined: {}", other.action()),
        }
    }

    async fn next_status(sub: &mut Subscription) -> StatusEventPayload {
        let delivery = tokio::time::timeout(TIMEOUT, sub.recv())
            .await
            .expect("status event never arrived")
            .expect("status subject closed");
        match delivery.message().unwrap() {
            BusMessage::CalculationStatusEvent { payload } => payload,
            other => panic!("unexpected message: {}", other.action()),
        }
    }

    #[tokio::test]
    async fn accepted_dispatch_reports_running_then_successful() {
        let fixture = fixture();
        let caller = fixture.bus.connect("dispatcher");
        let routing_key = "registry.status.calc-1";
        let mut status_sub = caller.subscribe(routing_key);
        let mut registry_sub = caller.subscribe(REGISTRY);

        let accepted =
            offer_accepted(&caller, &fixture.inbox, invocation("calc-1", "open_file"), routing_key)
                .await;
        assert_eq!(accepted.cmd_invocation_payload.calculation_id, "calc-1");
        assert_eq!(accepted.private_routing_key, routing_key);

        let running = next_status(&mut status_sub).await;
        assert_eq!(running.status, CalculationStatus::Running);
        assert_eq!(running.correlation_id, "corr-calc-1");

        let done = next_status(&mut status_sub).await;
        assert_eq!(done.status, CalculationStatus::Successful);
        assert_eq!(done.details.unwrap().stdout, "done");

        // Finishing re-announces availability on the registry subject.
        let delivery = tokio::time::timeout(TIMEOUT, registry_sub.recv())
            .await
            .unwrap()
            .unwrap();
        match delivery.message().unwrap() {
            BusMessage::CommandInvocationClientResponse { payload } => {
                assert_eq!(payload.calculation_id, None);
                assert!(payload.client_is_available);
            }
            other => panic!("unexpected message: {}", other.action()),
        }
        assert!(!fixture.runner.is_busy());
    }

    #[tokio::test]
    async fn busy_runner_declines_a_second_dispatch() {
        let fixture = fixture();
        let caller = fixture.bus.connect("dispatcher");

        offer_accepted(&caller, &fixture.inbox, invocation("calc-1", "stall"), "s.1").await;
        assert!(fixture.runner.is_busy());

        let second =
            offer_declined(&caller, &fixture.inbox, invocation("calc-2", "open_file"), "s.2").await;
        assert!(!second.client_is_available);
        assert_eq!(second.calculation_id.as_deref(), Some("calc-2"));
        assert_eq!(second.client_id, "client-under-test");
    }

    #[tokio::test]
    async fn unknown_commands_are_declined_without_claiming() {
        let fixture = fixture();
        let caller = fixture.bus.connect("dispatcher");

        let reply =
            offer_declined(&caller, &fixture.inbox, invocation("calc-1", "warp_drive"), "s.1").await;
        assert!(!reply.client_is_available);
        assert!(!fixture.runner.is_busy());
    }

    #[tokio::test]
    async fn invalid_parameters_are_declined_without_claiming() {
        let fixture = fixture();
        let caller = fixture.bus.connect("dispatcher");

        let mut bad = invocation("calc-1", "open_file");
        bad.parameters = HashMap::from([("wrong".to_string(), rmpv::Value::from(1))]);
        let reply = offer_declined(&caller, &fixture.inbox, bad, "s.1").await;
        assert!(!reply.client_is_available);
        assert!(!fixture.runner.is_busy());
    }

    #[tokio::test]
    async fn cancel_stops_the_active_calculation() {
        let fixture = fixture();
        let caller = fixture.bus.connect("dispatcher");
        let routing_key = "registry.status.calc-9";
        let mut status_sub = caller.subscribe(routing_key);

        offer_accepted(&caller, &fixture.inbox, invocation("calc-9", "stall"), routing_key).await;
        assert_eq!(next_status(&mut status_sub).await.status, CalculationStatus::Running);

        // A cancel for some other calculation changes nothing.
        let unrelated = BusMessage::CancelCalculation {
            payload: CancelCalculationPayload {
                calculation_id: "calc-404".to_string(),
                correlation_id: "corr-calc-404".to_string(),
            },
        };
        caller.publish(&fixture.inbox, &unrelated).await.unwrap();

        let cancel = BusMessage::CancelCalculation {
            payload: CancelCalculationPayload {
                calculation_id: "calc-9".to_string(),
                correlation_id: "corr-calc-9".to_string(),
            },
        };
        caller.publish(&fixture.inbox, &cancel).await.unwrap();

        let done = next_status(&mut status_sub).await;
        assert_eq!(done.status, CalculationStatus::Cancelled);
        assert!(fixture.runner.wait_idle(TIMEOUT).await);
    }

    #[tokio::test]
    async fn health_probes_answer_healthy_even_while_busy() {
        let fixture = fixture();
        let caller = fixture.bus.connect("monitor");

        offer_accepted(&caller, &fixture.inbox, invocation("calc-1", "stall"), "s.1").await;

        match caller
            .request(&fixture.inbox, &BusMessage::HealthCheck, TIMEOUT)
            .await
            .unwrap()
        {
            BusMessage::HealthCheckResponse { payload } => {
                assert_eq!(payload.health_status, HealthStatus::Healthy);
            }
            other => panic!("unexpected reply: {}", other.action()),
        }
    }

    #[tokio::test]
    async fn withdraw_and_announce_reach_the_registry_subject() {
        let fixture = fixture();
        let watcher = fixture.bus.connect("watcher");
        let mut registry_sub = watcher.subscribe(REGISTRY);

        fixture.runner.announce_available().await.unwrap();
        fixture.runner.withdraw().await.unwrap();

        let first = registry_sub.recv().await.unwrap().message().unwrap();
        let second = registry_sub.recv().await.unwrap().message().unwrap();
        match (first, second) {
            (
                BusMessage::CommandInvocationClientResponse { payload: joined },
                BusMessage::CommandInvocationClientResponse { payload: left },
            ) => {
                assert!(joined.client_is_available);
                assert!(!left.client_is_available);
                assert_eq!(joined.private_inbox_prefix, fixture.inbox);
            }
            other => panic!("unexpected messages: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_active_unblocks_wait_idle() {
        let fixture = fixture();
        let caller = fixture.bus.connect("dispatcher");

        offer_accepted(&caller, &fixture.inbox, invocation("calc-1", "stall"), "s.1").await;

        fixture.runner.cancel_active();
        assert!(fixture.runner.wait_idle(TIMEOUT).await);
        assert!(!fixture.runner.is_busy());
    }
}

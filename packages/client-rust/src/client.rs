//! Client lifecycle: registration, inbox wiring, announcement, shutdown.
//!
//! [`RegistryClient::new`] builds the executable command set from the
//! application spec; [`RegistryClient::start`] runs the one-shot
//! registration handshake and, only on success, subscribes the private
//! inbox and announces availability. A rejected registration is fatal: the
//! client never announces and the embedding process is expected to exit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use xtalhub_core::bus::{SubscriptionHandle, REGISTRY};
use xtalhub_core::messages::{MessageError, RegisterApplicationPayload};
use xtalhub_core::spec::{ApplicationSpec, SpecError};
use xtalhub_core::{BusMessage, MessageBus, TransportError};

use crate::command::{CommandError, CommandHandler, ExecutableCommand};
use crate::config::ClientConfig;
use crate::runner::CommandRunner;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures starting or running a client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The registry answered the registration request with an error. Fatal:
    /// the client must not announce availability.
    #[error("registration rejected by the registry: {0}")]
    RegistrationRejected(String),
    #[error("invalid application spec: {0}")]
    InvalidSpec(#[from] SpecError),
    #[error("application declares no command named '{0}'")]
    UnknownCommand(String),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("client is already started")]
    AlreadyStarted,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A wrapper client for one scientific application.
///
/// Deferred startup: `new()` validates the spec and builds the command set,
/// `start()` registers with the registry and begins serving dispatches.
pub struct RegistryClient {
    config: ClientConfig,
    spec: ApplicationSpec,
    commands: HashMap<String, Arc<ExecutableCommand>>,
    runner: Option<Arc<CommandRunner>>,
    inbox_sub: Option<SubscriptionHandle>,
}

impl RegistryClient {
    /// Validates the spec and parses the call pattern of every command that
    /// declares one. Commands without a call pattern need an in-process
    /// handler via [`Self::set_handler`] before `start()`.
    pub fn new(spec: ApplicationSpec, config: ClientConfig) -> Result<Self, ClientError> {
        spec.validate()?;
        let mut commands = HashMap::new();
        for command in &spec.commands {
            if command.call_pattern.is_some() {
                commands.insert(
                    command.name.clone(),
                    Arc::new(ExecutableCommand::from_spec(command)?),
                );
            }
        }
        Ok(Self {
            config,
            spec,
            commands,
            runner: None,
            inbox_sub: None,
        })
    }

    /// Installs an in-process handler for one declared command, replacing
    /// the call-pattern implementation if the command has one.
    pub fn set_handler(
        &mut self,
        command: &str,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), ClientError> {
        let Some(spec) = self.spec.command(command) else {
            return Err(ClientError::UnknownCommand(command.to_string()));
        };
        self.commands.insert(
            command.to_string(),
            Arc::new(ExecutableCommand::with_handler(spec, handler)),
        );
        Ok(())
    }

    /// Registers with the registry and starts serving the private inbox.
    ///
    /// Order matters: the registration request must succeed before the
    /// inbox is subscribed or availability announced. A rejection leaves
    /// the client stopped.
    pub async fn start(&mut self, bus: &MessageBus) -> Result<(), ClientError> {
        if self.runner.is_some() {
            return Err(ClientError::AlreadyStarted);
        }
        for command in &self.spec.commands {
            if !self.commands.contains_key(&command.name) {
                return Err(ClientError::Command(CommandError::NotExecutable(
                    command.name.clone(),
                )));
            }
        }

        let conn = bus.connect(&self.config.client_id);
        let registration = BusMessage::RegisterApplication {
            payload: RegisterApplicationPayload {
                application_spec: self.spec.clone(),
                private_routing_key: conn.inbox_prefix().to_string(),
            },
        };
        let reply = conn
            .request(
                REGISTRY,
                &registration,
                Duration::from_millis(self.config.registration_timeout_ms),
            )
            .await?;
        let response = reply.into_generic_response()?;
        if !response.is_success() {
            return Err(ClientError::RegistrationRejected(
                response.msg.unwrap_or_else(|| "no reason given".to_string()),
            ));
        }

        let runner = Arc::new(CommandRunner::new(
            conn.clone(),
            &self.spec,
            &self.config,
            self.commands.clone(),
        ));
        let inbox_sub = {
            let runner = Arc::clone(&runner);
            conn.subscribe_handler(conn.inbox_prefix(), move |delivery| {
                let runner = Arc::clone(&runner);
                async move { runner.handle(delivery).await }
            })
        };
        runner.announce_available().await?;

        tracing::info!(
            client_id = %self.config.client_id,
            application_slug = %self.spec.slug,
            application_version = %self.spec.version,
            inbox = %runner.inbox_prefix(),
            "client registered and available"
        );
        self.runner = Some(runner);
        self.inbox_sub = Some(inbox_sub);
        Ok(())
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    #[must_use]
    pub fn spec(&self) -> &ApplicationSpec {
        &self.spec
    }

    /// The private inbox subject, once started.
    #[must_use]
    pub fn inbox_prefix(&self) -> Option<&str> {
        self.runner.as_deref().map(CommandRunner::inbox_prefix)
    }

    /// Whether a calculation is currently running.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.runner.as_ref().is_some_and(|runner| runner.is_busy())
    }

    /// Withdraws from the pool, cancels any running calculation, and waits
    /// for the runner to go idle. Returns `false` when the grace period
    /// expired with the command still winding down.
    pub async fn shutdown(mut self, grace: Duration) -> bool {
        let Some(runner) = self.runner.take() else {
            return true;
        };
        if let Err(error) = runner.withdraw().await {
            tracing::warn!(%error, "failed to withdraw from the pool");
        }
        // No new dispatches once the inbox subscription is gone.
        self.inbox_sub.take();
        runner.cancel_active();

        let deadline = Instant::now() + grace;
        let idle = runner
            .wait_idle(deadline.saturating_duration_since(Instant::now()))
            .await;
        if !idle {
            tracing::warn!("shutdown grace expired with a command still running");
        }
        tracing::info!(client_id = %self.config.client_id, "client stopped");
        idle
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use xtalhub_core::calculation::{CalculationStatus, ExecutionDetails};
    use xtalhub_core::messages::{
        CalculationStatusPayload, CancelCalculationPayload, InvocationRequestPayload,
        PollCalculationStatusPayload,
    };
    use xtalhub_core::spec::{CommandSpec, ParameterSpec, ParameterType};
    use xtalhub_core::BusConnection;
    use xtalhub_server::{InMemoryStore, RegistryConfig, RegistryServer, RegistryStore};

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct OpenFileHandler;

    #[async_trait]
    impl CommandHandler for OpenFileHandler {
        async fn run(
            &self,
            parameters: HashMap<String, rmpv::Value>,
            _cancel: CancellationToken,
        ) -> anyhow::Result<ExecutionDetails> {
            let file = parameters
                .get("input_file")
                .and_then(rmpv::Value::as_str)
                .unwrap_or_default();
            Ok(ExecutionDetails {
                returncode: Some(0),
                stdout: format!("opened {file}"),
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

    fn crystal_explorer_spec() -> ApplicationSpec {
        ApplicationSpec::new("CrystalExplorer", "crystal_explorer", "21.5").with_command(
            CommandSpec::new("open_file")
                .with_parameter(ParameterSpec::required("input_file", ParameterType::Str)),
        )
    }

    fn start_server(bus: &MessageBus) -> RegistryServer {
        let mut config = RegistryConfig::default();
        config.dispatch.ack_timeout_ms = 500;
        config.dispatch.backoff_ms = 10;
        let store = Arc::new(InMemoryStore::new());
        RegistryServer::start(bus, store as Arc<dyn RegistryStore>, config)
    }

    fn handler_client(client_id: &str) -> RegistryClient {
        let mut client =
            RegistryClient::new(crystal_explorer_spec(), ClientConfig::named(client_id)).unwrap();
        client.set_handler("open_file", Arc::new(OpenFileHandler)).unwrap();
        client
    }

    async fn wait_clients(server: &RegistryServer, n: usize) {
        for _ in 0..500 {
            if server.client_count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pool never reached {n} client(s)");
    }

    struct Submission {
        calculation_id: String,
        correlation_id: String,
    }

    async fn submit(conn: &BusConnection, parameters: HashMap<String, rmpv::Value>) -> Submission {
        let msg = BusMessage::CommandInvocationRequest {
            payload: InvocationRequestPayload {
                application_slug: "crystal_explorer".to_string(),
                application_version: "21.5".to_string(),
                command_name: "open_file".to_string(),
                parameters,
                calculation_id: None,
            },
        };
        match conn.request(REGISTRY, &msg, TIMEOUT).await.unwrap() {
            BusMessage::GenericResponse { payload } => {
                assert!(payload.is_success(), "submission refused: {:?}", payload.msg);
                Submission {
                    calculation_id: payload.payload_str("calculation_id").unwrap().to_string(),
                    correlation_id: payload.payload_str("correlation_id").unwrap().to_string(),
                }
            }
            other => panic!("unexpected reply: {}", other.action()),
        }
    }

    async fn poll(conn: &BusConnection, correlation_id: &str) -> CalculationStatusPayload {
        let msg = BusMessage::PollCalculationStatus {
            payload: PollCalculationStatusPayload {
                correlation_id: correlation_id.to_string(),
            },
        };
        match conn.request(REGISTRY, &msg, TIMEOUT).await.unwrap() {
            BusMessage::CalculationStatusResponse { payload } => payload,
            other => panic!("unexpected reply: {}", other.action()),
        }
    }

    async fn wait_status(
        conn: &BusConnection,
        correlation_id: &str,
        wanted: CalculationStatus,
    ) -> CalculationStatusPayload {
        for _ in 0..500 {
            let status = poll(conn, correlation_id).await;
            if status.status == wanted {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("calculation never reached {wanted}");
    }

    fn params(file: &str) -> HashMap<String, rmpv::Value> {
        HashMap::from([("input_file".to_string(), rmpv::Value::from(file))])
    }

    #[tokio::test]
    async fn client_registers_announces_and_executes() {
        let bus = MessageBus::new();
        let server = start_server(&bus);
        let caller = bus.connect("caller");

        let mut client = handler_client("ce-client-1");
        client.start(&bus).await.unwrap();
        assert!(client.inbox_prefix().is_some());
        wait_clients(&server, 1).await;

        let accepted = submit(&caller, params("struct.cif")).await;
        let result =
            wait_status(&caller, &accepted.correlation_id, CalculationStatus::Successful).await;
        assert_eq!(result.calculation_id, accepted.calculation_id);
        assert_eq!(result.details.unwrap().stdout, "opened struct.cif");

        // Ready for the next dispatch.
        assert!(!client.is_busy());
        let again = submit(&caller, params("other.cif")).await;
        wait_status(&caller, &again.correlation_id, CalculationStatus::Successful).await;

        assert!(client.shutdown(Duration::from_secs(1)).await);
        assert!(server.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn rejected_registration_is_fatal() {
        let bus = MessageBus::new();
        let _server = start_server(&bus);

        // Occupy the slug+version with a different command surface.
        let mut conflicting = handler_client("ce-client-1");
        conflicting.start(&bus).await.unwrap();

        let other_spec = ApplicationSpec::new("CrystalExplorer", "crystal_explorer", "21.5")
            .with_command(
                CommandSpec::new("render_scene")
                    .with_call_pattern("crystalexplorer --render {input_file}")
                    .with_parameter(ParameterSpec::required("input_file", ParameterType::Str)),
            );
        let mut client = RegistryClient::new(other_spec, ClientConfig::named("ce-client-2")).unwrap();

        let err = client.start(&bus).await.unwrap_err();
        assert!(matches!(err, ClientError::RegistrationRejected(_)), "{err}");
        assert!(client.inbox_prefix().is_none());
    }

    #[tokio::test]
    async fn commands_need_a_pattern_or_a_handler() {
        let bus = MessageBus::new();
        let mut client =
            RegistryClient::new(crystal_explorer_spec(), ClientConfig::named("ce-client-1"))
                .unwrap();

        // open_file has no call pattern and no handler was installed.
        let err = client.start(&bus).await.unwrap_err();
        assert!(
            matches!(
                &err,
                ClientError::Command(CommandError::NotExecutable(name)) if name == "open_file"
            ),
            "{err}"
        );
    }

    #[tokio::test]
    async fn handlers_for_undeclared_commands_are_refused() {
        let mut client =
            RegistryClient::new(crystal_explorer_spec(), ClientConfig::named("ce-client-1"))
                .unwrap();
        let err = client
            .set_handler("warp_drive", Arc::new(OpenFileHandler))
            .unwrap_err();
        assert!(matches!(err, ClientError::UnknownCommand(name) if name == "warp_drive"));
    }

    #[tokio::test]
    async fn shutdown_withdraws_from_the_pool() {
        let bus = MessageBus::new();
        let server = start_server(&bus);

        let mut client = handler_client("ce-client-1");
        client.start(&bus).await.unwrap();
        wait_clients(&server, 1).await;

        assert!(client.shutdown(Duration::from_secs(1)).await);
        wait_clients(&server, 0).await;
    }

    #[tokio::test]
    async fn cancel_flows_through_server_and_client() {
        let bus = MessageBus::new();
        let server = start_server(&bus);
        let caller = bus.connect("caller");

        let mut client =
            RegistryClient::new(crystal_explorer_spec(), ClientConfig::named("ce-client-1"))
                .unwrap();
        client.set_handler("open_file", Arc::new(StuckHandler)).unwrap();
        client.start(&bus).await.unwrap();
        wait_clients(&server, 1).await;

        let accepted = submit(&caller, params("slow.cif")).await;
        wait_status(&caller, &accepted.correlation_id, CalculationStatus::Running).await;

        let cancel = BusMessage::CancelCalculation {
            payload: CancelCalculationPayload {
                calculation_id: accepted.calculation_id.clone(),
                correlation_id: accepted.correlation_id.clone(),
            },
        };
        match caller.request(REGISTRY, &cancel, TIMEOUT).await.unwrap() {
            BusMessage::GenericResponse { payload } => assert!(payload.is_success()),
            other => panic!("unexpected reply: {}", other.action()),
        }

        wait_status(&caller, &accepted.correlation_id, CalculationStatus::Cancelled).await;

        // The runner killed the handler and went idle again.
        for _ in 0..500 {
            if !client.is_busy() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!client.is_busy());
    }

    #[tokio::test]
    async fn starting_twice_is_an_error() {
        let bus = MessageBus::new();
        let _server = start_server(&bus);

        let mut client = handler_client("ce-client-1");
        client.start(&bus).await.unwrap();
        let err = client.start(&bus).await.unwrap_err();
        assert!(matches!(err, ClientError::AlreadyStarted));
    }
}

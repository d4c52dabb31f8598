//! The registry server.
//!
//! Owns the public registry subject and runs the whole protocol from it:
//! application registration, invocation admission and dispatch, status
//! reads, cancellation, and availability announcements. Each admitted
//! calculation gets a private status inbox under the server's own prefix;
//! executing clients stream their progress there while the caller polls
//! over the registry subject.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;

use xtalhub_core::bus::{status_inbox, SubscriptionHandle, REGISTRY};
use xtalhub_core::messages::{
    actions, CancelCalculationPayload, ClientAvailabilityPayload, GenericResponsePayload,
    GetCalculationStatusPayload, HealthStatus, HealthStatusPayload, InvocationPayload,
    InvocationRequestPayload, PollCalculationStatusPayload, RegisterApplicationPayload,
    StatusEventPayload,
};
use xtalhub_core::{BusConnection, BusMessage, Delivery, MessageBus};

use crate::config::RegistryConfig;
use crate::error::RegistryError;
use crate::invocation::{
    ApplyOutcome, CalculationRecord, CancelOutcome, CommandDispatcher, InvocationCoordinator,
    RecordSweeper,
};
use crate::registry::availability::{AvailabilityEvent, ClientAvailabilityTracker};
use crate::registry::health::{ClientHealthMonitor, HealthTask};
use crate::registry::registration::RegistrationService;
use crate::service::{BackgroundWorker, ServerState, ShutdownController};
use crate::storage::RegistryStore;

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

struct ServerInner {
    conn: BusConnection,
    registration: RegistrationService,
    coordinator: Arc<InvocationCoordinator>,
    tracker: Arc<ClientAvailabilityTracker>,
    dispatcher: Arc<CommandDispatcher>,
    shutdown: ShutdownController,
    /// Live status-inbox subscriptions, keyed by calculation id. An entry
    /// is dropped once its record turns terminal.
    status_subs: Arc<DashMap<String, SubscriptionHandle>>,
}

/// Handle to a running registry server.
///
/// Everything runs on the bus the server was started with; dropping the
/// handle without calling [`Self::shutdown`] tears the subscriptions down
/// without draining.
pub struct RegistryServer {
    inner: Arc<ServerInner>,
    registry_sub: Option<SubscriptionHandle>,
    health_worker: BackgroundWorker<ClientHealthMonitor>,
    sweep_worker: BackgroundWorker<RecordSweeper>,
    events_task: JoinHandle<()>,
}

impl RegistryServer {
    /// Starts a registry server on the given bus. Must be called from
    /// within a Tokio runtime.
    #[must_use]
    pub fn start(bus: &MessageBus, store: Arc<dyn RegistryStore>, config: RegistryConfig) -> Self {
        let conn = bus.connect(&config.server_name);
        let (tracker, mut events) = ClientAvailabilityTracker::new();
        let tracker = Arc::new(tracker);
        let coordinator = Arc::new(InvocationCoordinator::new(
            Arc::clone(&store),
            config.server_name.clone(),
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            conn.clone(),
            Arc::clone(&tracker),
            Arc::clone(&coordinator),
            config.dispatch.clone(),
        ));
        let status_subs: Arc<DashMap<String, SubscriptionHandle>> = Arc::new(DashMap::new());

        let inner = Arc::new(ServerInner {
            conn: conn.clone(),
            registration: RegistrationService::new(store),
            coordinator: Arc::clone(&coordinator),
            tracker: Arc::clone(&tracker),
            dispatcher,
            shutdown: ShutdownController::new(),
            status_subs: Arc::clone(&status_subs),
        });

        // Pool membership changes: joins are informational, losses fail
        // whatever the lost client was running.
        let events_task = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            let status_subs = Arc::clone(&status_subs);
            async move {
                while let Some(event) = events.recv().await {
                    match event {
                        AvailabilityEvent::Joined(handle) => {
                            tracing::info!(
                                client_id = %handle.client_id,
                                application_slug = %handle.application_slug,
                                application_version = %handle.application_version,
                                "client joined the pool"
                            );
                        }
                        AvailabilityEvent::Lost(handle) => {
                            tracing::warn!(client_id = %handle.client_id, "client left the pool");
                            for calculation_id in coordinator.on_client_lost(&handle.client_id) {
                                status_subs.remove(&calculation_id);
                            }
                        }
                    }
                }
            }
        });

        let registry_sub = {
            let inner = Arc::clone(&inner);
            conn.subscribe_handler(REGISTRY, move |delivery| {
                let inner = Arc::clone(&inner);
                async move { inner.handle(delivery).await }
            })
        };

        let health_worker = BackgroundWorker::start(
            ClientHealthMonitor::new(Arc::clone(&tracker), conn.clone(), config.health.clone()),
            config.health.probe_interval_ms,
        );
        let sweep_worker = BackgroundWorker::start(
            RecordSweeper::new(coordinator, config.retention.terminal_retention_ms),
            config.retention.sweep_interval_ms,
        );

        inner.shutdown.set_ready();
        tracing::info!(server_name = %config.server_name, subject = REGISTRY, "registry server ready");

        Self {
            inner,
            registry_sub: Some(registry_sub),
            health_worker,
            sweep_worker,
            events_task,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        self.inner.shutdown.state()
    }

    /// Stops accepting registrations and invocations while keeping reads
    /// and cancels served. Part of [`Self::shutdown`], exposed separately
    /// so an operator can drain ahead of a restart.
    pub fn begin_drain(&self) {
        self.inner.shutdown.trigger_shutdown();
    }

    /// Number of clients currently in the availability pool.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Number of calculation records currently held.
    #[must_use]
    pub fn calculation_count(&self) -> usize {
        self.inner.coordinator.len()
    }

    /// Snapshot of one calculation record, if it exists.
    #[must_use]
    pub fn calculation(&self, calculation_id: &str) -> Option<CalculationRecord> {
        self.inner.coordinator.get(calculation_id)
    }

    /// Runs one health probe round out of schedule.
    pub async fn probe_clients_now(&self) -> anyhow::Result<()> {
        self.health_worker.submit(HealthTask::ProbeRound).await
    }

    /// Drains and stops the server. Returns `false` when handlers were
    /// still running at the deadline.
    pub async fn shutdown(mut self, drain_timeout: Duration) -> bool {
        self.inner.shutdown.trigger_shutdown();
        // Dropping the subscription stops new deliveries; in-flight
        // handlers keep their guards until they return.
        self.registry_sub.take();
        self.health_worker.stop().await;
        self.sweep_worker.stop().await;

        let drained = self.inner.shutdown.wait_for_drain(drain_timeout).await;
        if !drained {
            tracing::warn!("drain deadline hit with handlers still in flight");
        }
        self.inner.status_subs.clear();
        self.events_task.abort();
        tracing::info!("registry server stopped");
        drained
    }
}

// ---------------------------------------------------------------------------
// Message handling
// ---------------------------------------------------------------------------

impl ServerInner {
    async fn handle(self: Arc<Self>, delivery: Delivery) -> anyhow::Result<()> {
        let _guard = self.shutdown.in_flight_guard();
        match delivery.message()? {
            BusMessage::RegisterApplication { payload } => {
                self.handle_register(&delivery, &payload).await
            }
            BusMessage::CommandInvocationRequest { payload } => {
                self.handle_invocation(&delivery, payload).await
            }
            BusMessage::CommandInvocationClientResponse { payload } => {
                self.handle_announce(payload);
                Ok(())
            }
            BusMessage::GetCalculationStatus { payload } => {
                self.handle_get_status(&delivery, &payload).await
            }
            BusMessage::PollCalculationStatus { payload } => {
                self.handle_poll(&delivery, &payload).await
            }
            BusMessage::CancelCalculation { payload } => {
                self.handle_cancel(&delivery, &payload).await
            }
            BusMessage::HealthCheck => self.handle_health_probe(&delivery).await,
            other => {
                tracing::warn!(action = other.action(), "unexpected message on the registry subject");
                Ok(())
            }
        }
    }

    async fn handle_register(
        &self,
        delivery: &Delivery,
        payload: &RegisterApplicationPayload,
    ) -> anyhow::Result<()> {
        let response = if self.shutdown.accepting_work() {
            match self.registration.register(payload) {
                Ok(record) => {
                    let body = rmpv::Value::Map(vec![
                        ("slug".into(), record.spec.slug.clone().into()),
                        ("version".into(), record.spec.version.clone().into()),
                    ]);
                    GenericResponsePayload::success(actions::REGISTER_APPLICATION)
                        .with_payload(body)
                }
                Err(error) => {
                    GenericResponsePayload::error(actions::REGISTER_APPLICATION, error.to_string())
                }
            }
        } else {
            GenericResponsePayload::error(
                actions::REGISTER_APPLICATION,
                RegistryError::Draining.to_string(),
            )
        };
        self.conn
            .respond(delivery, &BusMessage::GenericResponse { payload: response })
            .await?;
        Ok(())
    }

    async fn handle_invocation(
        &self,
        delivery: &Delivery,
        request: InvocationRequestPayload,
    ) -> anyhow::Result<()> {
        if !self.shutdown.accepting_work() {
            let response = GenericResponsePayload::error(
                actions::COMMAND_INVOCATION_REQUEST,
                RegistryError::Draining.to_string(),
            );
            self.conn
                .respond(delivery, &BusMessage::GenericResponse { payload: response })
                .await?;
            return Ok(());
        }

        match self.admit(&request) {
            Ok(invocation) => {
                let status_subject =
                    status_inbox(self.conn.inbox_prefix(), &invocation.calculation_id);
                // Subscribe before answering so no status event can slip
                // past between the accept and the first report.
                self.watch_status_subject(&invocation.calculation_id, &status_subject);

                let response = GenericResponsePayload::success(
                    actions::COMMAND_INVOCATION_REQUEST,
                )
                .with_payload(rmpv::Value::Map(vec![
                    (
                        "calculation_id".into(),
                        invocation.calculation_id.clone().into(),
                    ),
                    (
                        "correlation_id".into(),
                        invocation.correlation_id.clone().into(),
                    ),
                ]));
                self.conn
                    .respond(delivery, &BusMessage::GenericResponse { payload: response })
                    .await?;
                self.dispatcher.spawn(invocation, status_subject);
            }
            Err(error) => {
                tracing::debug!(
                    application_slug = %request.application_slug,
                    command = %request.command_name,
                    %error,
                    "invocation refused"
                );
                let response = GenericResponsePayload::error(
                    actions::COMMAND_INVOCATION_REQUEST,
                    error.to_string(),
                );
                self.conn
                    .respond(delivery, &BusMessage::GenericResponse { payload: response })
                    .await?;
            }
        }
        Ok(())
    }

    /// Validates an invocation request against the registered spec and
    /// opens the calculation record.
    fn admit(&self, request: &InvocationRequestPayload) -> Result<InvocationPayload, RegistryError> {
        let spec = self
            .registration
            .resolve(&request.application_slug, &request.application_version)?;
        let command = spec.command(&request.command_name).ok_or_else(|| {
            RegistryError::UnknownCommand {
                slug: request.application_slug.clone(),
                command: request.command_name.clone(),
            }
        })?;
        let parameters = command.resolve_parameters(&request.parameters)?;
        self.coordinator.open(request, parameters)
    }

    /// Subscribes the per-calculation status inbox and routes its events
    /// into the coordinator.
    fn watch_status_subject(&self, calculation_id: &str, subject: &str) {
        let coordinator = Arc::clone(&self.coordinator);
        let tracker = Arc::clone(&self.tracker);
        let status_subs = Arc::clone(&self.status_subs);

        let sub = self.conn.subscribe_handler(subject, move |delivery| {
            let coordinator = Arc::clone(&coordinator);
            let tracker = Arc::clone(&tracker);
            let status_subs = Arc::clone(&status_subs);
            async move {
                match delivery.message()? {
                    BusMessage::CalculationStatusEvent { payload } => {
                        apply_status_event(&coordinator, &tracker, &status_subs, &payload);
                    }
                    other => {
                        tracing::warn!(
                            action = other.action(),
                            subject = %delivery.subject,
                            "unexpected message on a status inbox"
                        );
                    }
                }
                Ok(())
            }
        });
        self.status_subs.insert(calculation_id.to_string(), sub);
    }

    /// `client_is_available: true` with no calculation id is a pool
    /// announcement; dispatch answers never land here.
    fn handle_announce(&self, payload: ClientAvailabilityPayload) {
        if payload.calculation_id.is_some() {
            tracing::warn!(
                client_id = %payload.client_id,
                "dispatch answer arrived on the registry subject; its reply window is gone"
            );
            return;
        }
        if !payload.client_is_available {
            if self.tracker.remove(&payload.client_id).is_some() {
                tracing::info!(client_id = %payload.client_id, "client withdrew from the pool");
            }
            return;
        }
        match self
            .registration
            .resolve(&payload.application_slug, &payload.application_version)
        {
            Ok(spec) => {
                self.tracker.announce(
                    &payload.client_id,
                    &payload.application_slug,
                    &payload.application_version,
                    spec.command_names(),
                    &payload.private_inbox_prefix,
                );
            }
            Err(_) => {
                tracing::warn!(
                    client_id = %payload.client_id,
                    application_slug = %payload.application_slug,
                    application_version = %payload.application_version,
                    "announce for an unregistered application ignored"
                );
            }
        }
    }

    async fn handle_get_status(
        &self,
        delivery: &Delivery,
        payload: &GetCalculationStatusPayload,
    ) -> anyhow::Result<()> {
        let response = match self.coordinator.status_of(&payload.calculation_id) {
            Ok(status) => BusMessage::CalculationStatusResponse { payload: status },
            Err(error) => BusMessage::GenericResponse {
                payload: GenericResponsePayload::error(
                    actions::GET_CALCULATION_STATUS,
                    error.to_string(),
                ),
            },
        };
        self.conn.respond(delivery, &response).await?;
        Ok(())
    }

    async fn handle_poll(
        &self,
        delivery: &Delivery,
        payload: &PollCalculationStatusPayload,
    ) -> anyhow::Result<()> {
        let response = match self.coordinator.poll(&payload.correlation_id) {
            Ok(status) => BusMessage::CalculationStatusResponse { payload: status },
            Err(error) => BusMessage::GenericResponse {
                payload: GenericResponsePayload::error(
                    actions::POLL_CALCULATION_STATUS,
                    error.to_string(),
                ),
            },
        };
        self.conn.respond(delivery, &response).await?;
        Ok(())
    }

    async fn handle_cancel(
        &self,
        delivery: &Delivery,
        payload: &CancelCalculationPayload,
    ) -> anyhow::Result<()> {
        let response = match self.coordinator.get(&payload.calculation_id) {
            None => GenericResponsePayload::error(
                actions::CANCEL_CALCULATION,
                RegistryError::UnknownCalculation(payload.calculation_id.clone()).to_string(),
            ),
            // Cancels must name the correlation they belong to.
            Some(record) if record.payload.correlation_id != payload.correlation_id => {
                GenericResponsePayload::error(
                    actions::CANCEL_CALCULATION,
                    RegistryError::UnknownCorrelation(payload.correlation_id.clone()).to_string(),
                )
            }
            Some(_) => match self.coordinator.cancel(&payload.calculation_id) {
                CancelOutcome::Cancelled { assigned_client_id } => {
                    self.status_subs.remove(&payload.calculation_id);
                    if let Some(client_id) = assigned_client_id {
                        self.forward_cancel(&client_id, payload).await;
                    }
                    GenericResponsePayload::success(actions::CANCEL_CALCULATION)
                }
                // Cancelling finished work is a no-op, not an error.
                CancelOutcome::AlreadyTerminal => {
                    GenericResponsePayload::success(actions::CANCEL_CALCULATION)
                }
                CancelOutcome::NotFound => GenericResponsePayload::error(
                    actions::CANCEL_CALCULATION,
                    RegistryError::UnknownCalculation(payload.calculation_id.clone()).to_string(),
                ),
            },
        };
        self.conn
            .respond(delivery, &BusMessage::GenericResponse { payload: response })
            .await?;
        Ok(())
    }

    /// Best-effort cancel forward to the executing client's inbox.
    async fn forward_cancel(&self, client_id: &str, payload: &CancelCalculationPayload) {
        let Some(handle) = self.tracker.client(client_id) else {
            return;
        };
        let msg = BusMessage::CancelCalculation {
            payload: payload.clone(),
        };
        if let Err(error) = self.conn.publish(&handle.inbox_prefix, &msg).await {
            tracing::warn!(client_id, %error, "failed to forward cancel to the client");
        }
        // The reservation has no live record behind it anymore.
        self.tracker.release(&handle);
    }

    async fn handle_health_probe(&self, delivery: &Delivery) -> anyhow::Result<()> {
        let health_status = if self.shutdown.accepting_work() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        self.conn
            .respond(
                delivery,
                &BusMessage::HealthCheckResponse {
                    payload: HealthStatusPayload { health_status },
                },
            )
            .await?;
        Ok(())
    }
}

/// Applies one status event and, on a terminal move, releases the client
/// and tears down the calculation's status inbox.
fn apply_status_event(
    coordinator: &InvocationCoordinator,
    tracker: &ClientAvailabilityTracker,
    status_subs: &DashMap<String, SubscriptionHandle>,
    payload: &StatusEventPayload,
) {
    let terminal = payload.status.is_terminal();
    if coordinator.apply_client_status(payload) == ApplyOutcome::Applied && terminal {
        if let Some(handle) = tracker.client(&payload.client_id) {
            tracker.release(&handle);
        }
        status_subs.remove(&payload.calculation_id);
    }
}

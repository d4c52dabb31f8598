//! Offer loop that finds an executing client for each calculation.
//!
//! Candidates come from the availability pool in arrival order. Each one is
//! offered the work over its private inbox and must accept or decline within
//! the ack deadline; declines and timeouts release the candidate and move on.
//! When the retry budget runs out the calculation fails with
//! `no_client_available`.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng as _;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use xtalhub_core::calculation::{CalculationStatus, FailureCause};
use xtalhub_core::messages::{ClientAvailabilityPayload, CommandDispatchPayload, InvocationPayload};
use xtalhub_core::{BusConnection, BusMessage, TransportError};

use crate::config::{DispatchConfig, MatchPolicy};
use crate::invocation::coordinator::InvocationCoordinator;
use crate::registry::availability::{ClientAvailabilityTracker, ClientHandle};

/// How one contacted client answered an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OfferOutcome {
    Accepted,
    Declined,
    TimedOut,
}

/// Runs the offer loop for calculations admitted by the coordinator.
pub struct CommandDispatcher {
    conn: BusConnection,
    tracker: Arc<ClientAvailabilityTracker>,
    coordinator: Arc<InvocationCoordinator>,
    config: DispatchConfig,
}

impl CommandDispatcher {
    #[must_use]
    pub fn new(
        conn: BusConnection,
        tracker: Arc<ClientAvailabilityTracker>,
        coordinator: Arc<InvocationCoordinator>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            conn,
            tracker,
            coordinator,
            config,
        }
    }

    /// Spawns the offer loop for one calculation. The caller has already
    /// answered the submitter; this runs to a bound client or a terminal
    /// failure on its own.
    pub fn spawn(self: &Arc<Self>, invocation: InvocationPayload, status_subject: String) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher.dispatch(invocation, status_subject).await;
        })
    }

    async fn dispatch(&self, invocation: InvocationPayload, status_subject: String) {
        let calculation_id = invocation.calculation_id.clone();
        let started = Instant::now();

        for attempt in 1..=self.config.max_attempts {
            // The record may have been cancelled, or a racing status report
            // may already have bound a client.
            match self.coordinator.get(&calculation_id) {
                Some(record)
                    if record.status == CalculationStatus::Pending
                        && record.assigned_client_id.is_none() => {}
                _ => return,
            }

            let Some(client) = self.claim_candidate(&invocation).await else {
                break;
            };

            match self.offer(&client, &invocation, &status_subject).await {
                OfferOutcome::Accepted => {
                    if self.coordinator.mark_accepted(&calculation_id, &client.client_id) {
                        tracing::info!(
                            calculation_id = %calculation_id,
                            client_id = %client.client_id,
                            attempt,
                            duration_ms = started.elapsed().as_millis() as u64,
                            "dispatch assigned"
                        );
                    } else {
                        // Record moved on while the offer was in flight.
                        self.tracker.release(&client);
                    }
                    return;
                }
                OfferOutcome::Declined => {
                    self.tracker.release(&client);
                    self.coordinator.append_note(
                        &calculation_id,
                        format!("client '{}' declined dispatch (attempt {attempt})", client.client_id),
                    );
                }
                OfferOutcome::TimedOut => {
                    self.tracker.release(&client);
                    self.coordinator.append_note(
                        &calculation_id,
                        format!(
                            "{}: no acknowledgement from '{}' within {}ms (attempt {attempt})",
                            FailureCause::DispatchTimeout,
                            client.client_id,
                            self.config.ack_timeout_ms
                        ),
                    );
                }
            }

            if attempt < self.config.max_attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        self.coordinator.fail(
            &calculation_id,
            FailureCause::NoClientAvailable,
            &format!("no client accepted after {} attempt(s)", self.config.max_attempts),
        );
    }

    /// Claims an available candidate, honoring the match policy when the
    /// pool has none right now.
    async fn claim_candidate(&self, invocation: &InvocationPayload) -> Option<Arc<ClientHandle>> {
        if let Some(client) = self.acquire(invocation) {
            return Some(client);
        }

        let MatchPolicy::Queue { max_wait_ms } = self.config.match_policy else {
            return None;
        };

        let deadline = Instant::now() + Duration::from_millis(max_wait_ms);
        let mut epoch = self.tracker.epoch_receiver();
        loop {
            epoch.borrow_and_update();
            if let Some(client) = self.acquire(invocation) {
                return Some(client);
            }
            match tokio::time::timeout_at(deadline, epoch.changed()).await {
                Ok(Ok(())) => continue,
                // Tracker dropped or wait budget exhausted; one last look.
                Ok(Err(_)) | Err(_) => return self.acquire(invocation),
            }
        }
    }

    fn acquire(&self, invocation: &InvocationPayload) -> Option<Arc<ClientHandle>> {
        self.tracker.acquire_candidate(
            &invocation.application_slug,
            &invocation.application_version,
            &invocation.command_name,
        )
    }

    async fn offer(
        &self,
        client: &ClientHandle,
        invocation: &InvocationPayload,
        status_subject: &str,
    ) -> OfferOutcome {
        let msg = BusMessage::ClientIsAvailableToExecuteCommand {
            payload: CommandDispatchPayload {
                cmd_invocation_payload: invocation.clone(),
                private_routing_key: status_subject.to_string(),
            },
        };
        let timeout = Duration::from_millis(self.config.ack_timeout_ms);

        match self.conn.request(&client.inbox_prefix, &msg, timeout).await {
            Ok(BusMessage::CommandInvocationRequestAccepted { payload }) => {
                if payload.cmd_invocation_payload.calculation_id == invocation.calculation_id {
                    OfferOutcome::Accepted
                } else {
                    tracing::warn!(
                        client_id = %client.client_id,
                        "acceptance names a different calculation"
                    );
                    OfferOutcome::Declined
                }
            }
            Ok(BusMessage::CommandInvocationClientResponse { payload }) => {
                answer_for(&payload, &invocation.calculation_id)
            }
            Ok(other) => {
                tracing::warn!(
                    client_id = %client.client_id,
                    action = other.action(),
                    "unexpected reply to dispatch offer"
                );
                OfferOutcome::Declined
            }
            Err(TransportError::Timeout { .. }) => OfferOutcome::TimedOut,
            Err(error) => {
                tracing::warn!(client_id = %client.client_id, %error, "dispatch offer failed");
                OfferOutcome::Declined
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_ms.saturating_mul(u64::from(attempt));
        let jitter = rand::rng().random_range(0..=self.config.backoff_ms / 2 + 1);
        Duration::from_millis(base + jitter)
    }
}

fn answer_for(payload: &ClientAvailabilityPayload, calculation_id: &str) -> OfferOutcome {
    if payload.calculation_id.as_deref() != Some(calculation_id) {
        tracing::warn!(
            client_id = %payload.client_id,
            "dispatch reply names a different calculation"
        );
        return OfferOutcome::Declined;
    }
    if payload.client_is_available {
        OfferOutcome::Accepted
    } else {
        OfferOutcome::Declined
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use xtalhub_core::bus::SubscriptionHandle;
    use xtalhub_core::messages::{InvocationAcceptedPayload, InvocationRequestPayload};
    use xtalhub_core::MessageBus;

    use super::*;
    use crate::registry::availability::AvailabilityState;
    use crate::storage::{InMemoryStore, RegistryStore};

    struct Fixture {
        bus: MessageBus,
        store: Arc<InMemoryStore>,
        coordinator: Arc<InvocationCoordinator>,
        tracker: Arc<ClientAvailabilityTracker>,
    }

    fn fixture() -> Fixture {
        let bus = MessageBus::new();
        let store = Arc::new(InMemoryStore::new());
        let coordinator = Arc::new(InvocationCoordinator::new(
            Arc::clone(&store) as Arc<dyn RegistryStore>,
            "registry",
        ));
        let (tracker, _events) = ClientAvailabilityTracker::new();
        Fixture {
            bus,
            store,
            coordinator,
            tracker: Arc::new(tracker),
        }
    }

    fn dispatcher(fixture: &Fixture, config: DispatchConfig) -> Arc<CommandDispatcher> {
        Arc::new(CommandDispatcher::new(
            fixture.bus.connect("registry"),
            Arc::clone(&fixture.tracker),
            Arc::clone(&fixture.coordinator),
            config,
        ))
    }

    fn quick_config() -> DispatchConfig {
        DispatchConfig {
            ack_timeout_ms: 200,
            max_attempts: 3,
            backoff_ms: 5,
            match_policy: MatchPolicy::FailFast,
        }
    }

    fn open_invocation(fixture: &Fixture) -> InvocationPayload {
        let request = InvocationRequestPayload {
            application_slug: "crystal_explorer".to_string(),
            application_version: "21.5".to_string(),
            command_name: "open_file".to_string(),
            parameters: HashMap::new(),
            calculation_id: None,
        };
        fixture.coordinator.open(&request, HashMap::new()).unwrap()
    }

    /// Joins the pool and answers offers with a fixed accept/decline.
    fn spawn_client(fixture: &Fixture, client_id: &str, accept: bool) -> SubscriptionHandle {
        let conn = fixture.bus.connect(client_id);
        let prefix = conn.inbox_prefix().to_string();
        fixture.tracker.announce(
            client_id,
            "crystal_explorer",
            "21.5",
            vec!["open_file".to_string()],
            &prefix,
        );

        let reply_conn = conn.clone();
        let id = client_id.to_string();
        conn.subscribe_handler(&prefix, move |delivery| {
            let conn = reply_conn.clone();
            let id = id.clone();
            async move {
                if let BusMessage::ClientIsAvailableToExecuteCommand { payload } =
                    delivery.message()?
                {
                    let answer = if accept {
                        BusMessage::CommandInvocationRequestAccepted {
                            payload: InvocationAcceptedPayload {
                                cmd_invocation_payload: payload.cmd_invocation_payload,
                                private_routing_key: payload.private_routing_key,
                            },
                        }
                    } else {
                        BusMessage::CommandInvocationClientResponse {
                            payload: ClientAvailabilityPayload {
                                calculation_id: Some(
                                    payload.cmd_invocation_payload.calculation_id,
                                ),
                                application_slug: payload.cmd_invocation_payload.application_slug,
                                application_version: payload
                                    .cmd_invocation_payload
                                    .application_version,
                                client_id: id,
                                client_is_available: false,
                                private_inbox_prefix: conn.inbox_prefix().to_string(),
                            },
                        }
                    };
                    conn.respond(&delivery, &answer).await?;
                }
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn first_available_client_gets_the_work() {
        let fixture = fixture();
        let _client = spawn_client(&fixture, "client-a", true);
        let invocation = open_invocation(&fixture);
        let calculation_id = invocation.calculation_id.clone();

        let dispatcher = dispatcher(&fixture, quick_config());
        dispatcher
            .spawn(invocation, "status.subject".to_string())
            .await
            .unwrap();

        let record = fixture.coordinator.get(&calculation_id).unwrap();
        assert_eq!(record.status, CalculationStatus::Accepted);
        assert_eq!(record.assigned_client_id.as_deref(), Some("client-a"));

        // Accepting keeps the client reserved until it finishes.
        let handle = fixture.tracker.client("client-a").unwrap();
        assert_eq!(handle.availability(), AvailabilityState::Busy);
    }

    #[tokio::test]
    async fn racing_dispatches_claim_the_client_exactly_once() {
        let fixture = fixture();
        let _client = spawn_client(&fixture, "client-a", true);
        let first = open_invocation(&fixture);
        let second = open_invocation(&fixture);
        let first_id = first.calculation_id.clone();
        let second_id = second.calculation_id.clone();

        let dispatcher = dispatcher(&fixture, quick_config());
        let (left, right) = tokio::join!(
            dispatcher.spawn(first, "status.subject".to_string()),
            dispatcher.spawn(second, "status.subject".to_string()),
        );
        left.unwrap();
        right.unwrap();

        let outcomes = [
            fixture.coordinator.get(&first_id).unwrap(),
            fixture.coordinator.get(&second_id).unwrap(),
        ];
        let winners: Vec<_> = outcomes
            .iter()
            .filter(|r| r.status == CalculationStatus::Accepted)
            .collect();
        assert_eq!(winners.len(), 1, "the single client must be claimed once");
        assert_eq!(winners[0].assigned_client_id.as_deref(), Some("client-a"));

        let loser = outcomes
            .iter()
            .find(|r| r.status != CalculationStatus::Accepted)
            .unwrap();
        assert_eq!(loser.status, CalculationStatus::Failed);
        assert_eq!(loser.failure_cause, Some(FailureCause::NoClientAvailable));
    }

    #[tokio::test]
    async fn declines_move_to_the_next_client() {
        let fixture = fixture();
        let _first = spawn_client(&fixture, "client-a", false);
        let _second = spawn_client(&fixture, "client-b", true);
        let invocation = open_invocation(&fixture);
        let calculation_id = invocation.calculation_id.clone();

        let dispatcher = dispatcher(&fixture, quick_config());
        dispatcher
            .spawn(invocation, "status.subject".to_string())
            .await
            .unwrap();

        let record = fixture.coordinator.get(&calculation_id).unwrap();
        assert_eq!(record.assigned_client_id.as_deref(), Some("client-b"));

        // The decliner went back into the pool.
        let first = fixture.tracker.client("client-a").unwrap();
        assert_eq!(first.availability(), AvailabilityState::Available);

        let history = fixture.store.status_events(&calculation_id).unwrap();
        assert!(history
            .iter()
            .any(|e| e.comment.as_deref().is_some_and(|c| c.contains("declined"))));
    }

    #[tokio::test]
    async fn unanimous_declines_exhaust_the_budget() {
        let fixture = fixture();
        let _client = spawn_client(&fixture, "client-a", false);
        let invocation = open_invocation(&fixture);
        let calculation_id = invocation.calculation_id.clone();

        let mut config = quick_config();
        config.max_attempts = 2;
        let dispatcher = dispatcher(&fixture, config);
        dispatcher
            .spawn(invocation, "status.subject".to_string())
            .await
            .unwrap();

        let record = fixture.coordinator.get(&calculation_id).unwrap();
        assert_eq!(record.status, CalculationStatus::Failed);
        assert_eq!(record.failure_cause, Some(FailureCause::NoClientAvailable));

        // The decliner is not stuck busy.
        let handle = fixture.tracker.client("client-a").unwrap();
        assert_eq!(handle.availability(), AvailabilityState::Available);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_clients_count_as_timeouts() {
        let fixture = fixture();
        // In the pool, but nothing subscribed on its inbox.
        fixture.tracker.announce(
            "client-mute",
            "crystal_explorer",
            "21.5",
            vec!["open_file".to_string()],
            "xtalhub.inbox.client-mute.dead",
        );
        let invocation = open_invocation(&fixture);
        let calculation_id = invocation.calculation_id.clone();

        let mut config = quick_config();
        config.max_attempts = 1;
        let dispatcher = dispatcher(&fixture, config);
        dispatcher
            .spawn(invocation, "status.subject".to_string())
            .await
            .unwrap();

        let record = fixture.coordinator.get(&calculation_id).unwrap();
        assert_eq!(record.status, CalculationStatus::Failed);

        let history = fixture.store.status_events(&calculation_id).unwrap();
        assert!(history
            .iter()
            .any(|e| e.comment.as_deref().is_some_and(|c| c.contains("dispatch_timeout"))));
    }

    #[tokio::test]
    async fn fail_fast_without_candidates() {
        let fixture = fixture();
        let invocation = open_invocation(&fixture);
        let calculation_id = invocation.calculation_id.clone();

        let dispatcher = dispatcher(&fixture, quick_config());
        dispatcher
            .spawn(invocation, "status.subject".to_string())
            .await
            .unwrap();

        let record = fixture.coordinator.get(&calculation_id).unwrap();
        assert_eq!(record.status, CalculationStatus::Failed);
        assert_eq!(record.failure_cause, Some(FailureCause::NoClientAvailable));
    }

    #[tokio::test]
    async fn queue_policy_waits_for_a_late_client() {
        let fixture = fixture();
        let invocation = open_invocation(&fixture);
        let calculation_id = invocation.calculation_id.clone();

        let mut config = quick_config();
        config.match_policy = MatchPolicy::Queue { max_wait_ms: 2_000 };
        let dispatcher = dispatcher(&fixture, config);
        let handle = dispatcher.spawn(invocation, "status.subject".to_string());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let _client = spawn_client(&fixture, "client-late", true);

        handle.await.unwrap();
        let record = fixture.coordinator.get(&calculation_id).unwrap();
        assert_eq!(record.status, CalculationStatus::Accepted);
        assert_eq!(record.assigned_client_id.as_deref(), Some("client-late"));
    }

    #[tokio::test]
    async fn cancelled_records_are_not_dispatched() {
        let fixture = fixture();
        let _client = spawn_client(&fixture, "client-a", true);
        let invocation = open_invocation(&fixture);
        let calculation_id = invocation.calculation_id.clone();
        fixture.coordinator.cancel(&calculation_id);

        let dispatcher = dispatcher(&fixture, quick_config());
        dispatcher
            .spawn(invocation, "status.subject".to_string())
            .await
            .unwrap();

        let record = fixture.coordinator.get(&calculation_id).unwrap();
        assert_eq!(record.status, CalculationStatus::Cancelled);
        assert!(record.failure_cause.is_none());
    }
}

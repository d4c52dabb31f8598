//! In-process publish/subscribe transport with private-inbox
//! request/response.
//!
//! [`MessageBus`] is the broker: a registry of subjects, each fanning out to
//! its current subscribers over bounded mpsc channels. [`BusConnection`] is
//! the per-component handle used to publish, subscribe, and run
//! request/response exchanges; every connection owns a unique private inbox
//! prefix for point-to-point traffic.
//!
//! Delivery semantics: fanout to all subscribers of a subject; arrival order
//! preserved per subscription; no ordering across subjects. A request is a
//! publish carrying a generated reply-to subject plus a temporary inbox
//! subscription that is torn down when the exchange ends.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::FutureExt;
use tokio::sync::mpsc;

use super::subject;
use crate::messages::{BusMessage, MessageError};

// ---------------------------------------------------------------------------
// Config and errors
// ---------------------------------------------------------------------------

/// Tuning knobs for the transport.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Queue capacity per subscription; publishers wait when a subscriber's
    /// queue is full.
    pub subscription_capacity: usize,
    /// Timeout applied by [`BusConnection::request_default`].
    pub default_request_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscription_capacity: 256,
            default_request_timeout_ms: 30_000,
        }
    }
}

/// Transport-level failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request on '{subject}' timed out after {timeout_ms}ms")]
    Timeout { subject: String, timeout_ms: u64 },
    #[error("reply inbox closed before a response arrived")]
    Closed,
    #[error(transparent)]
    Message(#[from] MessageError),
}

// ---------------------------------------------------------------------------
// Deliveries and subscriptions
// ---------------------------------------------------------------------------

/// Unique identifier for a subscription, assigned by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// One message as received by a subscriber.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Subject the message arrived on.
    pub subject: String,
    /// Reply subject for request exchanges; transport metadata, not part of
    /// the payload schema.
    pub reply_to: Option<String>,
    /// Encoded envelope bytes.
    pub bytes: Vec<u8>,
}

impl Delivery {
    /// Decodes the envelope carried by this delivery.
    pub fn message(&self) -> Result<BusMessage, MessageError> {
        BusMessage::decode(&self.bytes)
    }
}

struct Subscriber {
    id: SubscriptionId,
    tx: mpsc::Sender<Delivery>,
}

/// Receiver-style subscription. Dropping it tears the subscription down.
pub struct Subscription {
    id: SubscriptionId,
    subject: String,
    rx: mpsc::Receiver<Delivery>,
    core: Arc<BusCore>,
}

impl Subscription {
    /// Waits for the next delivery; `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.core.remove_subscriber(&self.subject, self.id);
    }
}

/// Handle to a handler-loop subscription. Dropping it unsubscribes; the
/// loop finishes in-flight work and exits once its queue drains.
pub struct SubscriptionHandle {
    id: SubscriptionId,
    subject: String,
    core: Arc<BusCore>,
}

impl SubscriptionHandle {
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.core.remove_subscriber(&self.subject, self.id);
    }
}

// ---------------------------------------------------------------------------
// Bus core
// ---------------------------------------------------------------------------

/// Shared broker state: subject → live subscribers.
struct BusCore {
    subjects: DashMap<String, Vec<Subscriber>>,
    next_subscription_id: AtomicU64,
}

impl BusCore {
    fn new() -> Self {
        Self {
            subjects: DashMap::new(),
            // Subscription IDs start at 1 (0 is reserved as "none").
            next_subscription_id: AtomicU64::new(1),
        }
    }

    fn add_subscriber(&self, subject: &str, capacity: usize) -> (SubscriptionId, mpsc::Receiver<Delivery>) {
        let id = SubscriptionId(self.next_subscription_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(capacity);
        self.subjects
            .entry(subject.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        (id, rx)
    }

    fn remove_subscriber(&self, subject: &str, id: SubscriptionId) {
        if let Some(mut entry) = self.subjects.get_mut(subject) {
            entry.retain(|s| s.id != id);
            if entry.is_empty() {
                drop(entry);
                self.subjects.remove_if(subject, |_, subs| subs.is_empty());
            }
        }
    }

    fn subscriber_count(&self, subject: &str) -> usize {
        self.subjects.get(subject).map_or(0, |subs| subs.len())
    }

    /// Fans a delivery out to every current subscriber of the subject.
    ///
    /// Senders are cloned out of the map before awaiting so no map guard is
    /// held across a suspension point. Subscribers that went away are
    /// cleaned up afterwards.
    async fn deliver(&self, delivery: Delivery) {
        let targets: Vec<(SubscriptionId, mpsc::Sender<Delivery>)> = match self
            .subjects
            .get(&delivery.subject)
        {
            Some(subs) => subs.iter().map(|s| (s.id, s.tx.clone())).collect(),
            // Publishing to a subject nobody listens on is not an error.
            None => return,
        };

        let mut dead: Vec<SubscriptionId> = Vec::new();
        for (id, tx) in targets {
            if tx.send(delivery.clone()).await.is_err() {
                dead.push(id);
            }
        }
        for id in dead {
            self.remove_subscriber(&delivery.subject, id);
        }
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// The broker. Cheap to clone; all clones share one subject registry.
#[derive(Clone)]
pub struct MessageBus {
    core: Arc<BusCore>,
    config: Arc<BusConfig>,
}

impl MessageBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    #[must_use]
    pub fn with_config(config: BusConfig) -> Self {
        Self {
            core: Arc::new(BusCore::new()),
            config: Arc::new(config),
        }
    }

    /// Opens a connection with its own unique private inbox prefix. The
    /// owner name is informational and lands in subject names and logs.
    #[must_use]
    pub fn connect(&self, owner: &str) -> BusConnection {
        let inbox_prefix = subject::private_inbox_prefix(owner);
        tracing::debug!(owner, inbox_prefix = %inbox_prefix, "bus connection opened");
        BusConnection {
            core: Arc::clone(&self.core),
            config: Arc::clone(&self.config),
            inbox_prefix,
            reply_seq: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Number of live subscriptions on a subject. Mostly useful in tests
    /// and introspection.
    #[must_use]
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.core.subscriber_count(subject)
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-component handle onto the bus.
#[derive(Clone)]
pub struct BusConnection {
    core: Arc<BusCore>,
    config: Arc<BusConfig>,
    inbox_prefix: String,
    reply_seq: Arc<AtomicU64>,
}

impl BusConnection {
    /// The connection's unique private inbox prefix.
    #[must_use]
    pub fn inbox_prefix(&self) -> &str {
        &self.inbox_prefix
    }

    /// Fire-and-forget publish. Succeeds even when nobody is subscribed.
    pub async fn publish(&self, subj: &str, msg: &BusMessage) -> Result<(), TransportError> {
        self.publish_with_reply(subj, msg, None).await
    }

    /// Publishes a reply to the inbox a request arrived with. A delivery
    /// without a reply-to subject is logged and ignored so broadcast
    /// handlers can respond unconditionally.
    pub async fn respond(
        &self,
        delivery: &Delivery,
        msg: &BusMessage,
    ) -> Result<(), TransportError> {
        match &delivery.reply_to {
            Some(reply_to) => self.publish_with_reply(reply_to, msg, None).await,
            None => {
                tracing::trace!(
                    subject = %delivery.subject,
                    action = msg.action(),
                    "no reply-to subject on delivery; response dropped"
                );
                Ok(())
            }
        }
    }

    async fn publish_with_reply(
        &self,
        subj: &str,
        msg: &BusMessage,
        reply_to: Option<String>,
    ) -> Result<(), TransportError> {
        let bytes = msg.encode()?;
        self.core
            .deliver(Delivery {
                subject: subj.to_string(),
                reply_to,
                bytes,
            })
            .await;
        Ok(())
    }

    /// Opens a receiver-style subscription on a subject.
    #[must_use]
    pub fn subscribe(&self, subj: &str) -> Subscription {
        let (id, rx) = self
            .core
            .add_subscriber(subj, self.config.subscription_capacity);
        Subscription {
            id,
            subject: subj.to_string(),
            rx,
            core: Arc::clone(&self.core),
        }
    }

    /// Registers a handler invoked once per delivery, in arrival order.
    ///
    /// Handler errors and panics are logged; neither tears down the
    /// subscription.
    pub fn subscribe_handler<F, Fut>(&self, subj: &str, handler: F) -> SubscriptionHandle
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (id, mut rx) = self
            .core
            .add_subscriber(subj, self.config.subscription_capacity);
        let subject_name = subj.to_string();
        let loop_subject = subject_name.clone();

        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                match AssertUnwindSafe(handler(delivery)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        tracing::warn!(subject = %loop_subject, %error, "subscription handler failed");
                    }
                    Err(_) => {
                        tracing::error!(subject = %loop_subject, "subscription handler panicked");
                    }
                }
            }
            tracing::trace!(subject = %loop_subject, "subscription handler loop ended");
        });

        SubscriptionHandle {
            id,
            subject: subject_name,
            core: Arc::clone(&self.core),
        }
    }

    /// Request/response over the bus: publish with a generated reply-to
    /// inbox and wait for the first reply.
    pub async fn request(
        &self,
        subj: &str,
        msg: &BusMessage,
        timeout: Duration,
    ) -> Result<BusMessage, TransportError> {
        let seq = self.reply_seq.fetch_add(1, Ordering::Relaxed);
        let reply_subject = subject::reply_inbox(&self.inbox_prefix, seq);
        let mut reply_sub = self.subscribe(&reply_subject);

        self.publish_with_reply(subj, msg, Some(reply_subject))
            .await?;

        match tokio::time::timeout(timeout, reply_sub.recv()).await {
            Ok(Some(delivery)) => Ok(delivery.message()?),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout {
                subject: subj.to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
        // reply_sub drops here, tearing the inbox down.
    }

    /// [`Self::request`] with the configured default timeout.
    pub async fn request_default(
        &self,
        subj: &str,
        msg: &BusMessage,
    ) -> Result<BusMessage, TransportError> {
        self.request(
            subj,
            msg,
            Duration::from_millis(self.config.default_request_timeout_ms),
        )
        .await
    }

    #[must_use]
    pub fn subscriber_count(&self, subj: &str) -> usize {
        self.core.subscriber_count(subj)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::messages::payloads::GetCalculationStatusPayload;
    use crate::messages::{actions, GenericResponsePayload};

    fn status_query(id: &str) -> BusMessage {
        BusMessage::GetCalculationStatus {
            payload: GetCalculationStatusPayload {
                calculation_id: id.to_string(),
            },
        }
    }

    #[tokio::test]
    async fn publish_fans_out_to_all_subscribers() {
        let bus = MessageBus::new();
        let conn = bus.connect("test");

        let mut sub_a = conn.subscribe("work");
        let mut sub_b = conn.subscribe("work");

        conn.publish("work", &BusMessage::HealthCheck).await.unwrap();

        let got_a = sub_a.recv().await.unwrap().message().unwrap();
        let got_b = sub_b.recv().await.unwrap().message().unwrap();
        assert_eq!(got_a, BusMessage::HealthCheck);
        assert_eq!(got_b, BusMessage::HealthCheck);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let bus = MessageBus::new();
        let conn = bus.connect("test");
        conn.publish("nobody.home", &BusMessage::HealthCheck)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn per_subject_order_is_preserved() {
        let bus = MessageBus::new();
        let conn = bus.connect("test");
        let mut sub = conn.subscribe("ordered");

        for i in 0..20 {
            conn.publish("ordered", &status_query(&format!("calc-{i}")))
                .await
                .unwrap();
        }
        for i in 0..20 {
            let msg = sub.recv().await.unwrap().message().unwrap();
            match msg {
                BusMessage::GetCalculationStatus { payload } => {
                    assert_eq!(payload.calculation_id, format!("calc-{i}"));
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn request_reply_round_trip() {
        let bus = MessageBus::new();
        let server = bus.connect("server");
        let caller = bus.connect("caller");

        let responder = server.clone();
        let _handle = server.subscribe_handler("svc", move |delivery| {
            let conn = responder.clone();
            async move {
                let reply = BusMessage::GenericResponse {
                    payload: GenericResponsePayload::success(actions::GET_CALCULATION_STATUS),
                };
                conn.respond(&delivery, &reply).await?;
                Ok(())
            }
        });

        let response = caller
            .request("svc", &status_query("calc-1"), Duration::from_secs(1))
            .await
            .unwrap();
        let payload = response.into_generic_response().unwrap();
        assert!(payload.is_success());

        // The configured-default variant takes the same path.
        let response = caller.request_default("svc", &status_query("calc-2")).await.unwrap();
        assert!(response.into_generic_response().unwrap().is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_without_responder() {
        let bus = MessageBus::new();
        // A subscriber that never answers, so the publish itself succeeds.
        let server = bus.connect("server");
        let _quiet = server.subscribe("svc");

        let caller = bus.connect("caller");
        let err = caller
            .request("svc", &BusMessage::HealthCheck, Duration::from_millis(250))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }), "{err}");
    }

    #[tokio::test]
    async fn reply_inbox_is_torn_down_after_request() {
        let bus = MessageBus::new();
        let server = bus.connect("server");
        let responder = server.clone();
        let _handle = server.subscribe_handler("svc", move |delivery| {
            let conn = responder.clone();
            async move {
                conn.respond(&delivery, &BusMessage::HealthCheck).await?;
                Ok(())
            }
        });

        let caller = bus.connect("caller");
        let reply_subject_prefix = format!("{}.reply.", caller.inbox_prefix());

        caller
            .request("svc", &BusMessage::HealthCheck, Duration::from_secs(1))
            .await
            .unwrap();

        // First exchange used reply seq 1.
        assert_eq!(bus.subscriber_count(&format!("{reply_subject_prefix}1")), 0);
    }

    #[tokio::test]
    async fn handler_error_does_not_kill_subscription() {
        let bus = MessageBus::new();
        let conn = bus.connect("test");
        let processed = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&processed);
        let _handle = conn.subscribe_handler("flaky", move |delivery| {
            let counter = Arc::clone(&counter);
            async move {
                let msg = delivery.message()?;
                counter.fetch_add(1, Ordering::SeqCst);
                if matches!(msg, BusMessage::HealthCheck) {
                    anyhow::bail!("cannot handle health checks today");
                }
                Ok(())
            }
        });

        conn.publish("flaky", &BusMessage::HealthCheck).await.unwrap();
        conn.publish("flaky", &status_query("calc-1")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while processed.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("both messages should be processed");
    }

    #[tokio::test]
    async fn handler_panic_does_not_kill_subscription() {
        let bus = MessageBus::new();
        let conn = bus.connect("test");
        let processed = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&processed);
        let _handle = conn.subscribe_handler("explosive", move |delivery| {
            let counter = Arc::clone(&counter);
            async move {
                if matches!(delivery.message()?, BusMessage::HealthCheck) {
                    panic!("boom");
                }
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        conn.publish("explosive", &BusMessage::HealthCheck)
            .await
            .unwrap();
        conn.publish("explosive", &status_query("calc-1"))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while processed.load(Ordering::SeqCst) < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("the message after the panic should be processed");
    }

    #[tokio::test]
    async fn dropping_subscription_removes_it_from_the_subject() {
        let bus = MessageBus::new();
        let conn = bus.connect("test");

        let sub_a = conn.subscribe("room");
        let sub_b = conn.subscribe("room");
        assert_eq!(bus.subscriber_count("room"), 2);

        drop(sub_a);
        assert_eq!(bus.subscriber_count("room"), 1);
        drop(sub_b);
        assert_eq!(bus.subscriber_count("room"), 0);
    }

    #[tokio::test]
    async fn connections_have_unique_inbox_prefixes() {
        let bus = MessageBus::new();
        let a = bus.connect("node");
        let b = bus.connect("node");
        assert_ne!(a.inbox_prefix(), b.inbox_prefix());
    }

    #[test]
    fn bus_config_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.subscription_capacity, 256);
        assert_eq!(config.default_request_timeout_ms, 30_000);
    }
}

//! Liveness probing of announced clients.
//!
//! Each probe round sends a `health_check` request to every client's private
//! inbox and counts consecutive misses per client. A client that misses
//! `max_missed_probes` rounds in a row is removed from the availability
//! pool, which in turn fails its in-flight calculations through the lost
//! event it emits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;

use xtalhub_core::messages::{BusMessage, HealthStatus};
use xtalhub_core::BusConnection;

use crate::config::HealthConfig;
use crate::registry::availability::ClientAvailabilityTracker;
use crate::service::BackgroundRunnable;

/// On-demand work for the health worker; regular rounds come from the tick.
#[derive(Debug)]
pub enum HealthTask {
    /// Run one probe round immediately.
    ProbeRound,
}

/// Background runnable that keeps the availability pool honest.
pub struct ClientHealthMonitor {
    tracker: Arc<ClientAvailabilityTracker>,
    conn: BusConnection,
    config: HealthConfig,
    /// Consecutive misses per client id.
    strikes: HashMap<String, u32>,
}

impl ClientHealthMonitor {
    #[must_use]
    pub fn new(
        tracker: Arc<ClientAvailabilityTracker>,
        conn: BusConnection,
        config: HealthConfig,
    ) -> Self {
        Self {
            tracker,
            conn,
            config,
            strikes: HashMap::new(),
        }
    }

    /// Probes every client in the pool once, in parallel, and applies the
    /// strike bookkeeping.
    async fn probe_round(&mut self) {
        let snapshot = self.tracker.snapshot();
        if snapshot.is_empty() {
            return;
        }

        let timeout = Duration::from_millis(self.config.probe_timeout_ms);
        let probes = snapshot.iter().map(|handle| {
            let conn = self.conn.clone();
            let handle = Arc::clone(handle);
            async move {
                let reply = conn
                    .request(&handle.inbox_prefix, &BusMessage::HealthCheck, timeout)
                    .await;
                (handle, reply)
            }
        });
        let outcomes = join_all(probes).await;

        // Forget strike history of clients that already left the pool.
        self.strikes
            .retain(|id, _| snapshot.iter().any(|h| h.client_id == *id));

        for (handle, reply) in outcomes {
            if is_healthy(&reply) {
                self.strikes.remove(&handle.client_id);
                continue;
            }

            let strikes = self.strikes.entry(handle.client_id.clone()).or_insert(0);
            *strikes += 1;
            tracing::warn!(
                client_id = %handle.client_id,
                strikes = *strikes,
                max = self.config.max_missed_probes,
                "client missed a health probe"
            );

            if *strikes >= self.config.max_missed_probes {
                self.strikes.remove(&handle.client_id);
                self.tracker.remove(&handle.client_id);
            }
        }
    }
}

fn is_healthy(reply: &Result<BusMessage, xtalhub_core::TransportError>) -> bool {
    matches!(
        reply,
        Ok(BusMessage::HealthCheckResponse { payload })
            if payload.health_status == HealthStatus::Healthy
    )
}

#[async_trait]
impl BackgroundRunnable for ClientHealthMonitor {
    type Task = HealthTask;

    async fn run(&mut self, task: HealthTask) {
        match task {
            HealthTask::ProbeRound => self.probe_round().await,
        }
    }

    async fn on_tick(&mut self) {
        self.probe_round().await;
    }
}

//! Reconnect supervisor: watches the connection for FAILED, reconnects with
//! bounded exponential backoff, and replays the registry.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time;

use super::connection::{ConnectionState, TopicConnection};
use super::registry::{ResubscribeReport, SubscriptionRegistry};
use crate::config::BackoffPolicy;
use crate::error::RealtimeError;

/// What the UI should show about the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorStatus {
    Healthy,
    Reconnecting { attempt: u32 },
    /// Retries exhausted; stays here until [`ReconnectSupervisor::retry_now`].
    GaveUp { attempts: u32 },
    /// The broker rejected the credential; the user has to log in again.
    AuthRejected,
}

enum Outcome {
    Recovered(ResubscribeReport),
    AuthRejected(String),
    GaveUp,
}

pub struct ReconnectSupervisor {
    connection: Arc<TopicConnection>,
    registry: Arc<SubscriptionRegistry>,
    policy: BackoffPolicy,
    status: watch::Sender<SupervisorStatus>,
    recoveries: watch::Sender<u64>,
    last_report: Mutex<Option<ResubscribeReport>>,
    retry: Notify,
}

impl ReconnectSupervisor {
    pub fn new(registry: Arc<SubscriptionRegistry>, policy: BackoffPolicy) -> Arc<Self> {
        let (status, _) = watch::channel(SupervisorStatus::Healthy);
        let (recoveries, _) = watch::channel(0);
        Arc::new(Self {
            connection: registry.connection().clone(),
            registry,
            policy,
            status,
            recoveries,
            last_report: Mutex::new(None),
            retry: Notify::new(),
        })
    }

    pub fn status(&self) -> SupervisorStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.subscribe()
    }

    /// Number of successful recoveries so far, as a watch channel.
    pub fn watch_recoveries(&self) -> watch::Receiver<u64> {
        self.recoveries.subscribe()
    }

    pub fn last_report(&self) -> Option<ResubscribeReport> {
        *self.last_report.lock()
    }

    /// Restart the backoff loop after the supervisor gave up.
    pub fn retry_now(&self) {
        self.retry.notify_one();
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.clone().run())
    }

    async fn run(self: Arc<Self>) {
        let mut state_rx = self.connection.watch_state();
        loop {
            if state_rx
                .wait_for(|s| *s == ConnectionState::Failed)
                .await
                .is_err()
            {
                return;
            }

            loop {
                match self.recover().await {
                    Outcome::Recovered(report) => {
                        *self.last_report.lock() = Some(report);
                        self.status.send_replace(SupervisorStatus::Healthy);
                        self.recoveries.send_modify(|n| *n += 1);
                        break;
                    }
                    Outcome::AuthRejected(reason) => {
                        tracing::error!(%reason, "credential rejected during reconnect");
                        self.status.send_replace(SupervisorStatus::AuthRejected);
                        return;
                    }
                    Outcome::GaveUp => {
                        tracing::error!(
                            attempts = self.policy.max_attempts,
                            "reconnect attempts exhausted"
                        );
                        self.status.send_replace(SupervisorStatus::GaveUp {
                            attempts: self.policy.max_attempts,
                        });
                        self.retry.notified().await;
                    }
                }
            }
        }
    }

    async fn recover(&self) -> Outcome {
        for attempt in 1..=self.policy.max_attempts {
            self.status
                .send_replace(SupervisorStatus::Reconnecting { attempt });
            let delay = jittered(self.policy.delay_for(attempt));
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
            time::sleep(delay).await;

            match self.connection.reconnect().await {
                Ok(handle) => match self.registry.resubscribe_all() {
                    Ok(report) => {
                        tracing::info!(
                            session_id = %handle.session_id,
                            attempt,
                            subscriptions = report.subscriptions,
                            "bus recovered"
                        );
                        return Outcome::Recovered(report);
                    }
                    Err(err) => tracing::warn!(%err, attempt, "replay failed; retrying"),
                },
                Err(RealtimeError::Auth(reason)) => return Outcome::AuthRejected(reason),
                Err(err) => tracing::warn!(%err, attempt, "reconnect attempt failed"),
            }
        }
        Outcome::GaveUp
    }
}

/// Add up to 25% random jitter.
fn jittered(base: Duration) -> Duration {
    let spread = base.as_millis() as u64 / 4;
    if spread == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

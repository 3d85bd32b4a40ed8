use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use quest_core::health::Heartbeat;

use crate::domain::repository::{EventLog, OutboxStore};
use crate::error::EventsError;
use crate::usecase::backoff::Backoff;

/// Cap on the wait between passes after consecutive store or log errors.
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RelayPolicy {
    pub batch_size: u64,
    /// How long a claimed row stays invisible to other relays.
    pub lease: Duration,
    /// Forwarding attempts before a row is marked `FAILED`.
    pub max_attempts: u32,
    pub retry: Backoff,
    pub poll_interval: Duration,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            batch_size: 100,
            lease: Duration::from_secs(30),
            max_attempts: 10,
            retry: Backoff::default(),
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    /// Claimed rows handed back untouched because an earlier row of their
    /// topic is now waiting for a retry.
    pub released: usize,
}

/// Moves committed outbox rows onto the event log.
pub struct OutboxRelay<S, L> {
    store: S,
    log: Arc<L>,
    policy: RelayPolicy,
    heartbeat: Option<Heartbeat>,
}

impl<S: OutboxStore, L: EventLog> OutboxRelay<S, L> {
    pub fn new(store: S, log: Arc<L>, policy: RelayPolicy) -> Self {
        Self {
            store,
            log,
            policy,
            heartbeat: None,
        }
    }

    /// Beat `heartbeat` after every successful pass.
    pub fn with_heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn policy(&self) -> &RelayPolicy {
        &self.policy
    }

    /// Claim one batch of due rows and forward them in id order.
    ///
    /// A forwarding failure schedules a retry (or dead-letters the row once
    /// `max_attempts` is reached); the rest of that topic's batch is
    /// released so nothing overtakes the failed row.
    pub async fn drain_once(&self) -> Result<DrainReport, EventsError> {
        let events = self
            .store
            .claim_due(self.policy.batch_size, self.policy.lease)
            .await?;
        let mut report = DrainReport {
            claimed: events.len(),
            ..DrainReport::default()
        };

        let mut blocked: HashSet<String> = HashSet::new();
        let mut held_back = Vec::new();

        for event in events {
            if blocked.contains(event.topic.as_str()) {
                held_back.push(event.id);
                continue;
            }

            match self.log.append(&event.envelope()).await {
                Ok(entry_id) => {
                    self.store.mark_sent(event.id).await?;
                    report.sent += 1;
                    debug!(topic = %event.topic, event_id = %event.id, entry_id, "outbox event relayed");
                }
                Err(e) => {
                    let attempts = event.attempts + 1;
                    let reason = e.detail();
                    if attempts >= self.policy.max_attempts {
                        self.store.mark_failed(event.id, attempts, &reason).await?;
                        report.failed += 1;
                        error!(
                            topic = %event.topic,
                            event_id = %event.id,
                            attempts,
                            error = %reason,
                            "outbox event dead-lettered"
                        );
                    } else {
                        let delay = self.policy.retry.delay(attempts);
                        let next_retry_at =
                            Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
                        self.store
                            .mark_retry(event.id, attempts, next_retry_at, &reason)
                            .await?;
                        report.retried += 1;
                        blocked.insert(event.topic.to_string());
                        warn!(
                            topic = %event.topic,
                            event_id = %event.id,
                            attempts,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %reason,
                            "outbox event relay failed, will retry"
                        );
                    }
                }
            }
        }

        if !held_back.is_empty() {
            self.store.release(&held_back).await?;
            report.released = held_back.len();
        }

        Ok(report)
    }

    /// Drain until `shutdown` turns `true` or its sender is dropped.
    ///
    /// Goes again immediately after a full batch, otherwise waits
    /// `poll_interval`. Errors back off exponentially.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let error_backoff = Backoff::new(self.policy.poll_interval, MAX_ERROR_BACKOFF);
        let mut consecutive_errors: u32 = 0;
        info!(batch_size = self.policy.batch_size, "outbox relay started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = match self.drain_once().await {
                Ok(report) => {
                    consecutive_errors = 0;
                    if let Some(heartbeat) = &self.heartbeat {
                        heartbeat.beat();
                    }
                    if report.claimed > 0 {
                        debug!(
                            claimed = report.claimed,
                            sent = report.sent,
                            retried = report.retried,
                            failed = report.failed,
                            released = report.released,
                            "outbox drain pass"
                        );
                    }
                    if self.policy.batch_size > 0 && report.claimed as u64 >= self.policy.batch_size {
                        continue;
                    }
                    self.policy.poll_interval
                }
                Err(e) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    let delay = error_backoff.delay(consecutive_errors);
                    error!(
                        error = %e.detail(),
                        consecutive_errors,
                        retry_in_ms = delay.as_millis() as u64,
                        "outbox drain pass failed"
                    );
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("outbox relay stopped");
    }
}

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::domain::repository::{EventBus, EventLog};
use crate::domain::types::{
    DEFAULT_BATCH_COUNT, DEFAULT_BLOCK_MS, Delivery, PollReport, entry_order,
};
use crate::error::EventsError;
use crate::usecase::backoff::Backoff;
use crate::usecase::dispatch::{Dispatcher, EventHandler};

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub group: String,
    pub consumer: String,
    /// Take over entries another consumer of the group left pending for at
    /// least this long. `None` leaves them alone.
    pub claim_idle: Option<Duration>,
    /// Wait between passes after log errors.
    pub error_backoff: Backoff,
}

impl ConsumerOptions {
    pub fn new(group: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            consumer: consumer.into(),
            claim_idle: None,
            error_backoff: Backoff::new(Duration::from_millis(200), Duration::from_secs(30)),
        }
    }

    pub fn with_claim_idle(mut self, min_idle: Duration) -> Self {
        self.claim_idle = Some(min_idle);
        self
    }
}

/// Durable [`EventBus`]: one consumer of a consumer group on the event log.
///
/// Entries are acknowledged only after every handler of their topic
/// succeeds. A failed entry stays pending and blocks later entries of the
/// same topic until a later pass delivers it successfully.
pub struct StreamConsumer<L> {
    log: Arc<L>,
    dispatcher: Dispatcher,
    options: ConsumerOptions,
    ready_groups: Mutex<HashSet<String>>,
    stop: watch::Sender<bool>,
}

impl<L: EventLog> StreamConsumer<L> {
    pub fn new(log: Arc<L>, options: ConsumerOptions) -> Self {
        Self {
            log,
            dispatcher: Dispatcher::new(),
            options,
            ready_groups: Mutex::new(HashSet::new()),
            stop: watch::Sender::new(false),
        }
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    async fn ensure_groups(&self, topics: &[String]) -> Result<(), EventsError> {
        for topic in topics {
            let known = self
                .ready_groups
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(topic);
            if known {
                continue;
            }
            self.log.ensure_group(topic, &self.options.group).await?;
            self.ready_groups
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(topic.clone());
        }
        Ok(())
    }

    /// Backlog of `topic` this consumer must finish before reading new
    /// entries: its own pending entries plus, when configured, entries
    /// claimed from idle consumers. Oldest first.
    ///
    /// The flag reports whether the pending read hit `count`, meaning more
    /// pending entries may remain.
    async fn backlog(
        &self,
        topic: &str,
        count: usize,
    ) -> Result<(Vec<Delivery>, bool), EventsError> {
        let group = &self.options.group;
        let consumer = &self.options.consumer;

        let mut backlog = self.log.read_pending(group, consumer, topic, count).await?;
        let pending_truncated = backlog.len() >= count;
        if let Some(min_idle) = self.options.claim_idle {
            let claimed = self
                .log
                .claim_idle(group, consumer, topic, min_idle, count)
                .await?;
            backlog.extend(claimed);
        }
        backlog.sort_by_key(|d| entry_order(&d.entry_id));
        backlog.dedup_by(|a, b| a.entry_id == b.entry_id);
        Ok((backlog, pending_truncated))
    }

    /// Deliver in order, stopping at the first failure. Returns whether
    /// every delivery was acknowledged.
    async fn deliver_in_order(
        &self,
        deliveries: &[Delivery],
        report: &mut PollReport,
    ) -> Result<bool, EventsError> {
        for delivery in deliveries {
            report.delivered += 1;
            let outcome = self.dispatcher.dispatch(&delivery.envelope).await;
            if !outcome.is_success() {
                report.failed += 1;
                warn!(
                    group = %self.options.group,
                    topic = %delivery.envelope.topic,
                    event_id = %delivery.envelope.id,
                    entry_id = %delivery.entry_id,
                    redelivered = delivery.redelivered,
                    failed_handlers = outcome.failed,
                    "delivery left pending for redelivery"
                );
                return Ok(false);
            }
            self.log.ack(&self.options.group, delivery).await?;
            report.acked += 1;
        }
        Ok(true)
    }

    /// One pass over `topics`: backlog first, then new entries for topics
    /// whose backlog drained.
    async fn pass(
        &self,
        topics: &[String],
        block: Duration,
        count: usize,
    ) -> Result<PollReport, EventsError> {
        self.ensure_groups(topics).await?;

        let mut report = PollReport::default();
        let mut unblocked = Vec::with_capacity(topics.len());
        for topic in topics {
            let (backlog, pending_truncated) = self.backlog(topic, count).await?;
            let drained = self.deliver_in_order(&backlog, &mut report).await?;
            if drained && !pending_truncated {
                unblocked.push(topic.clone());
            }
        }
        if unblocked.is_empty() {
            return Ok(report);
        }

        let fresh = self
            .log
            .read_new(
                &self.options.group,
                &self.options.consumer,
                &unblocked,
                count,
                block,
            )
            .await?;
        let mut by_topic: BTreeMap<String, Vec<Delivery>> = BTreeMap::new();
        for delivery in fresh {
            by_topic
                .entry(delivery.envelope.topic.clone())
                .or_default()
                .push(delivery);
        }
        for deliveries in by_topic.values_mut() {
            deliveries.sort_by_key(|d| entry_order(&d.entry_id));
            self.deliver_in_order(deliveries, &mut report).await?;
        }

        Ok(report)
    }

    /// Wait `duration` unless stopped first. Returns `true` when stopped.
    async fn pause(&self, stop: &mut watch::Receiver<bool>, duration: Duration) -> bool {
        if *stop.borrow_and_update() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            changed = stop.changed() => {
                if changed.is_err() {
                    return true;
                }
            }
        }
        *stop.borrow()
    }
}

impl<L: EventLog> EventBus for StreamConsumer<L> {
    fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) {
        self.dispatcher.subscribe(topic, handler);
    }

    async fn poll_once(&self, block: Duration, count: usize) -> Result<PollReport, EventsError> {
        let topics = self.dispatcher.topics();
        if topics.is_empty() {
            return Ok(PollReport::default());
        }
        let result = self.pass(&topics, block, count.max(1)).await;
        if let Err(EventsError::GroupMissing { group, stream }) = &result {
            // Recreated on the next pass.
            self.ready_groups
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            warn!(group = %group, stream = %stream, "consumer group missing, recreating");
        }
        result
    }

    async fn run(&self, block_ms: Option<u64>, count: Option<usize>) -> Result<(), EventsError> {
        let block = Duration::from_millis(block_ms.unwrap_or(DEFAULT_BLOCK_MS));
        let count = count.unwrap_or(DEFAULT_BATCH_COUNT);
        let mut stop = self.stop.subscribe();
        let mut consecutive_errors: u32 = 0;
        info!(
            group = %self.options.group,
            consumer = %self.options.consumer,
            "stream consumer started"
        );

        loop {
            if *stop.borrow_and_update() {
                break;
            }
            if self.dispatcher.topics().is_empty() {
                if self.pause(&mut stop, block).await {
                    break;
                }
                continue;
            }

            match self.poll_once(block, count).await {
                Ok(report) => {
                    consecutive_errors = 0;
                    // Only failing backlog left: wait before redelivering it.
                    if report.failed > 0 && report.acked == 0 && self.pause(&mut stop, block).await {
                        break;
                    }
                }
                Err(e) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    let delay = self.options.error_backoff.delay(consecutive_errors);
                    error!(
                        group = %self.options.group,
                        error = %e.detail(),
                        consecutive_errors,
                        retry_in_ms = delay.as_millis() as u64,
                        "stream consumer pass failed"
                    );
                    if self.pause(&mut stop, delay).await {
                        break;
                    }
                }
            }
        }

        info!(group = %self.options.group, "stream consumer stopped");
        Ok(())
    }

    fn stop(&self) {
        self.stop.send_replace(true);
    }
}

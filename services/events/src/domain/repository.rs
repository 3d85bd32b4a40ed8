#![allow(async_fn_in_trait)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use quest_domain::id::EventId;

use crate::domain::types::{Delivery, EventEnvelope, OutboxEvent, PollReport};
use crate::error::EventsError;
use crate::usecase::dispatch::EventHandler;

/// Stages events for delivery.
///
/// `Tx` is the unit of atomicity the event joins: the durable publisher takes
/// the caller's database transaction, so the event commits or rolls back with
/// the business change. Returns once the event is staged, never waits for
/// subscribers.
pub trait OutboxPublisher: Send + Sync {
    type Tx: Sync + ?Sized;

    async fn publish(
        &self,
        tx: &Self::Tx,
        topic: &str,
        payload: serde_json::Value,
        dedup_key: Option<String>,
    ) -> Result<OutboxEvent, EventsError>;
}

/// Relay-side access to outbox rows. Only the relay mutates status fields.
pub trait OutboxStore: Send + Sync {
    /// Claim up to `limit` due `NEW` rows in id order, leasing them for
    /// `lease`. A row is only due when no earlier unsent row of its topic is
    /// waiting for a retry.
    async fn claim_due(&self, limit: u64, lease: Duration)
    -> Result<Vec<OutboxEvent>, EventsError>;

    /// `NEW -> SENT`.
    async fn mark_sent(&self, id: EventId) -> Result<(), EventsError>;

    /// `NEW -> NEW` with attempts and next_retry_at advanced.
    async fn mark_retry(
        &self,
        id: EventId,
        attempts: u32,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), EventsError>;

    /// `NEW -> FAILED` (terminal).
    async fn mark_failed(&self, id: EventId, attempts: u32, error: &str)
    -> Result<(), EventsError>;

    /// Drop the lease on claimed rows that were not attempted.
    async fn release(&self, ids: &[EventId]) -> Result<(), EventsError>;
}

/// Durable, ordered stream of envelopes with consumer groups.
///
/// Within a group each entry goes to one consumer and stays pending for that
/// consumer until acknowledged.
pub trait EventLog: Send + Sync {
    /// Append to the topic's stream. Returns the entry id.
    async fn append(&self, envelope: &EventEnvelope) -> Result<String, EventsError>;

    /// Create the group on the topic's stream if missing, positioned at the start.
    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), EventsError>;

    /// Entries already delivered to `consumer` and not yet acknowledged, oldest first.
    async fn read_pending(
        &self,
        group: &str,
        consumer: &str,
        topic: &str,
        count: usize,
    ) -> Result<Vec<Delivery>, EventsError>;

    /// Entries never delivered to the group, waiting up to `block` when none
    /// are available. At most `count` entries per topic.
    async fn read_new(
        &self,
        group: &str,
        consumer: &str,
        topics: &[String],
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, EventsError>;

    /// Take over entries pending on other consumers for at least `min_idle`.
    async fn claim_idle(
        &self,
        group: &str,
        consumer: &str,
        topic: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<Delivery>, EventsError>;

    async fn ack(&self, group: &str, delivery: &Delivery) -> Result<(), EventsError>;
}

/// Seen-set used by idempotent consumers.
///
/// A key moves from absent to claimed (while a handler runs) to seen. Futures
/// are `Send` because stores are awaited inside boxed handlers.
pub trait DedupStore: Send + Sync {
    /// Atomically claim `key` for `lease` unless it is already claimed or
    /// seen. Returns `false` when someone else holds it.
    fn try_claim(
        &self,
        key: &str,
        lease: Duration,
    ) -> impl Future<Output = Result<bool, EventsError>> + Send;

    /// Record `key` as processed for `ttl`, replacing the claim.
    fn mark_seen(
        &self,
        key: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), EventsError>> + Send;

    /// Drop a claim so a redelivery can process the key again.
    fn release(&self, key: &str) -> impl Future<Output = Result<(), EventsError>> + Send;
}

/// Per-topic publish counter. Callers treat failures as best effort.
pub trait EventCounter: Send + Sync {
    async fn incr(&self, topic: &str) -> Result<(), EventsError>;
}

/// Delivers events to subscribed handlers.
pub trait EventBus: Send + Sync {
    fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>);

    /// One delivery pass.
    async fn poll_once(&self, block: Duration, count: usize) -> Result<PollReport, EventsError>;

    /// Delivery loop; returns after [`EventBus::stop`].
    async fn run(&self, block_ms: Option<u64>, count: Option<usize>) -> Result<(), EventsError>;

    fn stop(&self);
}

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use quest_domain::id::EventId;
use quest_domain::topic::Topic;
use quest_events::domain::repository::{DedupStore, EventCounter, EventLog, OutboxStore};
use quest_events::domain::types::{Delivery, EventEnvelope, OutboxEvent, OutboxStatus};
use quest_events::error::EventsError;
use quest_events::infra::memory::MemoryEventLog;
use quest_events::usecase::dispatch::EventHandler;

pub fn new_event(topic: &str, payload: Value) -> OutboxEvent {
    OutboxEvent::new(Topic::parse(topic).unwrap(), payload, None)
}

pub fn numbered(topic: &str, n: u32) -> OutboxEvent {
    new_event(topic, json!({ "n": n }))
}

pub fn envelope(topic: &str, n: u32) -> EventEnvelope {
    numbered(topic, n).envelope()
}

pub fn ids(events: &[OutboxEvent]) -> Vec<EventId> {
    events.iter().map(|e| e.id).collect()
}

// ── MockOutboxStore ──────────────────────────────────────────────────────────

/// Outbox rows in memory with the same claim rules as the database store.
#[derive(Clone, Default)]
pub struct MockOutboxStore {
    pub rows: Arc<Mutex<Vec<OutboxEvent>>>,
    claim_failures: Arc<Mutex<usize>>,
}

impl MockOutboxStore {
    pub fn with_rows(rows: Vec<OutboxEvent>) -> Self {
        Self {
            rows: Arc::new(Mutex::new(rows)),
            ..Self::default()
        }
    }

    /// Fail the next `times` claims as if the database were unreachable.
    pub fn fail_claims(&self, times: usize) {
        *self.claim_failures.lock().unwrap() = times;
    }

    pub fn claim_failures_left(&self) -> usize {
        *self.claim_failures.lock().unwrap()
    }

    pub fn row(&self, id: EventId) -> OutboxEvent {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .expect("row exists")
    }

    fn update(
        &self,
        id: EventId,
        to: OutboxStatus,
        apply: impl FnOnce(&mut OutboxEvent),
    ) -> Result<(), EventsError> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| anyhow::anyhow!("row {id} not found"))?;
        row.status.ensure_transition(to)?;
        row.status = to;
        apply(row);
        Ok(())
    }
}

impl OutboxStore for MockOutboxStore {
    async fn claim_due(
        &self,
        limit: u64,
        lease: Duration,
    ) -> Result<Vec<OutboxEvent>, EventsError> {
        {
            let mut left = self.claim_failures.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(anyhow::anyhow!("connection refused").into());
            }
        }
        let now = Utc::now();
        let lease_until = now + chrono::Duration::milliseconds(lease.as_millis() as i64);
        let mut rows = self.rows.lock().unwrap();
        rows.sort_by_key(|r| r.id);

        let mut blocked = HashSet::new();
        let mut claimed = Vec::new();
        for row in rows.iter_mut().filter(|r| r.status == OutboxStatus::New) {
            let topic = row.topic.to_string();
            if blocked.contains(&topic) {
                continue;
            }
            if row.next_retry_at > now {
                blocked.insert(topic);
                continue;
            }
            if claimed.len() as u64 >= limit {
                break;
            }
            row.next_retry_at = lease_until;
            claimed.push(row.clone());
        }
        Ok(claimed)
    }

    async fn mark_sent(&self, id: EventId) -> Result<(), EventsError> {
        self.update(id, OutboxStatus::Sent, |_| {})
    }

    async fn mark_retry(
        &self,
        id: EventId,
        attempts: u32,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), EventsError> {
        self.update(id, OutboxStatus::New, |row| {
            row.attempts = attempts;
            row.next_retry_at = next_retry_at;
            row.last_error = Some(error.to_owned());
        })
    }

    async fn mark_failed(&self, id: EventId, attempts: u32, error: &str) -> Result<(), EventsError> {
        self.update(id, OutboxStatus::Failed, |row| {
            row.attempts = attempts;
            row.last_error = Some(error.to_owned());
        })
    }

    async fn release(&self, ids: &[EventId]) -> Result<(), EventsError> {
        let now = Utc::now();
        for row in self.rows.lock().unwrap().iter_mut() {
            if ids.contains(&row.id) && row.status == OutboxStatus::New {
                row.next_retry_at = now;
            }
        }
        Ok(())
    }
}

// ── FlakyLog ─────────────────────────────────────────────────────────────────

/// [`MemoryEventLog`] whose appends fail a set number of times per topic and
/// whose pending reads fail a set number of times overall.
#[derive(Default)]
pub struct FlakyLog {
    pub inner: MemoryEventLog,
    failures: Mutex<HashMap<String, usize>>,
    read_failures: Mutex<usize>,
}

impl FlakyLog {
    pub fn fail_appends(&self, topic: &str, times: usize) {
        self.failures.lock().unwrap().insert(topic.to_owned(), times);
    }

    pub fn fail_reads(&self, times: usize) {
        *self.read_failures.lock().unwrap() = times;
    }

    pub fn read_failures_left(&self) -> usize {
        *self.read_failures.lock().unwrap()
    }
}

impl EventLog for FlakyLog {
    async fn append(&self, envelope: &EventEnvelope) -> Result<String, EventsError> {
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&envelope.topic) {
                if *left > 0 {
                    *left -= 1;
                    return Err(anyhow::anyhow!("stream unavailable").into());
                }
            }
        }
        self.inner.append(envelope).await
    }

    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), EventsError> {
        self.inner.ensure_group(topic, group).await
    }

    async fn read_pending(
        &self,
        group: &str,
        consumer: &str,
        topic: &str,
        count: usize,
    ) -> Result<Vec<Delivery>, EventsError> {
        {
            let mut left = self.read_failures.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(anyhow::anyhow!("connection reset").into());
            }
        }
        self.inner.read_pending(group, consumer, topic, count).await
    }

    async fn read_new(
        &self,
        group: &str,
        consumer: &str,
        topics: &[String],
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, EventsError> {
        self.inner
            .read_new(group, consumer, topics, count, block)
            .await
    }

    async fn claim_idle(
        &self,
        group: &str,
        consumer: &str,
        topic: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<Delivery>, EventsError> {
        self.inner
            .claim_idle(group, consumer, topic, min_idle, count)
            .await
    }

    async fn ack(&self, group: &str, delivery: &Delivery) -> Result<(), EventsError> {
        self.inner.ack(group, delivery).await
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────────

/// Records every envelope it receives.
#[derive(Clone, Default)]
pub struct Recorder {
    pub seen: Arc<Mutex<Vec<EventEnvelope>>>,
}

impl Recorder {
    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    /// `n` field of every received payload, in delivery order.
    pub fn numbers(&self) -> Vec<u64> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| e.payload["n"].as_u64())
            .collect()
    }

    pub fn handler(&self) -> impl EventHandler + 'static {
        let seen = Arc::clone(&self.seen);
        move |event: EventEnvelope| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push(event);
                anyhow::Ok(())
            }
        }
    }

    /// Waits `delay` before recording, so concurrent deliveries overlap.
    pub fn slow_handler(&self, delay: Duration) -> impl EventHandler + 'static {
        let seen = Arc::clone(&self.seen);
        move |event: EventEnvelope| {
            let seen = Arc::clone(&seen);
            async move {
                tokio::time::sleep(delay).await;
                seen.lock().unwrap().push(event);
                anyhow::Ok(())
            }
        }
    }

    /// Records, then fails for the first `failures` calls.
    pub fn flaky_handler(&self, failures: usize) -> impl EventHandler + 'static {
        let seen = Arc::clone(&self.seen);
        let left = Arc::new(Mutex::new(failures));
        move |event: EventEnvelope| {
            let seen = Arc::clone(&seen);
            let left = Arc::clone(&left);
            async move {
                seen.lock().unwrap().push(event);
                let mut left = left.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    return Err(anyhow::anyhow!("downstream unavailable"));
                }
                anyhow::Ok(())
            }
        }
    }

    /// Records, then fails whenever the payload's `n` equals `n`.
    pub fn failing_on(&self, n: u64) -> impl EventHandler + 'static {
        let seen = Arc::clone(&self.seen);
        move |event: EventEnvelope| {
            let seen = Arc::clone(&seen);
            async move {
                let fail = event.payload["n"].as_u64() == Some(n);
                seen.lock().unwrap().push(event);
                if fail {
                    return Err(anyhow::anyhow!("cannot handle {n}"));
                }
                anyhow::Ok(())
            }
        }
    }
}

pub fn panicking_handler() -> impl EventHandler + 'static {
    |_event: EventEnvelope| async {
        if true {
            panic!("handler bug");
        }
        anyhow::Ok(())
    }
}

// ── Failing collaborators ────────────────────────────────────────────────────

pub struct FailingCounter;

impl EventCounter for FailingCounter {
    async fn incr(&self, _topic: &str) -> Result<(), EventsError> {
        Err(anyhow::anyhow!("redis down").into())
    }
}

pub struct FailingDedupStore;

impl DedupStore for FailingDedupStore {
    async fn try_claim(&self, _key: &str, _lease: Duration) -> Result<bool, EventsError> {
        Err(anyhow::anyhow!("redis down").into())
    }

    async fn mark_seen(&self, _key: &str, _ttl: Duration) -> Result<(), EventsError> {
        Err(anyhow::anyhow!("redis down").into())
    }

    async fn release(&self, _key: &str) -> Result<(), EventsError> {
        Err(anyhow::anyhow!("redis down").into())
    }
}

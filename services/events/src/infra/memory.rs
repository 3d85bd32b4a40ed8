//! In-process implementations for tests and single-process deployments.
//! Nothing here survives a restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, Notify, watch};
use tokio::time::Instant;

use crate::domain::repository::{DedupStore, EventBus, EventCounter, EventLog, OutboxPublisher};
use crate::domain::types::{
    Delivery, EventEnvelope, OutboxEvent, OutboxStatus, PollReport, entry_order,
};
use crate::error::EventsError;
use crate::schema::SchemaRegistry;
use crate::usecase::dispatch::{Dispatcher, EventHandler};
use crate::usecase::publish::prepare_event;

// ── Synchronous bus ──────────────────────────────────────────────────────────

/// Publisher and bus in one: `publish` runs the topic's handlers before it
/// returns. Handler failures are logged, never redelivered.
#[derive(Clone)]
pub struct InMemoryEventBus {
    dispatcher: Dispatcher,
    registry: Arc<SchemaRegistry>,
    stop: Arc<watch::Sender<bool>>,
}

impl InMemoryEventBus {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            dispatcher: Dispatcher::new(),
            registry,
            stop: Arc::new(watch::Sender::new(false)),
        }
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(Arc::new(SchemaRegistry::new()))
    }
}

impl OutboxPublisher for InMemoryEventBus {
    type Tx = ();

    async fn publish(
        &self,
        _tx: &(),
        topic: &str,
        payload: Value,
        dedup_key: Option<String>,
    ) -> Result<OutboxEvent, EventsError> {
        let mut event = prepare_event(&self.registry, topic, payload, dedup_key)?;
        self.dispatcher.dispatch(&event.envelope()).await;
        event.status = OutboxStatus::Sent;
        Ok(event)
    }
}

impl EventBus for InMemoryEventBus {
    fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) {
        self.dispatcher.subscribe(topic, handler);
    }

    /// Delivery already happened inside `publish`.
    async fn poll_once(&self, _block: Duration, _count: usize) -> Result<PollReport, EventsError> {
        Ok(PollReport::default())
    }

    async fn run(&self, _block_ms: Option<u64>, _count: Option<usize>) -> Result<(), EventsError> {
        let mut stop = self.stop.subscribe();
        while !*stop.borrow_and_update() {
            if stop.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }

    fn stop(&self) {
        self.stop.send_replace(true);
    }
}

// ── Event log ────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct PendingEntry {
    owner: String,
    delivered_at: Instant,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Sequence of the last entry handed out as new.
    cursor: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<u64, EventEnvelope>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct LogState {
    last_seq: u64,
    streams: HashMap<String, StreamState>,
}

impl LogState {
    fn group_mut(
        &mut self,
        topic: &str,
        group: &str,
    ) -> Result<(&BTreeMap<u64, EventEnvelope>, &mut GroupState), EventsError> {
        let missing = || EventsError::GroupMissing {
            group: group.to_owned(),
            stream: topic.to_owned(),
        };
        let stream = self.streams.get_mut(topic).ok_or_else(missing)?;
        let state = stream.groups.get_mut(group).ok_or_else(missing)?;
        Ok((&stream.entries, state))
    }
}

fn entry_id(seq: u64) -> String {
    format!("{seq}-0")
}

/// Consumer-group stream semantics kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    state: Mutex<LogState>,
    appended: Notify,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every envelope appended to `topic`, oldest first.
    pub async fn entries(&self, topic: &str) -> Vec<EventEnvelope> {
        self.state
            .lock()
            .await
            .streams
            .get(topic)
            .map(|s| s.entries.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Entries of `topic` delivered to `group` and not yet acknowledged.
    pub async fn pending_count(&self, topic: &str, group: &str) -> usize {
        self.state
            .lock()
            .await
            .streams
            .get(topic)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    /// Drop `topic` with its entries and groups, like `DEL` on the stream key.
    pub async fn delete_stream(&self, topic: &str) {
        self.state.lock().await.streams.remove(topic);
    }

    fn take_new(
        state: &mut LogState,
        group: &str,
        consumer: &str,
        topics: &[String],
        count: usize,
    ) -> Result<Vec<Delivery>, EventsError> {
        let now = Instant::now();
        let mut deliveries = Vec::new();
        for topic in topics {
            let (entries, group_state) = state.group_mut(topic, group)?;
            let fresh: Vec<(u64, EventEnvelope)> = entries
                .range(group_state.cursor + 1..)
                .take(count)
                .map(|(seq, envelope)| (*seq, envelope.clone()))
                .collect();
            for (seq, envelope) in fresh {
                group_state.cursor = seq;
                group_state.pending.insert(
                    seq,
                    PendingEntry {
                        owner: consumer.to_owned(),
                        delivered_at: now,
                    },
                );
                deliveries.push(Delivery {
                    entry_id: entry_id(seq),
                    envelope,
                    redelivered: false,
                });
            }
        }
        Ok(deliveries)
    }
}

impl EventLog for MemoryEventLog {
    async fn append(&self, envelope: &EventEnvelope) -> Result<String, EventsError> {
        let seq = {
            let mut state = self.state.lock().await;
            state.last_seq += 1;
            let seq = state.last_seq;
            state
                .streams
                .entry(envelope.topic.clone())
                .or_default()
                .entries
                .insert(seq, envelope.clone());
            seq
        };
        self.appended.notify_waiters();
        Ok(entry_id(seq))
    }

    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), EventsError> {
        self.state
            .lock()
            .await
            .streams
            .entry(topic.to_owned())
            .or_default()
            .groups
            .entry(group.to_owned())
            .or_default();
        Ok(())
    }

    async fn read_pending(
        &self,
        group: &str,
        consumer: &str,
        topic: &str,
        count: usize,
    ) -> Result<Vec<Delivery>, EventsError> {
        let mut state = self.state.lock().await;
        let (entries, group_state) = state.group_mut(topic, group)?;
        let now = Instant::now();
        let mut deliveries = Vec::new();
        for (seq, pending) in group_state.pending.iter_mut() {
            if deliveries.len() >= count {
                break;
            }
            if pending.owner != consumer {
                continue;
            }
            let Some(envelope) = entries.get(seq) else {
                continue;
            };
            pending.delivered_at = now;
            deliveries.push(Delivery {
                entry_id: entry_id(*seq),
                envelope: envelope.clone(),
                redelivered: true,
            });
        }
        Ok(deliveries)
    }

    async fn read_new(
        &self,
        group: &str,
        consumer: &str,
        topics: &[String],
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, EventsError> {
        let deadline = Instant::now() + block;
        loop {
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                let deliveries = Self::take_new(&mut state, group, consumer, topics, count)?;
                if !deliveries.is_empty() {
                    return Ok(deliveries);
                }
            }

            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn claim_idle(
        &self,
        group: &str,
        consumer: &str,
        topic: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<Delivery>, EventsError> {
        let mut state = self.state.lock().await;
        let (entries, group_state) = state.group_mut(topic, group)?;
        let now = Instant::now();
        let mut deliveries = Vec::new();
        for (seq, pending) in group_state.pending.iter_mut() {
            if deliveries.len() >= count {
                break;
            }
            if pending.owner == consumer || now.duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            let Some(envelope) = entries.get(seq) else {
                continue;
            };
            pending.owner = consumer.to_owned();
            pending.delivered_at = now;
            deliveries.push(Delivery {
                entry_id: entry_id(*seq),
                envelope: envelope.clone(),
                redelivered: true,
            });
        }
        Ok(deliveries)
    }

    async fn ack(&self, group: &str, delivery: &Delivery) -> Result<(), EventsError> {
        let (seq, _) = entry_order(&delivery.entry_id);
        let mut state = self.state.lock().await;
        let (_, group_state) = state.group_mut(&delivery.envelope.topic, group)?;
        group_state.pending.remove(&seq);
        Ok(())
    }
}

// ── Dedup store ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryDedupStore {
    expires_at: StdMutex<HashMap<String, Instant>>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DedupStore for MemoryDedupStore {
    async fn try_claim(&self, key: &str, lease: Duration) -> Result<bool, EventsError> {
        let now = Instant::now();
        let mut keys = self.expires_at.lock().unwrap_or_else(PoisonError::into_inner);
        if keys.get(key).is_some_and(|expires_at| *expires_at > now) {
            return Ok(false);
        }
        keys.insert(key.to_owned(), now + lease);
        Ok(true)
    }

    async fn mark_seen(&self, key: &str, ttl: Duration) -> Result<(), EventsError> {
        self.expires_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), Instant::now() + ttl);
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<(), EventsError> {
        self.expires_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

// ── Publish counter ──────────────────────────────────────────────────────────

/// Clones share the same counts.
#[derive(Debug, Clone, Default)]
pub struct MemoryCounter {
    counts: Arc<StdMutex<HashMap<String, u64>>>,
}

impl MemoryCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, topic: &str) -> u64 {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .copied()
            .unwrap_or(0)
    }
}

impl EventCounter for MemoryCounter {
    async fn incr(&self, topic: &str) -> Result<(), EventsError> {
        *self
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_owned())
            .or_insert(0) += 1;
        Ok(())
    }
}

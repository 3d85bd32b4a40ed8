use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use quest_core::effect::best_effort;
use quest_domain::topic::Topic;

use crate::domain::repository::{EventBus, EventCounter, OutboxPublisher};
use crate::domain::types::{OutboxEvent, PollReport};
use crate::error::EventsError;
use crate::usecase::dispatch::EventHandler;

/// Entry point for domain services: publish inside a transaction, subscribe
/// handlers, drive delivery.
///
/// Built once at process start and passed to whoever needs it.
pub struct Events<P, B, C> {
    publisher: P,
    bus: B,
    counter: C,
}

impl<P, B, C> Events<P, B, C>
where
    P: OutboxPublisher,
    B: EventBus,
    C: EventCounter,
{
    pub fn new(publisher: P, bus: B, counter: C) -> Self {
        Self {
            publisher,
            bus,
            counter,
        }
    }

    /// Stage an event in `tx`. Counting the publish is best effort; only
    /// staging failures are returned, and the caller must then roll back.
    pub async fn publish(
        &self,
        tx: &P::Tx,
        topic: &str,
        payload: Value,
        dedup_key: Option<String>,
    ) -> Result<OutboxEvent, EventsError> {
        let event = self.publisher.publish(tx, topic, payload, dedup_key).await?;
        best_effort("events.counter.incr", self.counter.incr(event.topic.as_str())).await;
        Ok(event)
    }

    /// Register `handler` for `topic`. Handlers run in registration order.
    pub fn on(
        &self,
        topic: &str,
        handler: impl EventHandler + 'static,
    ) -> Result<&Self, EventsError> {
        let topic = Topic::parse(topic)?;
        self.bus.subscribe(topic.as_str(), Arc::new(handler));
        Ok(self)
    }

    pub async fn poll_once(&self, block: Duration, count: usize) -> Result<PollReport, EventsError> {
        self.bus.poll_once(block, count).await
    }

    pub async fn run(&self, block_ms: Option<u64>, count: Option<usize>) -> Result<(), EventsError> {
        self.bus.run(block_ms, count).await
    }

    pub fn stop(&self) {
        self.bus.stop();
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

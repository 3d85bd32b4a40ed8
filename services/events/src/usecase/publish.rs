use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use quest_domain::topic::Topic;

use crate::domain::repository::{EventLog, OutboxPublisher};
use crate::domain::types::{OutboxEvent, OutboxStatus};
use crate::error::EventsError;
use crate::schema::SchemaRegistry;

/// Validate topic and payload and build the `NEW` event to stage.
///
/// Shared by every publisher so that nothing reaches storage unless it
/// passes the naming convention and the topic's schema.
pub fn prepare_event(
    registry: &SchemaRegistry,
    topic: &str,
    payload: Value,
    dedup_key: Option<String>,
) -> Result<OutboxEvent, EventsError> {
    let topic = Topic::parse(topic)?;
    registry.validate(topic.as_str(), &payload)?;
    Ok(OutboxEvent::new(topic, payload, dedup_key))
}

/// Appends straight to an [`EventLog`], bypassing the outbox table.
///
/// For events not tied to a database mutation. A crash between the caller's
/// own writes and this append loses the event.
pub struct StreamPublisher<L> {
    log: Arc<L>,
    registry: Arc<SchemaRegistry>,
}

impl<L> Clone for StreamPublisher<L> {
    fn clone(&self) -> Self {
        Self {
            log: Arc::clone(&self.log),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<L: EventLog> StreamPublisher<L> {
    pub fn new(log: Arc<L>, registry: Arc<SchemaRegistry>) -> Self {
        Self { log, registry }
    }
}

impl<L: EventLog> OutboxPublisher for StreamPublisher<L> {
    type Tx = ();

    async fn publish(
        &self,
        _tx: &(),
        topic: &str,
        payload: Value,
        dedup_key: Option<String>,
    ) -> Result<OutboxEvent, EventsError> {
        let mut event = prepare_event(&self.registry, topic, payload, dedup_key)?;
        let entry_id = self.log.append(&event.envelope()).await?;
        debug!(topic = %event.topic, event_id = %event.id, entry_id, "event appended to stream");
        event.status = OutboxStatus::Sent;
        Ok(event)
    }
}

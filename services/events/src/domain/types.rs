use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use quest_domain::id::EventId;
use quest_domain::topic::Topic;

use crate::error::EventsError;

/// Delivery state of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    New,
    Sent,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
        }
    }

    /// `SENT` and `FAILED` are terminal; `NEW -> NEW` is a retry.
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::New, _) => true,
            (Self::Sent | Self::Failed, _) => false,
        }
    }

    pub fn ensure_transition(self, next: Self) -> Result<(), EventsError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(EventsError::IllegalTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(Self::New),
            "SENT" => Ok(Self::Sent),
            "FAILED" => Ok(Self::Failed),
            other => Err(anyhow::anyhow!("unknown outbox status `{other}`")),
        }
    }
}

/// One row of the transactional outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEvent {
    pub id: EventId,
    pub topic: Topic,
    pub payload: serde_json::Value,
    pub dedup_key: Option<String>,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_retry_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// A fresh `NEW` event, due immediately.
    pub fn new(topic: Topic, payload: serde_json::Value, dedup_key: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: EventId::new(),
            topic,
            payload,
            dedup_key,
            status: OutboxStatus::New,
            attempts: 0,
            last_error: None,
            next_retry_at: now,
            created_at: now,
        }
    }

    pub fn envelope(&self) -> EventEnvelope {
        EventEnvelope {
            id: self.id,
            topic: self.topic.to_string(),
            payload: self.payload.clone(),
            dedup_key: self.dedup_key.clone(),
            created_at: self.created_at,
        }
    }
}

/// What travels on the stream and what handlers receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: EventId,
    pub topic: String,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
    #[serde(serialize_with = "quest_core::serde::to_rfc3339_ms")]
    pub created_at: DateTime<Utc>,
}

impl EventEnvelope {
    /// Key that identifies the logical occurrence: the dedup key when the
    /// publisher supplied one, else the event id.
    pub fn idempotency_key(&self) -> String {
        match &self.dedup_key {
            Some(key) => key.clone(),
            None => self.id.to_string(),
        }
    }
}

/// An envelope handed out by an [`EventLog`](crate::domain::repository::EventLog)
/// to one consumer of a group, pending until acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Stream entry id, `<millis>-<seq>`.
    pub entry_id: String,
    pub envelope: EventEnvelope,
    /// Delivered before to this group without an ack.
    pub redelivered: bool,
}

/// Sort key for stream entry ids (`<millis>-<seq>`). Unparseable ids sort last.
pub fn entry_order(entry_id: &str) -> (u64, u64) {
    let mut parts = entry_id.splitn(2, '-');
    let ms = parts.next().and_then(|p| p.parse().ok());
    let seq = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    match ms {
        Some(ms) => (ms, seq),
        None => (u64::MAX, u64::MAX),
    }
}

/// Outcome of one consumer pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Deliveries handed to the dispatcher, first deliveries and redeliveries.
    pub delivered: usize,
    pub acked: usize,
    /// Deliveries left pending because a handler failed.
    pub failed: usize,
}

/// Default wait for new stream entries in one poll.
pub const DEFAULT_BLOCK_MS: u64 = 5_000;

/// Default maximum entries read per topic in one poll.
pub const DEFAULT_BATCH_COUNT: usize = 100;

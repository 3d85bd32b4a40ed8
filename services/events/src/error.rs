use quest_domain::topic::TopicError;

use crate::domain::types::OutboxStatus;

/// Events subsystem error variants.
///
/// Publish-side variants reach the caller, who must roll back its
/// transaction. Handler failures never become an `EventsError`; the bus logs
/// them and redelivers.
#[derive(Debug, thiserror::Error)]
pub enum EventsError {
    #[error(transparent)]
    InvalidTopic(#[from] TopicError),
    #[error("payload for {topic} rejected by schema: {reason}")]
    SchemaViolation { topic: String, reason: String },
    #[error("illegal outbox status transition {from} -> {to}")]
    IllegalTransition {
        from: OutboxStatus,
        to: OutboxStatus,
    },
    /// The consumer group (or its stream) vanished, e.g. after a flush.
    #[error("consumer group {group} missing on {stream}")]
    GroupMissing { group: String, stream: String },
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl EventsError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidTopic(_) => "INVALID_TOPIC",
            Self::SchemaViolation { .. } => "SCHEMA_VIOLATION",
            Self::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            Self::GroupMissing { .. } => "GROUP_MISSING",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Display text including the context chain of internal errors.
    pub fn detail(&self) -> String {
        match self {
            Self::Internal(inner) => format!("{inner:#}"),
            other => other.to_string(),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Internal(_) | Self::GroupMissing { .. })
    }
}

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use quest_core::config::Config;

use crate::schema::SchemaRegistry;
use crate::usecase::backoff::Backoff;
use crate::usecase::relay::RelayPolicy;

/// Relay worker configuration loaded from environment variables.
///
/// Field `foo_bar` is read from `FOO_BAR`.
#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Redis connection URL.
    pub redis_url: String,
    /// Port for `/healthz` and `/readyz` (default 3120).
    #[serde(default = "default_health_port")]
    pub relay_health_port: u16,
    #[serde(default = "default_batch_size")]
    pub relay_batch_size: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub relay_poll_interval_ms: u64,
    #[serde(default = "default_lease_ms")]
    pub relay_lease_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub relay_max_attempts: u32,
    #[serde(default = "default_backoff_initial_ms")]
    pub relay_backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub relay_backoff_max_ms: u64,
    /// Readiness fails when the drain loop has not completed a pass for this long.
    #[serde(default = "default_stale_after_ms")]
    pub relay_stale_after_ms: u64,
    /// Prefix of stream and counter keys (default `events:`).
    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,
    /// Approximate stream length cap. Unset keeps every entry.
    pub stream_max_len: Option<u64>,
    /// Consumer name within its group (default `relay-<uuid>`).
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,
    #[serde(default = "default_consumer_block_ms")]
    pub consumer_block_ms: u64,
    /// Pending entries idle this long on another consumer are taken over.
    #[serde(default = "default_consumer_claim_idle_ms")]
    pub consumer_claim_idle_ms: u64,
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,
    /// How long a dedup key stays claimed by a handler that has not finished.
    #[serde(default = "default_dedup_claim_lease_ms")]
    pub dedup_claim_lease_ms: u64,
    /// Directory of `<topic>.json` payload schemas.
    pub event_schema_dir: Option<PathBuf>,
}

impl Config for EventsConfig {}

fn default_health_port() -> u16 {
    3120
}

fn default_batch_size() -> u64 {
    100
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_lease_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    300_000
}

fn default_stale_after_ms() -> u64 {
    60_000
}

fn default_stream_prefix() -> String {
    "events:".to_owned()
}

fn default_consumer_name() -> String {
    format!("relay-{}", uuid::Uuid::new_v4())
}

fn default_consumer_block_ms() -> u64 {
    5_000
}

fn default_consumer_claim_idle_ms() -> u64 {
    60_000
}

fn default_dedup_ttl_secs() -> u64 {
    86_400
}

fn default_dedup_claim_lease_ms() -> u64 {
    300_000
}

impl EventsConfig {
    pub fn relay_policy(&self) -> RelayPolicy {
        RelayPolicy {
            batch_size: self.relay_batch_size,
            lease: Duration::from_millis(self.relay_lease_ms),
            max_attempts: self.relay_max_attempts.max(1),
            retry: Backoff::new(
                Duration::from_millis(self.relay_backoff_initial_ms),
                Duration::from_millis(self.relay_backoff_max_ms),
            ),
            poll_interval: Duration::from_millis(self.relay_poll_interval_ms),
        }
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.relay_stale_after_ms)
    }

    pub fn claim_idle(&self) -> Duration {
        Duration::from_millis(self.consumer_claim_idle_ms)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    pub fn dedup_claim_lease(&self) -> Duration {
        Duration::from_millis(self.dedup_claim_lease_ms)
    }

    /// Schemas from `event_schema_dir`, or an empty registry when unset.
    pub fn schema_registry(&self) -> anyhow::Result<SchemaRegistry> {
        match &self.event_schema_dir {
            Some(dir) => SchemaRegistry::load_dir(dir),
            None => Ok(SchemaRegistry::new()),
        }
    }
}

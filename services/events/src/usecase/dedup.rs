use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use quest_core::effect::best_effort;

use crate::domain::repository::DedupStore;
use crate::domain::types::EventEnvelope;
use crate::usecase::dispatch::EventHandler;

/// `"<scope>:<hash>"` identifying one logical occurrence of `payload`.
///
/// The hash is the first 16 bytes (hex) of the SHA-256 of the payload's
/// canonical JSON, with every key named in `volatile` removed at any depth.
/// Object key order does not affect the result.
pub fn derive_dedup_key(scope: &str, payload: &Value, volatile: &[&str]) -> String {
    let canonical = canonicalize(payload, volatile).to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{scope}:{}", hex::encode(&digest[..16]))
}

fn canonicalize(value: &Value, volatile: &[&str]) -> Value {
    match value {
        Value::Object(fields) => {
            let mut entries: Vec<(&String, &Value)> = fields
                .iter()
                .filter(|(k, _)| !volatile.contains(&k.as_str()))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = Map::new();
            for (k, v) in entries {
                out.insert(k.clone(), canonicalize(v, volatile));
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| canonicalize(v, volatile)).collect())
        }
        other => other.clone(),
    }
}

/// How long a key stays claimed while the inner handler runs, unless the
/// handler finishes first.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(300);

/// Handler wrapper that runs the inner handler at most once per logical
/// occurrence within a consumer group, as long as the seen marker lives.
///
/// The key is claimed atomically before the inner handler runs, so competing
/// consumers holding duplicates cannot both run it. Success turns the claim
/// into a seen marker for `ttl`; failure releases it for redelivery. A crash
/// leaves the claim until its lease expires.
pub struct Deduplicated<D, H> {
    store: Arc<D>,
    inner: H,
    group: String,
    ttl: Duration,
    claim_lease: Duration,
}

impl<D: DedupStore, H: EventHandler> Deduplicated<D, H> {
    pub fn new(store: Arc<D>, group: impl Into<String>, ttl: Duration, inner: H) -> Self {
        Self {
            store,
            inner,
            group: group.into(),
            ttl,
            claim_lease: DEFAULT_CLAIM_LEASE,
        }
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    pub fn seen_key(&self, event: &EventEnvelope) -> String {
        format!(
            "dedup:{}:{}:{}",
            self.group,
            event.topic,
            event.idempotency_key()
        )
    }
}

impl<D: DedupStore, H: EventHandler> EventHandler for Deduplicated<D, H> {
    fn handle<'a>(&'a self, event: &'a EventEnvelope) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let key = self.seen_key(event);
            if !self.store.try_claim(&key, self.claim_lease).await? {
                debug!(topic = %event.topic, event_id = %event.id, key, "duplicate event skipped");
                return Ok(());
            }

            // A panic must still release the claim.
            let outcome = match AssertUnwindSafe(self.inner.handle(event)).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("handler panicked")),
            };
            match outcome {
                Ok(()) => {
                    best_effort("dedup mark_seen", self.store.mark_seen(&key, self.ttl)).await;
                    Ok(())
                }
                Err(e) => {
                    best_effort("dedup release", self.store.release(&key)).await;
                    Err(e)
                }
            }
        })
    }
}

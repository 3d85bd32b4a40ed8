use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use deadpool_redis::redis::{self, AsyncCommands};
use deadpool_redis::{Connection, Pool};
use tracing::warn;

use quest_core::serde::format_rfc3339_ms;

use crate::domain::repository::{DedupStore, EventCounter, EventLog};
use crate::domain::types::{Delivery, EventEnvelope};
use crate::error::EventsError;

/// `XREADGROUP` reply: per stream, entries with their field map. Fields are
/// `None` for pending entries whose payload was trimmed away.
type ReadReply = Option<Vec<(String, Vec<(String, Option<HashMap<String, String>>)>)>>;

/// `XPENDING` extended reply: (entry id, owner, idle ms, delivery count).
type PendingReply = Vec<(String, String, u64, u64)>;

/// `XCLAIM` reply; `None` fields mark entries trimmed since delivery.
type ClaimReply = Vec<(String, Option<HashMap<String, String>>)>;

async fn connection(pool: &Pool) -> Result<Connection, EventsError> {
    Ok(pool.get().await.context("get redis connection")?)
}

/// Map a stream command failure, surfacing `NOGROUP` so callers can recreate
/// the group.
fn stream_error(e: redis::RedisError, group: &str, stream: &str, op: &'static str) -> EventsError {
    if e.code() == Some("NOGROUP") {
        EventsError::GroupMissing {
            group: group.to_owned(),
            stream: stream.to_owned(),
        }
    } else {
        anyhow::Error::new(e).context(op).into()
    }
}

// ── Event log (Redis Streams) ────────────────────────────────────────────────

/// One stream per topic, keyed `<prefix><topic>`.
#[derive(Clone)]
pub struct RedisEventLog {
    pub pool: Pool,
    pub prefix: String,
    /// Approximate `MAXLEN` applied on append. `None` keeps everything.
    pub max_len: Option<u64>,
}

impl RedisEventLog {
    pub fn stream_key(&self, topic: &str) -> String {
        format!("{}{}", self.prefix, topic)
    }

    /// Turn raw entries into deliveries. Entries that cannot be decoded are
    /// acknowledged and dropped so they do not block the topic forever.
    async fn decode_entries(
        &self,
        conn: &mut Connection,
        group: &str,
        key: &str,
        entries: Vec<(String, Option<HashMap<String, String>>)>,
        redelivered: bool,
    ) -> Result<Vec<Delivery>, EventsError> {
        let mut deliveries = Vec::with_capacity(entries.len());
        for (entry_id, fields) in entries {
            let decoded = fields
                .context("entry fields missing")
                .and_then(|fields| decode_envelope(&fields));
            match decoded {
                Ok(envelope) => deliveries.push(Delivery {
                    entry_id,
                    envelope,
                    redelivered,
                }),
                Err(e) => {
                    warn!(stream = key, group, entry_id, error = %format!("{e:#}"), "undecodable stream entry dropped");
                    let _: i64 = redis::cmd("XACK")
                        .arg(key)
                        .arg(group)
                        .arg(&entry_id)
                        .query_async(conn)
                        .await
                        .context("xack undecodable entry")?;
                }
            }
        }
        Ok(deliveries)
    }
}

/// Stream entry fields for `envelope`.
pub fn encode_envelope(envelope: &EventEnvelope) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("id", envelope.id.to_string()),
        ("topic", envelope.topic.clone()),
        ("payload", envelope.payload.to_string()),
        ("created_at", format_rfc3339_ms(&envelope.created_at)),
    ];
    if let Some(key) = &envelope.dedup_key {
        fields.push(("dedup_key", key.clone()));
    }
    fields
}

pub fn decode_envelope(fields: &HashMap<String, String>) -> anyhow::Result<EventEnvelope> {
    let field = |name: &str| {
        fields
            .get(name)
            .with_context(|| format!("missing field `{name}`"))
    };
    Ok(EventEnvelope {
        id: field("id")?.parse().context("parse event id")?,
        topic: field("topic")?.clone(),
        payload: serde_json::from_str(field("payload")?).context("parse payload")?,
        dedup_key: fields.get("dedup_key").cloned(),
        created_at: DateTime::parse_from_rfc3339(field("created_at")?)
            .context("parse created_at")?
            .with_timezone(&Utc),
    })
}

impl EventLog for RedisEventLog {
    async fn append(&self, envelope: &EventEnvelope) -> Result<String, EventsError> {
        let mut conn = connection(&self.pool).await?;
        let mut cmd = redis::cmd("XADD");
        cmd.arg(self.stream_key(&envelope.topic));
        if let Some(max_len) = self.max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*");
        for (name, value) in encode_envelope(envelope) {
            cmd.arg(name).arg(value);
        }
        let entry_id: String = cmd.query_async(&mut conn).await.context("xadd")?;
        Ok(entry_id)
    }

    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), EventsError> {
        let mut conn = connection(&self.pool).await?;
        let created: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(self.stream_key(topic))
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(anyhow::Error::new(e).context("xgroup create").into()),
        }
    }

    async fn read_pending(
        &self,
        group: &str,
        consumer: &str,
        topic: &str,
        count: usize,
    ) -> Result<Vec<Delivery>, EventsError> {
        let mut conn = connection(&self.pool).await?;
        let key = self.stream_key(topic);
        let reply: ReadReply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(&key)
            .arg("0")
            .query_async(&mut conn)
            .await
            .map_err(|e| stream_error(e, group, &key, "xreadgroup pending"))?;

        let mut deliveries = Vec::new();
        for (_, entries) in reply.unwrap_or_default() {
            deliveries.extend(
                self.decode_entries(&mut conn, group, &key, entries, true)
                    .await?,
            );
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
        if topics.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = connection(&self.pool).await?;
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(count);
        // BLOCK 0 would wait forever.
        if !block.is_zero() {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("STREAMS");
        let keys: Vec<String> = topics.iter().map(|topic| self.stream_key(topic)).collect();
        cmd.arg(&keys);
        for _ in topics {
            cmd.arg(">");
        }
        let reply: ReadReply = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| stream_error(e, group, &keys.join(","), "xreadgroup new"))?;

        let mut deliveries = Vec::new();
        for (key, entries) in reply.unwrap_or_default() {
            deliveries.extend(
                self.decode_entries(&mut conn, group, &key, entries, false)
                    .await?,
            );
        }
        Ok(deliveries)
    }

    async fn claim_idle(
        &self,
        group: &str,
        consumer: &str,
        topic: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<Delivery>, EventsError> {
        let mut conn = connection(&self.pool).await?;
        let key = self.stream_key(topic);
        let min_idle_ms = min_idle.as_millis() as u64;

        let pending: PendingReply = redis::cmd("XPENDING")
            .arg(&key)
            .arg(group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| stream_error(e, group, &key, "xpending"))?;
        let stale: Vec<String> = pending
            .into_iter()
            .filter(|(_, owner, _, _)| owner != consumer)
            .map(|(entry_id, _, _, _)| entry_id)
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: ClaimReply = redis::cmd("XCLAIM")
            .arg(&key)
            .arg(group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg(&stale)
            .query_async(&mut conn)
            .await
            .map_err(|e| stream_error(e, group, &key, "xclaim"))?;
        self.decode_entries(&mut conn, group, &key, claimed, true)
            .await
    }

    async fn ack(&self, group: &str, delivery: &Delivery) -> Result<(), EventsError> {
        let mut conn = connection(&self.pool).await?;
        let _: i64 = redis::cmd("XACK")
            .arg(self.stream_key(&delivery.envelope.topic))
            .arg(group)
            .arg(&delivery.entry_id)
            .query_async(&mut conn)
            .await
            .context("xack")?;
        Ok(())
    }
}

// ── Dedup store ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RedisDedupStore {
    pub pool: Pool,
}

impl DedupStore for RedisDedupStore {
    async fn try_claim(&self, key: &str, lease: Duration) -> Result<bool, EventsError> {
        let mut conn = connection(&self.pool).await?;
        // `SET NX` replies OK when the key was set, nil when it already existed.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("claimed")
            .arg("NX")
            .arg("PX")
            .arg((lease.as_millis() as u64).max(1))
            .query_async(&mut conn)
            .await
            .context("dedup claim")?;
        Ok(reply.is_some())
    }

    async fn mark_seen(&self, key: &str, ttl: Duration) -> Result<(), EventsError> {
        let mut conn = connection(&self.pool).await?;
        let (): () = conn
            .set_ex(key, "seen", ttl.as_secs().max(1))
            .await
            .context("dedup set")?;
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<(), EventsError> {
        let mut conn = connection(&self.pool).await?;
        let _: i64 = conn.del(key).await.context("dedup release")?;
        Ok(())
    }
}

// ── Publish counter ──────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RedisEventCounter {
    pub pool: Pool,
    pub prefix: String,
}

impl EventCounter for RedisEventCounter {
    async fn incr(&self, topic: &str) -> Result<(), EventsError> {
        let mut conn = connection(&self.pool).await?;
        let key = format!("{}published:{}", self.prefix, topic);
        let _: i64 = conn.incr(&key, 1).await.context("incr publish counter")?;
        Ok(())
    }
}

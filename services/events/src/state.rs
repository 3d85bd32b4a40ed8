use std::sync::Arc;

use deadpool_redis::Pool as RedisPool;
use sea_orm::DatabaseConnection;

use quest_core::health::Heartbeat;

use crate::config::EventsConfig;
use crate::infra::cache::{RedisDedupStore, RedisEventCounter, RedisEventLog};
use crate::infra::db::{DbOutboxPublisher, DbOutboxStore};
use crate::schema::SchemaRegistry;
use crate::usecase::consume::{ConsumerOptions, StreamConsumer};
use crate::usecase::events::Events;
use crate::usecase::relay::OutboxRelay;

/// Durable facade: outbox rows in Postgres, delivery from Redis Streams.
pub type DurableEvents = Events<DbOutboxPublisher, StreamConsumer<RedisEventLog>, RedisEventCounter>;

/// Connections and settings built once in `main`; hands out the stores,
/// publisher, relay and facade.
#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub redis: RedisPool,
    pub registry: Arc<SchemaRegistry>,
    pub config: EventsConfig,
}

impl AppState {
    pub fn outbox_publisher(&self) -> DbOutboxPublisher {
        DbOutboxPublisher {
            registry: Arc::clone(&self.registry),
        }
    }

    pub fn outbox_store(&self) -> DbOutboxStore {
        DbOutboxStore {
            db: self.db.clone(),
        }
    }

    pub fn event_log(&self) -> RedisEventLog {
        RedisEventLog {
            pool: self.redis.clone(),
            prefix: self.config.stream_prefix.clone(),
            max_len: self.config.stream_max_len,
        }
    }

    pub fn dedup_store(&self) -> RedisDedupStore {
        RedisDedupStore {
            pool: self.redis.clone(),
        }
    }

    pub fn event_counter(&self) -> RedisEventCounter {
        RedisEventCounter {
            pool: self.redis.clone(),
            prefix: self.config.stream_prefix.clone(),
        }
    }

    pub fn relay(&self, heartbeat: Heartbeat) -> OutboxRelay<DbOutboxStore, RedisEventLog> {
        OutboxRelay::new(
            self.outbox_store(),
            Arc::new(self.event_log()),
            self.config.relay_policy(),
        )
        .with_heartbeat(heartbeat)
    }

    /// Consumer of `group`, named after this process.
    pub fn consumer(&self, group: &str) -> StreamConsumer<RedisEventLog> {
        let options = ConsumerOptions::new(group, self.config.consumer_name.clone())
            .with_claim_idle(self.config.claim_idle());
        StreamConsumer::new(Arc::new(self.event_log()), options)
    }

    pub fn events(&self, group: &str) -> DurableEvents {
        Events::new(
            self.outbox_publisher(),
            self.consumer(group),
            self.event_counter(),
        )
    }
}

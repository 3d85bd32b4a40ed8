use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Alias, Expr, LockBehavior, LockType, Query};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseBackend,
    DatabaseConnection, DatabaseTransaction, DbErr, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Statement, TransactionTrait,
};
use serde_json::Value;
use uuid::Uuid;

use quest_domain::id::EventId;
use quest_domain::topic::Topic;
use quest_events_schema::outbox_events;

use crate::domain::repository::{OutboxPublisher, OutboxStore};
use crate::domain::types::{OutboxEvent, OutboxStatus};
use crate::error::EventsError;
use crate::schema::SchemaRegistry;
use crate::usecase::publish::prepare_event;

/// Key of the transaction-scoped advisory lock serializing relay claims on
/// Postgres.
const CLAIM_LOCK_KEY: i64 = 0x5155_4553_545f_4f42;

// ── Publisher ────────────────────────────────────────────────────────────────

/// Stages events as `outbox_events` rows inside the caller's transaction.
#[derive(Clone)]
pub struct DbOutboxPublisher {
    pub registry: Arc<SchemaRegistry>,
}

impl OutboxPublisher for DbOutboxPublisher {
    type Tx = DatabaseTransaction;

    async fn publish(
        &self,
        tx: &DatabaseTransaction,
        topic: &str,
        payload: Value,
        dedup_key: Option<String>,
    ) -> Result<OutboxEvent, EventsError> {
        let event = prepare_event(&self.registry, topic, payload, dedup_key)?;
        outbox_events::ActiveModel {
            id: Set(event.id.0),
            topic: Set(event.topic.to_string()),
            payload: Set(event.payload.clone()),
            dedup_key: Set(event.dedup_key.clone()),
            status: Set(event.status.as_str().to_owned()),
            attempts: Set(0),
            last_error: Set(None),
            created_at: Set(event.created_at),
            next_retry_at: Set(event.next_retry_at),
            sent_at: Set(None),
        }
        .insert(tx)
        .await
        .context("insert outbox event")?;
        Ok(event)
    }
}

// ── Relay store ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct DbOutboxStore {
    pub db: DatabaseConnection,
}

impl DbOutboxStore {
    /// Apply a status update to a `NEW` row, reporting why nothing changed.
    async fn update_new_row(
        &self,
        id: EventId,
        to: OutboxStatus,
        update: sea_orm::UpdateMany<outbox_events::Entity>,
    ) -> Result<(), EventsError> {
        let result = update
            .filter(outbox_events::Column::Id.eq(id.0))
            .filter(outbox_events::Column::Status.eq(OutboxStatus::New.as_str()))
            .exec(&self.db)
            .await
            .context("update outbox event status")?;
        if result.rows_affected > 0 {
            return Ok(());
        }

        let current = outbox_events::Entity::find_by_id(id.0)
            .one(&self.db)
            .await
            .context("find outbox event")?
            .with_context(|| format!("outbox event {id} not found"))?;
        let from: OutboxStatus = current.status.parse()?;
        from.ensure_transition(to)?;
        Err(anyhow::anyhow!("outbox event {id} changed concurrently").into())
    }
}

impl OutboxStore for DbOutboxStore {
    /// Rows come out in id order, which is creation order rather than commit
    /// order: a transaction that commits late can add a row behind ones of
    /// its topic that were already relayed.
    async fn claim_due(
        &self,
        limit: u64,
        lease: Duration,
    ) -> Result<Vec<OutboxEvent>, EventsError> {
        let now = Utc::now();
        let lease_until = now + chrono::Duration::milliseconds(lease.as_millis() as i64);
        let backend = self.db.get_database_backend();

        let rows = self
            .db
            .transaction::<_, Vec<outbox_events::Model>, DbErr>(|txn| {
                Box::pin(async move {
                    if backend == DatabaseBackend::Postgres {
                        txn.execute(Statement::from_sql_and_values(
                            DatabaseBackend::Postgres,
                            "SELECT pg_advisory_xact_lock($1)",
                            [CLAIM_LOCK_KEY.into()],
                        ))
                        .await?;
                    }

                    // An earlier row of the same topic waiting for a retry (or
                    // leased by another relay) holds back the whole topic.
                    let earlier = Alias::new("earlier");
                    let blocked_by_earlier = Query::select()
                        .expr(Expr::val(1))
                        .from_as(outbox_events::Entity, earlier.clone())
                        .and_where(
                            Expr::col((earlier.clone(), outbox_events::Column::Topic))
                                .equals((outbox_events::Entity, outbox_events::Column::Topic)),
                        )
                        .and_where(
                            Expr::col((earlier.clone(), outbox_events::Column::Id)).lt(Expr::col(
                                (outbox_events::Entity, outbox_events::Column::Id),
                            )),
                        )
                        .and_where(
                            Expr::col((earlier.clone(), outbox_events::Column::Status))
                                .eq(OutboxStatus::New.as_str()),
                        )
                        .and_where(
                            Expr::col((earlier, outbox_events::Column::NextRetryAt)).gt(now),
                        )
                        .to_owned();

                    let rows = outbox_events::Entity::find()
                        .filter(outbox_events::Column::Status.eq(OutboxStatus::New.as_str()))
                        .filter(outbox_events::Column::NextRetryAt.lte(now))
                        .filter(Expr::exists(blocked_by_earlier).not())
                        .order_by_asc(outbox_events::Column::Id)
                        .limit(limit)
                        .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
                        .all(txn)
                        .await?;

                    let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
                    if !ids.is_empty() {
                        outbox_events::Entity::update_many()
                            .col_expr(
                                outbox_events::Column::NextRetryAt,
                                Expr::value(lease_until),
                            )
                            .filter(outbox_events::Column::Id.is_in(ids))
                            .exec(txn)
                            .await?;
                    }
                    Ok(rows)
                })
            })
            .await
            .context("claim due outbox events")?;

        rows.into_iter()
            .map(|row| {
                let mut event = event_from_model(row)?;
                event.next_retry_at = lease_until;
                Ok(event)
            })
            .collect()
    }

    async fn mark_sent(&self, id: EventId) -> Result<(), EventsError> {
        let update = outbox_events::Entity::update_many()
            .col_expr(
                outbox_events::Column::Status,
                Expr::value(OutboxStatus::Sent.as_str()),
            )
            .col_expr(outbox_events::Column::SentAt, Expr::value(Some(Utc::now())));
        self.update_new_row(id, OutboxStatus::Sent, update).await
    }

    async fn mark_retry(
        &self,
        id: EventId,
        attempts: u32,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), EventsError> {
        let update = outbox_events::Entity::update_many()
            .col_expr(outbox_events::Column::Attempts, Expr::value(attempts as i32))
            .col_expr(outbox_events::Column::NextRetryAt, Expr::value(next_retry_at))
            .col_expr(
                outbox_events::Column::LastError,
                Expr::value(Some(error.to_owned())),
            );
        self.update_new_row(id, OutboxStatus::New, update).await
    }

    async fn mark_failed(&self, id: EventId, attempts: u32, error: &str) -> Result<(), EventsError> {
        let update = outbox_events::Entity::update_many()
            .col_expr(
                outbox_events::Column::Status,
                Expr::value(OutboxStatus::Failed.as_str()),
            )
            .col_expr(outbox_events::Column::Attempts, Expr::value(attempts as i32))
            .col_expr(
                outbox_events::Column::LastError,
                Expr::value(Some(error.to_owned())),
            );
        self.update_new_row(id, OutboxStatus::Failed, update).await
    }

    async fn release(&self, ids: &[EventId]) -> Result<(), EventsError> {
        if ids.is_empty() {
            return Ok(());
        }
        outbox_events::Entity::update_many()
            .col_expr(outbox_events::Column::NextRetryAt, Expr::value(Utc::now()))
            .filter(outbox_events::Column::Id.is_in(ids.iter().map(|id| id.0)))
            .filter(outbox_events::Column::Status.eq(OutboxStatus::New.as_str()))
            .exec(&self.db)
            .await
            .context("release outbox events")?;
        Ok(())
    }
}

fn event_from_model(model: outbox_events::Model) -> Result<OutboxEvent, EventsError> {
    let topic = Topic::parse(&model.topic)
        .with_context(|| format!("stored topic of outbox event {}", model.id))?;
    Ok(OutboxEvent {
        id: EventId(model.id),
        topic,
        payload: model.payload,
        dedup_key: model.dedup_key,
        status: model.status.parse()?,
        attempts: u32::try_from(model.attempts).unwrap_or_default(),
        last_error: model.last_error,
        next_retry_at: model.next_retry_at,
        created_at: model.created_at,
    })
}

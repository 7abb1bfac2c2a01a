//! PostgreSQL implementation of [`Storage`].
//!
//! Leases rely on `FOR UPDATE SKIP LOCKED` so several engine processes can
//! drain the same queues without double-delivering. Invocation writes and row
//! transitions share a REPEATABLE READ transaction.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Row, Transaction, postgres::PgRow};

use super::{Storage, TriggerStats};
use crate::error::{HooklineError, Result};
use crate::event::{Event, EventId, Invocation, NewScheduledEvent, ScheduledEvent};

/// PostgreSQL-backed queue storage.
///
/// # Example
/// ```ignore
/// use hookline::PostgresStorage;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgresql://localhost/hookline").await?;
/// let storage = PostgresStorage::new(pool);
/// storage.migrate().await?;
/// ```
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| HooklineError::Other(anyhow!("failed to run migrations: {e}")))
    }

    async fn begin_repeatable_read(&self) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| HooklineError::Other(anyhow!("failed to begin transaction: {e}")))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await
            .map_err(|e| HooklineError::Other(anyhow!("failed to set isolation level: {e}")))?;
        Ok(tx)
    }

    /// Insert an invocation row and bump the queue row's `tries`. Both
    /// queues share this shape; only the table names differ.
    async fn log_invocation(
        tx: &mut Transaction<'static, Postgres>,
        log_table: &str,
        queue_table: &str,
        invocation: &Invocation,
    ) -> Result<()> {
        let insert = format!(
            "INSERT INTO {log_table} (event_id, status, request, response) VALUES ($1, $2, $3, $4)"
        );
        sqlx::query(&insert)
            .bind(&invocation.event_id.0)
            .bind(invocation.status)
            .bind(&invocation.request)
            .bind(&invocation.response)
            .execute(&mut **tx)
            .await
            .map_err(|e| HooklineError::Other(anyhow!("failed to insert invocation: {e}")))?;

        let bump = format!("UPDATE {queue_table} SET tries = tries + 1 WHERE id = $1");
        let result = sqlx::query(&bump)
            .bind(&invocation.event_id.0)
            .execute(&mut **tx)
            .await
            .map_err(|e| HooklineError::Other(anyhow!("failed to bump tries: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(HooklineError::EventNotFound(invocation.event_id.clone()));
        }
        Ok(())
    }

    async fn commit(tx: Transaction<'static, Postgres>) -> Result<()> {
        tx.commit()
            .await
            .map_err(|e| HooklineError::Other(anyhow!("failed to commit transaction: {e}")))
    }
}

fn map_event(row: &PgRow) -> Result<Event> {
    let map = |e: sqlx::Error| HooklineError::Other(anyhow!("failed to decode event row: {e}"));
    Ok(Event {
        id: EventId(row.try_get::<String, _>("id").map_err(map)?),
        schema_name: row.try_get("schema_name").map_err(map)?,
        table_name: row.try_get("table_name").map_err(map)?,
        trigger_name: row.try_get("trigger_name").map_err(map)?,
        payload: row.try_get("payload").map_err(map)?,
        tries: row.try_get("tries").map_err(map)?,
        created_at: row.try_get("created_at").map_err(map)?,
        next_retry_at: row.try_get("next_retry_at").map_err(map)?,
    })
}

fn map_scheduled_event(row: &PgRow) -> Result<ScheduledEvent> {
    let map =
        |e: sqlx::Error| HooklineError::Other(anyhow!("failed to decode scheduled row: {e}"));
    Ok(ScheduledEvent {
        id: EventId(row.try_get::<String, _>("id").map_err(map)?),
        name: row.try_get("name").map_err(map)?,
        scheduled_time: row.try_get("scheduled_time").map_err(map)?,
        additional_payload: row.try_get("additional_payload").map_err(map)?,
        tries: row.try_get("tries").map_err(map)?,
        next_retry_at: row.try_get("next_retry_at").map_err(map)?,
    })
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn fetch_events(&self, limit: i64) -> Result<Vec<Event>> {
        let now = Utc::now();
        let rows = sqlx::query(
            r#"
            UPDATE event_log
            SET locked = TRUE
            WHERE id IN (
                SELECT id
                FROM event_log
                WHERE locked = FALSE
                    AND delivered = FALSE
                    AND error = FALSE
                    AND archived = FALSE
                    AND (next_retry_at IS NULL OR next_retry_at <= $2)
                ORDER BY created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, schema_name, table_name, trigger_name, payload, tries,
                      created_at, next_retry_at
            "#,
        )
        .bind(limit)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| HooklineError::Other(anyhow!("failed to lease events: {e}")))?;

        rows.iter().map(map_event).collect()
    }

    async fn record_event_success(&self, event: &Event, invocation: &Invocation) -> Result<()> {
        let mut tx = self.begin_repeatable_read().await?;
        Self::log_invocation(&mut tx, "event_invocation_logs", "event_log", invocation).await?;
        sqlx::query(
            "UPDATE event_log SET delivered = TRUE, locked = FALSE, next_retry_at = NULL \
             WHERE id = $1",
        )
        .bind(&event.id.0)
        .execute(&mut *tx)
        .await
        .map_err(|e| HooklineError::Other(anyhow!("failed to mark event delivered: {e}")))?;
        Self::commit(tx).await
    }

    async fn record_event_error(&self, event: &Event, invocation: &Invocation) -> Result<()> {
        let mut tx = self.begin_repeatable_read().await?;
        Self::log_invocation(&mut tx, "event_invocation_logs", "event_log", invocation).await?;
        sqlx::query(
            "UPDATE event_log SET error = TRUE, locked = FALSE, next_retry_at = NULL \
             WHERE id = $1",
        )
        .bind(&event.id.0)
        .execute(&mut *tx)
        .await
        .map_err(|e| HooklineError::Other(anyhow!("failed to mark event errored: {e}")))?;
        Self::commit(tx).await
    }

    async fn record_event_retry(
        &self,
        event: &Event,
        invocation: &Invocation,
        retry_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.begin_repeatable_read().await?;
        Self::log_invocation(&mut tx, "event_invocation_logs", "event_log", invocation).await?;
        sqlx::query("UPDATE event_log SET next_retry_at = $2, locked = FALSE WHERE id = $1")
            .bind(&event.id.0)
            .bind(retry_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| HooklineError::Other(anyhow!("failed to set event retry: {e}")))?;
        Self::commit(tx).await
    }

    async fn unlock_all_events(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE event_log SET locked = FALSE WHERE locked = TRUE")
            .execute(&self.pool)
            .await
            .map_err(|e| HooklineError::Other(anyhow!("failed to unlock events: {e}")))?;
        Ok(result.rows_affected())
    }

    async fn fetch_scheduled_events(&self, limit: i64) -> Result<Vec<ScheduledEvent>> {
        let now = Utc::now();
        let rows = sqlx::query(
            r#"
            UPDATE hdb_scheduled_events
            SET locked = TRUE
            WHERE id IN (
                SELECT id
                FROM hdb_scheduled_events
                WHERE locked = FALSE
                    AND delivered = FALSE
                    AND error = FALSE
                    AND dead = FALSE
                    AND cancelled = FALSE
                    AND ((next_retry_at IS NULL AND scheduled_time <= $2)
                         OR next_retry_at <= $2)
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, name, scheduled_time, additional_payload, tries, next_retry_at
            "#,
        )
        .bind(limit)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| HooklineError::Other(anyhow!("failed to lease scheduled events: {e}")))?;

        rows.iter().map(map_scheduled_event).collect()
    }

    async fn record_scheduled_success(
        &self,
        event: &ScheduledEvent,
        invocation: &Invocation,
    ) -> Result<()> {
        let mut tx = self.begin_repeatable_read().await?;
        Self::log_invocation(
            &mut tx,
            "hdb_scheduled_event_invocation_logs",
            "hdb_scheduled_events",
            invocation,
        )
        .await?;
        sqlx::query(
            "UPDATE hdb_scheduled_events \
             SET delivered = TRUE, locked = FALSE, next_retry_at = NULL WHERE id = $1",
        )
        .bind(&event.id.0)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            HooklineError::Other(anyhow!("failed to mark scheduled event delivered: {e}"))
        })?;
        Self::commit(tx).await
    }

    async fn record_scheduled_error(
        &self,
        event: &ScheduledEvent,
        invocation: &Invocation,
    ) -> Result<()> {
        let mut tx = self.begin_repeatable_read().await?;
        Self::log_invocation(
            &mut tx,
            "hdb_scheduled_event_invocation_logs",
            "hdb_scheduled_events",
            invocation,
        )
        .await?;
        // next_retry_at is deliberately left in place on this queue.
        sqlx::query("UPDATE hdb_scheduled_events SET error = TRUE, locked = FALSE WHERE id = $1")
            .bind(&event.id.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                HooklineError::Other(anyhow!("failed to mark scheduled event errored: {e}"))
            })?;
        Self::commit(tx).await
    }

    async fn record_scheduled_retry(
        &self,
        event: &ScheduledEvent,
        invocation: &Invocation,
        retry_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.begin_repeatable_read().await?;
        Self::log_invocation(
            &mut tx,
            "hdb_scheduled_event_invocation_logs",
            "hdb_scheduled_events",
            invocation,
        )
        .await?;
        sqlx::query(
            "UPDATE hdb_scheduled_events SET next_retry_at = $2, locked = FALSE WHERE id = $1",
        )
        .bind(&event.id.0)
        .bind(retry_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| HooklineError::Other(anyhow!("failed to set scheduled retry: {e}")))?;
        Self::commit(tx).await
    }

    async fn mark_scheduled_dead(&self, id: &EventId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE hdb_scheduled_events SET dead = TRUE, locked = FALSE WHERE id = $1",
        )
        .bind(&id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| HooklineError::Other(anyhow!("failed to mark scheduled event dead: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(HooklineError::EventNotFound(id.clone()));
        }
        Ok(())
    }

    async fn cancel_scheduled_event(&self, id: &EventId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE hdb_scheduled_events SET cancelled = TRUE \
             WHERE id = $1 \
                 AND locked = FALSE \
                 AND delivered = FALSE \
                 AND error = FALSE \
                 AND dead = FALSE \
                 AND cancelled = FALSE",
        )
        .bind(&id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| HooklineError::Other(anyhow!("failed to cancel scheduled event: {e}")))?;
        if result.rows_affected() > 0 {
            return Ok(());
        }

        let exists = sqlx::query("SELECT 1 FROM hdb_scheduled_events WHERE id = $1")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| HooklineError::Other(anyhow!("failed to look up scheduled event: {e}")))?;
        match exists {
            Some(_) => Err(HooklineError::NotCancellable(id.clone())),
            None => Err(HooklineError::EventNotFound(id.clone())),
        }
    }

    async fn insert_scheduled_events(&self, events: &[NewScheduledEvent]) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| HooklineError::Other(anyhow!("failed to begin transaction: {e}")))?;

        let mut inserted = 0;
        for event in events {
            let result = sqlx::query(
                "INSERT INTO hdb_scheduled_events (id, name, scheduled_time, additional_payload) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (name, scheduled_time) DO NOTHING",
            )
            .bind(&event.id.0)
            .bind(&event.name)
            .bind(event.scheduled_time)
            .bind(&event.additional_payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                HooklineError::Other(anyhow!("failed to insert scheduled event: {e}"))
            })?;
            inserted += result.rows_affected();
        }

        Self::commit(tx).await?;
        Ok(inserted)
    }

    async fn unlock_all_scheduled_events(&self) -> Result<u64> {
        let result =
            sqlx::query("UPDATE hdb_scheduled_events SET locked = FALSE WHERE locked = TRUE")
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    HooklineError::Other(anyhow!("failed to unlock scheduled events: {e}"))
                })?;
        Ok(result.rows_affected())
    }

    async fn trigger_stats_below(&self, horizon: i64) -> Result<Vec<TriggerStats>> {
        let rows = sqlx::query(
            "SELECT name, upcoming_events_count, max_scheduled_time \
             FROM hdb_scheduled_events_stats \
             WHERE upcoming_events_count < $1",
        )
        .bind(horizon)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| HooklineError::Other(anyhow!("failed to read trigger stats: {e}")))?;

        rows.iter()
            .map(|row| {
                let map = |e: sqlx::Error| {
                    HooklineError::Other(anyhow!("failed to decode stats row: {e}"))
                };
                Ok(TriggerStats {
                    name: row.try_get("name").map_err(map)?,
                    upcoming_events_count: row.try_get("upcoming_events_count").map_err(map)?,
                    max_scheduled_time: row.try_get("max_scheduled_time").map_err(map)?,
                })
            })
            .collect()
    }
}

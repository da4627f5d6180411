//! SQLite-backed stream transport.
//!
//! Entries live in the `stream_entries` table of the main database. A claim
//! atomically assigns `consumer` and `delivered_at`; ack deletes the row;
//! idle reclamation re-assigns rows whose delivery is older than the
//! threshold. SQLite serializes writers, which is what makes the claim
//! atomic under concurrent consumers.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{StreamEntry, StreamTransport};
use crate::core::errors::StreamError;
use crate::core::event::Event;
use crate::store::sqlite::fmt_ts;

/// Durable stream over the shared SQLite database.
pub struct SqliteStream {
    pool: SqlitePool,
    publish_wakeup: Arc<Notify>,
}

#[derive(sqlx::FromRow)]
struct ClaimedRow {
    id: i64,
    payload: String,
}

impl SqliteStream {
    /// Wrap the shared pool. The `stream_entries` table is created by the
    /// store's migrations.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            publish_wakeup: Arc::new(Notify::new()),
        }
    }

    async fn try_claim(&self, consumer: &str, count: usize) -> Result<Vec<StreamEntry>, StreamError> {
        let rows: Vec<ClaimedRow> = sqlx::query_as(
            r"
            UPDATE stream_entries SET
                consumer = ?,
                delivered_at = ?,
                delivery_count = delivery_count + 1
            WHERE id IN (
                SELECT id FROM stream_entries
                WHERE consumer IS NULL
                ORDER BY id ASC
                LIMIT ?
            )
            RETURNING id, payload
            ",
        )
        .bind(consumer)
        .bind(fmt_ts(Utc::now()))
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| StreamEntry::new(row.id.to_string(), row.payload))
            .collect())
    }
}

impl std::fmt::Debug for SqliteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStream").finish_non_exhaustive()
    }
}

#[async_trait]
impl StreamTransport for SqliteStream {
    async fn publish(&self, event: &Event) -> Result<String, StreamError> {
        let payload = serde_json::to_string(event).map_err(|source| StreamError::Payload {
            stream_id: event.id.clone(),
            source,
        })?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO stream_entries (payload, published_at) VALUES (?, ?) RETURNING id",
        )
        .bind(&payload)
        .bind(fmt_ts(Utc::now()))
        .fetch_one(&self.pool)
        .await?;

        self.publish_wakeup.notify_waiters();
        Ok(id.to_string())
    }

    async fn publish_batch(&self, events: &[Event]) -> Vec<Result<String, StreamError>> {
        let mut results = Vec::with_capacity(events.len());
        for event in events {
            results.push(self.publish(event).await);
        }
        results
    }

    async fn read_group(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let deadline = Instant::now() + block;
        loop {
            let entries = self.try_claim(consumer, count).await?;
            if !entries.is_empty() || Instant::now() >= deadline {
                return Ok(entries);
            }

            // Wait for a publish or the rest of the block interval, whichever
            // comes first, then re-check.
            tokio::select! {
                () = self.publish_wakeup.notified() => {}
                () = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    async fn ack(&self, stream_id: &str) -> Result<(), StreamError> {
        let Ok(id) = stream_id.parse::<i64>() else {
            tracing::warn!(stream_id, "Ignoring ack for malformed stream id");
            return Ok(());
        };
        sqlx::query("DELETE FROM stream_entries WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn claim_idle(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let idle_ms = i64::try_from(min_idle.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now() - chrono::Duration::milliseconds(idle_ms);

        let rows: Vec<ClaimedRow> = sqlx::query_as(
            r"
            UPDATE stream_entries SET
                consumer = ?,
                delivered_at = ?,
                delivery_count = delivery_count + 1
            WHERE id IN (
                SELECT id FROM stream_entries
                WHERE consumer IS NOT NULL AND delivered_at < ?
                ORDER BY id ASC
                LIMIT ?
            )
            RETURNING id, payload
            ",
        )
        .bind(consumer)
        .bind(fmt_ts(Utc::now()))
        .bind(fmt_ts(cutoff))
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await?;

        if !rows.is_empty() {
            tracing::info!(
                consumer,
                claimed = rows.len(),
                "Reclaimed idle pending entries"
            );
        }

        Ok(rows
            .into_iter()
            .map(|row| StreamEntry::new(row.id.to_string(), row.payload))
            .collect())
    }

    async fn ping(&self) -> Result<(), StreamError> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    async fn pending_count(&self) -> Result<u64, StreamError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM stream_entries WHERE consumer IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

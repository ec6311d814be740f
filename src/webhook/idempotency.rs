//! Processed-event records keyed by `(provider, dedup key)`

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, warn};

use super::WebhookError;

/// Store deciding whether an event was already processed.
///
/// `insert_if_absent` must be atomic: of two concurrent calls with the same
/// key exactly one returns `true`.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Record the event; `false` when it was already recorded.
    async fn insert_if_absent(&self, provider: &str, event_id: &str) -> Result<bool, WebhookError>;

    /// Forget the event so a redelivery is processed again.
    async fn release(&self, provider: &str, event_id: &str);

    /// Drop records older than the retention window; returns how many.
    async fn purge_expired(&self) -> Result<u64, WebhookError>;
}

fn retention_delta(retention: Duration) -> chrono::Duration {
    chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

/// Records kept in memory for `retention`, then treated as absent.
#[derive(Debug)]
pub struct InMemoryIdempotencyStore {
    records: DashMap<(String, String), DateTime<Utc>>,
    retention: chrono::Duration,
}

impl InMemoryIdempotencyStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            records: DashMap::new(),
            retention: retention_delta(retention),
        }
    }

    fn is_expired(&self, processed_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - processed_at >= self.retention
    }

    pub(crate) fn insert_if_absent_at(&self, provider: &str, event_id: &str, now: DateTime<Utc>) -> bool {
        match self
            .records
            .entry((provider.to_string(), event_id.to_string()))
        {
            Entry::Occupied(mut existing) => {
                if self.is_expired(*existing.get(), now) {
                    existing.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    /// When the event was processed, if still retained.
    pub fn processed_at(&self, provider: &str, event_id: &str) -> Option<DateTime<Utc>> {
        let processed = *self
            .records
            .get(&(provider.to_string(), event_id.to_string()))?;
        (!self.is_expired(processed, Utc::now())).then_some(processed)
    }

    pub fn len(&self) -> usize {
        self.records
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.records
            .is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn insert_if_absent(&self, provider: &str, event_id: &str) -> Result<bool, WebhookError> {
        Ok(self.insert_if_absent_at(provider, event_id, Utc::now()))
    }

    async fn release(&self, provider: &str, event_id: &str) {
        self.records
            .remove(&(provider.to_string(), event_id.to_string()));
    }

    async fn purge_expired(&self) -> Result<u64, WebhookError> {
        let now = Utc::now();
        let before = self
            .records
            .len();
        self.records
            .retain(|_, processed| !self.is_expired(*processed, now));
        Ok(before.saturating_sub(
            self.records
                .len(),
        ) as u64)
    }
}

fn store_error(err: sqlx::Error) -> WebhookError {
    WebhookError::Store {
        reason: err.to_string(),
    }
}

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS webhook_events (
    provider TEXT NOT NULL,
    event_key TEXT NOT NULL,
    processed_at INTEGER NOT NULL,
    PRIMARY KEY (provider, event_key)
)";

/// Records in a SQLite file, so deduplication survives restarts.
///
/// Timestamps are stored as Unix milliseconds. The insert is a single
/// upsert statement, which keeps it atomic across pooled connections.
#[derive(Debug, Clone)]
pub struct SqliteIdempotencyStore {
    pool: SqlitePool,
    retention: chrono::Duration,
}

impl SqliteIdempotencyStore {
    /// Open (creating if missing) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>, retention: Duration) -> Result<Self, WebhookError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(store_error)?;
        sqlx::query(CREATE_TABLE)
            .execute(&pool)
            .await
            .map_err(store_error)?;
        debug!("[WEBHOOK] Dedup store opened at {}", path.as_ref().display());
        Ok(Self {
            pool,
            retention: retention_delta(retention),
        })
    }

    fn cutoff_ms(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp_millis()
            .saturating_sub(
                self.retention
                    .num_milliseconds(),
            )
    }

    pub(crate) async fn insert_if_absent_at(
        &self,
        provider: &str,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, WebhookError> {
        let result = sqlx::query(
            "INSERT INTO webhook_events (provider, event_key, processed_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (provider, event_key) DO UPDATE SET processed_at = excluded.processed_at
             WHERE webhook_events.processed_at <= ?4",
        )
        .bind(provider)
        .bind(event_id)
        .bind(now.timestamp_millis())
        .bind(self.cutoff_ms(now))
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(result.rows_affected() > 0)
    }

    /// When the event was processed, if still retained.
    pub async fn processed_at(&self, provider: &str, event_id: &str) -> Result<Option<DateTime<Utc>>, WebhookError> {
        let row = sqlx::query(
            "SELECT processed_at FROM webhook_events
             WHERE provider = ?1 AND event_key = ?2 AND processed_at > ?3",
        )
        .bind(provider)
        .bind(event_id)
        .bind(self.cutoff_ms(Utc::now()))
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let millis: i64 = row
            .try_get(0)
            .map_err(store_error)?;
        Ok(Utc
            .timestamp_millis_opt(millis)
            .single())
    }

    /// Records on disk, expired or not.
    pub async fn len(&self) -> Result<u64, WebhookError> {
        let row = sqlx::query("SELECT COUNT(*) FROM webhook_events")
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;
        let count: i64 = row
            .try_get(0)
            .map_err(store_error)?;
        Ok(count.max(0) as u64)
    }

    pub async fn close(&self) {
        self.pool
            .close()
            .await;
    }
}

#[async_trait]
impl IdempotencyStore for SqliteIdempotencyStore {
    async fn insert_if_absent(&self, provider: &str, event_id: &str) -> Result<bool, WebhookError> {
        self.insert_if_absent_at(provider, event_id, Utc::now())
            .await
    }

    async fn release(&self, provider: &str, event_id: &str) {
        let result = sqlx::query("DELETE FROM webhook_events WHERE provider = ?1 AND event_key = ?2")
            .bind(provider)
            .bind(event_id)
            .execute(&self.pool)
            .await;
        if let Err(e) = result {
            warn!("[WEBHOOK] Failed to release {} event {}: {}", provider, event_id, e);
        }
    }

    async fn purge_expired(&self) -> Result<u64, WebhookError> {
        let result = sqlx::query("DELETE FROM webhook_events WHERE processed_at <= ?1")
            .bind(self.cutoff_ms(Utc::now()))
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(result.rows_affected())
    }
}

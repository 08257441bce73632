//! Outbox Table Writer and Outbox Sender (spec §4.4, §4.5).
//!
//! The writer persists a transaction's staged events into `txo_outbox` in the
//! same store transaction as the user's state mutations. The sender is a
//! standalone background loop: fetch candidates (non-locking read), lease
//! them (read-write, re-applying the no-lease predicate), publish in
//! parallel, and reconcile (delete on success, clear lease on failure).
//!
//! Reference DDL (spec §6) computes `shard` as a store-generated column from
//! `FARM_FINGERPRINT`; Postgres has no equivalent built-in, so `shard` is
//! computed client-side in [`fingerprint`] from a SHA-256 digest of the id
//! and written at insert time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use txo_domain::{CoreError, StagedEvent};
use txo_ports::EventPublisher;
use uuid::Uuid;

use crate::translate::translate_sqlx_error;

/// Deterministic hash of an outbox row id, used both for shard assignment
/// and as a stand-in for the store's `FARM_FINGERPRINT`.
pub fn fingerprint(id: &Uuid) -> i64 {
    let digest = Sha256::digest(id.as_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[0..8]);
    i64::from_be_bytes(buf)
}

/// `|fingerprint(id)| mod shard_count`, matching the reference DDL's
/// generated column expression.
pub fn shard_for(id: &Uuid, shard_count: u32) -> u32 {
    if shard_count == 0 {
        return 0;
    }
    (fingerprint(id).unsigned_abs() % shard_count as u64) as u32
}

/// Writes staged events into the outbox table inside an already-open
/// transaction.
pub struct OutboxWriter {
    shard_count: Option<u32>,
}

impl OutboxWriter {
    pub fn new(shard_count: Option<u32>) -> Self {
        Self { shard_count }
    }

    #[instrument(skip(self, tx, events), fields(event_count = events.len()))]
    pub async fn write_batch(
        &self,
        tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
        events: &[StagedEvent],
    ) -> Result<(), CoreError> {
        for event in events {
            let shard = self.shard_count.map(|n| shard_for(&event.id, n) as i32);
            let attributes = Value::Object(event.attributes.clone());
            sqlx::query(
                "INSERT INTO txo_outbox \
                 (id, topic, data, attributes, ordering_key, lease_expiration, published_at, shard) \
                 VALUES ($1, $2, $3, $4, $5, NULL, NULL, $6)",
            )
            .bind(event.id)
            .bind(&event.topic)
            .bind(&event.data)
            .bind(&attributes)
            .bind(&event.ordering_key)
            .bind(shard)
            .execute(&mut **tx)
            .await
            .map_err(|e| translate_sqlx_error(e, "OutboxEvent"))?;
        }
        debug!(count = events.len(), "staged events written to outbox");
        Ok(())
    }
}

/// Sharding knobs (spec §4.5's `sharding` parameter).
#[derive(Debug, Clone)]
pub struct ShardingConfig {
    pub column: String,
    pub count: u32,
    pub round_robin: bool,
}

/// Sender tunables, all overridable; defaults match spec §4.5.
#[derive(Debug, Clone)]
pub struct OutboxSenderConfig {
    pub batch_size: usize,
    pub polling_interval: Duration,
    pub lease_duration: Duration,
    pub max_publish_concurrency: usize,
    pub sharding: Option<ShardingConfig>,
    pub index: Option<String>,
    pub id_column: String,
    pub lease_expiration_column: String,
}

impl Default for OutboxSenderConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            polling_interval: Duration::from_millis(1000),
            lease_duration: Duration::from_millis(60_000),
            max_publish_concurrency: 50,
            sharding: None,
            index: None,
            id_column: "id".to_string(),
            lease_expiration_column: "lease_expiration".to_string(),
        }
    }
}

/// A handle callers (typically a transaction runner) use to wake the
/// sender after committing new outbox rows. Cloning is cheap; duplicate
/// wakeups coalesce because the underlying channel has capacity 1.
#[derive(Clone)]
pub struct OutboxWakeHandle {
    tx: mpsc::Sender<()>,
}

impl OutboxWakeHandle {
    /// Non-blocking; a pending wakeup already in the channel means this is
    /// a no-op, which is the intended coalescing behavior.
    pub fn wake(&self) {
        let _ = self.tx.try_send(());
    }
}

struct LeasedRow {
    id: Uuid,
    topic: String,
    data: Vec<u8>,
    attributes: Map<String, Value>,
    ordering_key: Option<String>,
}

/// Background worker implementing the fetch → lease → publish → reconcile
/// state machine.
pub struct OutboxSender<P: EventPublisher> {
    pool: PgPool,
    config: OutboxSenderConfig,
    publisher: Arc<P>,
    wake_rx: mpsc::Receiver<()>,
    shard_cycle: Vec<u32>,
    cycle_pos: usize,
}

impl<P: EventPublisher + 'static> OutboxSender<P> {
    /// Builds a sender and the handle used to wake it. The shard cycle (if
    /// sharding with round-robin is configured) is a permutation drawn once
    /// here, at construction time.
    pub fn new(pool: PgPool, config: OutboxSenderConfig, publisher: Arc<P>) -> (Self, OutboxWakeHandle) {
        let (tx, rx) = mpsc::channel(1);
        let shard_cycle = match &config.sharding {
            Some(s) if s.round_robin && s.count > 0 => {
                let mut cycle: Vec<u32> = (0..s.count).collect();
                cycle.shuffle(&mut rand::thread_rng());
                cycle
            }
            _ => Vec::new(),
        };
        let sender = Self {
            pool,
            config,
            publisher,
            wake_rx: rx,
            shard_cycle,
            cycle_pos: 0,
        };
        (sender, OutboxWakeHandle { tx })
    }

    /// Runs the poll/wake loop until `shutdown` resolves.
    pub async fn run(mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.polling_interval);
        info!("outbox sender started");
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.wake_rx.recv() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("outbox sender shutting down");
                        return;
                    }
                }
            }
            if let Err(e) = self.tick().await {
                warn!(error = %e, "outbox sender tick failed");
            }
        }
    }

    /// One fetch → lease → publish → reconcile cycle.
    #[instrument(skip(self))]
    async fn tick(&mut self) -> Result<(), CoreError> {
        let candidate_ids = self.fetch().await?;
        if candidate_ids.is_empty() {
            return Ok(());
        }

        let leased = self.lease(&candidate_ids).await?;
        if leased.is_empty() {
            debug!("lease acquired zero rows, another sender won the race");
            return Ok(());
        }

        let (succeeded, failed) = self.publish_all(leased).await;
        self.reconcile(&succeeded, &failed).await?;
        debug!(succeeded = succeeded.len(), failed = failed.len(), "tick complete");
        Ok(())
    }

    fn next_shard(&mut self) -> Option<u32> {
        let sharding = self.config.sharding.as_ref()?;
        if sharding.round_robin {
            if self.shard_cycle.is_empty() {
                return None;
            }
            let shard = self.shard_cycle[self.cycle_pos % self.shard_cycle.len()];
            self.cycle_pos = self.cycle_pos.wrapping_add(1);
            Some(shard)
        } else {
            None
        }
    }

    async fn fetch(&mut self) -> Result<Vec<Uuid>, CoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| translate_sqlx_error(e, "OutboxEvent"))?;

        let id_column = &self.config.id_column;
        let lease_column = &self.config.lease_expiration_column;

        let rows = if let Some(sharding) = self.config.sharding.clone() {
            let shard_column = &sharding.column;
            if let Some(shard) = self.next_shard() {
                let sql = format!(
                    "SELECT {id_column} FROM txo_outbox \
                     WHERE {shard_column} = $1 AND ({lease_column} IS NULL OR {lease_column} < now()) \
                     LIMIT $2"
                );
                sqlx::query(&sql)
                    .bind(shard as i32)
                    .bind(self.config.batch_size as i64)
                    .fetch_all(&mut *tx)
                    .await
            } else {
                let sql = format!(
                    "SELECT {id_column} FROM txo_outbox \
                     WHERE {shard_column} BETWEEN 0 AND $1 AND ({lease_column} IS NULL OR {lease_column} < now()) \
                     LIMIT $2"
                );
                sqlx::query(&sql)
                    .bind(sharding.count as i32 - 1)
                    .bind(self.config.batch_size as i64)
                    .fetch_all(&mut *tx)
                    .await
            }
        } else {
            let sql = format!(
                "SELECT {id_column} FROM txo_outbox \
                 WHERE ({lease_column} IS NULL OR {lease_column} < now()) \
                 LIMIT $1"
            );
            sqlx::query(&sql)
                .bind(self.config.batch_size as i64)
                .fetch_all(&mut *tx)
                .await
        }
        .map_err(|e| translate_sqlx_error(e, "OutboxEvent"))?;

        tx.rollback().await.map_err(|e| translate_sqlx_error(e, "OutboxEvent"))?;

        Ok(rows.into_iter().map(|r| r.get::<Uuid, _>(id_column.as_str())).collect())
    }

    async fn lease(&self, ids: &[Uuid]) -> Result<Vec<LeasedRow>, CoreError> {
        let lease_until = Utc::now()
            + chrono::Duration::from_std(self.config.lease_duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let id_column = &self.config.id_column;
        let lease_column = &self.config.lease_expiration_column;
        let sql = format!(
            "UPDATE txo_outbox SET {lease_column} = $1 \
             WHERE {id_column} = ANY($2) AND ({lease_column} IS NULL OR {lease_column} < now()) \
             RETURNING {id_column}, topic, data, attributes, ordering_key"
        );

        let rows = sqlx::query(&sql)
            .bind(lease_until)
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| translate_sqlx_error(e, "OutboxEvent"))?;

        rows.into_iter()
            .map(|row| {
                let attributes: Value = row.try_get("attributes").unwrap_or(Value::Null);
                let attributes = match attributes {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                Ok(LeasedRow {
                    id: row
                        .try_get(id_column.as_str())
                        .map_err(|e| translate_sqlx_error(e, "OutboxEvent"))?,
                    topic: row.try_get("topic").map_err(|e| translate_sqlx_error(e, "OutboxEvent"))?,
                    data: row.try_get("data").map_err(|e| translate_sqlx_error(e, "OutboxEvent"))?,
                    attributes,
                    ordering_key: row
                        .try_get("ordering_key")
                        .map_err(|e| translate_sqlx_error(e, "OutboxEvent"))?,
                })
            })
            .collect()
    }

    async fn publish_all(&self, leased: Vec<LeasedRow>) -> (Vec<Uuid>, Vec<Uuid>) {
        use futures::stream::{self, StreamExt};

        let publisher = Arc::clone(&self.publisher);
        let concurrency = self.config.max_publish_concurrency.max(1);

        let results = stream::iter(leased)
            .map(|row| {
                let publisher = Arc::clone(&publisher);
                async move {
                    let id = row.id;
                    let result = publisher
                        .publish(
                            &row.topic,
                            &row.id.to_string(),
                            &row.data,
                            &row.attributes,
                            row.ordering_key.as_deref(),
                        )
                        .await;
                    (id, result)
                }
            })
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for (id, result) in results {
            match result {
                Ok(()) => succeeded.push(id),
                Err(e) => {
                    warn!(event_id = %id, error = %e, "publish failed, lease will be cleared");
                    failed.push(id);
                }
            }
        }
        (succeeded, failed)
    }

    async fn reconcile(&self, succeeded: &[Uuid], failed: &[Uuid]) -> Result<(), CoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| translate_sqlx_error(e, "OutboxEvent"))?;

        let id_column = &self.config.id_column;
        let lease_column = &self.config.lease_expiration_column;

        if !succeeded.is_empty() {
            let sql = format!("DELETE FROM txo_outbox WHERE {id_column} = ANY($1)");
            sqlx::query(&sql)
                .bind(succeeded)
                .execute(&mut *tx)
                .await
                .map_err(|e| translate_sqlx_error(e, "OutboxEvent"))?;
        }
        if !failed.is_empty() {
            let sql = format!("UPDATE txo_outbox SET {lease_column} = NULL WHERE {id_column} = ANY($1)");
            sqlx::query(&sql)
                .bind(failed)
                .execute(&mut *tx)
                .await
                .map_err(|e| translate_sqlx_error(e, "OutboxEvent"))?;
        }

        tx.commit().await.map_err(|e| translate_sqlx_error(e, "OutboxEvent"))?;
        Ok(())
    }
}

/// `publishedAt`-and-long-lease variant mentioned in spec §4.5: instead of
/// deleting a successfully published row, stamp it with `published_at` and
/// push the lease a year out so it falls outside the scan window until a
/// retention policy removes it. Not wired into [`OutboxSender::reconcile`]
/// by default (spec §9 open question: this repo takes the delete-on-publish
/// variant), kept here for backings whose row-deletion policy prefers it.
pub async fn mark_published_with_long_lease(
    pool: &PgPool,
    succeeded: &[Uuid],
) -> Result<(), CoreError> {
    if succeeded.is_empty() {
        return Ok(());
    }
    let far_future: DateTime<Utc> = Utc::now() + chrono::Duration::days(365);
    sqlx::query("UPDATE txo_outbox SET published_at = now(), lease_expiration = $1 WHERE id = ANY($2)")
        .bind(far_future)
        .bind(succeeded)
        .execute(pool)
        .await
        .map_err(|e| translate_sqlx_error(e, "OutboxEvent"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_for_is_deterministic_and_in_range() {
        let id = Uuid::new_v4();
        let a = shard_for(&id, 4);
        let b = shard_for(&id, 4);
        assert_eq!(a, b);
        assert!(a < 4);
    }

    #[test]
    fn shard_for_zero_shards_is_zero() {
        let id = Uuid::new_v4();
        assert_eq!(shard_for(&id, 0), 0);
    }

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = OutboxSenderConfig::default();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.polling_interval, Duration::from_millis(1000));
        assert_eq!(config.lease_duration, Duration::from_millis(60_000));
        assert_eq!(config.id_column, "id");
        assert_eq!(config.lease_expiration_column, "lease_expiration");
    }

    #[test]
    fn config_accepts_column_name_overrides() {
        let config = OutboxSenderConfig {
            id_column: "event_id".to_string(),
            lease_expiration_column: "lease_until".to_string(),
            sharding: Some(ShardingConfig {
                column: "bucket".to_string(),
                count: 8,
                round_robin: false,
            }),
            ..OutboxSenderConfig::default()
        };
        assert_eq!(config.id_column, "event_id");
        assert_eq!(config.lease_expiration_column, "lease_until");
        assert_eq!(config.sharding.as_ref().unwrap().column, "bucket");
    }
}

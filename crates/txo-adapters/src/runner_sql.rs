//! SQL transaction runner (spec §4.6): composes the SQL state transaction,
//! the staged-event log, and the outbox writer; retries on a stale-read
//! signal from the user body; wakes the sender after a successful commit.

use std::future::Future;
use std::time::Duration;

use sqlx::PgPool;
use tracing::{debug, instrument, warn};
use txo_domain::{CoreError, StagedEventLog};

use crate::outbox::{OutboxWakeHandle, OutboxWriter};
use crate::sql::SqlStateTransaction;
use crate::translate::translate_sqlx_error;

#[derive(Debug, Clone)]
pub struct SqlTransactionRunnerConfig {
    /// Upper bound on automatic retries following a
    /// `TransactionOldTimestampError`.
    pub max_old_timestamp_retries: u32,
    /// Ceiling on the suggested retry delay (spec §7/§8): a delay above
    /// this surfaces the error immediately instead of retrying.
    pub max_old_timestamp_delay: Duration,
}

impl Default for SqlTransactionRunnerConfig {
    fn default() -> Self {
        Self {
            max_old_timestamp_retries: 5,
            max_old_timestamp_delay: Duration::from_secs(5),
        }
    }
}

/// Composes a SQL state transaction, a staged-event log, and the outbox
/// writer into the `run({...}, fn)` primitive application code calls.
pub struct SqlTransactionRunner {
    pool: PgPool,
    outbox_writer: OutboxWriter,
    wake: OutboxWakeHandle,
    config: SqlTransactionRunnerConfig,
}

impl SqlTransactionRunner {
    pub fn new(
        pool: PgPool,
        outbox_writer: OutboxWriter,
        wake: OutboxWakeHandle,
        config: SqlTransactionRunnerConfig,
    ) -> Self {
        Self {
            pool,
            outbox_writer,
            wake,
            config,
        }
    }

    /// Runs `body` in a fresh read-write transaction, retrying on
    /// `TransactionOldTimestampError` per the configured policy.
    #[instrument(skip(self, body))]
    pub async fn run<T, F, Fut>(&self, body: F) -> Result<T, CoreError>
    where
        F: Fn(&mut SqlStateTransaction<'_>, &mut StagedEventLog) -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let mut tx: sqlx::Transaction<'static, sqlx::Postgres> = self
                .pool
                .begin()
                .await
                .map_err(|e| translate_sqlx_error(e, "transaction"))?;
            let mut events = StagedEventLog::new();

            let outcome = {
                let mut stxn = SqlStateTransaction::new(&mut tx, false);
                body(&mut stxn, &mut events).await
            };

            match outcome {
                Ok(value) => {
                    if !events.is_empty() {
                        self.outbox_writer.write_batch(&mut tx, events.events()).await?;
                    }
                    tx.commit().await.map_err(|e| translate_sqlx_error(e, "transaction"))?;
                    self.wake.wake();
                    return Ok(value);
                }
                Err(CoreError::TransactionOldTimestampError {
                    as_of_unix_ms,
                    suggested_delay_ms,
                }) => {
                    let _ = tx.rollback().await;
                    let delay = Duration::from_millis(suggested_delay_ms);
                    if delay > self.config.max_old_timestamp_delay
                        || attempt >= self.config.max_old_timestamp_retries
                    {
                        return Err(CoreError::TransactionOldTimestampError {
                            as_of_unix_ms,
                            suggested_delay_ms,
                        });
                    }
                    debug!(attempt, delay_ms = suggested_delay_ms, "retrying after stale read");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                Err(e) => {
                    let _ = tx.rollback().await;
                    return Err(e);
                }
            }
        }
    }

    /// Runs `body` in a read-only snapshot; staging an event fails with
    /// `InvalidOperation`.
    #[instrument(skip(self, body))]
    pub async fn run_read_only<T, F, Fut>(&self, body: F) -> Result<T, CoreError>
    where
        F: FnOnce(&mut SqlStateTransaction<'_>, &mut StagedEventLog) -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| translate_sqlx_error(e, "transaction"))?;
        let mut events = StagedEventLog::read_only();
        let mut stxn = SqlStateTransaction::new(&mut tx, true);
        let outcome = body(&mut stxn, &mut events).await;
        match outcome {
            Ok(value) => {
                tx.rollback().await.map_err(|e| translate_sqlx_error(e, "transaction"))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "failed to roll back read-only transaction");
                }
                Err(e)
            }
        }
    }
}

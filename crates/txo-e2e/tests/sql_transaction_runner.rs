//! Exercises [`SqlTransactionRunner`] against a real Postgres instance:
//! insert-and-stage commits atomically with the outbox write, and a failed
//! body leaves neither the row nor an outbox entry behind.
//!
//! Gated on `TXO_TEST_DATABASE_URL` since it needs a running database with
//! the `txo_entity_items` and `txo_outbox` tables migrated.

use txo_adapters::{OutboxWriter, SqlTransactionRunner, SqlTransactionRunnerConfig};
use txo_domain::{CoreError, StageOptions};
use txo_e2e::{new_item, should_run_pg_tests, Item};

#[tokio::test]
async fn insert_and_stage_commit_together() {
    if !should_run_pg_tests() {
        return;
    }
    let pool = txo_e2e::pg_pool().await;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS txo_entity_items (pk TEXT PRIMARY KEY, data JSONB NOT NULL, soft_delete_at TIMESTAMPTZ)",
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS txo_outbox (id UUID PRIMARY KEY, topic TEXT NOT NULL, data BYTEA NOT NULL, attributes JSONB NOT NULL, ordering_key TEXT, lease_expiration TIMESTAMPTZ, published_at TIMESTAMPTZ, shard INT NOT NULL DEFAULT 0)",
    )
    .execute(&pool)
    .await
    .unwrap();

    let (_sender, wake) = txo_adapters::OutboxSender::new(
        pool.clone(),
        txo_adapters::OutboxSenderConfig::default(),
        std::sync::Arc::new(txo_e2e::RecordingPublisher::new()),
    );
    let runner = SqlTransactionRunner::new(
        pool.clone(),
        OutboxWriter::new(None),
        wake,
        SqlTransactionRunnerConfig::default(),
    );

    let item = new_item("sql-item-1", "first");
    runner
        .run(|tx, events| {
            let item = item.clone();
            async move {
                tx.insert(&item).await?;
                events.stage("item.created", &item, StageOptions::default())?;
                Ok::<(), CoreError>(())
            }
        })
        .await
        .unwrap();

    let fetched: Item = runner
        .run_read_only(|tx, _events| {
            async move { tx.find_or_fail(&["sql-item-1".to_string()], Default::default()).await }
        })
        .await
        .unwrap();
    assert_eq!(fetched.label, "first");

    let outbox_count: i64 = sqlx::query_scalar("SELECT count(*) FROM txo_outbox WHERE topic = 'item.created'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(outbox_count, 1);
}

#[tokio::test]
async fn failed_body_rolls_back_state_and_outbox_together() {
    if !should_run_pg_tests() {
        return;
    }
    let pool = txo_e2e::pg_pool().await;
    let (_sender, wake) = txo_adapters::OutboxSender::new(
        pool.clone(),
        txo_adapters::OutboxSenderConfig::default(),
        std::sync::Arc::new(txo_e2e::RecordingPublisher::new()),
    );
    let runner = SqlTransactionRunner::new(
        pool.clone(),
        OutboxWriter::new(None),
        wake,
        SqlTransactionRunnerConfig::default(),
    );

    let item = new_item("sql-item-2", "second");
    let result = runner
        .run(|tx, events| {
            let item = item.clone();
            async move {
                tx.insert(&item).await?;
                events.stage("item.created", &item, StageOptions::default())?;
                Err(CoreError::InvalidArgument {
                    reason: "simulated failure after staging".to_string(),
                })
            }
        })
        .await;
    assert!(result.is_err());

    let fetched = runner
        .run_read_only(|tx, _events| async move { tx.get::<Item>(&["sql-item-2".to_string()], Default::default()).await })
        .await
        .unwrap();
    assert!(fetched.is_none());

    let outbox_count: i64 = sqlx::query_scalar("SELECT count(*) FROM txo_outbox WHERE topic = 'item.created'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(outbox_count, 0);
}

//! Exercises the outbox sender's fetch/lease/publish/reconcile cycle
//! against a real Postgres instance, gated on `TXO_TEST_DATABASE_URL`.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use txo_adapters::{OutboxSender, OutboxSenderConfig};
use txo_e2e::{should_run_pg_tests, RecordingPublisher};

#[tokio::test]
async fn staged_rows_are_published_and_deleted() {
    if !should_run_pg_tests() {
        return;
    }
    let pool = txo_e2e::pg_pool().await;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS txo_outbox (id UUID PRIMARY KEY, topic TEXT NOT NULL, data BYTEA NOT NULL, attributes JSONB NOT NULL, ordering_key TEXT, lease_expiration TIMESTAMPTZ, published_at TIMESTAMPTZ, shard INT NOT NULL DEFAULT 0)",
    )
    .execute(&pool)
    .await
    .unwrap();

    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO txo_outbox (id, topic, data, attributes, shard) VALUES ($1, 'sender.test', $2, '{}', 0)",
    )
    .bind(id)
    .bind(b"payload".to_vec())
    .execute(&pool)
    .await
    .unwrap();

    let publisher = Arc::new(RecordingPublisher::new());
    let config = OutboxSenderConfig {
        polling_interval: Duration::from_millis(50),
        ..OutboxSenderConfig::default()
    };
    let (sender, _wake) = OutboxSender::new(pool.clone(), config, publisher.clone());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(sender.run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;

    let messages = publisher.messages();
    assert!(messages.iter().any(|m| m.id == id.to_string()));

    let remaining: i64 = sqlx::query_scalar("SELECT count(*) FROM txo_outbox WHERE id = $1")
        .bind(id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(remaining, 0, "published row should be deleted on success");
}

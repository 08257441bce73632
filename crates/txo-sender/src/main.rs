//! Outbox Sender service.
//!
//! Standalone service that scans the outbox table, leases rows, publishes
//! them to the broker, and reconciles leases on success or failure. The
//! transaction runner is a library concern used in-process by application
//! code; this binary is the background half of the pattern and is safe to
//! run as any number of replicas against the same database.

mod config;

use axum::{routing::get, Json, Router};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use txo_adapters::config::ConnectionConfig;
use txo_adapters::nats::{NatsEventPublisher, NatsPublisherConfig};
use txo_adapters::{OutboxSender, OutboxWakeHandle};

use config::SenderEnvConfig;

/// Liveness/readiness state shared with the health endpoint.
struct SenderState {
    connection: ConnectionConfig,
    running: AtomicBool,
}

impl SenderState {
    fn is_ready(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_config = SenderEnvConfig::from_env();
    let connection = env_config.connection.clone();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&connection.log_level)),
        )
        .json()
        .init();

    info!(
        batch_size = env_config.outbox.batch_size,
        polling_interval_ms = env_config.outbox.polling_interval_ms,
        lease_duration_ms = env_config.outbox.lease_duration_ms,
        "starting outbox sender"
    );

    info!(database_url = %redact(&connection.database_url), "connecting to database");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&connection.database_url)
        .await?;
    info!("database connection established");

    let nats_config = NatsPublisherConfig::from_env();
    let publisher = match NatsEventPublisher::connect(nats_config).await {
        Ok(publisher) => {
            info!(url = %connection.nats_url, "NATS connection established");
            Arc::new(publisher)
        }
        Err(e) => {
            error!(error = %e, "failed to connect to NATS, cannot publish outbox events");
            return Err(Box::new(e));
        }
    };

    let state = Arc::new(SenderState {
        connection: connection.clone(),
        running: AtomicBool::new(true),
    });

    let health_state = state.clone();
    let health_addr = SocketAddr::from(([0, 0, 0, 0], connection.health_port));
    let health_app = Router::new()
        .route("/ready", get(move || ready_handler(health_state.clone())))
        .route("/health", get(|| async { Json(json!({"status": "ok"})) }));

    let health_server = tokio::spawn(async move {
        info!(addr = %health_addr, "health server listening");
        if let Err(e) = axum::serve(
            tokio::net::TcpListener::bind(health_addr).await.unwrap(),
            health_app,
        )
        .await
        {
            error!(error = %e, "health server error");
        }
    });

    let (sender, _wake): (OutboxSender<NatsEventPublisher>, OutboxWakeHandle) =
        OutboxSender::new(pool, env_config.outbox.clone().into_sender_config(), publisher);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sender_loop = tokio::spawn(sender.run(shutdown_rx));

    shutdown_signal().await;
    info!("shutdown signal received, stopping outbox sender");
    state.running.store(false, Ordering::Relaxed);
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), sender_loop).await;
    health_server.abort();

    info!("outbox sender shutdown complete");
    Ok(())
}

async fn ready_handler(state: Arc<SenderState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": if state.is_ready() { "ready" } else { "not_ready" },
        "database_url": redact(&state.connection.database_url),
    }))
}

fn redact(url: &str) -> String {
    match url.split('@').last() {
        Some(suffix) if suffix != url => format!("****@{suffix}"),
        _ => url.to_string(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

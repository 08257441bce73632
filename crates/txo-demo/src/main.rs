//! Demo HTTP service.
//!
//! Exercises the SQL transaction runner end-to-end: creating an order
//! inserts it and stages an `order.created` event in the same database
//! transaction, and the outbox sender (run separately, see `txo-sender`)
//! drains that event to the broker.

mod model;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use txo_adapters::config::ConnectionConfig;
use txo_adapters::nats::{NatsEventPublisher, NatsPublisherConfig};
use txo_adapters::{OutboxSender, OutboxWriter, SqlTransactionRunner, SqlTransactionRunnerConfig};
use txo_domain::{CoreError, StageOptions};
use uuid::Uuid;

use model::{CreateOrderRequest, Order, OrderResponse};

struct AppState {
    runner: SqlTransactionRunner,
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<Json<OrderResponse>, (StatusCode, String)> {
    let result = state
        .runner
        .run(|tx, events| {
            let req = &req;
            async move {
                let now = Utc::now();
                let order = Order {
                    id: Uuid::new_v4().to_string(),
                    customer_id: req.customer_id.clone(),
                    total_cents: req.total_cents,
                    created_at: now,
                    updated_at: now,
                    deleted_at: None,
                };
                tx.insert(&order).await?;
                events.stage(
                    "order.created",
                    &json!({"order_id": order.id, "customer_id": order.customer_id}),
                    StageOptions::default(),
                )?;
                Ok::<Order, CoreError>(order)
            }
        })
        .await;

    match result {
        Ok(order) => Ok(Json(order.into())),
        Err(e) => Err(map_error(e)),
    }
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<OrderResponse>, (StatusCode, String)> {
    let result = state
        .runner
        .run_read_only(|tx, _events| {
            let id = id.clone();
            async move { tx.find_or_fail::<Order>(&[id], Default::default()).await }
        })
        .await;

    match result {
        Ok(order) => Ok(Json(order.into())),
        Err(e) => Err(map_error(e)),
    }
}

fn map_error(err: CoreError) -> (StatusCode, String) {
    let status = match &err {
        CoreError::EntityNotFound { .. } => StatusCode::NOT_FOUND,
        CoreError::EntityAlreadyExists { .. } => StatusCode::CONFLICT,
        CoreError::InvalidArgument { .. }
        | CoreError::InvalidQuery { .. }
        | CoreError::InvalidOperation { .. }
        | CoreError::EntityMissingPrimaryKey { .. }
        | CoreError::InvalidEntityDefinition { .. } => StatusCode::BAD_REQUEST,
        CoreError::TransactionOldTimestampError { .. } => StatusCode::CONFLICT,
        CoreError::TemporaryBackendError { .. } => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::TransactionFinished => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/orders", post(create_order))
        .route("/api/v1/orders/:id", get(get_order))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "txo_demo=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let connection = ConnectionConfig::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&connection.database_url)
        .await?;

    let publisher = Arc::new(NatsEventPublisher::connect(NatsPublisherConfig::from_env()).await?);
    let (sender, wake) = OutboxSender::new(
        pool.clone(),
        txo_adapters::config::OutboxEnvConfig::from_env().into_sender_config(),
        publisher,
    );

    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(sender.run(shutdown_rx));

    let runner = SqlTransactionRunner::new(
        pool,
        OutboxWriter::new(None),
        wake,
        SqlTransactionRunnerConfig::default(),
    );
    let state = Arc::new(AppState { runner });

    let app = create_router(state);
    let addr = format!("0.0.0.0:{}", connection.health_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(%addr, "demo service listening");
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_handler_reports_ok() {
        let Json(body) = health().await;
        assert_eq!(body["status"], "ok");
    }

    #[test]
    fn entity_not_found_maps_to_404() {
        let (status, _) = map_error(CoreError::EntityNotFound {
            entity_type: "orders".to_string(),
            key: "missing".to_string(),
        });
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

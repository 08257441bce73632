//! Shared fixtures for the integration tests in `tests/`: a recording
//! [`EventPublisher`] double and a small versioned entity used across
//! the SQL, document, and sender suites.

use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use txo_domain::{Entity, VersionedEntity};
use txo_ports::{EventPublisher, PublishError};

#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub id: String,
    pub payload: Vec<u8>,
    pub attributes: Map<String, Value>,
    pub ordering_key: Option<String>,
}

/// An [`EventPublisher`] that records everything published instead of
/// sending it anywhere, so tests can assert on publish order and content.
#[derive(Debug, Clone, Default)]
pub struct RecordingPublisher {
    messages: Arc<Mutex<Vec<PublishedMessage>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.messages.lock().unwrap().clone()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(
        &self,
        topic: &str,
        id: &str,
        payload: &[u8],
        attributes: &Map<String, Value>,
        ordering_key: Option<&str>,
    ) -> impl Future<Output = Result<(), PublishError>> + Send {
        let messages = self.messages.clone();
        let topic = topic.to_string();
        let id = id.to_string();
        let payload = payload.to_vec();
        let attributes = attributes.clone();
        let ordering_key = ordering_key.map(str::to_string);
        async move {
            messages.lock().unwrap().push(PublishedMessage {
                topic,
                id,
                payload,
                attributes,
                ordering_key,
            });
            Ok(())
        }
    }

    fn flush(&self) -> impl Future<Output = Result<(), PublishError>> + Send {
        async { Ok(()) }
    }
}

/// A small versioned entity used by every test suite in this crate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub id: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Entity for Item {
    const TABLE: &'static str = "items";
    const PRIMARY_KEY_COLUMNS: &'static [&'static str] = &["id"];
    const SOFT_DELETE_COLUMN: Option<&'static str> = Some("deleted_at");

    fn primary_key(&self) -> Vec<String> {
        vec![self.id.clone()]
    }

    fn is_soft_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

impl VersionedEntity for Item {
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }
}

pub fn new_item(id: &str, label: &str) -> Item {
    let now = Utc::now();
    Item {
        id: id.to_string(),
        label: label.to_string(),
        created_at: now,
        updated_at: now,
        deleted_at: None,
    }
}

/// Gate for the tests that need a real Postgres instance: set
/// `TXO_TEST_DATABASE_URL` to run them, otherwise they no-op.
pub fn should_run_pg_tests() -> bool {
    std::env::var("TXO_TEST_DATABASE_URL").is_ok()
}

pub async fn pg_pool() -> sqlx::PgPool {
    let url = std::env::var("TXO_TEST_DATABASE_URL")
        .expect("TXO_TEST_DATABASE_URL must be set when should_run_pg_tests() is true");
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("failed to connect to test database")
}

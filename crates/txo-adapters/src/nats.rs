//! Reference [`EventPublisher`] over NATS JetStream.
//!
//! The broker client is out of scope for the core per the spec this crate
//! implements; this adapter exists so the sender and the document runner
//! have something concrete to publish against in tests and demos. Dedup is
//! delegated to JetStream's `Nats-Msg-Id` header, matching the sender's
//! at-least-once + broker-side-dedup contract.

use async_nats::jetstream::{self, stream::Config as StreamConfig, Context as JetStreamContext};
use async_nats::{Client as NatsClient, HeaderMap};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument};
use txo_ports::{EventPublisher, PublishError};

const MSG_ID_HEADER: &str = "Nats-Msg-Id";
const ORDERING_KEY_HEADER: &str = "Txo-Ordering-Key";

#[derive(Debug, Clone)]
pub struct NatsPublisherConfig {
    pub url: String,
    pub stream_name: String,
    pub subjects: Vec<String>,
    pub message_ttl_secs: i64,
    pub duplicate_window_secs: i64,
}

impl Default for NatsPublisherConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream_name: "txo-outbox".to_string(),
            subjects: vec!["txo.>".to_string()],
            message_ttl_secs: 7 * 24 * 60 * 60,
            duplicate_window_secs: 120,
        }
    }
}

impl NatsPublisherConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("NATS_URL").unwrap_or(defaults.url),
            stream_name: std::env::var("NATS_STREAM_NAME").unwrap_or(defaults.stream_name),
            subjects: std::env::var("NATS_SUBJECTS")
                .ok()
                .map(|s| s.split(',').map(|p| p.trim().to_string()).collect())
                .unwrap_or(defaults.subjects),
            message_ttl_secs: std::env::var("NATS_MESSAGE_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.message_ttl_secs),
            duplicate_window_secs: std::env::var("NATS_DUPLICATE_WINDOW_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.duplicate_window_secs),
        }
    }
}

pub struct NatsEventPublisher {
    jetstream: JetStreamContext,
    config: NatsPublisherConfig,
}

impl NatsEventPublisher {
    pub async fn connect(config: NatsPublisherConfig) -> Result<Self, PublishError> {
        info!(url = %config.url, "connecting to NATS");
        let client: NatsClient =
            async_nats::connect(&config.url)
                .await
                .map_err(|e| PublishError::ConnectionError {
                    message: format!("failed to connect to NATS: {e}"),
                })?;
        let jetstream = jetstream::new(client);

        let stream_config = StreamConfig {
            name: config.stream_name.clone(),
            subjects: config.subjects.clone(),
            max_age: std::time::Duration::from_secs(config.message_ttl_secs as u64),
            duplicate_window: std::time::Duration::from_secs(config.duplicate_window_secs as u64),
            ..Default::default()
        };
        match jetstream.get_stream(&config.stream_name).await {
            Ok(_) => debug!(stream = %config.stream_name, "outbox stream already exists"),
            Err(_) => {
                jetstream
                    .create_stream(stream_config)
                    .await
                    .map_err(|e| PublishError::ConnectionError {
                        message: format!("failed to create stream: {e}"),
                    })?;
            }
        }

        Ok(Self { jetstream, config })
    }
}

impl EventPublisher for NatsEventPublisher {
    #[instrument(skip(self, payload, attributes), fields(topic = %topic, id = %id))]
    async fn publish(
        &self,
        topic: &str,
        id: &str,
        payload: &[u8],
        attributes: &Map<String, Value>,
        ordering_key: Option<&str>,
    ) -> Result<(), PublishError> {
        let mut headers = HeaderMap::new();
        headers.insert(MSG_ID_HEADER, id.to_string());
        if let Some(key) = ordering_key {
            headers.insert(ORDERING_KEY_HEADER, key.to_string());
        }
        for (name, value) in attributes {
            if let Value::String(s) = value {
                headers.insert(name.as_str(), s.clone());
            }
        }

        let ack = self
            .jetstream
            .publish_with_headers(topic.to_string(), headers, payload.to_vec().into())
            .await
            .map_err(|e| PublishError::Rejected {
                message: format!("publish to {topic} failed: {e}"),
            })?;

        ack.await.map_err(|e| PublishError::Rejected {
            message: format!("no ack for {topic}: {e}"),
        })?;

        debug!(topic = %topic, id = %id, "published");
        Ok(())
    }

    async fn flush(&self) -> Result<(), PublishError> {
        // JetStream acks are awaited per-publish above; nothing buffered here.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_env_falls_back_to_defaults() {
        let config = NatsPublisherConfig::default();
        assert_eq!(config.url, "nats://localhost:4222");
        assert_eq!(config.stream_name, "txo-outbox");
    }
}

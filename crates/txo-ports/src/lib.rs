//! Port traits adapters implement.
//!
//! The core (transaction runners, outbox sender) depends only on these
//! traits, never on a concrete broker or clock. Per the spec this crate
//! implements, the storage clients themselves are out of scope: adapters
//! decide what "SQL" and "document" backings mean.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde_json::Map;
use serde_json::Value;

/// Publishes a staged event to a message broker. Implementations are
/// expected to be at-least-once and to let the broker deduplicate on
/// `id` — the sender never assumes publish is itself idempotent.
pub trait EventPublisher: Send + Sync {
    /// Publishes a single message. `id` doubles as the broker-side
    /// dedup/idempotency key.
    fn publish(
        &self,
        topic: &str,
        id: &str,
        payload: &[u8],
        attributes: &Map<String, Value>,
        ordering_key: Option<&str>,
    ) -> impl Future<Output = Result<(), PublishError>> + Send;

    /// Waits for any buffered publishes to be acknowledged by the broker.
    /// Implementations with no internal buffering may no-op.
    fn flush(&self) -> impl Future<Output = Result<(), PublishError>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("publisher connection error: {message}")]
    ConnectionError { message: String },

    #[error("publish rejected: {message}")]
    Rejected { message: String },
}

/// Clock port for deterministic time handling, e.g. in tests that assert
/// on outbox lease expirations without sleeping real time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// System clock implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_reports_recent_time() {
        let before = Utc::now();
        let now = SystemClock.now();
        assert!(now >= before);
    }
}

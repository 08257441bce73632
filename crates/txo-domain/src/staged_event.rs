//! The staged-event log (spec §4.1): an insertion-ordered, transaction-scoped
//! sequence of events queued for publication. Events are serialized at
//! stage-time, not at publish-time, so a later failure to publish never
//! depends on the staging state still being reachable.

use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::errors::CoreError;

/// A single staged event, fully serialized and ready to hand to an outbox
/// writer. `ordering_key` groups events that must publish in relative order
/// (shares a broker partition/ordering key); events with no ordering key
/// carry no such guarantee.
#[derive(Debug, Clone)]
pub struct StagedEvent {
    pub id: Uuid,
    pub topic: String,
    pub data: Vec<u8>,
    pub attributes: Map<String, Value>,
    pub ordering_key: Option<String>,
}

/// Options accepted by [`StagedEventLog::stage`].
#[derive(Debug, Clone, Default)]
pub struct StageOptions {
    pub attributes: Map<String, Value>,
    pub ordering_key: Option<String>,
}

/// Accumulates staged events for the lifetime of a single transaction body.
/// The runner drains [`StagedEventLog::events`] into the outbox writer at
/// commit time and never inspects it before the body returns successfully.
#[derive(Debug, Default)]
pub struct StagedEventLog {
    events: Vec<StagedEvent>,
    read_only: bool,
}

/// Pulls `eventId`/`eventName`/`producedAt` out of a payload's `id`/`name`/
/// `producedAt` fields, when the payload serializes as an object and carries
/// them. Fields absent from the payload are simply absent from the result.
fn default_attributes(payload: &Value) -> Map<String, Value> {
    let mut attributes = Map::new();
    let Value::Object(fields) = payload else {
        return attributes;
    };
    if let Some(id) = fields.get("id") {
        attributes.insert("eventId".to_string(), id.clone());
    }
    if let Some(name) = fields.get("name") {
        attributes.insert("eventName".to_string(), name.clone());
    }
    if let Some(produced_at) = fields.get("producedAt") {
        attributes.insert("producedAt".to_string(), produced_at.clone());
    }
    attributes
}

impl StagedEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A log bound to a read-only transaction attempt: `stage` always fails
    /// with [`CoreError::InvalidOperation`], since read-only transactions
    /// run in a store snapshot and cannot publish.
    pub fn read_only() -> Self {
        Self {
            events: Vec::new(),
            read_only: true,
        }
    }

    /// Serializes `payload` as JSON and appends it to the log. Returns the
    /// generated event id, which callers may use as an idempotency key on
    /// the broker side.
    ///
    /// Default attributes are computed from the payload's `id`, `name`, and
    /// `producedAt` fields when present (`eventId`, `eventName`,
    /// `producedAt` respectively), then `opts.attributes` is overlaid on
    /// top — caller-supplied attributes always win over the computed
    /// defaults.
    pub fn stage<T: Serialize>(
        &mut self,
        topic: impl Into<String>,
        payload: &T,
        opts: StageOptions,
    ) -> Result<Uuid, CoreError> {
        if self.read_only {
            return Err(CoreError::InvalidOperation {
                reason: "cannot stage an event inside a read-only transaction".to_string(),
            });
        }
        let topic = topic.into();
        if topic.is_empty() {
            return Err(CoreError::InvalidArgument {
                reason: "staged event topic must not be empty".to_string(),
            });
        }
        let payload_value = serde_json::to_value(payload).map_err(|e| CoreError::InvalidArgument {
            reason: format!("failed to serialize staged event payload: {e}"),
        })?;
        let mut attributes = default_attributes(&payload_value);
        attributes.extend(opts.attributes);
        let data = serde_json::to_vec(&payload_value).map_err(|e| CoreError::InvalidArgument {
            reason: format!("failed to serialize staged event payload: {e}"),
        })?;
        let id = Uuid::new_v4();
        self.events.push(StagedEvent {
            id,
            topic,
            data,
            attributes,
            ordering_key: opts.ordering_key,
        });
        Ok(id)
    }

    /// The events staged so far, in staging order.
    pub fn events(&self) -> &[StagedEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Clears the log. Used by the transaction runner when retrying a body
    /// after a [`CoreError::TransactionOldTimestampError`] — events staged
    /// during the failed attempt must not leak into the retry.
    pub fn reset(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Payload {
        value: u32,
    }

    #[test]
    fn stage_appends_in_order_and_assigns_unique_ids() {
        let mut log = StagedEventLog::new();
        let id1 = log
            .stage("widgets.created", &Payload { value: 1 }, StageOptions::default())
            .unwrap();
        let id2 = log
            .stage("widgets.created", &Payload { value: 2 }, StageOptions::default())
            .unwrap();
        assert_ne!(id1, id2);
        assert_eq!(log.events().len(), 2);
        assert_eq!(log.events()[0].id, id1);
        assert_eq!(log.events()[1].id, id2);
    }

    #[test]
    fn stage_rejects_empty_topic() {
        let mut log = StagedEventLog::new();
        let result = log.stage("", &Payload { value: 1 }, StageOptions::default());
        assert!(result.is_err());
    }

    #[test]
    fn reset_clears_events_for_retry() {
        let mut log = StagedEventLog::new();
        log.stage("widgets.created", &Payload { value: 1 }, StageOptions::default())
            .unwrap();
        assert!(!log.is_empty());
        log.reset();
        assert!(log.is_empty());
    }

    #[test]
    fn read_only_log_rejects_staging() {
        let mut log = StagedEventLog::read_only();
        let result = log.stage("widgets.created", &Payload { value: 1 }, StageOptions::default());
        assert!(matches!(result, Err(CoreError::InvalidOperation { .. })));
    }

    #[derive(Serialize)]
    struct NamedPayload {
        id: String,
        name: String,
        #[serde(rename = "producedAt")]
        produced_at: String,
    }

    #[test]
    fn stage_computes_default_attributes_from_payload_fields() {
        let mut log = StagedEventLog::new();
        log.stage(
            "widgets.created",
            &NamedPayload {
                id: "e1".to_string(),
                name: "n".to_string(),
                produced_at: "2024-01-01T00:00:00Z".to_string(),
            },
            StageOptions::default(),
        )
        .unwrap();
        let attributes = &log.events()[0].attributes;
        assert_eq!(attributes.get("eventId"), Some(&Value::String("e1".to_string())));
        assert_eq!(attributes.get("eventName"), Some(&Value::String("n".to_string())));
        assert_eq!(
            attributes.get("producedAt"),
            Some(&Value::String("2024-01-01T00:00:00Z".to_string()))
        );
    }

    #[test]
    fn stage_caller_supplied_attributes_win_over_defaults() {
        let mut log = StagedEventLog::new();
        let mut attributes = Map::new();
        attributes.insert("eventName".into(), Value::String("override".into()));
        log.stage(
            "widgets.created",
            &NamedPayload {
                id: "e1".to_string(),
                name: "n".to_string(),
                produced_at: "2024-01-01T00:00:00Z".to_string(),
            },
            StageOptions {
                attributes,
                ordering_key: None,
            },
        )
        .unwrap();
        let attrs = &log.events()[0].attributes;
        assert_eq!(attrs.get("eventId"), Some(&Value::String("e1".to_string())));
        assert_eq!(attrs.get("eventName"), Some(&Value::String("override".to_string())));
    }

    #[test]
    fn stage_omits_default_attributes_absent_from_payload() {
        let mut log = StagedEventLog::new();
        log.stage("widgets.created", &Payload { value: 1 }, StageOptions::default())
            .unwrap();
        let attributes = &log.events()[0].attributes;
        assert!(attributes.is_empty());
    }

    #[test]
    fn stage_carries_attributes_and_ordering_key() {
        let mut log = StagedEventLog::new();
        let mut attributes = Map::new();
        attributes.insert("source".into(), Value::String("widgets".into()));
        log.stage(
            "widgets.created",
            &Payload { value: 1 },
            StageOptions {
                attributes: attributes.clone(),
                ordering_key: Some("widget-1".to_string()),
            },
        )
        .unwrap();
        let event = &log.events()[0];
        assert_eq!(event.attributes, attributes);
        assert_eq!(event.ordering_key.as_deref(), Some("widget-1"));
    }
}

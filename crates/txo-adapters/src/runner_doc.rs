//! Document transaction runner (spec §4.7): composes the document state
//! transaction with a staged-event log; publishes best-effort after commit
//! since the document backing has no outbox table.

use std::future::Future;
use std::sync::Arc;

use tracing::{error, instrument};
use txo_domain::{CoreError, StagedEventLog};
use txo_ports::EventPublisher;

use crate::doc::{DocumentStateTransaction, DocumentStore};

pub struct DocumentTransactionRunner<P: EventPublisher> {
    store: DocumentStore,
    publisher: Arc<P>,
}

impl<P: EventPublisher> DocumentTransactionRunner<P> {
    pub fn new(store: DocumentStore, publisher: Arc<P>) -> Self {
        Self { store, publisher }
    }

    /// Runs `body`, commits the document transaction on success, then
    /// publishes every staged event *in order*, best-effort: a publish
    /// failure after commit is logged and dropped (spec §9 open question —
    /// no in-process retry beyond this call).
    #[instrument(skip(self, body))]
    pub async fn run<T, F, Fut>(&self, body: F) -> Result<T, CoreError>
    where
        F: FnOnce(&mut DocumentStateTransaction, &mut StagedEventLog) -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let mut stxn = self.store.begin(false);
        let mut events = StagedEventLog::new();

        let outcome = body(&mut stxn, &mut events).await;
        let value = match outcome {
            Ok(value) => value,
            Err(e) => {
                // stxn is dropped without commit: buffered intents are discarded.
                return Err(e);
            }
        };

        stxn.commit()?;

        for event in events.events() {
            if let Err(e) = self
                .publisher
                .publish(
                    &event.topic,
                    &event.id.to_string(),
                    &event.data,
                    &event.attributes,
                    event.ordering_key.as_deref(),
                )
                .await
            {
                error!(
                    event_id = %event.id,
                    topic = %event.topic,
                    error = %e,
                    "post-commit publish failed, state already committed"
                );
            }
        }

        Ok(value)
    }

    /// Runs `body` against a read-only document snapshot; staging an event
    /// fails with `InvalidOperation`.
    #[instrument(skip(self, body))]
    pub async fn run_read_only<T, F, Fut>(&self, body: F) -> Result<T, CoreError>
    where
        F: FnOnce(&mut DocumentStateTransaction, &mut StagedEventLog) -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let mut stxn = self.store.begin(true);
        let mut events = StagedEventLog::read_only();
        body(&mut stxn, &mut events).await
    }
}

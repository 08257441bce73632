//! Storage and broker adapters: the SQL and document state transactions,
//! the outbox writer/sender, the two transaction runners, and a reference
//! NATS event publisher.

pub mod config;
pub mod doc;
pub mod nats;
pub mod outbox;
pub mod runner_doc;
pub mod runner_sql;
pub mod sql;
mod translate;

pub use doc::{DocumentStateTransaction, DocumentStore};
pub use outbox::{OutboxSender, OutboxSenderConfig, OutboxWakeHandle, OutboxWriter, ShardingConfig};
pub use runner_doc::DocumentTransactionRunner;
pub use runner_sql::{SqlTransactionRunner, SqlTransactionRunnerConfig};
pub use sql::{DeleteOptions, GetOptions, SqlStateTransaction};

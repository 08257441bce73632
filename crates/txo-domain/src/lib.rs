//! Pure domain types shared by every transactional-outbox adapter: the
//! closed error taxonomy, column conversions, entity contracts, and the
//! staged-event log. Nothing in this crate talks to a store or a broker.

pub mod columns;
pub mod entity;
pub mod errors;
pub mod staged_event;

pub use columns::{BigIntColumn, IntColumn, KeyPart, PreciseTimestamp, Timestamp};
pub use entity::{Entity, VersionedEntity};
pub use errors::CoreError;
pub use staged_event::{StageOptions, StagedEvent, StagedEventLog};

//! Entity and versioned-entity contracts (spec §3).
//!
//! The source language attaches table/column metadata via reflective
//! decorators; per the redesign notes (spec §9) we replace that with an
//! explicit registration trait implemented once per entity type. There is
//! no runtime reflection anywhere on the hot path: `Entity::TABLE`,
//! `Entity::PRIMARY_KEY_COLUMNS`, and `Entity::SOFT_DELETE_COLUMN` are
//! `const`s resolved at compile time.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::errors::CoreError;

/// A typed record with a declared composite primary key and an optional
/// soft-delete marker column.
///
/// Implementors are stored as a single JSON document per row/document; the
/// primary key is additionally projected out into its own physical column(s)
/// so the backing store can index and enforce uniqueness on it directly.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Physical table (SQL) or collection (document) name.
    const TABLE: &'static str;

    /// Declared primary-key field names, in the type's declared order.
    /// Exactly one of these pairs with [`Entity::primary_key`] at any call
    /// site; both must agree on arity and order.
    const PRIMARY_KEY_COLUMNS: &'static [&'static str];

    /// Name of the column carrying the soft-delete marker, if any. The
    /// invariant "exactly one column may carry softDelete" is encoded by
    /// this being a single optional name rather than a set.
    const SOFT_DELETE_COLUMN: Option<&'static str> = None;

    /// Declared secondary indexes, as `(index_name, key_columns)` pairs.
    /// A `get` with `index` set looks the row up by these columns instead
    /// of by the primary key.
    const INDEXES: &'static [(&'static str, &'static [&'static str])] = &[];

    /// The ordered tuple of this instance's primary-key field values,
    /// stringified per spec §4.2's primary-key composition rule. Must have
    /// the same length as [`Entity::PRIMARY_KEY_COLUMNS`].
    fn primary_key(&self) -> Vec<String>;

    /// `true` if this instance is currently soft-deleted. Entities with no
    /// soft-delete column are never soft-deleted.
    fn is_soft_deleted(&self) -> bool {
        false
    }
}

/// An [`Entity`] that additionally carries `createdAt`/`updatedAt`/
/// `deletedAt` and enforces the versioned-entity invariants (spec §3):
/// `updatedAt >= createdAt`; soft-delete sets `deletedAt := updatedAt`;
/// once soft-deleted, the next mutation either restores (`deletedAt :=
/// null`) or keeps it deleted with a strictly greater `updatedAt`.
pub trait VersionedEntity: Entity {
    fn created_at(&self) -> DateTime<Utc>;
    fn updated_at(&self) -> DateTime<Utc>;
    fn deleted_at(&self) -> Option<DateTime<Utc>>;

    /// Validates the versioned-entity invariants of `self` as the proposed
    /// next state following `previous` (or as a fresh insert when
    /// `previous` is `None`).
    fn validate_transition(&self, previous: Option<&Self>) -> Result<(), CoreError> {
        if self.updated_at() < self.created_at() {
            return Err(CoreError::InvalidArgument {
                reason: format!(
                    "{}: updatedAt ({}) must be >= createdAt ({})",
                    Self::TABLE,
                    self.updated_at(),
                    self.created_at()
                ),
            });
        }
        if let Some(deleted_at) = self.deleted_at() {
            if deleted_at != self.updated_at() {
                return Err(CoreError::InvalidArgument {
                    reason: format!(
                        "{}: deletedAt must equal updatedAt of the causing mutation",
                        Self::TABLE
                    ),
                });
            }
        }
        if let Some(prev) = previous {
            if prev.deleted_at().is_some() && self.deleted_at().is_some() {
                // Still soft-deleted: updatedAt must have strictly advanced.
                if self.updated_at() <= prev.updated_at() {
                    return Err(CoreError::InvalidArgument {
                        reason: format!(
                            "{}: a soft-deleted entity kept deleted must advance updatedAt",
                            Self::TABLE
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Widget {
        id: String,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        deleted_at: Option<DateTime<Utc>>,
    }

    impl Entity for Widget {
        const TABLE: &'static str = "Widget";
        const PRIMARY_KEY_COLUMNS: &'static [&'static str] = &["id"];
        fn primary_key(&self) -> Vec<String> {
            vec![self.id.clone()]
        }
        fn is_soft_deleted(&self) -> bool {
            self.deleted_at.is_some()
        }
    }

    impl VersionedEntity for Widget {
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

    fn widget(created: &str, updated: &str, deleted: Option<&str>) -> Widget {
        Widget {
            id: "w1".into(),
            created_at: created.parse().unwrap(),
            updated_at: updated.parse().unwrap(),
            deleted_at: deleted.map(|d| d.parse().unwrap()),
        }
    }

    #[test]
    fn updated_before_created_is_rejected() {
        let w = widget(
            "2024-01-02T00:00:00Z",
            "2024-01-01T00:00:00Z",
            None,
        );
        assert!(w.validate_transition(None).is_err());
    }

    #[test]
    fn deleted_at_must_equal_updated_at() {
        let w = widget(
            "2024-01-01T00:00:00Z",
            "2024-01-02T00:00:00Z",
            Some("2024-01-01T00:00:00Z"),
        );
        assert!(w.validate_transition(None).is_err());
    }

    #[test]
    fn staying_deleted_requires_advancing_updated_at() {
        let prev = widget(
            "2024-01-01T00:00:00Z",
            "2024-01-02T00:00:00Z",
            Some("2024-01-02T00:00:00Z"),
        );
        let same = widget(
            "2024-01-01T00:00:00Z",
            "2024-01-02T00:00:00Z",
            Some("2024-01-02T00:00:00Z"),
        );
        assert!(same.validate_transition(Some(&prev)).is_err());

        let advanced = widget(
            "2024-01-01T00:00:00Z",
            "2024-01-03T00:00:00Z",
            Some("2024-01-03T00:00:00Z"),
        );
        assert!(advanced.validate_transition(Some(&prev)).is_ok());
    }

    #[test]
    fn restoring_from_soft_delete_is_allowed() {
        let prev = widget(
            "2024-01-01T00:00:00Z",
            "2024-01-02T00:00:00Z",
            Some("2024-01-02T00:00:00Z"),
        );
        let restored = widget("2024-01-01T00:00:00Z", "2024-01-03T00:00:00Z", None);
        assert!(restored.validate_transition(Some(&prev)).is_ok());
    }
}

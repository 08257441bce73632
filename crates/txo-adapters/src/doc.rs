//! Document state transaction (`stxn_doc`, spec §4.3) over `sled`.
//!
//! Each entity type gets two sled trees: the active collection (named after
//! `Entity::TABLE`) and, for types with a soft-delete column, a shadow
//! collection (`<table>$deleted`) carrying a TTL field. `sled`'s native
//! transactions are synchronous and span a statically-known tuple of trees,
//! while a runner's user body is async and may touch an arbitrary set of
//! entity types; this transaction buffers `set`/`delete` intents during the
//! body and applies all of them atomically, across every tree touched, in
//! one `sled` transaction at commit time.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use sled::transaction::{ConflictableTransactionError, TransactionalTree};
use sled::Transactional;
use txo_domain::{CoreError, Entity};

/// Default TTL field name written to shadow documents (spec §6).
pub const DEFAULT_TTL_FIELD: &str = "_expirationDate";

fn active_tree<E: Entity>() -> String {
    E::TABLE.to_string()
}

fn shadow_tree<E: Entity>() -> String {
    format!("{}$deleted", E::TABLE)
}

fn encode_key(parts: &[String]) -> Vec<u8> {
    txo_domain::columns::join_key_tuple(parts).into_bytes()
}

#[derive(Debug)]
struct DocStoreError(String);

impl fmt::Display for DocStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for DocStoreError {}

fn sled_err(e: sled::Error) -> CoreError {
    CoreError::temporary_with_source("document store error", DocStoreError(e.to_string()))
}

/// Owns the underlying `sled::Db` and hands out transactions.
#[derive(Clone)]
pub struct DocumentStore {
    db: sled::Db,
    ttl_field: String,
    expiration_delay: ChronoDuration,
}

impl DocumentStore {
    pub fn open(path: impl AsRef<Path>, expiration_delay: ChronoDuration) -> Result<Self, CoreError> {
        let db = sled::open(path).map_err(sled_err)?;
        Ok(Self {
            db,
            ttl_field: DEFAULT_TTL_FIELD.to_string(),
            expiration_delay,
        })
    }

    /// An in-memory store for tests; dropped with the process.
    pub fn temporary(expiration_delay: ChronoDuration) -> Result<Self, CoreError> {
        let db = sled::Config::new().temporary(true).open().map_err(sled_err)?;
        Ok(Self {
            db,
            ttl_field: DEFAULT_TTL_FIELD.to_string(),
            expiration_delay,
        })
    }

    pub fn begin(&self, read_only: bool) -> DocumentStateTransaction {
        DocumentStateTransaction {
            db: self.db.clone(),
            ttl_field: self.ttl_field.clone(),
            expiration_delay: self.expiration_delay,
            intents: Vec::new(),
            read_only,
        }
    }
}

#[derive(Debug, Clone)]
enum Intent {
    Put { tree: String, key: Vec<u8>, value: Vec<u8> },
    Delete { tree: String, key: Vec<u8> },
}

/// Typed document reads/writes for one runner attempt.
pub struct DocumentStateTransaction {
    db: sled::Db,
    ttl_field: String,
    expiration_delay: ChronoDuration,
    intents: Vec<Intent>,
    read_only: bool,
}

impl DocumentStateTransaction {
    fn guard_writable(&self) -> Result<(), CoreError> {
        if self.read_only {
            return Err(CoreError::InvalidOperation {
                reason: "state mutation is not permitted in a read-only transaction".to_string(),
            });
        }
        Ok(())
    }

    /// Reads the active collection first; falls back to the shadow
    /// collection (stripping the TTL field) when the type has a
    /// soft-delete column. Never returns a shadow copy when the active
    /// copy exists.
    pub fn get<E: Entity>(&self, key: &[String]) -> Result<Option<E>, CoreError> {
        let id = encode_key(key);
        let active = self.db.open_tree(active_tree::<E>()).map_err(sled_err)?;
        if let Some(bytes) = active.get(&id).map_err(sled_err)? {
            let entity: E = serde_json::from_slice(&bytes).map_err(|e| CoreError::InvalidEntityDefinition {
                reason: format!("{}: failed to hydrate document: {e}", E::TABLE),
            })?;
            return Ok(Some(entity));
        }

        if E::SOFT_DELETE_COLUMN.is_none() {
            return Ok(None);
        }

        let shadow = self.db.open_tree(shadow_tree::<E>()).map_err(sled_err)?;
        let Some(bytes) = shadow.get(&id).map_err(sled_err)? else {
            return Ok(None);
        };
        let mut value: Value = serde_json::from_slice(&bytes).map_err(|e| CoreError::InvalidEntityDefinition {
            reason: format!("{}: failed to hydrate shadow document: {e}", E::TABLE),
        })?;
        if let Value::Object(ref mut map) = value {
            map.remove(&self.ttl_field);
        }
        let entity: E = serde_json::from_value(value).map_err(|e| CoreError::InvalidEntityDefinition {
            reason: format!("{}: failed to hydrate shadow document: {e}", E::TABLE),
        })?;
        Ok(Some(entity))
    }

    /// Writes `entity`, routing it to the active or shadow collection
    /// depending on whether its soft-delete column is set, and buffering
    /// the matching delete of the other collection so at most one copy
    /// exists once this transaction commits.
    pub fn set<E: Entity>(&mut self, entity: &E) -> Result<(), CoreError> {
        self.guard_writable()?;
        let key = encode_key(&entity.primary_key());
        let data = serde_json::to_value(entity).map_err(|e| CoreError::InvalidArgument {
            reason: format!("{}: failed to serialize entity: {e}", E::TABLE),
        })?;
        let deleted_at = soft_delete_timestamp::<E>(&data)?;

        match deleted_at {
            Some(deleted_at) => {
                let expiration = deleted_at + self.expiration_delay;
                let mut augmented = data;
                if let Value::Object(ref mut map) = augmented {
                    map.insert(self.ttl_field.clone(), Value::String(expiration.to_rfc3339()));
                }
                let bytes = serde_json::to_vec(&augmented).map_err(|e| CoreError::InvalidArgument {
                    reason: format!("{}: failed to serialize shadow document: {e}", E::TABLE),
                })?;
                self.intents.push(Intent::Put {
                    tree: shadow_tree::<E>(),
                    key: key.clone(),
                    value: bytes,
                });
                self.intents.push(Intent::Delete {
                    tree: active_tree::<E>(),
                    key,
                });
            }
            None => {
                let bytes = serde_json::to_vec(&data).map_err(|e| CoreError::InvalidArgument {
                    reason: format!("{}: failed to serialize document: {e}", E::TABLE),
                })?;
                self.intents.push(Intent::Put {
                    tree: active_tree::<E>(),
                    key: key.clone(),
                    value: bytes,
                });
                self.intents.push(Intent::Delete {
                    tree: shadow_tree::<E>(),
                    key,
                });
            }
        }
        Ok(())
    }

    /// Deletes both the active and shadow copies. Idempotent.
    pub fn delete<E: Entity>(&mut self, key: &[String]) -> Result<(), CoreError> {
        self.guard_writable()?;
        let id = encode_key(key);
        self.intents.push(Intent::Delete {
            tree: active_tree::<E>(),
            key: id.clone(),
        });
        self.intents.push(Intent::Delete {
            tree: shadow_tree::<E>(),
            key: id,
        });
        Ok(())
    }

    pub fn reset(&mut self) {
        self.intents.clear();
    }

    /// Applies every buffered intent atomically, across however many trees
    /// were touched.
    pub fn commit(self) -> Result<(), CoreError> {
        if self.intents.is_empty() {
            return Ok(());
        }

        let mut tree_names: Vec<String> = self
            .intents
            .iter()
            .map(|intent| match intent {
                Intent::Put { tree, .. } | Intent::Delete { tree, .. } => tree.clone(),
            })
            .collect();
        tree_names.sort();
        tree_names.dedup();

        let trees: Vec<sled::Tree> = tree_names
            .iter()
            .map(|name| self.db.open_tree(name))
            .collect::<Result<_, _>>()
            .map_err(sled_err)?;

        let index_of: HashMap<&str, usize> = tree_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        trees
            .as_slice()
            .transaction(|txn_trees: &[TransactionalTree]| {
                for intent in &self.intents {
                    match intent {
                        Intent::Put { tree, key, value } => {
                            txn_trees[index_of[tree.as_str()]].insert(key.as_slice(), value.as_slice())?;
                        }
                        Intent::Delete { tree, key } => {
                            txn_trees[index_of[tree.as_str()]].remove(key.as_slice())?;
                        }
                    }
                }
                Ok::<(), ConflictableTransactionError<std::convert::Infallible>>(())
            })
            .map_err(|e| sled_err(sled::Error::Io(std::io::Error::other(e.to_string()))))?;

        Ok(())
    }
}

fn soft_delete_timestamp<E: Entity>(data: &Value) -> Result<Option<DateTime<Utc>>, CoreError> {
    let Some(column) = E::SOFT_DELETE_COLUMN else {
        return Ok(None);
    };
    match data.get(column) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| CoreError::InvalidEntityDefinition {
                reason: format!("{}: invalid soft-delete timestamp: {e}", E::TABLE),
            }),
        Some(other) => Err(CoreError::InvalidEntityDefinition {
            reason: format!(
                "{}: soft-delete column {column} must serialize as an RFC3339 string, got {other}",
                E::TABLE
            ),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Doc {
        id: String,
        deleted_at: Option<DateTime<Utc>>,
    }

    impl Entity for Doc {
        const TABLE: &'static str = "Doc";
        const PRIMARY_KEY_COLUMNS: &'static [&'static str] = &["id"];
        const SOFT_DELETE_COLUMN: Option<&'static str> = Some("deleted_at");
        fn primary_key(&self) -> Vec<String> {
            vec![self.id.clone()]
        }
        fn is_soft_deleted(&self) -> bool {
            self.deleted_at.is_some()
        }
    }

    #[test]
    fn set_and_get_round_trip_active_collection() {
        let store = DocumentStore::temporary(ChronoDuration::days(30)).unwrap();
        let mut tx = store.begin(false);
        let doc = Doc {
            id: "d1".to_string(),
            deleted_at: None,
        };
        tx.set(&doc).unwrap();
        tx.commit().unwrap();

        let tx2 = store.begin(false);
        let fetched: Option<Doc> = tx2.get(&["d1".to_string()]).unwrap();
        assert_eq!(fetched, Some(doc));
    }

    #[test]
    fn soft_delete_moves_document_to_shadow_collection() {
        let store = DocumentStore::temporary(ChronoDuration::days(30)).unwrap();
        let deleted_at = Utc::now();
        let mut tx = store.begin(false);
        let doc = Doc {
            id: "d2".to_string(),
            deleted_at: Some(deleted_at),
        };
        tx.set(&doc).unwrap();
        tx.commit().unwrap();

        let tx2 = store.begin(false);
        let fetched: Option<Doc> = tx2.get(&["d2".to_string()]).unwrap();
        assert_eq!(fetched, Some(doc));

        let active = store.db.open_tree(active_tree::<Doc>()).unwrap();
        assert!(active.get(b"d2").unwrap().is_none());
    }

    #[test]
    fn restoring_from_soft_delete_removes_shadow_copy() {
        let store = DocumentStore::temporary(ChronoDuration::days(30)).unwrap();
        let mut tx = store.begin(false);
        tx.set(&Doc {
            id: "d3".to_string(),
            deleted_at: Some(Utc::now()),
        })
        .unwrap();
        tx.commit().unwrap();

        let mut tx2 = store.begin(false);
        tx2.set(&Doc {
            id: "d3".to_string(),
            deleted_at: None,
        })
        .unwrap();
        tx2.commit().unwrap();

        let shadow = store.db.open_tree(shadow_tree::<Doc>()).unwrap();
        assert!(shadow.get(b"d3").unwrap().is_none());
        let active = store.db.open_tree(active_tree::<Doc>()).unwrap();
        assert!(active.get(b"d3").unwrap().is_some());
    }

    #[test]
    fn delete_is_idempotent() {
        let store = DocumentStore::temporary(ChronoDuration::days(30)).unwrap();
        let mut tx = store.begin(false);
        tx.delete::<Doc>(&["missing".to_string()]).unwrap();
        tx.commit().unwrap();
        let mut tx2 = store.begin(false);
        tx2.delete::<Doc>(&["missing".to_string()]).unwrap();
        tx2.commit().unwrap();
    }
}

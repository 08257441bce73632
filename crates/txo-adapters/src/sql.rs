//! SQL state transaction (`stxn_sql`, spec §4.2) over `sqlx::Postgres`.
//!
//! Every entity type gets one physical table, named `txo_entity_<Entity::TABLE>`,
//! with three columns: `pk` (the joined primary-key tuple), `data` (the full
//! entity as JSONB), and `soft_delete_at` (mirrored out of the entity's
//! declared soft-delete column so the store can filter without touching the
//! JSON payload). Tables are expected to already exist via migration;
//! schema migrations are out of scope here.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{postgres::Postgres, Row, Transaction};
use txo_domain::{CoreError, Entity};

use crate::translate::translate_sqlx_error;

/// Options accepted by [`SqlStateTransaction::get`] and
/// [`SqlStateTransaction::find_or_fail`].
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub include_soft_deletes: bool,
    /// Entity fields the caller actually wants back. When `None`, the full
    /// entity is read. When `Some`, must include the soft-delete column
    /// unless `include_soft_deletes` is set.
    pub columns: Option<Vec<String>>,
    /// Name of a declared [`Entity::INDEXES`] entry to look the row up by,
    /// instead of the primary key. `key` is then the index's key tuple.
    pub index: Option<String>,
}

/// Options accepted by [`SqlStateTransaction::delete`].
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    pub include_soft_deletes: bool,
}

/// Typed row reads/writes over a single SQL transaction. Borrowed for the
/// lifetime of one runner attempt; never outlives its transaction.
pub struct SqlStateTransaction<'a> {
    tx: &'a mut Transaction<'static, Postgres>,
    read_only: bool,
}

impl<'a> SqlStateTransaction<'a> {
    pub fn new(tx: &'a mut Transaction<'static, Postgres>, read_only: bool) -> Self {
        Self { tx, read_only }
    }

    fn guard_writable(&self) -> Result<(), CoreError> {
        if self.read_only {
            return Err(CoreError::InvalidOperation {
                reason: "state mutation is not permitted in a read-only transaction".to_string(),
            });
        }
        Ok(())
    }

    /// Reads one row, by primary key (`opts.index` unset) or by a declared
    /// secondary index (`opts.index` set, `key` then being that index's key
    /// tuple). An index read only carries the indexed columns and the
    /// primary key; when `opts.columns` is omitted (the caller wants the
    /// full entity) this re-reads the full row by primary key afterward.
    pub async fn get<E: Entity>(
        &mut self,
        key: &[String],
        opts: GetOptions,
    ) -> Result<Option<E>, CoreError> {
        validate_columns::<E>(&opts)?;

        match &opts.index {
            None => {
                let pk = primary_key_of::<E>(key)?;
                self.get_by_pk(&pk, opts.include_soft_deletes).await
            }
            Some(index_name) if opts.columns.is_some() => {
                self.get_by_index_row::<E>(index_name, key, opts.include_soft_deletes).await
            }
            Some(index_name) => {
                match self.lookup_pk_by_index::<E>(index_name, key).await? {
                    Some(pk) => self.get_by_pk(&pk, opts.include_soft_deletes).await,
                    None => Ok(None),
                }
            }
        }
    }

    async fn get_by_pk<E: Entity>(
        &mut self,
        pk: &str,
        include_soft_deletes: bool,
    ) -> Result<Option<E>, CoreError> {
        let table = table_name::<E>();
        let sql = format!("SELECT data, soft_delete_at FROM {table} WHERE pk = $1");
        let row = sqlx::query(&sql)
            .bind(pk)
            .fetch_optional(&mut **self.tx)
            .await
            .map_err(|e| translate_sqlx_error(e, E::TABLE))?;

        let Some(row) = row else { return Ok(None) };
        let soft_deleted: Option<DateTime<Utc>> = row.try_get("soft_delete_at").ok().flatten();
        if soft_deleted.is_some() && !include_soft_deletes {
            return Ok(None);
        }
        hydrate_row::<E>(&row).map(Some)
    }

    /// Looks a row's primary key up by a secondary index's key columns,
    /// without fetching the rest of the row.
    async fn lookup_pk_by_index<E: Entity>(
        &mut self,
        index_name: &str,
        key: &[String],
    ) -> Result<Option<String>, CoreError> {
        let table = table_name::<E>();
        let (predicate, columns) = index_predicate::<E>(index_name, key)?;
        let sql = format!("SELECT pk FROM {table} WHERE {predicate} LIMIT 1");
        let mut query = sqlx::query(&sql);
        for value in &columns {
            query = query.bind(value);
        }
        let row = query
            .fetch_optional(&mut **self.tx)
            .await
            .map_err(|e| translate_sqlx_error(e, E::TABLE))?;
        Ok(match row {
            Some(row) => Some(row.try_get("pk").map_err(|e| translate_sqlx_error(e, E::TABLE))?),
            None => None,
        })
    }

    /// As [`Self::lookup_pk_by_index`], but fetches the full row in the same
    /// query (used when the caller named explicit `columns`, so the extra
    /// primary-key re-read in [`Self::get`] would be redundant).
    async fn get_by_index_row<E: Entity>(
        &mut self,
        index_name: &str,
        key: &[String],
        include_soft_deletes: bool,
    ) -> Result<Option<E>, CoreError> {
        let table = table_name::<E>();
        let (predicate, columns) = index_predicate::<E>(index_name, key)?;
        let sql = format!("SELECT data, soft_delete_at FROM {table} WHERE {predicate} LIMIT 1");
        let mut query = sqlx::query(&sql);
        for value in &columns {
            query = query.bind(value);
        }
        let row = query
            .fetch_optional(&mut **self.tx)
            .await
            .map_err(|e| translate_sqlx_error(e, E::TABLE))?;

        let Some(row) = row else { return Ok(None) };
        let soft_deleted: Option<DateTime<Utc>> = row.try_get("soft_delete_at").ok().flatten();
        if soft_deleted.is_some() && !include_soft_deletes {
            return Ok(None);
        }
        hydrate_row::<E>(&row).map(Some)
    }

    /// As [`SqlStateTransaction::get`], but fails with [`CoreError::EntityNotFound`]
    /// instead of returning `None`.
    pub async fn find_or_fail<E: Entity>(
        &mut self,
        key: &[String],
        opts: GetOptions,
    ) -> Result<E, CoreError> {
        self.get::<E>(key, opts).await?.ok_or_else(|| CoreError::EntityNotFound {
            entity_type: E::TABLE.to_string(),
            key: key.join(","),
        })
    }

    /// Inserts one row; fails with [`CoreError::EntityAlreadyExists`] if the
    /// primary key is already present, soft-deleted or not.
    pub async fn insert<E: Entity>(&mut self, entity: &E) -> Result<(), CoreError> {
        self.guard_writable()?;
        self.insert_row(entity).await
    }

    /// Inserts every entity, failing the whole batch if any key collides.
    pub async fn insert_many<E: Entity>(&mut self, entities: &[E]) -> Result<(), CoreError> {
        self.guard_writable()?;
        for entity in entities {
            self.insert_row(entity).await?;
        }
        Ok(())
    }

    async fn insert_row<E: Entity>(&mut self, entity: &E) -> Result<(), CoreError> {
        let pk = encoded_primary_key(entity)?;
        let table = table_name::<E>();
        let data = serde_json::to_value(entity).map_err(|e| CoreError::InvalidArgument {
            reason: format!("{}: failed to serialize entity: {e}", E::TABLE),
        })?;
        let soft_delete_at = soft_delete_timestamp::<E>(&data)?;
        let sql = format!(
            "INSERT INTO {table} (pk, data, soft_delete_at) VALUES ($1, $2, $3) \
             ON CONFLICT (pk) DO NOTHING RETURNING pk"
        );
        let inserted = sqlx::query(&sql)
            .bind(&pk)
            .bind(&data)
            .bind(soft_delete_at)
            .fetch_optional(&mut **self.tx)
            .await
            .map_err(|e| translate_sqlx_error(e, E::TABLE))?;
        if inserted.is_none() {
            return Err(CoreError::EntityAlreadyExists {
                entity_type: E::TABLE.to_string(),
                key: pk,
            });
        }
        Ok(())
    }

    /// Overwrites a row wholesale; nullable fields absent from `entity`
    /// become null, matching the store's replace semantics.
    pub async fn replace<E: Entity>(&mut self, entity: &E) -> Result<(), CoreError> {
        self.guard_writable()?;
        let pk = encoded_primary_key(entity)?;
        let table = table_name::<E>();
        let data = serde_json::to_value(entity).map_err(|e| CoreError::InvalidArgument {
            reason: format!("{}: failed to serialize entity: {e}", E::TABLE),
        })?;
        let soft_delete_at = soft_delete_timestamp::<E>(&data)?;
        let sql = format!(
            "INSERT INTO {table} (pk, data, soft_delete_at) VALUES ($1, $2, $3) \
             ON CONFLICT (pk) DO UPDATE SET data = EXCLUDED.data, soft_delete_at = EXCLUDED.soft_delete_at"
        );
        sqlx::query(&sql)
            .bind(&pk)
            .bind(&data)
            .bind(soft_delete_at)
            .execute(&mut **self.tx)
            .await
            .map_err(|e| translate_sqlx_error(e, E::TABLE))?;
        Ok(())
    }

    /// Read-modify-write: loads the current row (or starts from `upsert_default`
    /// when absent and `upsert` is requested), applies `mutate`, then
    /// `replace`s the result. Returns the new value.
    ///
    /// The source spec's `update` takes a loosely-typed partial object; in a
    /// statically typed entity model the equivalent is a mutation closure
    /// over the fully-typed pre-image.
    pub async fn update<E: Entity>(
        &mut self,
        key: &[String],
        upsert_default: Option<E>,
        mutate: impl FnOnce(&mut E),
    ) -> Result<E, CoreError> {
        self.guard_writable()?;
        let existing = self
            .get::<E>(
                key,
                GetOptions {
                    include_soft_deletes: true,
                    ..Default::default()
                },
            )
            .await?;
        let mut entity = match (existing, upsert_default) {
            (Some(e), _) => e,
            (None, Some(default)) => default,
            (None, None) => {
                return Err(CoreError::EntityNotFound {
                    entity_type: E::TABLE.to_string(),
                    key: key.join(","),
                })
            }
        };
        mutate(&mut entity);
        if entity.primary_key() != key {
            return Err(CoreError::EntityMissingPrimaryKey {
                entity_type: E::TABLE.to_string(),
            });
        }
        self.replace(&entity).await?;
        Ok(entity)
    }

    /// Deletes a row outright, returning its pre-image.
    pub async fn delete<E: Entity>(
        &mut self,
        key: &[String],
        opts: DeleteOptions,
    ) -> Result<E, CoreError> {
        self.guard_writable()?;
        let entity = self
            .find_or_fail::<E>(
                key,
                GetOptions {
                    include_soft_deletes: opts.include_soft_deletes,
                    ..Default::default()
                },
            )
            .await?;
        let pk = primary_key_of::<E>(key)?;
        let table = table_name::<E>();
        let sql = format!("DELETE FROM {table} WHERE pk = $1");
        sqlx::query(&sql)
            .bind(&pk)
            .execute(&mut **self.tx)
            .await
            .map_err(|e| translate_sqlx_error(e, E::TABLE))?;
        Ok(entity)
    }

    /// `DELETE FROM … WHERE TRUE`: drops every row of the entity's table.
    pub async fn clear<E: Entity>(&mut self) -> Result<(), CoreError> {
        self.guard_writable()?;
        let table = table_name::<E>();
        let sql = format!("DELETE FROM {table} WHERE TRUE");
        sqlx::query(&sql)
            .execute(&mut **self.tx)
            .await
            .map_err(|e| translate_sqlx_error(e, E::TABLE))?;
        Ok(())
    }

    /// Executes a caller-supplied statement against the entity's table and
    /// hydrates every row into `E`. `statement` must select `data` (and,
    /// to honor soft-delete filtering, `soft_delete_at`).
    pub async fn query<E: Entity>(&mut self, statement: &str) -> Result<Vec<E>, CoreError> {
        let rows = sqlx::query(statement)
            .fetch_all(&mut **self.tx)
            .await
            .map_err(|e| translate_sqlx_error(e, E::TABLE))?;
        rows.into_iter()
            .map(|row| {
                let data: Value = row.try_get("data").map_err(|e| {
                    CoreError::temporary_with_source(format!("{}: malformed row", E::TABLE), e)
                })?;
                serde_json::from_value(data).map_err(|e| CoreError::InvalidEntityDefinition {
                    reason: format!("{}: failed to hydrate row: {e}", E::TABLE),
                })
            })
            .collect()
    }

    /// As [`SqlStateTransaction::query`], but chunks the result into
    /// `batch_size`-sized groups.
    ///
    /// The source spec describes a lazily-produced sequence of batches;
    /// here the full result set is fetched and then sliced, since this
    /// crate does not take on an async-generator dependency. Callers
    /// wanting true backpressure should page `statement` themselves with
    /// `LIMIT`/`OFFSET` and call [`SqlStateTransaction::query`] per page.
    pub async fn query_batches<E: Entity>(
        &mut self,
        statement: &str,
        batch_size: usize,
    ) -> Result<Vec<Vec<E>>, CoreError> {
        if batch_size == 0 {
            return Err(CoreError::InvalidArgument {
                reason: "batch_size must be > 0".to_string(),
            });
        }
        let all = self.query::<E>(statement).await?;
        Ok(all.chunks(batch_size).map(|chunk| chunk.to_vec()).collect())
    }
}

fn table_name<E: Entity>() -> String {
    format!("txo_entity_{}", E::TABLE)
}

/// Rejects `opts.columns` sets that drop the soft-delete column without
/// `opts.include_soft_deletes` also being set: such a read could never
/// distinguish a live row from a soft-deleted one.
fn validate_columns<E: Entity>(opts: &GetOptions) -> Result<(), CoreError> {
    let (Some(columns), Some(soft_delete_column)) = (&opts.columns, E::SOFT_DELETE_COLUMN) else {
        return Ok(());
    };
    if !opts.include_soft_deletes && !columns.iter().any(|c| c == soft_delete_column) {
        return Err(CoreError::InvalidArgument {
            reason: format!(
                "{}: columns must include the soft-delete column '{soft_delete_column}' unless include_soft_deletes is set",
                E::TABLE
            ),
        });
    }
    Ok(())
}

/// Looks up a declared index's key columns and builds a `data->>'col' = $n`
/// predicate over `key`, the caller-supplied index key tuple.
fn index_predicate<E: Entity>(
    index_name: &str,
    key: &[String],
) -> Result<(String, Vec<String>), CoreError> {
    let columns = E::INDEXES
        .iter()
        .find(|(name, _)| *name == index_name)
        .map(|(_, columns)| *columns)
        .ok_or_else(|| CoreError::InvalidArgument {
            reason: format!("{}: no such index '{index_name}'", E::TABLE),
        })?;
    if columns.len() != key.len() {
        return Err(CoreError::InvalidArgument {
            reason: format!(
                "{}: index '{index_name}' expects {} key column(s), got {}",
                E::TABLE,
                columns.len(),
                key.len()
            ),
        });
    }
    let predicate = columns
        .iter()
        .enumerate()
        .map(|(i, column)| format!("data->>'{column}' = ${}", i + 1))
        .collect::<Vec<_>>()
        .join(" AND ");
    Ok((predicate, key.to_vec()))
}

fn hydrate_row<E: Entity>(row: &sqlx::postgres::PgRow) -> Result<E, CoreError> {
    let data: Value = row.try_get("data").map_err(|e| {
        CoreError::temporary_with_source(format!("{}: malformed row", E::TABLE), e)
    })?;
    serde_json::from_value(data).map_err(|e| CoreError::InvalidEntityDefinition {
        reason: format!("{}: failed to hydrate row: {e}", E::TABLE),
    })
}

fn primary_key_of<E: Entity>(key: &[String]) -> Result<String, CoreError> {
    if key.len() != E::PRIMARY_KEY_COLUMNS.len() {
        return Err(CoreError::EntityMissingPrimaryKey {
            entity_type: E::TABLE.to_string(),
        });
    }
    Ok(txo_domain::columns::join_key_tuple(key))
}

fn encoded_primary_key<E: Entity>(entity: &E) -> Result<String, CoreError> {
    primary_key_of::<E>(&entity.primary_key())
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

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Widget {
        id: String,
        email: String,
        deleted_at: Option<String>,
    }

    impl Entity for Widget {
        const TABLE: &'static str = "Widget";
        const PRIMARY_KEY_COLUMNS: &'static [&'static str] = &["id"];
        const SOFT_DELETE_COLUMN: Option<&'static str> = Some("deleted_at");
        const INDEXES: &'static [(&'static str, &'static [&'static str])] =
            &[("by_email", &["email"])];
        fn primary_key(&self) -> Vec<String> {
            vec![self.id.clone()]
        }
    }

    #[test]
    fn validate_columns_allows_full_read() {
        let opts = GetOptions::default();
        assert!(validate_columns::<Widget>(&opts).is_ok());
    }

    #[test]
    fn validate_columns_rejects_missing_soft_delete_column() {
        let opts = GetOptions {
            columns: Some(vec!["id".to_string(), "email".to_string()]),
            ..Default::default()
        };
        assert!(matches!(
            validate_columns::<Widget>(&opts),
            Err(CoreError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn validate_columns_allows_missing_soft_delete_column_with_include_soft_deletes() {
        let opts = GetOptions {
            columns: Some(vec!["id".to_string()]),
            include_soft_deletes: true,
            ..Default::default()
        };
        assert!(validate_columns::<Widget>(&opts).is_ok());
    }

    #[test]
    fn validate_columns_allows_soft_delete_column_present() {
        let opts = GetOptions {
            columns: Some(vec!["id".to_string(), "deleted_at".to_string()]),
            ..Default::default()
        };
        assert!(validate_columns::<Widget>(&opts).is_ok());
    }

    #[test]
    fn index_predicate_builds_expected_clause() {
        let (predicate, values) =
            index_predicate::<Widget>("by_email", &["a@example.com".to_string()]).unwrap();
        assert_eq!(predicate, "data->>'email' = $1");
        assert_eq!(values, vec!["a@example.com".to_string()]);
    }

    #[test]
    fn index_predicate_rejects_unknown_index() {
        let result = index_predicate::<Widget>("no_such_index", &["x".to_string()]);
        assert!(matches!(result, Err(CoreError::InvalidArgument { .. })));
    }

    #[test]
    fn index_predicate_rejects_wrong_key_arity() {
        let result = index_predicate::<Widget>("by_email", &["a".to_string(), "b".to_string()]);
        assert!(matches!(result, Err(CoreError::InvalidArgument { .. })));
    }
}

//! Translates `sqlx`/Postgres error codes into the closed [`CoreError`]
//! taxonomy (spec §4.6's error-translation table). No raw database error
//! code should leak above the SQL transaction runner.

use txo_domain::CoreError;

/// SQLSTATE classes treated as transient/retryable per the error-translation
/// table: session/resource exhaustion and the usual "try again" codes.
const RETRYABLE_SQLSTATES: &[&str] = &[
    "53300", // too_many_connections
    "53400", // configuration_limit_exceeded
    "57014", // query_canceled (statement timeout)
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "08000", "08003", "08006", // connection_exception family
];

pub fn translate_sqlx_error(err: sqlx::Error, entity_type: &str) -> CoreError {
    match &err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string());
            match code.as_deref() {
                Some("23505") => CoreError::EntityAlreadyExists {
                    entity_type: entity_type.to_string(),
                    key: db_err.message().to_string(),
                },
                Some(c) if RETRYABLE_SQLSTATES.contains(&c) => {
                    CoreError::temporary_with_source(format!("{entity_type}: {}", db_err.message()), err)
                }
                _ => CoreError::temporary_with_source(
                    format!("{entity_type}: unrecognized database error"),
                    err,
                ),
            }
        }
        sqlx::Error::RowNotFound => CoreError::EntityNotFound {
            entity_type: entity_type.to_string(),
            key: String::new(),
        },
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            CoreError::temporary_with_source(format!("{entity_type}: pool/connection error"), err)
        }
        sqlx::Error::ColumnNotFound(_) | sqlx::Error::ColumnDecode { .. } => {
            CoreError::InvalidQuery {
                reason: err.to_string(),
            }
        }
        _ => CoreError::temporary_with_source(format!("{entity_type}: unexpected sqlx error"), err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_entity_not_found() {
        let err = translate_sqlx_error(sqlx::Error::RowNotFound, "Widget");
        assert!(matches!(err, CoreError::EntityNotFound { .. }));
    }
}

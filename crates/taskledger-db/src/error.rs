use taskledger_core::Error;

/// SQLSTATE for `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";
/// `duplicate_table`, also raised for an existing index.
const DUPLICATE_TABLE: &str = "42P07";
const DUPLICATE_OBJECT: &str = "42710";

/// Every driver failure reaching a caller is a transport failure.
pub(crate) fn map_db_error(err: sqlx::Error) -> Error {
    tracing::debug!(error = %err, "Database error");
    Error::Transport(err.to_string())
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|code| code.into_owned()),
        _ => None,
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some(UNIQUE_VIOLATION)
}

/// Errors raised when DDL races with another instance creating the same
/// object. `IF NOT EXISTS` does not cover all of them: two concurrent
/// `CREATE TABLE IF NOT EXISTS` can still collide on the catalog's unique index.
pub(crate) fn is_duplicate_object(err: &sqlx::Error) -> bool {
    matches!(
        sqlstate(err).as_deref(),
        Some(DUPLICATE_TABLE) | Some(DUPLICATE_OBJECT) | Some(UNIQUE_VIOLATION)
    )
}

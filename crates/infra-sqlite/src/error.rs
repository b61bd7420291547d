// sqlx::Error -> AppError
// (orphan rules forbid `impl From<sqlx::Error> for AppError` here)

use carbonbatch_core::error::AppError;

// SQLite extended result codes: https://www.sqlite.org/rescode.html
const SQLITE_CONSTRAINT_UNIQUE: &str = "2067";
const SQLITE_CONSTRAINT_PRIMARYKEY: &str = "1555";
const SQLITE_CONSTRAINT_FOREIGNKEY: &str = "787";
const SQLITE_CONSTRAINT_CHECK: &str = "275";
const SQLITE_BUSY: &str = "5";
const SQLITE_FULL: &str = "13";

fn db_code(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|c| c.into_owned()),
        _ => None,
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        db_code(err).as_deref(),
        Some(SQLITE_CONSTRAINT_UNIQUE) | Some(SQLITE_CONSTRAINT_PRIMARYKEY)
    )
}

pub(crate) fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    db_code(err).as_deref() == Some(SQLITE_CONSTRAINT_FOREIGNKEY)
}

/// Convert sqlx::Error to AppError with the SQLite code decoded
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> AppError {
    match &err {
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            Some(code @ (SQLITE_CONSTRAINT_UNIQUE | SQLITE_CONSTRAINT_PRIMARYKEY)) => {
                AppError::Database(format!(
                    "Unique constraint violation: {} ({})",
                    db_err.message(),
                    code
                ))
            }
            Some(code @ (SQLITE_CONSTRAINT_FOREIGNKEY | "3850")) => AppError::Database(format!(
                "Foreign key constraint violation: {} ({})",
                db_err.message(),
                code
            )),
            Some(SQLITE_CONSTRAINT_CHECK) => AppError::Database(format!(
                "Check constraint violation: {}",
                db_err.message()
            )),
            Some(SQLITE_BUSY) => AppError::Database(format!(
                "Database locked (SQLITE_BUSY): {}",
                db_err.message()
            )),
            Some(SQLITE_FULL) => AppError::Database(format!("Database full: {}", db_err.message())),
            Some(code) => AppError::Database(format!(
                "Database error [{}]: {}",
                code,
                db_err.message()
            )),
            None => AppError::Database(format!("Database error: {}", db_err.message())),
        },
        sqlx::Error::RowNotFound => AppError::Database("Row not found".to_string()),
        sqlx::Error::ColumnNotFound(col) => AppError::Database(format!("Column not found: {}", col)),
        sqlx::Error::PoolTimedOut => AppError::Database("Connection pool timed out".to_string()),
        _ => AppError::Database(err.to_string()),
    }
}

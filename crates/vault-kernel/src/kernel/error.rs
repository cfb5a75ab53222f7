//! Kernel-level error type and SQLite error classification.
//!
//! Every operation returns `Result<T, VaultError>`. Lock contention is
//! retried by the concurrency layer and only surfaces as `Busy` after the
//! retry budget; constraint failures surface as `Integrity` with the
//! offending field; unrecoverable storage faults surface as `Corruption`
//! carrying operator guidance text.

use rusqlite::ErrorCode;

/// Kernel-level error type.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// Write path stayed locked past the retry budget.
    #[error("database busy: {0}")]
    Busy(String),
    /// Uniqueness, foreign-key, or check failure with the offending field.
    #[error("integrity violation on {field}: {message}")]
    Integrity { field: String, message: String },
    /// Pragma setup or integrity check failed and recovery did not help.
    #[error("database corruption: {guidance}")]
    Corruption { guidance: String },
    /// Bad credentials, locked/reset account, missing user.
    #[error("authentication failure: {0}")]
    Auth(String),
    /// Permission map denied the operation at the data layer.
    #[error("permission denied: user '{username}' lacks '{permission}'")]
    PermissionDenied { username: String, permission: String },
    #[error("backup failed: {0}")]
    Backup(String),
    #[error("restore failed: {0}")]
    Restore(String),
    /// Malformed settings value; callers fall back to defaults.
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Any other SQLite error, with a context prefix.
    #[error("sqlite error: {0}")]
    Sqlite(String),
}

/// Operator guidance attached to lock/IO faults during pragma setup.
/// The sidecar files must never be deleted automatically while another
/// instance may hold them open.
pub const LOCKED_GUIDANCE: &str = "Database is locked or has I/O issues. \
Close all application instances on all computers, wait 10 seconds, and \
retry. If the problem persists, delete the -wal and -shm sidecar files \
next to the database.";

/// True if the error is SQLite lock contention (retryable).
pub fn is_locked(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, msg) => {
            matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
                || msg
                    .as_deref()
                    .map(|m| m.to_ascii_lowercase().contains("locked"))
                    .unwrap_or(false)
        }
        _ => false,
    }
}

/// Maps a rusqlite error into a classified `VaultError` with context.
pub fn map_sql(context: &str, err: rusqlite::Error) -> VaultError {
    if let rusqlite::Error::SqliteFailure(e, ref msg) = err {
        if e.code == ErrorCode::ConstraintViolation {
            let message = msg.clone().unwrap_or_else(|| err.to_string());
            return VaultError::Integrity {
                field: constraint_field(&message),
                message,
            };
        }
    }
    VaultError::Sqlite(format!("{context}: {err}"))
}

/// Pulls `table.column` out of messages like
/// "UNIQUE constraint failed: employees.sss_number".
fn constraint_field(message: &str) -> String {
    message
        .rsplit(':')
        .next()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_field_extracts_column() {
        assert_eq!(
            constraint_field("UNIQUE constraint failed: employees.sss_number"),
            "employees.sss_number"
        );
    }

    #[test]
    fn locked_detection_matches_busy_and_locked() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        );
        assert!(is_locked(&busy));
        let other = rusqlite::Error::QueryReturnedNoRows;
        assert!(!is_locked(&other));
    }
}

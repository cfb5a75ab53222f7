//! Retry-on-lock policy and query profiling.
//!
//! All write paths that can hit "database is locked" on the shared file go
//! through [with_retry]. Non-lock errors propagate immediately; lock errors
//! back off exponentially and become [VaultError::Busy] once the budget is
//! exhausted. The loop always terminates after `max_attempts`.

use std::time::{Duration, Instant};

use crate::kernel::error::{is_locked, map_sql, VaultError};

/// Queries slower than this are logged at INFO with a truncated statement.
pub const SLOW_QUERY_MS: u128 = 50;

/// Backoff policy for lock contention.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Default for interactive writes: 3 attempts, 500 ms base delay.
    pub fn writes() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }

    /// Tighter loop for small best-effort writes: 5 attempts, 100 ms base.
    pub fn quick() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

/// Runs `op`, retrying on lock contention per `policy`.
///
/// `context` names the operation for logs and error messages. Lock errors
/// sleep `base_delay * 2^attempt` between tries; any other error is mapped
/// and returned on the first occurrence.
pub fn with_retry<T>(
    policy: RetryPolicy,
    context: &str,
    mut op: impl FnMut() -> Result<T, rusqlite::Error>,
) -> Result<T, VaultError> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_locked(&err) => {
                if attempt + 1 >= policy.max_attempts {
                    tracing::error!(
                        context,
                        attempts = policy.max_attempts,
                        "database remains locked after final attempt"
                    );
                    return Err(VaultError::Busy(format!(
                        "{context}: another user is currently saving data; \
                         please wait a moment and try again ({err})"
                    )));
                }
                let wait = policy.delay_for(attempt);
                tracing::warn!(
                    context,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    wait_ms = wait.as_millis() as u64,
                    "database locked, retrying"
                );
                std::thread::sleep(wait);
                attempt += 1;
            }
            Err(err) => return Err(map_sql(context, err)),
        }
    }
}

/// Measures `op`; logs at INFO when it exceeds [SLOW_QUERY_MS].
pub fn profile<T>(sql: &str, op: impl FnOnce() -> T) -> T {
    let start = Instant::now();
    let out = op();
    let elapsed = start.elapsed().as_millis();
    if elapsed > SLOW_QUERY_MS {
        let preview: String = sql.chars().take(100).collect::<String>().replace('\n', " ");
        tracing::info!(elapsed_ms = elapsed as u64, query = %preview, "slow query");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locked_err() -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        )
    }

    #[test]
    fn retries_then_succeeds() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        };
        let mut calls = 0;
        let result = with_retry(policy, "test op", || {
            calls += 1;
            if calls < 3 {
                Err(locked_err())
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 3);
    }

    #[test]
    fn exhaustion_becomes_busy() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
        };
        let result: Result<(), _> = with_retry(policy, "test op", || Err(locked_err()));
        assert!(matches!(result, Err(VaultError::Busy(_))));
    }

    #[test]
    fn non_lock_error_propagates_immediately() {
        let policy = RetryPolicy::writes();
        let mut calls = 0;
        let result: Result<(), _> = with_retry(policy, "test op", || {
            calls += 1;
            Err(rusqlite::Error::QueryReturnedNoRows)
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}

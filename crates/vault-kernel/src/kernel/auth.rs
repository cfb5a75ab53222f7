//! Users, PIN credentials, permissions, and sessions.
//!
//! Credentials are bcrypt-hashed PINs (4-6 digits). Five failed attempts
//! inside 60 minutes do not lock the account out permanently; instead the
//! PIN is cleared and the user re-enrolls at the next login, which keeps a
//! small office running without an IT department. Permissions are a flat
//! key->bool map stored as JSON per user; admins bypass the map entirely.

use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde_json::{Map, Value};

use crate::kernel::db::{local_host, Db};
use crate::kernel::error::VaultError;
use crate::kernel::models::{Role, SessionRecord, Severity, UserRecord, TS_FORMAT};
use crate::kernel::retry::{with_retry, RetryPolicy};

/// Failures inside the window that trigger the PIN auto-reset.
pub const MAX_FAILED_ATTEMPTS: i64 = 5;
/// Width of the failure-counting window, minutes.
pub const LOCKOUT_WINDOW_MINUTES: i64 = 60;
/// Login attempts older than this are swept.
pub const ATTEMPT_RETENTION_DAYS: i64 = 30;
/// Sessions idle longer than this are swept.
pub const SESSION_IDLE_MINUTES: i64 = 60;

/// Every permission the kernel knows about. Unknown keys are dropped on
/// write; missing keys read as false.
pub const PERMISSION_KEYS: &[&str] = &[
    "dashboard",
    "employees",
    "add_employee",
    "edit_employee",
    "delete_employee",
    "print_system",
    "bulk_operations",
    "reports",
    "letters",
    "user_management",
    "settings",
    "audit_log",
    "backup_restore",
    "archive",
];

/// Keys withheld from the unprivileged role by default.
const USER_DENIED: &[&str] = &[
    "delete_employee",
    "user_management",
    "audit_log",
    "backup_restore",
    "archive",
];

/// Permissions a role starts with.
pub fn default_permissions(role: Role) -> Value {
    let mut map = Map::new();
    for key in PERMISSION_KEYS {
        let granted = match role {
            Role::Admin => true,
            Role::User => !USER_DENIED.contains(key),
        };
        map.insert((*key).to_string(), Value::Bool(granted));
    }
    Value::Object(map)
}

/// Outcome of an authentication attempt.
#[derive(Clone, Debug)]
pub enum AuthOutcome {
    /// Credentials verified; carries the user row and the new session id.
    Success { user: UserRecord, session_id: i64 },
    /// The account exists but has no PIN yet (fresh admin, post-reset, or a
    /// legacy password account). The caller must run PIN enrollment.
    PinSetupRequired,
    /// Unknown user or wrong PIN.
    InvalidCredentials,
    /// Too many failures: the PIN was just cleared and must be re-enrolled.
    PinAutoReset,
}

/// Hashes a PIN with bcrypt at the default cost.
pub fn hash_pin(pin: &str) -> Result<String, VaultError> {
    hash(pin, DEFAULT_COST).map_err(|e| VaultError::Auth(format!("hash pin: {e}")))
}

fn pin_matches(pin: &str, stored: &str) -> bool {
    verify(pin, stored).unwrap_or(false)
}

const WEAK_PINS: &[&str] = &[
    "1234", "0000", "1111", "2222", "123456", "654321", "000000", "111111", "121212", "112233",
];

/// Rejects weak PINs: wrong length, non-digits, single repeated digit,
/// ascending/descending runs, and a small denylist.
pub fn validate_pin_strength(pin: &str) -> Result<(), VaultError> {
    if pin.len() < 4 || pin.len() > 6 {
        return Err(VaultError::Auth("PIN must be 4 to 6 digits".to_string()));
    }
    if !pin.chars().all(|c| c.is_ascii_digit()) {
        return Err(VaultError::Auth("PIN must contain only digits".to_string()));
    }
    let digits: Vec<u8> = pin.bytes().map(|b| b - b'0').collect();
    if digits.windows(2).all(|w| w[0] == w[1]) {
        return Err(VaultError::Auth(
            "PIN must not repeat a single digit".to_string(),
        ));
    }
    let ascending = digits.windows(2).all(|w| w[1] == w[0].wrapping_add(1));
    let descending = digits.windows(2).all(|w| w[0] == w[1].wrapping_add(1));
    if ascending || descending {
        return Err(VaultError::Auth(
            "PIN must not be a sequential run".to_string(),
        ));
    }
    if WEAK_PINS.contains(&pin) {
        return Err(VaultError::Auth("PIN is too common".to_string()));
    }
    Ok(())
}

impl Db {
    /// Verifies `pin` for `username`, recording the attempt either way.
    /// `ip_address` identifies the client in the attempt and audit rows.
    pub fn authenticate(
        &self,
        username: &str,
        pin: &str,
        ip_address: Option<&str>,
    ) -> Result<AuthOutcome, VaultError> {
        let user = self.get_user(username)?;
        let Some(user) = user else {
            self.record_login_attempt(username, false, ip_address)?;
            self.log_security_event(
                "LOGIN_FAILED",
                Some(username),
                Some("unknown user"),
                Severity::Warning,
                ip_address,
            )?;
            return Ok(AuthOutcome::InvalidCredentials);
        };

        // Auto-reset fires before verification so a guessing run cannot keep
        // testing a partially-known PIN.
        if user.pin.is_some()
            && self.failed_attempts_in_window(username)? >= MAX_FAILED_ATTEMPTS
        {
            self.clear_pin(username)?;
            self.log_security_event(
                "PIN_AUTO_RESET",
                Some(username),
                Some("too many failed attempts; PIN cleared for re-enrollment"),
                Severity::Warning,
                ip_address,
            )?;
            tracing::warn!(username, "PIN auto-reset after repeated failures");
            return Ok(AuthOutcome::PinAutoReset);
        }

        // Legacy accounts still carry a password hash; a match routes them
        // into forced PIN enrollment rather than a normal login.
        if user.pin.is_none() {
            return match &user.password {
                None => Ok(AuthOutcome::PinSetupRequired),
                Some(stored) if pin_matches(pin, stored) => {
                    self.record_login_attempt(username, true, ip_address)?;
                    self.clear_failed_attempts(username)?;
                    Ok(AuthOutcome::PinSetupRequired)
                }
                Some(_) => {
                    self.record_login_attempt(username, false, ip_address)?;
                    self.log_security_event(
                        "LOGIN_FAILED",
                        Some(username),
                        Some("wrong password"),
                        Severity::Warning,
                        ip_address,
                    )?;
                    Ok(AuthOutcome::InvalidCredentials)
                }
            };
        }

        let stored = user.pin.clone().unwrap_or_default();
        if pin_matches(pin, &stored) {
            self.record_login_attempt(username, true, ip_address)?;
            self.clear_failed_attempts(username)?;
            self.log_security_event(
                "LOGIN_SUCCESS",
                Some(username),
                None,
                Severity::Info,
                ip_address,
            )?;
            let session_id = self.register_session(username, ip_address)?;
            Ok(AuthOutcome::Success { user, session_id })
        } else {
            self.record_login_attempt(username, false, ip_address)?;
            self.log_security_event(
                "LOGIN_FAILED",
                Some(username),
                Some("wrong PIN"),
                Severity::Warning,
                ip_address,
            )?;
            Ok(AuthOutcome::InvalidCredentials)
        }
    }

    /// True when the account must run PIN enrollment before normal logins.
    pub fn user_needs_pin_setup(&self, username: &str) -> Result<bool, VaultError> {
        Ok(self
            .get_user(username)?
            .map(|user| user.pin.is_none() || user.pin_change_required)
            .unwrap_or(false))
    }

    /// A successful login wipes the failure history so stale failures never
    /// count toward a later lockout.
    fn clear_failed_attempts(&self, username: &str) -> Result<(), VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "clear failed attempts", || {
                conn.execute(
                    "DELETE FROM login_attempts WHERE username = ?1 AND success = 0",
                    [username],
                )?;
                Ok(())
            })
        })
    }

    /// Validates, hashes, and stores a new PIN. Clears the legacy password,
    /// the change-required flag, and the failure history.
    pub fn set_pin(&self, username: &str, new_pin: &str) -> Result<(), VaultError> {
        validate_pin_strength(new_pin)?;
        let hashed = hash_pin(new_pin)?;
        let updated = self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "set pin", || {
                let rows = conn.execute(
                    "UPDATE users
                     SET pin = ?1, pin_change_required = 0, password = NULL
                     WHERE username = ?2",
                    params![hashed, username],
                )?;
                conn.execute(
                    "DELETE FROM login_attempts WHERE username = ?1 AND success = 0",
                    [username],
                )?;
                Ok(rows > 0)
            })
        })?;
        if !updated {
            return Err(VaultError::Auth(format!("unknown user: {username}")));
        }
        self.log_security_event("PIN_CHANGED", Some(username), None, Severity::Info, None)?;
        Ok(())
    }

    fn clear_pin(&self, username: &str) -> Result<(), VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "clear pin", || {
                conn.execute(
                    "UPDATE users SET pin = NULL, pin_change_required = 1 WHERE username = ?1",
                    [username],
                )?;
                conn.execute("DELETE FROM login_attempts WHERE username = ?1", [username])?;
                Ok(())
            })
        })
    }

    fn record_login_attempt(
        &self,
        username: &str,
        success: bool,
        ip_address: Option<&str>,
    ) -> Result<(), VaultError> {
        let now = Utc::now().format(TS_FORMAT).to_string();
        self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "record login attempt", || {
                conn.execute(
                    "INSERT INTO login_attempts(username, attempt_time, success, ip_address)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![username, now, success as i64, ip_address],
                )?;
                Ok(())
            })
        })
    }

    fn failed_attempts_in_window(&self, username: &str) -> Result<i64, VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "count failed attempts", || {
                conn.query_row(
                    "SELECT COUNT(*) FROM login_attempts
                     WHERE username = ?1 AND success = 0
                       AND attempt_time > datetime('now', ?2)",
                    params![username, format!("-{LOCKOUT_WINDOW_MINUTES} minutes")],
                    |r| r.get(0),
                )
            })
        })
    }

    /// Whether the account has crossed the failure threshold inside the
    /// window (the next authenticate call will auto-reset the PIN), plus the
    /// seconds until the oldest counted failure ages out and the count drops.
    pub fn is_account_locked(&self, username: &str) -> Result<(bool, i64), VaultError> {
        if self.failed_attempts_in_window(username)? < MAX_FAILED_ATTEMPTS {
            return Ok((false, 0));
        }
        let remaining: i64 = self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "lockout remaining", || {
                conn.query_row(
                    "SELECT CAST((julianday(MIN(attempt_time)) - julianday('now')) * 86400 AS INTEGER)
                            + ?2 * 60
                     FROM login_attempts
                     WHERE username = ?1 AND success = 0
                       AND attempt_time > datetime('now', ?3)",
                    params![
                        username,
                        LOCKOUT_WINDOW_MINUTES,
                        format!("-{LOCKOUT_WINDOW_MINUTES} minutes")
                    ],
                    |r| r.get(0),
                )
            })
        })?;
        Ok((true, remaining.max(0)))
    }

    /// Sweeps login attempts older than the retention period.
    pub fn cleanup_old_login_attempts(&self) -> Result<usize, VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "cleanup login attempts", || {
                Ok(conn.execute(
                    "DELETE FROM login_attempts WHERE attempt_time < datetime('now', ?1)",
                    [format!("-{ATTEMPT_RETENTION_DAYS} days")],
                )?)
            })
        })
    }

    // ---- users ----

    pub fn get_user(&self, username: &str) -> Result<Option<UserRecord>, VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "read user", || {
                conn.query_row(
                    "SELECT * FROM users WHERE username = ?1",
                    [username],
                    UserRecord::from_row,
                )
                .optional()
            })
        })
    }

    pub fn list_users(&self) -> Result<Vec<UserRecord>, VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "list users", || {
                let mut stmt = conn.prepare("SELECT * FROM users ORDER BY username")?;
                let rows = stmt.query_map([], UserRecord::from_row)?;
                rows.collect()
            })
        })
    }

    /// Creates a user. With no initial PIN the account starts in
    /// setup-required state. Seeds the role's default permissions.
    pub fn create_user(
        &self,
        acting_user: &str,
        username: &str,
        name: &str,
        role: Role,
        initial_pin: Option<&str>,
    ) -> Result<(), VaultError> {
        self.require_permission(acting_user, "user_management")?;
        if username.trim().is_empty() {
            return Err(VaultError::Integrity {
                field: "username".to_string(),
                message: "username must not be empty".to_string(),
            });
        }
        let pin_hash = match initial_pin {
            Some(pin) => {
                validate_pin_strength(pin)?;
                Some(hash_pin(pin)?)
            }
            None => None,
        };
        let perms = serde_json::to_string(&default_permissions(role))
            .map_err(|e| VaultError::Config(format!("serialize permissions: {e}")))?;

        self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "create user", || {
                conn.execute(
                    "INSERT INTO users(username, password, pin, pin_change_required, role, name)
                     VALUES (?1, NULL, ?2, ?3, ?4, ?5)",
                    params![
                        username,
                        pin_hash,
                        pin_hash.is_none() as i64,
                        role.as_str(),
                        name
                    ],
                )?;
                conn.execute(
                    "INSERT OR REPLACE INTO user_permissions(username, permissions)
                     VALUES (?1, ?2)",
                    params![username, perms],
                )?;
                Ok(())
            })
        })?;
        self.log_action(
            acting_user,
            "CREATE_USER",
            Some("users"),
            Some(username),
            None,
            Some(role.as_str()),
            None,
        )?;
        Ok(())
    }

    /// Updates display name and role. Demoting the last admin is refused.
    pub fn update_user(
        &self,
        acting_user: &str,
        username: &str,
        name: &str,
        role: Role,
    ) -> Result<(), VaultError> {
        self.require_permission(acting_user, "user_management")?;
        if role == Role::User && self.is_last_admin(username)? {
            return Err(VaultError::Auth(
                "cannot demote the last administrator".to_string(),
            ));
        }
        self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "update user", || {
                conn.execute(
                    "UPDATE users SET name = ?1, role = ?2 WHERE username = ?3",
                    params![name, role.as_str(), username],
                )?;
                Ok(())
            })
        })?;
        self.log_action(
            acting_user,
            "UPDATE_USER",
            Some("users"),
            Some(username),
            None,
            Some(role.as_str()),
            None,
        )
    }

    /// Deletes a user (permissions cascade). Deleting the last admin is
    /// refused.
    pub fn delete_user(&self, acting_user: &str, username: &str) -> Result<(), VaultError> {
        self.require_permission(acting_user, "user_management")?;
        if self.is_last_admin(username)? {
            return Err(VaultError::Auth(
                "cannot delete the last administrator".to_string(),
            ));
        }
        self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "delete user", || {
                conn.execute("DELETE FROM users WHERE username = ?1", [username])?;
                conn.execute("DELETE FROM record_locks WHERE locked_by = ?1", [username])?;
                Ok(())
            })
        })?;
        self.log_action(
            acting_user,
            "DELETE_USER",
            Some("users"),
            Some(username),
            None,
            None,
            None,
        )?;
        self.log_security_event(
            "USER_DELETED",
            Some(acting_user),
            Some(username),
            Severity::Warning,
            None,
        )
    }

    fn is_last_admin(&self, username: &str) -> Result<bool, VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "check last admin", || {
                let is_admin: bool = conn
                    .query_row(
                        "SELECT role = 'admin' FROM users WHERE username = ?1",
                        [username],
                        |r| r.get(0),
                    )
                    .optional()?
                    .unwrap_or(false);
                if !is_admin {
                    return Ok(false);
                }
                let admins: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM users WHERE role = 'admin'",
                    [],
                    |r| r.get(0),
                )?;
                Ok(admins <= 1)
            })
        })
    }

    // ---- permissions ----

    /// The effective permission map for a user. Admins get everything; a
    /// missing row falls back to the role defaults.
    pub fn get_user_permissions(&self, username: &str) -> Result<Value, VaultError> {
        let user = self.get_user(username)?;
        let Some(user) = user else {
            return Ok(default_permissions(Role::User));
        };
        if user.role == Role::Admin {
            return Ok(default_permissions(Role::Admin));
        }
        let stored: Option<String> = self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "read permissions", || {
                conn.query_row(
                    "SELECT permissions FROM user_permissions WHERE username = ?1",
                    [username],
                    |r| r.get(0),
                )
                .optional()
            })
        })?;
        match stored {
            Some(text) => {
                let parsed: Value = serde_json::from_str(&text)
                    .unwrap_or_else(|_| default_permissions(user.role));
                Ok(parsed)
            }
            None => Ok(default_permissions(user.role)),
        }
    }

    /// Replaces a user's permission map. Unknown keys are dropped; known
    /// keys missing from the input become false.
    pub fn set_user_permissions(
        &self,
        acting_user: &str,
        username: &str,
        permissions: &Value,
    ) -> Result<(), VaultError> {
        self.require_permission(acting_user, "user_management")?;
        let mut map = Map::new();
        for key in PERMISSION_KEYS {
            let granted = permissions
                .get(*key)
                .and_then(Value::as_bool)
                .unwrap_or(false);
            map.insert((*key).to_string(), Value::Bool(granted));
        }
        let text = serde_json::to_string(&Value::Object(map))
            .map_err(|e| VaultError::Config(format!("serialize permissions: {e}")))?;
        self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "write permissions", || {
                conn.execute(
                    "INSERT OR REPLACE INTO user_permissions(username, permissions)
                     VALUES (?1, ?2)",
                    params![username, text],
                )?;
                Ok(())
            })
        })?;
        self.log_action(
            acting_user,
            "SET_PERMISSIONS",
            Some("user_permissions"),
            Some(username),
            None,
            None,
            None,
        )
    }

    pub fn has_permission(&self, username: &str, permission: &str) -> Result<bool, VaultError> {
        let perms = self.get_user_permissions(username)?;
        Ok(perms.get(permission).and_then(Value::as_bool).unwrap_or(false))
    }

    /// Guard used at the top of every protected operation.
    pub fn require_permission(&self, username: &str, permission: &str) -> Result<(), VaultError> {
        if self.has_permission(username, permission)? {
            return Ok(());
        }
        self.log_security_event(
            "PERMISSION_DENIED",
            Some(username),
            Some(permission),
            Severity::Warning,
            None,
        )?;
        Err(VaultError::PermissionDenied {
            username: username.to_string(),
            permission: permission.to_string(),
        })
    }

    /// Resets every non-admin user to their role's default permission map.
    pub fn reset_all_users_to_default_permissions(
        &self,
        acting_user: &str,
    ) -> Result<usize, VaultError> {
        self.require_permission(acting_user, "user_management")?;
        let users = self.list_users()?;
        let mut reset = 0usize;
        self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "reset permissions", || {
                for user in &users {
                    let perms = serde_json::to_string(&default_permissions(user.role))
                        .map_err(|_| rusqlite::Error::InvalidQuery)?;
                    conn.execute(
                        "INSERT OR REPLACE INTO user_permissions(username, permissions)
                         VALUES (?1, ?2)",
                        params![user.username, perms],
                    )?;
                }
                Ok(())
            })
        })?;
        reset += users.len();
        self.log_action(
            acting_user,
            "RESET_PERMISSIONS",
            Some("user_permissions"),
            None,
            None,
            None,
            Some(&format!("{reset} users reset")),
        )?;
        Ok(reset)
    }

    // ---- sessions ----

    /// Registers an advisory presence row and returns its id. Also sweeps
    /// idle sessions.
    pub fn register_session(
        &self,
        username: &str,
        ip_address: Option<&str>,
    ) -> Result<i64, VaultError> {
        self.sweep_idle_sessions()?;
        let now = Utc::now().format(TS_FORMAT).to_string();
        let host = local_host();
        self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "register session", || {
                conn.execute(
                    "INSERT INTO active_sessions
                         (username, login_time, last_activity, ip_address, computer_name)
                     VALUES (?1, ?2, ?2, ?3, ?4)",
                    params![username, now, ip_address, host],
                )?;
                Ok(conn.last_insert_rowid())
            })
        })
    }

    /// Bumps the session heartbeat.
    pub fn touch_session(&self, session_id: i64) -> Result<(), VaultError> {
        let now = Utc::now().format(TS_FORMAT).to_string();
        self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "touch session", || {
                conn.execute(
                    "UPDATE active_sessions SET last_activity = ?1 WHERE id = ?2",
                    params![now, session_id],
                )?;
                Ok(())
            })
        })
    }

    /// Ends a session and releases the user's record locks.
    pub fn end_session(&self, session_id: i64) -> Result<(), VaultError> {
        let username: Option<String> = self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "end session", || {
                let username = conn
                    .query_row(
                        "SELECT username FROM active_sessions WHERE id = ?1",
                        [session_id],
                        |r| r.get(0),
                    )
                    .optional()?;
                conn.execute("DELETE FROM active_sessions WHERE id = ?1", [session_id])?;
                Ok(username)
            })
        })?;
        if let Some(username) = username {
            self.release_user_locks(&username)?;
            self.log_security_event("LOGOUT", Some(&username), None, Severity::Info, None)?;
        }
        Ok(())
    }

    /// Ends every session a user holds, releasing their record locks.
    /// Returns the number of sessions removed.
    pub fn force_logout_user(
        &self,
        acting_user: &str,
        username: &str,
    ) -> Result<usize, VaultError> {
        self.require_permission(acting_user, "user_management")?;
        let removed = self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "force logout", || {
                Ok(conn.execute(
                    "DELETE FROM active_sessions WHERE username = ?1",
                    [username],
                )?)
            })
        })?;
        self.release_user_locks(username)?;
        self.log_security_event(
            "FORCED_LOGOUT",
            Some(acting_user),
            Some(username),
            Severity::Warning,
            None,
        )?;
        Ok(removed)
    }

    /// Live sessions after sweeping idle ones.
    pub fn active_sessions(&self) -> Result<Vec<SessionRecord>, VaultError> {
        self.sweep_idle_sessions()?;
        self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "list sessions", || {
                let mut stmt =
                    conn.prepare("SELECT * FROM active_sessions ORDER BY login_time")?;
                let rows = stmt.query_map([], SessionRecord::from_row)?;
                rows.collect()
            })
        })
    }

    fn sweep_idle_sessions(&self) -> Result<(), VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "sweep idle sessions", || {
                conn.execute(
                    "DELETE FROM active_sessions WHERE last_activity < datetime('now', ?1)",
                    [format!("-{SESSION_IDLE_MINUTES} minutes")],
                )?;
                Ok(())
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::models::SecurityAuditFilter;
    use crate::kernel::schema::DEFAULT_ADMIN_PIN;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_db(dir: &TempDir) -> Db {
        Db::open(dir.path().join("vault.db")).unwrap()
    }

    #[test]
    fn pin_strength_rules() {
        assert!(validate_pin_strength("4829").is_ok());
        assert!(validate_pin_strength("58214").is_ok());
        assert!(validate_pin_strength("123").is_err()); // too short
        assert!(validate_pin_strength("1234567").is_err()); // too long
        assert!(validate_pin_strength("12a4").is_err()); // non-digit
        assert!(validate_pin_strength("7777").is_err()); // repeated
        assert!(validate_pin_strength("3456").is_err()); // ascending
        assert!(validate_pin_strength("9876").is_err()); // descending
        assert!(validate_pin_strength("121212").is_err()); // denylist
    }

    #[test]
    fn default_admin_authenticates_then_must_change() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        match db.authenticate("admin", DEFAULT_ADMIN_PIN, None).unwrap() {
            AuthOutcome::Success { user, .. } => {
                assert!(user.pin_change_required);
                assert_eq!(user.role, Role::Admin);
            }
            other => panic!("expected success, got {other:?}"),
        }
        db.set_pin("admin", "4829").unwrap();
        match db.authenticate("admin", "4829", None).unwrap() {
            AuthOutcome::Success { user, .. } => assert!(!user.pin_change_required),
            other => panic!("expected success, got {other:?}"),
        }
        assert!(matches!(
            db.authenticate("admin", DEFAULT_ADMIN_PIN, None).unwrap(),
            AuthOutcome::InvalidCredentials
        ));
    }

    #[test]
    fn five_failures_auto_reset_the_pin() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        db.set_pin("admin", "4829").unwrap();
        for _ in 0..5 {
            assert!(matches!(
                db.authenticate("admin", "0001", None).unwrap(),
                AuthOutcome::InvalidCredentials
            ));
        }
        let (locked, remaining_secs) = db.is_account_locked("admin").unwrap();
        assert!(locked);
        assert!(remaining_secs > 0 && remaining_secs <= LOCKOUT_WINDOW_MINUTES * 60);
        // Sixth attempt triggers the reset, even with the right PIN.
        assert!(matches!(
            db.authenticate("admin", "4829", None).unwrap(),
            AuthOutcome::PinAutoReset
        ));
        let resets = db
            .get_security_audit(
                &SecurityAuditFilter {
                    event_type: Some("PIN_AUTO_RESET".into()),
                    ..SecurityAuditFilter::default()
                },
                10,
            )
            .unwrap();
        assert_eq!(resets.len(), 1);
        assert_eq!(resets[0].severity, Severity::Warning);
        // PIN is gone; the account is back in setup mode and unlocked.
        assert!(matches!(
            db.authenticate("admin", "4829", None).unwrap(),
            AuthOutcome::PinSetupRequired
        ));
        assert!(!db.is_account_locked("admin").unwrap().0);
        db.set_pin("admin", "5913").unwrap();
        assert!(matches!(
            db.authenticate("admin", "5913", None).unwrap(),
            AuthOutcome::Success { .. }
        ));
    }

    #[test]
    fn permission_guard_and_admin_bypass() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        db.create_user("admin", "clerk", "Clerk", Role::User, Some("4829"))
            .unwrap();

        assert!(db.has_permission("clerk", "employees").unwrap());
        assert!(!db.has_permission("clerk", "user_management").unwrap());
        assert!(db.has_permission("admin", "user_management").unwrap());

        let denied = db.require_permission("clerk", "delete_employee");
        assert!(matches!(denied, Err(VaultError::PermissionDenied { .. })));

        db.set_user_permissions("admin", "clerk", &json!({"delete_employee": true}))
            .unwrap();
        assert!(db.has_permission("clerk", "delete_employee").unwrap());
        // Keys absent from the new map went false.
        assert!(!db.has_permission("clerk", "employees").unwrap());

        db.reset_all_users_to_default_permissions("admin").unwrap();
        assert!(db.has_permission("clerk", "employees").unwrap());
        assert!(!db.has_permission("clerk", "delete_employee").unwrap());
    }

    #[test]
    fn last_admin_is_protected() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        assert!(db.delete_user("admin", "admin").is_err());
        assert!(db
            .update_user("admin", "admin", "Administrator", Role::User)
            .is_err());

        db.create_user("admin", "admin2", "Second Admin", Role::Admin, Some("4829"))
            .unwrap();
        db.delete_user("admin", "admin2").unwrap();
        assert!(db.get_user("admin2").unwrap().is_none());
    }

    #[test]
    fn sessions_register_and_end() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        db.set_pin("admin", "4829").unwrap();
        let session_id = match db.authenticate("admin", "4829", None).unwrap() {
            AuthOutcome::Success { session_id, .. } => session_id,
            other => panic!("expected success, got {other:?}"),
        };
        assert_eq!(db.active_sessions().unwrap().len(), 1);
        db.touch_session(session_id).unwrap();
        db.acquire_record_lock("E-001-25", "admin").unwrap();
        db.end_session(session_id).unwrap();
        assert!(db.active_sessions().unwrap().is_empty());
        assert!(!db.lock_info("E-001-25").unwrap().locked);
    }

    #[test]
    fn force_logout_drops_sessions_and_locks() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        db.create_user("admin", "clerk", "Clerk", Role::User, Some("4829"))
            .unwrap();
        assert!(matches!(
            db.authenticate("clerk", "4829", None).unwrap(),
            AuthOutcome::Success { .. }
        ));
        db.acquire_record_lock("E-001-25", "clerk").unwrap();

        // A non-admin cannot throw other users out.
        assert!(matches!(
            db.force_logout_user("clerk", "admin"),
            Err(VaultError::PermissionDenied { .. })
        ));

        let removed = db.force_logout_user("admin", "clerk").unwrap();
        assert_eq!(removed, 1);
        assert!(db.active_sessions().unwrap().is_empty());
        assert!(!db.lock_info("E-001-25").unwrap().locked);

        let events = db
            .get_security_audit(
                &SecurityAuditFilter {
                    event_type: Some("FORCED_LOGOUT".into()),
                    ..SecurityAuditFilter::default()
                },
                10,
            )
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::Warning);
    }
}

//! Key/value settings, the settings.json bootstrap, and the force-close
//! beacon.
//!
//! Settings live in the database so every client sees the same values. A
//! `settings.json` next to the database file seeds first-run defaults and is
//! rewritten after reconciliation; when both disagree the database wins.

use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::kernel::db::Db;
use crate::kernel::error::VaultError;
use crate::kernel::models::{ForceCloseBeacon, TS_FORMAT};
use crate::kernel::retry::{with_retry, RetryPolicy};

/// Settings key holding the force-close beacon JSON.
pub const FORCE_CLOSE_KEY: &str = "force_close";

/// Seeds settings from `settings.json` (database wins on conflict), then
/// rewrites the file so it mirrors the database. Runs once per open; a
/// broken file is logged and skipped, never fatal.
pub(crate) fn bootstrap(conn: &Connection, db_path: &Path) -> Result<(), VaultError> {
    let file = match db_path.parent() {
        Some(parent) => parent.join("settings.json"),
        None => return Ok(()),
    };

    if file.exists() {
        match std::fs::read_to_string(&file) {
            Ok(text) => match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(map)) => {
                    for (key, value) in map {
                        let stored = match value {
                            Value::String(s) => s,
                            other => other.to_string(),
                        };
                        conn.execute(
                            "INSERT OR IGNORE INTO settings(key, value) VALUES(?1, ?2)",
                            params![key, stored],
                        )
                        .map_err(|e| VaultError::Sqlite(format!("seed setting: {e}")))?;
                    }
                }
                Ok(_) => tracing::warn!(file = %file.display(), "settings.json is not an object; ignored"),
                Err(err) => tracing::warn!(%err, file = %file.display(), "unparseable settings.json; ignored"),
            },
            Err(err) => tracing::warn!(%err, "could not read settings.json"),
        }
    }

    // Mirror the database back out for the next fresh install.
    let mut map = serde_json::Map::new();
    let mut stmt = conn
        .prepare("SELECT key, value FROM settings ORDER BY key")
        .map_err(|e| VaultError::Sqlite(format!("list settings: {e}")))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })
        .map_err(|e| VaultError::Sqlite(format!("list settings: {e}")))?;
    for row in rows {
        let (key, value) = row.map_err(|e| VaultError::Sqlite(format!("list settings: {e}")))?;
        map.insert(key, value.map(Value::String).unwrap_or(Value::Null));
    }
    if !map.is_empty() {
        let text = serde_json::to_string_pretty(&Value::Object(map))
            .map_err(|e| VaultError::Config(format!("serialize settings: {e}")))?;
        if let Err(err) = std::fs::write(&file, text) {
            tracing::warn!(%err, "could not rewrite settings.json");
        }
    }
    Ok(())
}

impl Db {
    pub fn get_setting(&self, key: &str) -> Result<Option<String>, VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "read setting", || {
                conn.query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    [key],
                    |r| r.get(0),
                )
                .optional()
            })
        })
    }

    /// Raw write, used by the kernel itself (scheduler bookkeeping and the
    /// beacon). UI paths go through [Db::update_setting].
    pub(crate) fn set_setting(&self, key: &str, value: &str) -> Result<(), VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "write setting", || {
                conn.execute(
                    "INSERT OR REPLACE INTO settings(key, value) VALUES(?1, ?2)",
                    params![key, value],
                )?;
                Ok(())
            })
        })
    }

    /// Permission-guarded, audited setting write.
    pub fn update_setting(
        &self,
        acting_user: &str,
        key: &str,
        value: &str,
    ) -> Result<(), VaultError> {
        self.require_permission(acting_user, "settings")?;
        let old = self.get_setting(key)?;
        self.set_setting(key, value)?;
        self.log_action(
            acting_user,
            "UPDATE_SETTING",
            Some("settings"),
            Some(key),
            old.as_deref(),
            Some(value),
            None,
        )
    }

    /// Raises the force-close beacon. Clients poll [Db::check_force_close]
    /// (every 30 seconds is the expected cadence) and exit voluntarily;
    /// nothing here kills their connections.
    pub fn request_force_close(
        &self,
        acting_user: &str,
        message: &str,
    ) -> Result<(), VaultError> {
        self.require_permission(acting_user, "settings")?;
        let beacon = ForceCloseBeacon {
            active: true,
            requested_by: acting_user.to_string(),
            message: message.to_string(),
            timestamp: Utc::now().format(TS_FORMAT).to_string(),
        };
        let text = serde_json::to_string(&beacon)
            .map_err(|e| VaultError::Config(format!("serialize beacon: {e}")))?;
        self.set_setting(FORCE_CLOSE_KEY, &text)?;
        self.log_security_event(
            "FORCE_CLOSE_REQUESTED",
            Some(acting_user),
            Some(message),
            crate::kernel::models::Severity::Critical,
            None,
        )
    }

    pub fn clear_force_close(&self, acting_user: &str) -> Result<(), VaultError> {
        self.require_permission(acting_user, "settings")?;
        self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "clear force close", || {
                conn.execute("DELETE FROM settings WHERE key = ?1", [FORCE_CLOSE_KEY])?;
                Ok(())
            })
        })?;
        self.log_security_event(
            "FORCE_CLOSE_CLEARED",
            Some(acting_user),
            None,
            crate::kernel::models::Severity::Info,
            None,
        )
    }

    /// The current beacon, if raised. A malformed stored value reads as no
    /// beacon.
    pub fn check_force_close(&self) -> Result<Option<ForceCloseBeacon>, VaultError> {
        let stored = self.get_setting(FORCE_CLOSE_KEY)?;
        Ok(stored
            .and_then(|text| serde_json::from_str::<ForceCloseBeacon>(&text).ok())
            .filter(|beacon| beacon.active))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn settings_round_trip_and_guard() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path().join("vault.db")).unwrap();
        assert!(db.get_setting("backup_time").unwrap().is_none());
        db.update_setting("admin", "backup_time", "02:30").unwrap();
        assert_eq!(db.get_setting("backup_time").unwrap().as_deref(), Some("02:30"));

        db.create_user("admin", "clerk", "Clerk", crate::kernel::models::Role::User, Some("4829"))
            .unwrap();
        assert!(db.update_setting("clerk", "backup_time", "03:00").is_ok());

        db.set_user_permissions("admin", "clerk", &serde_json::json!({"employees": true}))
            .unwrap();
        assert!(db.update_setting("clerk", "backup_time", "03:30").is_err());
    }

    #[test]
    fn settings_json_seeds_but_database_wins() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("settings.json");
        std::fs::write(&file, r#"{"backup_time": "01:00", "retention_days": "30"}"#).unwrap();

        let path = dir.path().join("vault.db");
        {
            let db = Db::open(&path).unwrap();
            assert_eq!(db.get_setting("backup_time").unwrap().as_deref(), Some("01:00"));
            db.set_setting("backup_time", "04:00").unwrap();
        }
        // Stale file value must not override the database on reopen.
        std::fs::write(&file, r#"{"backup_time": "01:00"}"#).unwrap();
        let db = Db::open(&path).unwrap();
        assert_eq!(db.get_setting("backup_time").unwrap().as_deref(), Some("04:00"));

        // The file was rewritten to mirror the database.
        let text = std::fs::read_to_string(&file).unwrap();
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["backup_time"], "04:00");
        assert_eq!(parsed["retention_days"], "30");
    }

    #[test]
    fn force_close_beacon_lifecycle() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path().join("vault.db")).unwrap();
        assert!(db.check_force_close().unwrap().is_none());

        db.request_force_close("admin", "maintenance window").unwrap();
        let beacon = db.check_force_close().unwrap().unwrap();
        assert_eq!(beacon.requested_by, "admin");
        assert_eq!(beacon.message, "maintenance window");

        db.clear_force_close("admin").unwrap();
        assert!(db.check_force_close().unwrap().is_none());
    }

    #[test]
    fn garbage_beacon_reads_as_absent() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path().join("vault.db")).unwrap();
        db.set_setting(FORCE_CLOSE_KEY, "not json").unwrap();
        assert!(db.check_force_close().unwrap().is_none());
    }
}

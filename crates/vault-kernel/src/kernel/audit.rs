//! Two audit surfaces.
//!
//! `audit_log` is the plain who-did-what trail behind every mutating
//! operation. `security_audit` is append-only and hash-chained: each entry
//! hashes `timestamp|event_type|username|details|previous_hash` with SHA-256.
//! The first entry stores NULL for `previous_hash` and hashes over the
//! sentinel "GENESIS". Verification walks the whole chain and reports every
//! broken link.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::kernel::db::{local_host, Db};
use crate::kernel::error::VaultError;
use crate::kernel::models::{
    AuditLogEntry, ChainVerification, SecurityAuditEntry, SecurityAuditFilter, Severity,
    TS_FORMAT, TS_FORMAT_MICROS,
};
use crate::kernel::retry::{with_retry, RetryPolicy};

/// Chain anchor for the first security-audit entry.
pub const GENESIS_HASH: &str = "GENESIS";

fn chain_hash(
    timestamp: &str,
    event_type: &str,
    username: &str,
    details: &str,
    previous_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.as_bytes());
    hasher.update(b"|");
    hasher.update(event_type.as_bytes());
    hasher.update(b"|");
    hasher.update(username.as_bytes());
    hasher.update(b"|");
    hasher.update(details.as_bytes());
    hasher.update(b"|");
    hasher.update(previous_hash.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn last_entry_hash(conn: &Connection) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT entry_hash FROM security_audit ORDER BY id DESC LIMIT 1",
        [],
        |r| r.get(0),
    )
    .optional()
}

impl Db {
    /// Appends to the general audit trail.
    #[allow(clippy::too_many_arguments)]
    pub fn log_action(
        &self,
        username: &str,
        action: &str,
        table_name: Option<&str>,
        record_id: Option<&str>,
        old_value: Option<&str>,
        new_value: Option<&str>,
        details: Option<&str>,
    ) -> Result<(), VaultError> {
        let timestamp = Utc::now().format(TS_FORMAT).to_string();
        self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "log action", || {
                conn.execute(
                    "INSERT INTO audit_log
                         (timestamp, username, action, table_name, record_id,
                          old_value, new_value, details)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        timestamp, username, action, table_name, record_id, old_value,
                        new_value, details
                    ],
                )?;
                Ok(())
            })
        })
    }

    /// Recent audit entries, newest first, optionally narrowed by user and
    /// action.
    pub fn get_audit_log(
        &self,
        limit: usize,
        username: Option<&str>,
        action: Option<&str>,
    ) -> Result<Vec<AuditLogEntry>, VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "read audit log", || {
                let mut sql = String::from("SELECT * FROM audit_log WHERE 1=1");
                let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
                if let Some(user) = username {
                    sql.push_str(" AND username = ?");
                    args.push(Box::new(user.to_string()));
                }
                if let Some(act) = action {
                    sql.push_str(" AND action = ?");
                    args.push(Box::new(act.to_string()));
                }
                sql.push_str(" ORDER BY timestamp DESC, id DESC LIMIT ?");
                args.push(Box::new(limit as i64));

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(
                    rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                    AuditLogEntry::from_row,
                )?;
                rows.collect()
            })
        })
    }

    /// Every audit entry that touched one employee, oldest first.
    pub fn get_employee_history(&self, emp_id: &str) -> Result<Vec<AuditLogEntry>, VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "read employee history", || {
                let mut stmt = conn.prepare(
                    "SELECT * FROM audit_log
                     WHERE record_id = ?1 AND table_name IN ('employees', 'archived_employees')
                     ORDER BY timestamp, id",
                )?;
                let rows = stmt.query_map([emp_id], AuditLogEntry::from_row)?;
                rows.collect()
            })
        })
    }

    /// Appends a hash-chained security event. The insert reads the previous
    /// tail and writes the new entry in one retried critical section. The
    /// first entry stores NULL for `previous_hash`.
    pub fn log_security_event(
        &self,
        event_type: &str,
        username: Option<&str>,
        details: Option<&str>,
        severity: Severity,
        ip_address: Option<&str>,
    ) -> Result<(), VaultError> {
        let timestamp = Utc::now().format(TS_FORMAT_MICROS).to_string();
        let host = local_host();
        self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "log security event", || {
                let previous = last_entry_hash(conn)?;
                let entry_hash = chain_hash(
                    &timestamp,
                    event_type,
                    username.unwrap_or(""),
                    details.unwrap_or(""),
                    previous.as_deref().unwrap_or(GENESIS_HASH),
                );
                conn.execute(
                    "INSERT INTO security_audit
                         (timestamp, event_type, username, ip_address, computer_name,
                          details, severity, previous_hash, entry_hash)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        timestamp,
                        event_type,
                        username,
                        ip_address,
                        host,
                        details,
                        severity.as_str(),
                        previous,
                        entry_hash
                    ],
                )?;
                Ok(())
            })
        })
    }

    /// Walks the entire chain, re-deriving every hash. Any edit, delete, or
    /// reorder shows up as one or more issues.
    pub fn verify_security_audit_integrity(&self) -> Result<ChainVerification, VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "verify security audit", || {
                let mut stmt = conn.prepare(
                    "SELECT id, timestamp, event_type, username, details,
                            previous_hash, entry_hash
                     FROM security_audit ORDER BY id",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                })?;

                let mut issues = Vec::new();
                // The first row must store NULL and hash over the sentinel.
                let mut expected_previous: Option<String> = None;
                let mut total = 0usize;
                for row in rows {
                    let (id, ts, event_type, username, details, previous, entry_hash) = row?;
                    total += 1;
                    if previous != expected_previous {
                        issues.push(format!(
                            "entry {id}: chain break (expected previous {}, stored {})",
                            expected_previous.as_deref().unwrap_or("NULL"),
                            previous.as_deref().unwrap_or("NULL"),
                        ));
                    }
                    let recomputed = chain_hash(
                        &ts,
                        &event_type,
                        username.as_deref().unwrap_or(""),
                        details.as_deref().unwrap_or(""),
                        previous.as_deref().unwrap_or(GENESIS_HASH),
                    );
                    if recomputed != entry_hash {
                        issues.push(format!("entry {id}: content hash mismatch"));
                    }
                    expected_previous = Some(entry_hash);
                }
                Ok(ChainVerification {
                    valid: issues.is_empty(),
                    total_entries: total,
                    issues,
                })
            })
        })
    }

    /// Filtered security-audit query, newest first. A bare `YYYY-MM-DD` end
    /// date is inclusive through end of day.
    pub fn get_security_audit(
        &self,
        filter: &SecurityAuditFilter,
        limit: usize,
    ) -> Result<Vec<SecurityAuditEntry>, VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "read security audit", || {
                let mut sql = String::from("SELECT * FROM security_audit WHERE 1=1");
                let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
                if let Some(event_type) = &filter.event_type {
                    sql.push_str(" AND event_type = ?");
                    args.push(Box::new(event_type.clone()));
                }
                if let Some(username) = &filter.username {
                    sql.push_str(" AND username = ?");
                    args.push(Box::new(username.clone()));
                }
                if let Some(severity) = filter.severity {
                    sql.push_str(" AND severity = ?");
                    args.push(Box::new(severity.as_str().to_string()));
                }
                if let Some(start) = &filter.start_date {
                    sql.push_str(" AND timestamp >= ?");
                    args.push(Box::new(start.clone()));
                }
                if let Some(end) = &filter.end_date {
                    sql.push_str(" AND timestamp <= ?");
                    let end = if end.len() == 10 {
                        format!("{end} 23:59:59")
                    } else {
                        end.clone()
                    };
                    args.push(Box::new(end));
                }
                sql.push_str(" ORDER BY timestamp DESC, id DESC LIMIT ?");
                args.push(Box::new(limit as i64));

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(
                    rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                    SecurityAuditEntry::from_row,
                )?;
                rows.collect()
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_db(dir: &TempDir) -> Db {
        Db::open(dir.path().join("vault.db")).unwrap()
    }

    #[test]
    fn chain_starts_at_genesis_and_links() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        db.log_security_event("LOGIN_SUCCESS", Some("alice"), None, Severity::Info, None)
            .unwrap();
        db.log_security_event(
            "LOGIN_FAILED",
            Some("bob"),
            Some("bad pin"),
            Severity::Warning,
            Some("192.168.1.7"),
        )
        .unwrap();

        let entries = db
            .get_security_audit(&SecurityAuditFilter::default(), 10)
            .unwrap();
        assert_eq!(entries.len(), 2);
        // Newest first: the oldest entry stores no previous hash at all.
        assert_eq!(entries[1].previous_hash, None);
        assert_eq!(
            entries[0].previous_hash.as_deref(),
            Some(entries[1].entry_hash.as_str())
        );
        assert_eq!(entries[0].ip_address.as_deref(), Some("192.168.1.7"));

        let verification = db.verify_security_audit_integrity().unwrap();
        assert!(verification.valid, "{:?}", verification.issues);
        assert_eq!(verification.total_entries, 2);
    }

    #[test]
    fn tampering_breaks_verification() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        for i in 0..10 {
            db.log_security_event(
                "LOGIN_SUCCESS",
                Some(&format!("user{i}")),
                None,
                Severity::Info,
                None,
            )
            .unwrap();
        }
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE security_audit SET details = 'edited' WHERE id = 5",
                [],
            )
            .map_err(|e| VaultError::Sqlite(e.to_string()))
        })
        .unwrap();

        let verification = db.verify_security_audit_integrity().unwrap();
        assert!(!verification.valid);
        assert!(verification
            .issues
            .iter()
            .any(|issue| issue.contains("entry 5")));
    }

    #[test]
    fn deleting_an_entry_breaks_the_chain() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        for _ in 0..5 {
            db.log_security_event("BACKUP_CREATED", Some("admin"), None, Severity::Info, None)
                .unwrap();
        }
        db.with_conn(|conn| {
            conn.execute("DELETE FROM security_audit WHERE id = 3", [])
                .map_err(|e| VaultError::Sqlite(e.to_string()))
        })
        .unwrap();

        let verification = db.verify_security_audit_integrity().unwrap();
        assert!(!verification.valid);
        assert_eq!(verification.total_entries, 4);
    }

    #[test]
    fn audit_log_filters_by_user_and_action() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        db.log_action("alice", "INSERT", Some("employees"), Some("E-001-25"), None, None, None)
            .unwrap();
        db.log_action("bob", "UPDATE", Some("employees"), Some("E-001-25"), None, None, None)
            .unwrap();
        db.log_action("alice", "DELETE", Some("employees"), Some("E-002-25"), None, None, None)
            .unwrap();

        assert_eq!(db.get_audit_log(50, Some("alice"), None).unwrap().len(), 2);
        assert_eq!(db.get_audit_log(50, None, Some("UPDATE")).unwrap().len(), 1);
        let history = db.get_employee_history("E-001-25").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].action, "INSERT");
    }
}

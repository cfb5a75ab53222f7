//! Backup, restore, and database health checks.
//!
//! Plain backups are checkpointed file copies into `backups/`, pruned to the
//! newest ten. Encrypted backups are a `EVAULT_ENC_V1\n` header, a random
//! 12-byte nonce, then the AES-256-GCM ciphertext of the database file; the
//! key is PBKDF2-HMAC-SHA256 over the password with a fixed salt. Restore
//! always snapshots the current file first and swaps the live connection out
//! while the file is overwritten.

use std::path::{Path, PathBuf};

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::Utc;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

use crate::kernel::db::Db;
use crate::kernel::error::VaultError;
use crate::kernel::models::{DatabaseStats, Severity, TS_FORMAT_COMPACT};
use crate::kernel::retry::{with_retry, RetryPolicy};

/// Magic header on encrypted backup files.
pub const ENC_HEADER: &[u8] = b"EVAULT_ENC_V1\n";
/// Key-derivation salt. Fixed so any installation can decrypt any backup
/// given the password.
const KDF_SALT: &[u8] = b"EmployeeVault_Backup_Salt_v1";
const KDF_ITERATIONS: u32 = 100_000;
const NONCE_LEN: usize = 12;
/// Newest snapshots kept by the prune pass.
pub const KEEP_SNAPSHOTS: usize = 10;

const SQLITE_MAGIC: &[u8] = b"SQLite format 3\0";

fn derive_key(password: &str) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), KDF_SALT, KDF_ITERATIONS, &mut key);
    key
}

fn encrypt(password: &str, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
    let key = derive_key(password);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| VaultError::Backup(format!("init cipher: {e}")))?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| VaultError::Backup(format!("encrypt backup: {e}")))?;

    let mut out = Vec::with_capacity(ENC_HEADER.len() + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(ENC_HEADER);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt(password: &str, data: &[u8]) -> Result<Vec<u8>, VaultError> {
    if !data.starts_with(ENC_HEADER) {
        return Err(VaultError::Restore(
            "not an encrypted backup (missing header)".to_string(),
        ));
    }
    let body = &data[ENC_HEADER.len()..];
    if body.len() < NONCE_LEN {
        return Err(VaultError::Restore("truncated encrypted backup".to_string()));
    }
    let (nonce_bytes, ciphertext) = body.split_at(NONCE_LEN);
    let key = derive_key(password);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| VaultError::Restore(format!("init cipher: {e}")))?;
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| VaultError::Restore("Invalid password or corrupted backup".to_string()))
}

fn looks_like_sqlite(data: &[u8]) -> bool {
    data.starts_with(SQLITE_MAGIC)
}

impl Db {
    fn stamped_backup_path(&self, extension: &str) -> PathBuf {
        let stem = self
            .path()
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "vault".to_string());
        let stamp = Utc::now().format(TS_FORMAT_COMPACT);
        self.backups_dir()
            .join(format!("{stem}_backup_{stamp}.{extension}"))
    }

    /// Checkpoints and copies the database file to `target`. Shared by
    /// manual backup and the scheduler.
    pub(crate) fn copy_database_to(&self, target: &Path) -> Result<(), VaultError> {
        self.commit_and_checkpoint()?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(self.path(), target)?;
        Ok(())
    }

    /// Creates a plain backup and prunes old snapshots.
    pub fn create_backup(&self, acting_user: &str) -> Result<PathBuf, VaultError> {
        self.require_permission(acting_user, "backup_restore")?;
        let target = self.stamped_backup_path("db");
        self.copy_database_to(&target)?;
        self.prune_snapshots()?;
        tracing::info!(backup = %target.display(), "backup created");
        self.log_security_event(
            "BACKUP_CREATED",
            Some(acting_user),
            Some(&target.display().to_string()),
            Severity::Info,
            None,
        )?;
        Ok(target)
    }

    /// Creates an encrypted backup protected by `password`.
    pub fn create_encrypted_backup(
        &self,
        acting_user: &str,
        password: &str,
    ) -> Result<PathBuf, VaultError> {
        self.require_permission(acting_user, "backup_restore")?;
        if password.is_empty() {
            return Err(VaultError::Backup("password must not be empty".to_string()));
        }
        self.commit_and_checkpoint()?;
        let plaintext = std::fs::read(self.path())?;
        let payload = encrypt(password, &plaintext)?;

        let target = self.stamped_backup_path("db.enc");
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, payload)?;
        self.prune_snapshots()?;
        tracing::info!(backup = %target.display(), "encrypted backup created");
        self.log_security_event(
            "BACKUP_CREATED",
            Some(acting_user),
            Some(&format!("{} (encrypted)", target.display())),
            Severity::Info,
            None,
        )?;
        Ok(target)
    }

    /// Restores from a plain backup file after validating it is SQLite.
    pub fn restore_from_backup(
        &self,
        acting_user: &str,
        backup_path: &Path,
    ) -> Result<(), VaultError> {
        self.require_permission(acting_user, "backup_restore")?;
        let data = std::fs::read(backup_path)?;
        if !looks_like_sqlite(&data) {
            return Err(VaultError::Restore(
                "backup file is not a SQLite database".to_string(),
            ));
        }
        self.swap_in(&data)?;
        tracing::info!(source = %backup_path.display(), "database restored");
        self.log_security_event(
            "DATABASE_RESTORED",
            Some(acting_user),
            Some(&backup_path.display().to_string()),
            Severity::Critical,
            None,
        )
    }

    /// Decrypts and restores an encrypted backup. A wrong password and a
    /// corrupted file are indistinguishable by construction.
    pub fn restore_from_encrypted(
        &self,
        acting_user: &str,
        backup_path: &Path,
        password: &str,
    ) -> Result<(), VaultError> {
        self.require_permission(acting_user, "backup_restore")?;
        let data = std::fs::read(backup_path)?;
        let plaintext = decrypt(password, &data)?;
        if !looks_like_sqlite(&plaintext) {
            return Err(VaultError::Restore(
                "Invalid password or corrupted backup".to_string(),
            ));
        }
        self.swap_in(&plaintext)?;
        tracing::info!(source = %backup_path.display(), "database restored from encrypted backup");
        self.log_security_event(
            "DATABASE_RESTORED",
            Some(acting_user),
            Some(&format!("{} (encrypted)", backup_path.display())),
            Severity::Critical,
            None,
        )
    }

    /// Snapshots the current file, then overwrites it under a dropped
    /// connection.
    fn swap_in(&self, new_contents: &[u8]) -> Result<(), VaultError> {
        let stamp = Utc::now().format(TS_FORMAT_COMPACT);
        let snapshot = self.backups_dir().join(format!("pre_restore_{stamp}.db"));
        self.copy_database_to(&snapshot)?;
        tracing::info!(snapshot = %snapshot.display(), "pre-restore snapshot written");

        self.replace_connection(|path| {
            std::fs::write(path, new_contents)?;
            // Stale sidecars from the old file must not shadow the new one.
            for suffix in ["-wal", "-shm"] {
                let mut sidecar = path.as_os_str().to_owned();
                sidecar.push(suffix);
                let _ = std::fs::remove_file(PathBuf::from(sidecar));
            }
            Ok(())
        })
    }

    /// Verifies a backup is decryptable and structurally sound without
    /// touching the live database.
    pub fn test_backup_restore(
        &self,
        backup_path: &Path,
        password: Option<&str>,
    ) -> Result<(), VaultError> {
        let data = std::fs::read(backup_path)?;
        let plaintext = match password {
            Some(password) => decrypt(password, &data)?,
            None => data,
        };
        if !looks_like_sqlite(&plaintext) {
            return Err(VaultError::Restore(
                "backup does not contain a SQLite database".to_string(),
            ));
        }
        let scratch = std::env::temp_dir().join(format!(
            "vault_verify_{}.db",
            Utc::now().format(TS_FORMAT_COMPACT)
        ));
        std::fs::write(&scratch, &plaintext)?;
        let result = (|| {
            let conn = rusqlite::Connection::open(&scratch)
                .map_err(|e| VaultError::Restore(format!("open backup copy: {e}")))?;
            let verdict: String = conn
                .query_row("PRAGMA quick_check", [], |r| r.get(0))
                .map_err(|e| VaultError::Restore(format!("quick_check: {e}")))?;
            if verdict != "ok" {
                return Err(VaultError::Restore(format!(
                    "backup failed quick_check: {verdict}"
                )));
            }
            // Structural soundness is not enough; the core tables must answer.
            for table in ["employees", "users"] {
                let _count: i64 = conn
                    .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
                    .map_err(|e| VaultError::Restore(format!("read {table}: {e}")))?;
            }
            Ok(())
        })();
        let _ = std::fs::remove_file(&scratch);
        result
    }

    /// Deletes all but the newest [KEEP_SNAPSHOTS] stamped backup files.
    /// Pre-migration and pre-restore copies are left alone.
    pub fn prune_snapshots(&self) -> Result<usize, VaultError> {
        let dir = self.backups_dir();
        if !dir.is_dir() {
            return Ok(0);
        }
        let mut snapshots: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .map(|name| name.contains("_backup_"))
                        .unwrap_or(false)
            })
            .collect();
        // Stamps embed UTC time, so name order is age order.
        snapshots.sort();
        let mut removed = 0usize;
        while snapshots.len() > KEEP_SNAPSHOTS {
            let oldest = snapshots.remove(0);
            if let Err(err) = std::fs::remove_file(&oldest) {
                tracing::warn!(%err, file = %oldest.display(), "could not prune old backup");
            } else {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "pruned old backups");
        }
        Ok(removed)
    }

    /// Quick structural check.
    pub fn check_database_integrity(&self) -> Result<bool, VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "quick_check", || {
                let verdict: String =
                    conn.query_row("PRAGMA quick_check", [], |r| r.get(0))?;
                Ok(verdict == "ok")
            })
        })
    }

    /// Full check: integrity_check, foreign-key violations, required tables,
    /// orphaned attachments, and the unique government-ID indexes. Empty
    /// means healthy.
    pub fn verify_database_integrity(&self) -> Result<Vec<String>, VaultError> {
        const REQUIRED_TABLES: &[&str] = &[
            "employees",
            "archived_employees",
            "employee_files",
            "users",
            "user_permissions",
            "login_attempts",
            "audit_log",
            "security_audit",
            "record_locks",
            "settings",
            "agencies",
        ];
        self.with_conn(|conn| {
            let mut issues = with_retry(RetryPolicy::quick(), "integrity_check", || {
                let mut issues = Vec::new();
                let mut stmt = conn.prepare("PRAGMA integrity_check")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                for row in rows {
                    let line = row?;
                    if line != "ok" {
                        issues.push(line);
                    }
                }
                let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                for row in rows {
                    let (table, rowid) = row?;
                    issues.push(format!("foreign key violation in {table} at rowid {rowid}"));
                }
                for table in REQUIRED_TABLES {
                    let present: i64 = conn.query_row(
                        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name = ?1",
                        [table],
                        |r| r.get(0),
                    )?;
                    if present == 0 {
                        issues.push(format!("missing table: {table}"));
                    }
                }
                let orphans: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM employee_files f
                     WHERE NOT EXISTS (SELECT 1 FROM employees e WHERE e.emp_id = f.emp_id)
                       AND NOT EXISTS (SELECT 1 FROM archived_employees a WHERE a.emp_id = f.emp_id)",
                    [],
                    |r| r.get(0),
                )?;
                if orphans > 0 {
                    issues.push(format!(
                        "{orphans} employee file(s) reference no employee record"
                    ));
                }
                Ok(issues)
            })?;
            if !crate::kernel::schema::government_id_indexes_present(conn)? {
                issues.push(
                    "government ID unique indexes absent; duplicates are not being rejected"
                        .to_string(),
                );
            }
            Ok(issues)
        })
    }

    /// Aggregate counters for the maintenance screens.
    pub fn get_database_stats(&self) -> Result<DatabaseStats, VaultError> {
        let mut stats = self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "database stats", || {
                Ok(DatabaseStats {
                    total_employees: conn.query_row(
                        "SELECT COUNT(*) FROM employees",
                        [],
                        |r| r.get(0),
                    )?,
                    active_employees: conn.query_row(
                        "SELECT COUNT(*) FROM employees
                         WHERE resign_date IS NULL OR resign_date = ''",
                        [],
                        |r| r.get(0),
                    )?,
                    total_users: conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?,
                    total_agencies: conn.query_row(
                        "SELECT COUNT(*) FROM agencies",
                        [],
                        |r| r.get(0),
                    )?,
                    db_size_mb: 0.0,
                })
            })
        })?;
        let bytes = std::fs::metadata(self.path()).map(|m| m.len()).unwrap_or(0);
        stats.db_size_mb = (bytes as f64 / 1_048_576.0 * 100.0).round() / 100.0;
        Ok(stats)
    }

    /// Rebuilds the file to reclaim space.
    pub fn vacuum_database(&self, acting_user: &str) -> Result<(), VaultError> {
        self.require_permission(acting_user, "backup_restore")?;
        self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "vacuum", || {
                conn.execute_batch("VACUUM")?;
                Ok(())
            })
        })?;
        self.log_action(acting_user, "VACUUM", None, None, None, None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::models::EmployeeRecord;
    use tempfile::TempDir;

    fn open_db(dir: &TempDir) -> Db {
        Db::open(dir.path().join("vault.db")).unwrap()
    }

    fn sample(emp_id: &str) -> EmployeeRecord {
        EmployeeRecord {
            emp_id: emp_id.to_string(),
            name: "Alice Reyes".to_string(),
            hire_date: "2024-03-01".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn plain_backup_is_a_valid_database() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        db.add_employee("admin", &sample("E-001-25")).unwrap();
        let backup = db.create_backup("admin").unwrap();
        assert!(backup.exists());
        db.test_backup_restore(&backup, None).unwrap();
    }

    #[test]
    fn backup_without_core_tables_is_rejected() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        // A structurally sound SQLite file that is not one of ours.
        let stray = dir.path().join("stray.db");
        {
            let conn = rusqlite::Connection::open(&stray).unwrap();
            conn.execute("CREATE TABLE notes (id INTEGER PRIMARY KEY)", [])
                .unwrap();
        }
        let err = db.test_backup_restore(&stray, None).unwrap_err();
        assert!(matches!(err, VaultError::Restore(_)));
    }

    #[test]
    fn encrypted_round_trip_and_wrong_password() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        db.add_employee("admin", &sample("E-001-25")).unwrap();
        let backup = db.create_encrypted_backup("admin", "hunter2-strong").unwrap();

        // No plaintext leakage.
        let raw = std::fs::read(&backup).unwrap();
        assert!(raw.starts_with(ENC_HEADER));
        assert!(!raw.windows(SQLITE_MAGIC.len()).any(|w| w == SQLITE_MAGIC));

        db.delete_employee("admin", "E-001-25").unwrap();
        assert!(!db.employee_exists("E-001-25").unwrap());

        let err = db
            .restore_from_encrypted("admin", &backup, "wrong-password")
            .unwrap_err();
        assert!(matches!(err, VaultError::Restore(msg)
            if msg == "Invalid password or corrupted backup"));
        // Failed restore left the live data untouched.
        assert!(db.get_user("admin").unwrap().is_some());

        db.restore_from_encrypted("admin", &backup, "hunter2-strong")
            .unwrap();
        assert!(db.employee_exists("E-001-25").unwrap());
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let backup = db.create_encrypted_backup("admin", "hunter2-strong").unwrap();
        let mut raw = std::fs::read(&backup).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        std::fs::write(&backup, &raw).unwrap();

        let err = db.test_backup_restore(&backup, Some("hunter2-strong")).unwrap_err();
        assert!(matches!(err, VaultError::Restore(_)));
    }

    #[test]
    fn restore_from_plain_backup() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        db.add_employee("admin", &sample("E-001-25")).unwrap();
        let backup = db.create_backup("admin").unwrap();
        db.delete_employee("admin", "E-001-25").unwrap();

        db.restore_from_backup("admin", &backup).unwrap();
        assert!(db.employee_exists("E-001-25").unwrap());
        // The database keeps working after the connection swap.
        db.add_employee("admin", &sample("E-002-25")).unwrap();

        // A pre-restore snapshot was kept.
        let snapshots: Vec<_> = std::fs::read_dir(db.backups_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("pre_restore_"))
            .collect();
        assert_eq!(snapshots.len(), 1);
    }

    #[test]
    fn garbage_file_does_not_restore() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let bogus = dir.path().join("bogus.db");
        std::fs::write(&bogus, b"definitely not sqlite").unwrap();
        assert!(db.restore_from_backup("admin", &bogus).is_err());
    }

    #[test]
    fn prune_keeps_the_newest_ten() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let backups = db.backups_dir();
        std::fs::create_dir_all(&backups).unwrap();
        for i in 0..15 {
            std::fs::write(
                backups.join(format!("vault_backup_202508{:02}_120000.db", i + 1)),
                b"stub",
            )
            .unwrap();
        }
        // Unrelated files are not prune candidates.
        std::fs::write(backups.join("pre_restore_20250801_120000.db"), b"stub").unwrap();

        let removed = db.prune_snapshots().unwrap();
        assert_eq!(removed, 5);
        let remaining: Vec<_> = std::fs::read_dir(&backups)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("_backup_"))
            .collect();
        assert_eq!(remaining.len(), KEEP_SNAPSHOTS);
    }

    #[test]
    fn integrity_and_stats() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        db.add_employee("admin", &sample("E-001-25")).unwrap();
        let mut resigned = sample("E-002-25");
        resigned.resign_date = Some("2025-01-31".to_string());
        db.add_employee("admin", &resigned).unwrap();

        assert!(db.check_database_integrity().unwrap());
        assert!(db.verify_database_integrity().unwrap().is_empty());

        let stats = db.get_database_stats().unwrap();
        assert_eq!(stats.total_employees, 2);
        assert_eq!(stats.active_employees, 1);
        assert_eq!(stats.total_users, 1);
        assert_eq!(stats.total_agencies, 6);
        assert!(stats.db_size_mb > 0.0);

        db.vacuum_database("admin").unwrap();
    }
}

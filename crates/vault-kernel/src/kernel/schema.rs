//! Schema declaration and the forward-only migration ladder.
//!
//! `ensure_schema` is idempotent: CREATE IF NOT EXISTS for every table and
//! index, introspect-then-act column additions for fields that arrived after
//! the first release, and seed data (agencies, the default admin). The
//! version ladder copies the file into `backups/` before applying anything.
//! Every step runs inside its own error boundary: a failed step logs and the
//! kernel continues with the partially-migrated schema rather than refusing
//! to start.

use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection};

use crate::kernel::auth::{default_permissions, hash_pin};
use crate::kernel::error::VaultError;
use crate::kernel::models::{Role, TS_FORMAT_COMPACT};

/// Current schema version. v8 added the record_locks table.
pub const TARGET_VERSION: i64 = 8;

/// Reference agencies seeded into an empty database.
pub const SEED_AGENCIES: &[&str] = &[
    "SUN WU",
    "PEOPLES LINK",
    "TDEVS",
    "VITASTAR",
    "MHAX RADIANT",
    "NEXUS",
];

/// Weak-credential default for the seeded admin. There is no interactive
/// setup step, so the row ships with `pin_change_required=1` and the first
/// login forces a PIN change.
pub const DEFAULT_ADMIN_PIN: &str = "123456";

const DEFAULT_EXCUSE_TEMPLATE: &str = "[DATE]

The Store Manager
[COMPANY_NAME]
[BRANCH_NAME]
[ADDRESS]

Dear Sir/Madam,


This is to inform you that [EMPLOYEE_NAME] was unable to report for work on [LETTER_DATE] due to [REASON].

We kindly request your understanding regarding this matter.

Thank you for your consideration.

Respectfully yours,

[SUPERVISOR_NAME]
[SUPERVISOR_TITLE]
";

fn schema_err(context: &str, err: rusqlite::Error) -> VaultError {
    VaultError::Sqlite(format!("{context}: {err}"))
}

/// Creates every table and index, adds late-arrival columns, and seeds
/// reference data. Safe to run on every open.
pub fn ensure_schema(conn: &Connection) -> Result<(), VaultError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users(
            username TEXT PRIMARY KEY,
            password TEXT,
            pin TEXT,
            pin_change_required INTEGER DEFAULT 1,
            role TEXT NOT NULL DEFAULT 'user',
            name TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS employees(
            emp_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT,
            phone TEXT,
            department TEXT,
            position TEXT,
            hire_date TEXT NOT NULL,
            resign_date TEXT,
            salary REAL,
            notes TEXT,
            modified TEXT,
            modified_by TEXT,
            contract_expiry TEXT,
            agency TEXT,
            sss_number TEXT,
            emergency_contact_name TEXT,
            emergency_contact_phone TEXT
        );
        CREATE TABLE IF NOT EXISTS employee_files(
            emp_id TEXT NOT NULL,
            filename TEXT NOT NULL,
            added_at TEXT NOT NULL,
            PRIMARY KEY(emp_id, filename),
            FOREIGN KEY(emp_id) REFERENCES employees(emp_id) ON DELETE CASCADE
        );
        CREATE TABLE IF NOT EXISTS agencies(name TEXT PRIMARY KEY);
        CREATE TABLE IF NOT EXISTS audit_log(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            username TEXT NOT NULL,
            action TEXT NOT NULL,
            table_name TEXT,
            record_id TEXT,
            old_value TEXT,
            new_value TEXT,
            details TEXT
        );
        CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT
        );
        CREATE TABLE IF NOT EXISTS login_attempts(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL,
            attempt_time TEXT NOT NULL,
            success INTEGER NOT NULL DEFAULT 0,
            ip_address TEXT
        );
        CREATE TABLE IF NOT EXISTS archived_employees(
            emp_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT,
            phone TEXT,
            department TEXT,
            position TEXT,
            hire_date TEXT NOT NULL,
            resign_date TEXT,
            salary REAL,
            notes TEXT,
            modified TEXT,
            modified_by TEXT,
            contract_expiry TEXT,
            agency TEXT,
            sss_number TEXT,
            emergency_contact_name TEXT,
            emergency_contact_phone TEXT,
            contract_start_date TEXT,
            contract_months INTEGER,
            tin_number TEXT,
            pagibig_number TEXT,
            philhealth_number TEXT,
            archived_date TEXT NOT NULL,
            archived_by TEXT NOT NULL,
            archive_reason TEXT
        );
        CREATE TABLE IF NOT EXISTS user_permissions(
            username TEXT PRIMARY KEY,
            permissions TEXT NOT NULL,
            FOREIGN KEY(username) REFERENCES users(username) ON DELETE CASCADE
        );
        CREATE TABLE IF NOT EXISTS stores(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            company_name TEXT NOT NULL,
            branch_name TEXT NOT NULL,
            address TEXT,
            active INTEGER DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );
        CREATE TABLE IF NOT EXISTS letter_templates(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            template_type TEXT,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            modified_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );
        CREATE TABLE IF NOT EXISTS letter_history(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            employee_id TEXT,
            letter_type TEXT,
            letter_date TEXT,
            store_id INTEGER,
            reason TEXT,
            supervisor_name TEXT,
            supervisor_title TEXT,
            file_path TEXT,
            created_by TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            FOREIGN KEY(employee_id) REFERENCES employees(emp_id) ON DELETE CASCADE,
            FOREIGN KEY(store_id) REFERENCES stores(id) ON DELETE SET NULL
        );
        CREATE TABLE IF NOT EXISTS active_sessions(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT,
            login_time TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            last_activity TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            ip_address TEXT,
            computer_name TEXT
        );
        CREATE TABLE IF NOT EXISTS db_version(
            version INTEGER PRIMARY KEY,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );
        CREATE TABLE IF NOT EXISTS record_locks(
            record_id TEXT PRIMARY KEY,
            locked_by TEXT NOT NULL,
            locked_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            computer_name TEXT,
            lock_expires_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS security_audit(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            username TEXT,
            ip_address TEXT,
            computer_name TEXT,
            details TEXT,
            severity TEXT DEFAULT 'INFO',
            previous_hash TEXT,
            entry_hash TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_emp_name ON employees(name);
        CREATE INDEX IF NOT EXISTS idx_emp_department ON employees(department);
        CREATE INDEX IF NOT EXISTS idx_emp_position ON employees(position);
        CREATE INDEX IF NOT EXISTS idx_emp_hire_date ON employees(hire_date);
        CREATE INDEX IF NOT EXISTS idx_emp_contract ON employees(contract_expiry);
        CREATE INDEX IF NOT EXISTS idx_emp_dept_status ON employees(department, resign_date);
        CREATE INDEX IF NOT EXISTS idx_emp_agency_status ON employees(agency, resign_date);
        CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp DESC);
        CREATE INDEX IF NOT EXISTS idx_audit_username ON audit_log(username, timestamp);
        CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_log(action, timestamp);
        CREATE INDEX IF NOT EXISTS idx_login_attempts_username ON login_attempts(username, attempt_time);
        CREATE INDEX IF NOT EXISTS idx_letter_history_employee ON letter_history(employee_id);
        CREATE INDEX IF NOT EXISTS idx_letter_history_date ON letter_history(letter_date);
        CREATE INDEX IF NOT EXISTS idx_active_sessions_username ON active_sessions(username);
        CREATE INDEX IF NOT EXISTS idx_record_locks_locked_by ON record_locks(locked_by);
        CREATE INDEX IF NOT EXISTS idx_record_locks_expires ON record_locks(lock_expires_at);
        CREATE INDEX IF NOT EXISTS idx_security_audit_timestamp ON security_audit(timestamp);
        CREATE INDEX IF NOT EXISTS idx_security_audit_event_type ON security_audit(event_type);
        CREATE INDEX IF NOT EXISTS idx_security_audit_username ON security_audit(username);
        "#,
    )
    .map_err(|e| schema_err("ensure schema", e))?;

    // Columns added after the first release. Old files pick them up here.
    add_column_if_missing(conn, "employees", "contract_start_date", "TEXT")?;
    add_column_if_missing(conn, "employees", "contract_months", "INTEGER")?;
    add_column_if_missing(conn, "employees", "tin_number", "TEXT")?;
    add_column_if_missing(conn, "employees", "pagibig_number", "TEXT")?;
    add_column_if_missing(conn, "employees", "philhealth_number", "TEXT")?;
    add_column_if_missing(conn, "employee_files", "file_type", "TEXT DEFAULT 'document'")?;

    seed_agencies(conn)?;
    seed_default_admin(conn)?;
    Ok(())
}

/// Introspects the table and adds the column only when it is missing.
pub fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    column_def: &str,
) -> Result<(), VaultError> {
    if table_columns(conn, table)?.iter().any(|c| c == column) {
        return Ok(());
    }
    let alter = format!("ALTER TABLE {table} ADD COLUMN {column} {column_def}");
    conn.execute(&alter, [])
        .map_err(|e| schema_err(&format!("add column {table}.{column}"), e))?;
    tracing::info!(table, column, "added missing column");
    Ok(())
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, VaultError> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = conn
        .prepare(&pragma)
        .map_err(|e| schema_err(&format!("table_info {table}"), e))?;
    let cols = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|e| schema_err(&format!("table_info {table}"), e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| schema_err(&format!("table_info {table}"), e))?;
    Ok(cols)
}

fn seed_agencies(conn: &Connection) -> Result<(), VaultError> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM agencies", [], |r| r.get(0))
        .map_err(|e| schema_err("count agencies", e))?;
    if count == 0 {
        for agency in SEED_AGENCIES {
            conn.execute("INSERT OR IGNORE INTO agencies(name) VALUES(?1)", [agency])
                .map_err(|e| schema_err("seed agencies", e))?;
        }
        tracing::info!(count = SEED_AGENCIES.len(), "seeded default agencies");
    }
    Ok(())
}

/// Seeds the default admin when the users table is empty.
fn seed_default_admin(conn: &Connection) -> Result<(), VaultError> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
        .map_err(|e| schema_err("count users", e))?;
    if count == 0 {
        let pin_hash = hash_pin(DEFAULT_ADMIN_PIN)?;
        conn.execute(
            "INSERT INTO users(username, password, pin, pin_change_required, role, name)
             VALUES(?1, NULL, ?2, 1, 'admin', 'Administrator')",
            params!["admin", pin_hash],
        )
        .map_err(|e| schema_err("seed default admin", e))?;
        tracing::info!("created default admin (PIN must be changed on first login)");
    }
    Ok(())
}

/// Idempotent password-to-PIN migration; runs on every open.
///
/// Legacy files declared `password TEXT NOT NULL`, which blocks creating
/// PIN-only users; such tables are rebuilt via copy-and-rename first.
pub fn migrate_password_to_pin(conn: &Connection) -> Result<(), VaultError> {
    let password_not_null: bool = {
        let mut stmt = conn
            .prepare("PRAGMA table_info(users)")
            .map_err(|e| schema_err("table_info users", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(1)?, row.get::<_, i64>(3)?))
            })
            .map_err(|e| schema_err("table_info users", e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| schema_err("table_info users", e))?;
        rows.iter().any(|(name, notnull)| name == "password" && *notnull != 0)
    };

    if password_not_null {
        tracing::info!("rebuilding users table to drop NOT NULL on password");
        let has_pin = table_columns(conn, "users")?.iter().any(|c| c == "pin");
        let copy_sql = if has_pin {
            "INSERT INTO users_new(username, password, pin, pin_change_required, role, name)
             SELECT username, password, pin, COALESCE(pin_change_required, 1), role, name FROM users"
        } else {
            "INSERT INTO users_new(username, password, pin, pin_change_required, role, name)
             SELECT username, password, NULL, 1, role, name FROM users"
        };
        conn.execute_batch(&format!(
            "BEGIN;
             CREATE TABLE users_new(
                 username TEXT PRIMARY KEY,
                 password TEXT,
                 pin TEXT,
                 pin_change_required INTEGER DEFAULT 1,
                 role TEXT NOT NULL DEFAULT 'user',
                 name TEXT NOT NULL
             );
             {copy_sql};
             DROP TABLE users;
             ALTER TABLE users_new RENAME TO users;
             COMMIT;"
        ))
        .map_err(|e| schema_err("rebuild users table", e))?;
    }

    add_column_if_missing(conn, "users", "pin", "TEXT")?;
    add_column_if_missing(conn, "users", "pin_change_required", "INTEGER DEFAULT 1")?;

    // Anyone still on a legacy password must set a PIN at next login.
    conn.execute(
        "UPDATE users SET pin_change_required = 1 WHERE password IS NOT NULL AND pin IS NULL",
        [],
    )
    .map_err(|e| schema_err("flag legacy users for pin setup", e))?;

    seed_default_admin(conn)
}

/// Reads the current schema version (0 when the version table is empty).
pub fn current_version(conn: &Connection) -> Result<i64, VaultError> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM db_version", [], |r| {
        r.get(0)
    })
    .map_err(|e| schema_err("read schema version", e))
}

/// Applies the version ladder. Copies the file into `backups_dir` before the
/// first step. Individual step failures log and do not abort.
pub fn run_migrations(
    conn: &Connection,
    db_path: &Path,
    backups_dir: &Path,
) -> Result<(), VaultError> {
    let current = current_version(conn)?;
    if current >= TARGET_VERSION {
        return Ok(());
    }
    tracing::info!(from = current, to = TARGET_VERSION, "migrating database");

    // A fresh file has nothing worth copying.
    if current > 0 && db_path.exists() {
        if let Err(err) = backup_before_migration(db_path, backups_dir, current) {
            tracing::warn!(%err, "could not create pre-migration backup");
        }
    }

    if current < 1 {
        // v1: placeholder, nothing to do.
    }
    if current < 2 {
        if let Err(err) = migrate_to_v2(conn) {
            tracing::error!(%err, "v2 migration step failed");
        }
    }
    if current < 7 {
        if let Err(err) = migrate_to_v7(conn) {
            tracing::error!(%err, "v7 migration step failed");
        }
    }

    conn.execute(
        "INSERT OR REPLACE INTO db_version(version) VALUES(?1)",
        [TARGET_VERSION],
    )
    .map_err(|e| schema_err("bump schema version", e))?;
    tracing::info!(version = TARGET_VERSION, "database migration completed");
    Ok(())
}

fn backup_before_migration(
    db_path: &Path,
    backups_dir: &Path,
    current: i64,
) -> Result<(), VaultError> {
    std::fs::create_dir_all(backups_dir)?;
    let stamp = Utc::now().format(TS_FORMAT_COMPACT);
    let target = backups_dir.join(format!("auto_migration_v{current}_{stamp}.db"));
    std::fs::copy(db_path, &target)?;
    tracing::info!(backup = %target.display(), "created pre-migration backup");
    Ok(())
}

/// v2: role-default permission rows plus the default excuse-letter template.
fn migrate_to_v2(conn: &Connection) -> Result<(), VaultError> {
    let users: Vec<(String, String)> = {
        let mut stmt = conn
            .prepare("SELECT username, role FROM users")
            .map_err(|e| schema_err("v2 list users", e))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| schema_err("v2 list users", e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| schema_err("v2 list users", e))?;
        rows
    };
    for (username, role) in users {
        let perms = serde_json::to_string(&default_permissions(Role::parse(&role)))
            .map_err(|e| VaultError::Config(format!("serialize permissions: {e}")))?;
        conn.execute(
            "INSERT OR REPLACE INTO user_permissions(username, permissions) VALUES(?1, ?2)",
            params![username, perms],
        )
        .map_err(|e| schema_err("v2 seed permissions", e))?;
    }

    let templates: i64 = conn
        .query_row("SELECT COUNT(*) FROM letter_templates", [], |r| r.get(0))
        .map_err(|e| schema_err("v2 count templates", e))?;
    if templates == 0 {
        conn.execute(
            "INSERT INTO letter_templates(name, template_type, content) VALUES(?1, ?2, ?3)",
            params!["Default Excuse Letter", "excuse", DEFAULT_EXCUSE_TEMPLATE],
        )
        .map_err(|e| schema_err("v2 seed template", e))?;
    }
    tracing::info!("v2 migration completed: permissions and templates seeded");
    Ok(())
}

/// The four government-ID columns protected by v7's partial unique indexes.
const GOVERNMENT_ID_COLUMNS: &[(&str, &str)] = &[
    ("sss_number", "idx_unique_sss"),
    ("tin_number", "idx_unique_tin"),
    ("pagibig_number", "idx_unique_pagibig"),
    ("philhealth_number", "idx_unique_philhealth"),
];

/// v7: partial unique indexes over non-empty government IDs.
///
/// When duplicates already exist the indexes are skipped (the version still
/// advances — documented behavior until the operator resolves duplicates and
/// calls [retry_v7]).
fn migrate_to_v7(conn: &Connection) -> Result<(), VaultError> {
    let mut duplicates = Vec::new();
    for (column, _) in GOVERNMENT_ID_COLUMNS {
        let count = duplicate_count(conn, column)?;
        if count > 0 {
            duplicates.push(format!("{column}: {count} duplicates"));
        }
    }

    if !duplicates.is_empty() {
        tracing::warn!(
            duplicates = %duplicates.join(", "),
            "duplicate government IDs found; unique constraints NOT added. \
             Resolve duplicates and run retry_v7"
        );
        return Ok(());
    }

    create_government_id_indexes(conn)?;
    tracing::info!("v7 migration completed: unique constraints added for government IDs");
    Ok(())
}

fn duplicate_count(conn: &Connection, column: &str) -> Result<i64, VaultError> {
    let sql = format!(
        "SELECT COUNT(*) FROM (
             SELECT {column} FROM employees
             WHERE {column} IS NOT NULL AND {column} != ''
             GROUP BY {column} HAVING COUNT(*) > 1
         )"
    );
    conn.query_row(&sql, [], |r| r.get(0))
        .map_err(|e| schema_err(&format!("v7 duplicate scan {column}"), e))
}

fn create_government_id_indexes(conn: &Connection) -> Result<(), VaultError> {
    for (column, index) in GOVERNMENT_ID_COLUMNS {
        let sql = format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {index}
             ON employees({column})
             WHERE {column} IS NOT NULL AND {column} != ''"
        );
        conn.execute(&sql, [])
            .map_err(|e| schema_err(&format!("create {index}"), e))?;
    }
    Ok(())
}

/// Operator entry point: retries the v7 index creation after duplicates have
/// been cleaned up. Fails with the duplicate counts when any remain.
pub fn retry_v7(conn: &Connection) -> Result<(), VaultError> {
    let mut remaining = Vec::new();
    for (column, _) in GOVERNMENT_ID_COLUMNS {
        let count = duplicate_count(conn, column)?;
        if count > 0 {
            remaining.push(format!("{column}: {count}"));
        }
    }
    if !remaining.is_empty() {
        return Err(VaultError::Integrity {
            field: "government ids".to_string(),
            message: format!("duplicates remain: {}", remaining.join(", ")),
        });
    }
    create_government_id_indexes(conn)?;
    tracing::info!("government-ID unique indexes created by retry_v7");
    Ok(())
}

/// True when all four partial unique indexes exist.
pub fn government_id_indexes_present(conn: &Connection) -> Result<bool, VaultError> {
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type='index' AND name LIKE 'idx_unique_%'")
        .map_err(|e| schema_err("list indexes", e))?;
    let names: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .map_err(|e| schema_err("list indexes", e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| schema_err("list indexes", e))?;
    Ok(GOVERNMENT_ID_COLUMNS
        .iter()
        .all(|(_, index)| names.iter().any(|n| n == index)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        ensure_schema(&conn).unwrap();
        migrate_password_to_pin(&conn).unwrap();
        conn
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = fresh_conn();
        ensure_schema(&conn).unwrap();
        migrate_password_to_pin(&conn).unwrap();
        let admins: i64 = conn
            .query_row("SELECT COUNT(*) FROM users WHERE role='admin'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(admins, 1);
    }

    #[test]
    fn legacy_not_null_password_table_is_rebuilt() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE users(
                 username TEXT PRIMARY KEY,
                 password TEXT NOT NULL,
                 role TEXT NOT NULL DEFAULT 'user',
                 name TEXT NOT NULL
             );
             INSERT INTO users(username, password, role, name)
             VALUES('old_admin', 'legacy-hash', 'admin', 'Old Admin');",
        )
        .unwrap();
        migrate_password_to_pin(&conn).unwrap();

        // NOT NULL dropped, pin columns added, legacy user flagged.
        conn.execute(
            "INSERT INTO users(username, password, pin, role, name)
             VALUES('pin_only', NULL, 'hash', 'user', 'Pin Only')",
            [],
        )
        .unwrap();
        let flagged: i64 = conn
            .query_row(
                "SELECT pin_change_required FROM users WHERE username='old_admin'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(flagged, 1);
    }

    #[test]
    fn v7_skips_indexes_when_duplicates_exist() {
        let conn = fresh_conn();
        for (id, name) in [("E-001-25", "A"), ("E-002-25", "B")] {
            conn.execute(
                "INSERT INTO employees(emp_id, name, hire_date, sss_number)
                 VALUES(?1, ?2, '2024-01-01', '12-3456789-0')",
                params![id, name],
            )
            .unwrap();
        }
        migrate_to_v7(&conn).unwrap();
        assert!(!government_id_indexes_present(&conn).unwrap());

        // Duplicates still insertable: documented until retry_v7.
        conn.execute(
            "INSERT INTO employees(emp_id, name, hire_date, sss_number)
             VALUES('E-003-25', 'C', '2024-01-01', '12-3456789-0')",
            [],
        )
        .unwrap();
        assert!(retry_v7(&conn).is_err());
    }

    #[test]
    fn v7_creates_indexes_on_clean_data() {
        let conn = fresh_conn();
        migrate_to_v7(&conn).unwrap();
        assert!(government_id_indexes_present(&conn).unwrap());
        conn.execute(
            "INSERT INTO employees(emp_id, name, hire_date, sss_number)
             VALUES('E-001-25', 'A', '2024-01-01', '12-3456789-0')",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO employees(emp_id, name, hire_date, sss_number)
             VALUES('E-002-25', 'B', '2024-01-01', '12-3456789-0')",
            [],
        );
        assert!(dup.is_err());
        // Empty IDs stay outside the partial index.
        conn.execute(
            "INSERT INTO employees(emp_id, name, hire_date, sss_number)
             VALUES('E-003-25', 'C', '2024-01-01', '')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO employees(emp_id, name, hire_date, sss_number)
             VALUES('E-004-25', 'D', '2024-01-01', '')",
            [],
        )
        .unwrap();
    }
}

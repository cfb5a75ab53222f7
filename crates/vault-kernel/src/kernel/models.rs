//! Typed rows for every table, plus the str codecs for roles, severities,
//! and file types. This module is the single row-to-struct translation
//! boundary; SQL text lives with the operations that run it.

use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// Timestamp format used for all stored timestamps (UTC).
pub const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Security-audit timestamps carry microseconds for strict ordering.
pub const TS_FORMAT_MICROS: &str = "%Y-%m-%d %H:%M:%S%.6f";
/// Compact stamp embedded in backup and corrupted-file names.
pub const TS_FORMAT_COMPACT: &str = "%Y%m%d_%H%M%S";

/// User role. Admins bypass the permission map entirely.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }

    /// Unknown strings fall back to the unprivileged role.
    pub fn parse(value: &str) -> Role {
        match value {
            "admin" => Role::Admin,
            _ => Role::User,
        }
    }
}

/// Security-audit severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        }
    }

    pub fn parse(value: &str) -> Severity {
        match value {
            "WARNING" => Severity::Warning,
            "ERROR" => Severity::Error,
            "CRITICAL" => Severity::Critical,
            _ => Severity::Info,
        }
    }
}

/// Employee-file classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    Document,
    Photo,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Document => "document",
            FileType::Photo => "photo",
        }
    }

    pub fn parse(value: &str) -> FileType {
        match value {
            "photo" => FileType::Photo,
            _ => FileType::Document,
        }
    }
}

/// A row in `users`. `password` is the legacy hash kept through the PIN
/// migration; `pin` is the current credential.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    pub password: Option<String>,
    pub pin: Option<String>,
    pub pin_change_required: bool,
    pub role: Role,
    pub name: String,
}

impl UserRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
        Ok(UserRecord {
            username: row.get("username")?,
            password: row.get("password")?,
            pin: row.get("pin")?,
            pin_change_required: row.get::<_, i64>("pin_change_required")? != 0,
            role: Role::parse(&row.get::<_, String>("role")?),
            name: row.get("name")?,
        })
    }
}

/// A row in `employees` (and, with the archive trailer, `archived_employees`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EmployeeRecord {
    pub emp_id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub department: Option<String>,
    pub position: Option<String>,
    pub hire_date: String,
    pub resign_date: Option<String>,
    pub salary: f64,
    pub notes: Option<String>,
    pub modified: Option<String>,
    pub modified_by: Option<String>,
    pub contract_expiry: Option<String>,
    pub agency: Option<String>,
    pub sss_number: Option<String>,
    pub emergency_contact_name: Option<String>,
    pub emergency_contact_phone: Option<String>,
    pub contract_start_date: Option<String>,
    pub contract_months: Option<i64>,
    pub tin_number: Option<String>,
    pub pagibig_number: Option<String>,
    pub philhealth_number: Option<String>,
}

impl EmployeeRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<EmployeeRecord> {
        Ok(EmployeeRecord {
            emp_id: row.get("emp_id")?,
            name: row.get("name")?,
            email: row.get("email")?,
            phone: row.get("phone")?,
            department: row.get("department")?,
            position: row.get("position")?,
            hire_date: row.get("hire_date")?,
            resign_date: row.get("resign_date")?,
            salary: row.get::<_, Option<f64>>("salary")?.unwrap_or(0.0),
            notes: row.get("notes")?,
            modified: row.get("modified")?,
            modified_by: row.get("modified_by")?,
            contract_expiry: row.get("contract_expiry")?,
            agency: row.get("agency")?,
            sss_number: row.get("sss_number")?,
            emergency_contact_name: row.get("emergency_contact_name")?,
            emergency_contact_phone: row.get("emergency_contact_phone")?,
            contract_start_date: row.get("contract_start_date")?,
            contract_months: row.get("contract_months")?,
            tin_number: row.get("tin_number")?,
            pagibig_number: row.get("pagibig_number")?,
            philhealth_number: row.get("philhealth_number")?,
        })
    }
}

/// An archived employee: the full employee row plus the archive trailer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchivedEmployeeRecord {
    pub employee: EmployeeRecord,
    pub archived_date: String,
    pub archived_by: String,
    pub archive_reason: Option<String>,
}

impl ArchivedEmployeeRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<ArchivedEmployeeRecord> {
        Ok(ArchivedEmployeeRecord {
            employee: EmployeeRecord::from_row(row)?,
            archived_date: row.get("archived_date")?,
            archived_by: row.get("archived_by")?,
            archive_reason: row.get("archive_reason")?,
        })
    }
}

/// Search + filter set for employee listings. All fields combine with AND.
#[derive(Clone, Debug, Default)]
pub struct EmployeeFilter {
    /// Matched with LIKE against emp_id and name.
    pub search: Option<String>,
    pub department: Option<String>,
    pub agency: Option<String>,
    pub active_only: bool,
    pub resigned_only: bool,
}

/// A row in `employee_files`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmployeeFileRecord {
    pub emp_id: String,
    pub filename: String,
    pub added_at: String,
    pub file_type: FileType,
}

impl EmployeeFileRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<EmployeeFileRecord> {
        Ok(EmployeeFileRecord {
            emp_id: row.get("emp_id")?,
            filename: row.get("filename")?,
            added_at: row.get("added_at")?,
            file_type: FileType::parse(
                &row.get::<_, Option<String>>("file_type")?.unwrap_or_default(),
            ),
        })
    }
}

/// A row in `stores`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreRecord {
    pub id: i64,
    pub company_name: String,
    pub branch_name: String,
    pub address: Option<String>,
    pub active: bool,
    pub created_at: String,
}

impl StoreRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<StoreRecord> {
        Ok(StoreRecord {
            id: row.get("id")?,
            company_name: row.get("company_name")?,
            branch_name: row.get("branch_name")?,
            address: row.get("address")?,
            active: row.get::<_, i64>("active")? != 0,
            created_at: row.get("created_at")?,
        })
    }
}

/// A row in `letter_templates`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LetterTemplateRecord {
    pub id: i64,
    pub name: String,
    pub template_type: Option<String>,
    pub content: String,
    pub created_at: String,
    pub modified_at: String,
}

impl LetterTemplateRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<LetterTemplateRecord> {
        Ok(LetterTemplateRecord {
            id: row.get("id")?,
            name: row.get("name")?,
            template_type: row.get("template_type")?,
            content: row.get("content")?,
            created_at: row.get("created_at")?,
            modified_at: row.get("modified_at")?,
        })
    }
}

/// Input for appending to `letter_history`.
#[derive(Clone, Debug, Default)]
pub struct LetterHistoryInput {
    pub employee_id: String,
    pub letter_type: String,
    pub letter_date: String,
    pub store_id: Option<i64>,
    pub reason: Option<String>,
    pub supervisor_name: Option<String>,
    pub supervisor_title: Option<String>,
    pub file_path: Option<String>,
    pub created_by: String,
}

/// A `letter_history` row joined with its store names.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LetterHistoryRecord {
    pub id: i64,
    pub employee_id: Option<String>,
    pub letter_type: Option<String>,
    pub letter_date: Option<String>,
    pub store_id: Option<i64>,
    pub reason: Option<String>,
    pub supervisor_name: Option<String>,
    pub supervisor_title: Option<String>,
    pub file_path: Option<String>,
    pub created_by: Option<String>,
    pub created_at: String,
    pub company_name: Option<String>,
    pub branch_name: Option<String>,
}

impl LetterHistoryRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<LetterHistoryRecord> {
        Ok(LetterHistoryRecord {
            id: row.get("id")?,
            employee_id: row.get("employee_id")?,
            letter_type: row.get("letter_type")?,
            letter_date: row.get("letter_date")?,
            store_id: row.get("store_id")?,
            reason: row.get("reason")?,
            supervisor_name: row.get("supervisor_name")?,
            supervisor_title: row.get("supervisor_title")?,
            file_path: row.get("file_path")?,
            created_by: row.get("created_by")?,
            created_at: row.get("created_at")?,
            company_name: row.get("company_name")?,
            branch_name: row.get("branch_name")?,
        })
    }
}

/// A row in `active_sessions`. Advisory; never gates authorization.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: i64,
    pub username: Option<String>,
    pub login_time: String,
    pub last_activity: String,
    pub ip_address: Option<String>,
    pub computer_name: Option<String>,
}

impl SessionRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
        Ok(SessionRecord {
            id: row.get("id")?,
            username: row.get("username")?,
            login_time: row.get("login_time")?,
            last_activity: row.get("last_activity")?,
            ip_address: row.get("ip_address")?,
            computer_name: row.get("computer_name")?,
        })
    }
}

/// State of a record lock as seen by [crate::kernel::db::Db::lock_info].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LockInfo {
    pub locked: bool,
    pub locked_by: Option<String>,
    pub locked_at: Option<String>,
    pub computer_name: Option<String>,
    pub lock_expires_at: Option<String>,
}

/// A row in the general `audit_log`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: i64,
    pub timestamp: String,
    pub username: String,
    pub action: String,
    pub table_name: Option<String>,
    pub record_id: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub details: Option<String>,
}

impl AuditLogEntry {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<AuditLogEntry> {
        Ok(AuditLogEntry {
            id: row.get("id")?,
            timestamp: row.get("timestamp")?,
            username: row.get("username")?,
            action: row.get("action")?,
            table_name: row.get("table_name")?,
            record_id: row.get("record_id")?,
            old_value: row.get("old_value")?,
            new_value: row.get("new_value")?,
            details: row.get("details")?,
        })
    }
}

/// A row in the hash-chained `security_audit`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecurityAuditEntry {
    pub id: i64,
    pub timestamp: String,
    pub event_type: String,
    pub username: Option<String>,
    pub ip_address: Option<String>,
    pub computer_name: Option<String>,
    pub details: Option<String>,
    pub severity: Severity,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

impl SecurityAuditEntry {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<SecurityAuditEntry> {
        Ok(SecurityAuditEntry {
            id: row.get("id")?,
            timestamp: row.get("timestamp")?,
            event_type: row.get("event_type")?,
            username: row.get("username")?,
            ip_address: row.get("ip_address")?,
            computer_name: row.get("computer_name")?,
            details: row.get("details")?,
            severity: Severity::parse(
                &row.get::<_, Option<String>>("severity")?.unwrap_or_default(),
            ),
            previous_hash: row.get("previous_hash")?,
            entry_hash: row.get("entry_hash")?,
        })
    }
}

/// Result of whole-chain verification over the security audit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub total_entries: usize,
    /// Empty when valid; one line per broken entry otherwise.
    pub issues: Vec<String>,
}

/// Filters for [crate::kernel::db::Db::get_security_audit].
#[derive(Clone, Debug, Default)]
pub struct SecurityAuditFilter {
    pub event_type: Option<String>,
    pub username: Option<String>,
    pub severity: Option<Severity>,
    /// Inclusive `YYYY-MM-DD`.
    pub start_date: Option<String>,
    /// Inclusive to end-of-day (`YYYY-MM-DD` treated as `... 23:59:59`).
    pub end_date: Option<String>,
}

/// The force-close beacon stored as JSON under the `force_close` setting.
/// Advisory: clients poll (every 30 s is the expected cadence) and exit
/// when `active` is set. Nothing in the kernel enforces the exit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForceCloseBeacon {
    pub active: bool,
    pub requested_by: String,
    pub message: String,
    pub timestamp: String,
}

/// Aggregate counters for the maintenance screens.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub total_employees: i64,
    pub active_employees: i64,
    pub total_users: i64,
    pub total_agencies: i64,
    pub db_size_mb: f64,
}

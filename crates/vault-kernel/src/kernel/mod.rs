//! Vault Kernel.
//!
//! The data layer of a shared-file employee records system: one SQLite file
//! on a LAN share, a handful of desktop clients, no server. Everything that
//! must be correct under that concurrency model lives here: pragma-tuned
//! storage, retry-on-lock, advisory record locks, PIN authentication with
//! auto-reset, the hash-chained security audit, and encrypted backup with
//! scheduled runs.

pub mod audit;
pub mod auth;
pub mod backup;
pub mod db;
pub mod directory;
pub mod employees;
pub mod error;
pub mod locks;
pub mod models;
pub mod retry;
pub mod scheduler;
pub mod schema;
pub mod settings;
pub mod storage;

pub use audit::GENESIS_HASH;
pub use auth::{
    default_permissions, validate_pin_strength, AuthOutcome, ATTEMPT_RETENTION_DAYS,
    LOCKOUT_WINDOW_MINUTES, MAX_FAILED_ATTEMPTS, PERMISSION_KEYS, SESSION_IDLE_MINUTES,
};
pub use backup::{ENC_HEADER, KEEP_SNAPSHOTS};
pub use db::Db;
pub use error::{VaultError, LOCKED_GUIDANCE};
pub use locks::{LockOutcome, LOCK_TTL_MINUTES};
pub use models::{
    ArchivedEmployeeRecord, AuditLogEntry, ChainVerification, DatabaseStats, EmployeeFileRecord,
    EmployeeFilter, EmployeeRecord, FileType, ForceCloseBeacon, LetterHistoryInput,
    LetterHistoryRecord, LockInfo, Role, SecurityAuditEntry, SecurityAuditFilter, SessionRecord,
    Severity, StoreRecord, UserRecord,
};
pub use retry::{with_retry, RetryPolicy, SLOW_QUERY_MS};
pub use scheduler::{
    run_auto_backup, BackupScheduler, SchedulerCommand, SchedulerConfig, SchedulerEvent,
    SchedulerState, DEFAULT_BACKUP_TIME,
};
pub use schema::{retry_v7, SEED_AGENCIES, TARGET_VERSION};
pub use settings::FORCE_CLOSE_KEY;

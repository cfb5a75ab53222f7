//! The shared database handle.
//!
//! `Db` owns a single configured connection behind a mutex and is cheap to
//! clone; every feature module hangs its operations off `impl Db` blocks.
//! Opening runs the full startup sequence: configure pragmas (with corruption
//! recovery), ensure the schema, run the credential migration, then walk the
//! version ladder.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rusqlite::Connection;

use crate::kernel::error::VaultError;
use crate::kernel::{schema, settings, storage};

/// How long the agency list stays cached before re-reading it.
pub(crate) const AGENCY_CACHE_TTL: Duration = Duration::from_secs(300);

pub(crate) struct AgencyCache {
    pub fetched_at: Instant,
    pub names: Vec<String>,
}

struct Inner {
    conn: Mutex<Connection>,
    path: PathBuf,
    network: AtomicBool,
    agencies: Mutex<Option<AgencyCache>>,
}

/// Cloneable handle over the shared connection.
#[derive(Clone)]
pub struct Db {
    inner: Arc<Inner>,
}

impl Db {
    /// Opens (creating if needed) the database at `path` and brings it fully
    /// up to date.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VaultError> {
        Self::open_with_alternate(path, None::<&Path>)
    }

    /// Like [Db::open], but when the primary file is corrupted and parked,
    /// `alternate` (typically a shared network copy) is copied into place
    /// instead of starting from an empty file.
    pub fn open_with_alternate(
        path: impl AsRef<Path>,
        alternate: Option<impl AsRef<Path>>,
    ) -> Result<Self, VaultError> {
        let path = path.as_ref().to_path_buf();
        let (conn, network) =
            storage::open(&path, alternate.as_ref().map(|p| p.as_ref()))?;

        schema::ensure_schema(&conn)?;
        schema::migrate_password_to_pin(&conn)?;
        let backups_dir = backups_dir_for(&path);
        schema::run_migrations(&conn, &path, &backups_dir)?;
        settings::bootstrap(&conn, &path)?;

        tracing::info!(path = %path.display(), network, "database ready");
        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                path,
                network: AtomicBool::new(network),
                agencies: Mutex::new(None),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// True when the file lives on a network share (conservative pragmas,
    /// no WAL).
    pub fn is_network(&self) -> bool {
        self.inner.network.load(Ordering::Relaxed)
    }

    /// Directory that pre-migration copies, snapshots, and scheduled backups
    /// land in: `backups/` next to the database file.
    pub fn backups_dir(&self) -> PathBuf {
        backups_dir_for(&self.inner.path)
    }

    /// Runs `f` with the connection locked. Escape hatch for maintenance
    /// queries; everyday callers use the typed operations.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, VaultError>,
    ) -> Result<T, VaultError> {
        let guard = self
            .inner
            .conn
            .lock()
            .map_err(|_| VaultError::Sqlite("connection mutex poisoned".to_string()))?;
        f(&guard)
    }

    /// Flushes WAL pages into the main file so other machines on the share
    /// see committed data. No-op in network mode (journal_mode=DELETE already
    /// writes through).
    pub fn commit_and_checkpoint(&self) -> Result<(), VaultError> {
        let network = self.is_network();
        self.with_conn(|conn| storage::checkpoint(conn, network))
    }

    /// Checkpoints and releases the handle. Other clones keep working; this
    /// exists so shutdown paths have an explicit flush point.
    pub fn close(self) -> Result<(), VaultError> {
        self.commit_and_checkpoint()
    }

    /// Swaps the live connection out while `f` manipulates the underlying
    /// file, then reconnects. Used by restore: SQLite on Windows will not let
    /// an open file be overwritten.
    pub(crate) fn replace_connection(
        &self,
        f: impl FnOnce(&Path) -> Result<(), VaultError>,
    ) -> Result<(), VaultError> {
        let mut guard = self
            .inner
            .conn
            .lock()
            .map_err(|_| VaultError::Sqlite("connection mutex poisoned".to_string()))?;

        let placeholder = Connection::open_in_memory()
            .map_err(|e| VaultError::Sqlite(format!("open placeholder connection: {e}")))?;
        let old = std::mem::replace(&mut *guard, placeholder);
        drop(old);

        let file_result = f(&self.inner.path);

        let (conn, network) = storage::open(&self.inner.path, None)?;
        self.inner.network.store(network, Ordering::Relaxed);
        *guard = conn;
        self.invalidate_agency_cache();
        file_result
    }

    pub(crate) fn cached_agencies(&self) -> Option<Vec<String>> {
        let guard = self.inner.agencies.lock().ok()?;
        match guard.as_ref() {
            Some(cache) if cache.fetched_at.elapsed() < AGENCY_CACHE_TTL => {
                Some(cache.names.clone())
            }
            _ => None,
        }
    }

    pub(crate) fn store_agency_cache(&self, names: Vec<String>) {
        if let Ok(mut guard) = self.inner.agencies.lock() {
            *guard = Some(AgencyCache {
                fetched_at: Instant::now(),
                names,
            });
        }
    }

    pub(crate) fn invalidate_agency_cache(&self) {
        if let Ok(mut guard) = self.inner.agencies.lock() {
            *guard = None;
        }
    }
}

fn backups_dir_for(db_path: &Path) -> PathBuf {
    db_path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
        .join("backups")
}

/// Hostname reported in sessions, record locks, and the security audit.
pub(crate) fn local_host() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_seeds_and_reopen_preserves() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.db");
        {
            let db = Db::open(&path).unwrap();
            let admins: i64 = db
                .with_conn(|c| {
                    c.query_row("SELECT COUNT(*) FROM users WHERE role='admin'", [], |r| {
                        r.get(0)
                    })
                    .map_err(|e| VaultError::Sqlite(e.to_string()))
                })
                .unwrap();
            assert_eq!(admins, 1);
            let version = db
                .with_conn(|c| schema::current_version(c))
                .unwrap();
            assert_eq!(version, schema::TARGET_VERSION);
            db.close().unwrap();
        }
        let db = Db::open(&path).unwrap();
        let admins: i64 = db
            .with_conn(|c| {
                c.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
                    .map_err(|e| VaultError::Sqlite(e.to_string()))
            })
            .unwrap();
        assert_eq!(admins, 1);
    }

    #[test]
    fn backups_dir_sits_next_to_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.db");
        let db = Db::open(&path).unwrap();
        assert_eq!(db.backups_dir(), dir.path().join("backups"));
    }
}

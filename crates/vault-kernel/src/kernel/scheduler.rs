//! Scheduled automatic backups.
//!
//! A worker thread wakes every 30 seconds and fires at the configured local
//! wall-clock time (HH:MM), at most once per day; the last run date is kept
//! in settings so a restart mid-day does not re-run. Each run writes a
//! stamped directory under `backups/auto/` and then sweeps directories older
//! than the retention period. Schedule times are deliberately local, not
//! UTC: "back up at 02:00" means 2 AM on the office clock.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};

use crate::kernel::db::Db;
use crate::kernel::error::VaultError;

const TICK: Duration = Duration::from_secs(30);
/// Fallback when the configured time does not parse.
pub const DEFAULT_BACKUP_TIME: &str = "02:00";

const ENABLED_KEY: &str = "auto_backup_enabled";
const TIME_KEY: &str = "auto_backup_time";
const RETENTION_KEY: &str = "auto_backup_retention";
const LAST_RUN_KEY: &str = "last_auto_backup";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Disabled,
    Idle,
    Running,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Local wall-clock `HH:MM`.
    pub backup_time: String,
    /// Auto-backup directories older than this are deleted. None keeps
    /// everything.
    pub retention_days: Option<u32>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            enabled: false,
            backup_time: DEFAULT_BACKUP_TIME.to_string(),
            retention_days: Some(30),
        }
    }
}

impl SchedulerConfig {
    /// Reads the scheduler settings rows.
    pub fn from_settings(db: &Db) -> Result<Self, VaultError> {
        let defaults = SchedulerConfig::default();
        Ok(SchedulerConfig {
            enabled: db
                .get_setting(ENABLED_KEY)?
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.enabled),
            backup_time: db.get_setting(TIME_KEY)?.unwrap_or(defaults.backup_time),
            retention_days: match db.get_setting(RETENTION_KEY)? {
                Some(value) => value.parse::<u32>().ok().filter(|d| *d > 0),
                None => defaults.retention_days,
            },
        })
    }
}

impl Db {
    /// Persists the scheduler settings so every client sees the same plan.
    /// A running [`BackupScheduler`] still needs `UpdateConfig` to pick the
    /// change up before its next tick.
    pub fn configure_auto_backup(
        &self,
        acting_user: &str,
        config: &SchedulerConfig,
    ) -> Result<(), VaultError> {
        self.require_permission(acting_user, "backup_restore")?;
        if NaiveTime::parse_from_str(&config.backup_time, "%H:%M").is_err() {
            return Err(VaultError::Config(format!(
                "invalid backup time {:?}; expected HH:MM",
                config.backup_time
            )));
        }
        self.set_setting(ENABLED_KEY, if config.enabled { "true" } else { "false" })?;
        self.set_setting(TIME_KEY, &config.backup_time)?;
        match config.retention_days {
            Some(days) => self.set_setting(RETENTION_KEY, &days.to_string())?,
            None => self.set_setting(RETENTION_KEY, "")?,
        }
        self.log_action(
            acting_user,
            "AUTO_BACKUP_CONFIGURED",
            Some("settings"),
            None,
            None,
            None,
            Some(&format!(
                "enabled={} time={} retention_days={:?}",
                config.enabled, config.backup_time, config.retention_days
            )),
        )?;
        Ok(())
    }
}

pub enum SchedulerCommand {
    UpdateConfig(SchedulerConfig),
    /// Run a backup immediately, regardless of schedule or last-run date.
    RunNow,
    Shutdown,
}

#[derive(Debug)]
pub enum SchedulerEvent {
    StateChanged(SchedulerState),
    BackupCompleted(PathBuf),
    BackupFailed(String),
    RetentionSwept(usize),
}

/// Handle to the worker thread. Dropping it shuts the worker down.
pub struct BackupScheduler {
    commands: Sender<SchedulerCommand>,
    events: Receiver<SchedulerEvent>,
    handle: Option<JoinHandle<()>>,
}

impl BackupScheduler {
    /// Spawns the worker with the given configuration.
    pub fn start(db: Db, config: SchedulerConfig) -> BackupScheduler {
        let (command_tx, command_rx) = channel();
        let (event_tx, event_rx) = channel();
        let handle = std::thread::Builder::new()
            .name("backup-scheduler".to_string())
            .spawn(move || worker_loop(db, config, command_rx, event_tx))
            .ok();
        if handle.is_none() {
            tracing::error!("could not spawn backup scheduler thread");
        }
        BackupScheduler {
            commands: command_tx,
            events: event_rx,
            handle,
        }
    }

    pub fn send(&self, command: SchedulerCommand) {
        let _ = self.commands.send(command);
    }

    /// Drains any pending events without blocking.
    pub fn drain_events(&self) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Blocks for the next event, up to `timeout`.
    pub fn next_event(&self, timeout: Duration) -> Option<SchedulerEvent> {
        self.events.recv_timeout(timeout).ok()
    }
}

impl Drop for BackupScheduler {
    fn drop(&mut self) {
        let _ = self.commands.send(SchedulerCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    db: Db,
    mut config: SchedulerConfig,
    commands: Receiver<SchedulerCommand>,
    events: Sender<SchedulerEvent>,
) {
    let mut state = if config.enabled {
        SchedulerState::Idle
    } else {
        SchedulerState::Disabled
    };
    // Arming after today's time has passed waits for tomorrow's occurrence.
    let mut next_run = next_occurrence(
        Local::now().naive_local(),
        parse_backup_time(&config.backup_time),
    );
    let _ = events.send(SchedulerEvent::StateChanged(state));
    tracing::info!(enabled = config.enabled, time = %config.backup_time, "backup scheduler started");

    loop {
        match commands.recv_timeout(TICK) {
            Ok(SchedulerCommand::Shutdown) => break,
            Ok(SchedulerCommand::UpdateConfig(new_config)) => {
                config = new_config;
                next_run = next_occurrence(
                    Local::now().naive_local(),
                    parse_backup_time(&config.backup_time),
                );
                let new_state = if config.enabled {
                    SchedulerState::Idle
                } else {
                    SchedulerState::Disabled
                };
                if new_state != state {
                    state = new_state;
                    let _ = events.send(SchedulerEvent::StateChanged(state));
                }
            }
            Ok(SchedulerCommand::RunNow) => {
                run_cycle(&db, &config, &events, &mut state, &mut next_run, true);
            }
            Err(RecvTimeoutError::Timeout) => {
                if config.enabled {
                    run_cycle(&db, &config, &events, &mut state, &mut next_run, false);
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::info!("backup scheduler stopped");
}

fn run_cycle(
    db: &Db,
    config: &SchedulerConfig,
    events: &Sender<SchedulerEvent>,
    state: &mut SchedulerState,
    next_run: &mut NaiveDateTime,
    forced: bool,
) {
    let now = Local::now();
    if !forced {
        let last_run = db
            .get_setting(LAST_RUN_KEY)
            .ok()
            .flatten()
            .and_then(|v| NaiveDate::parse_from_str(&v, "%Y-%m-%d").ok());
        if !is_due(now.naive_local(), *next_run, last_run) {
            return;
        }
        *next_run = next_occurrence(now.naive_local(), parse_backup_time(&config.backup_time));
    }

    *state = SchedulerState::Running;
    let _ = events.send(SchedulerEvent::StateChanged(SchedulerState::Running));

    match run_auto_backup(db) {
        Ok(target) => {
            let _ = db.set_setting(LAST_RUN_KEY, &now.format("%Y-%m-%d").to_string());
            tracing::info!(backup = %target.display(), "automatic backup completed");
            let _ = events.send(SchedulerEvent::BackupCompleted(target));
        }
        Err(err) => {
            tracing::error!(%err, "automatic backup failed");
            let _ = events.send(SchedulerEvent::BackupFailed(err.to_string()));
        }
    }

    if let Some(retention_days) = config.retention_days {
        match sweep_retention(&auto_backup_root(db), retention_days, now.date_naive()) {
            Ok(removed) if removed > 0 => {
                let _ = events.send(SchedulerEvent::RetentionSwept(removed));
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(%err, "retention sweep failed"),
        }
    }

    *state = SchedulerState::Idle;
    let _ = events.send(SchedulerEvent::StateChanged(SchedulerState::Idle));
}

fn auto_backup_root(db: &Db) -> PathBuf {
    db.backups_dir().join("auto")
}

/// One backup run: a stamped directory holding a checkpointed copy.
pub fn run_auto_backup(db: &Db) -> Result<PathBuf, VaultError> {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let target_dir = auto_backup_root(db).join(format!("AutoBackup_{stamp}"));
    std::fs::create_dir_all(&target_dir)?;
    let file_name = db
        .path()
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "vault.db".into());
    db.copy_database_to(&target_dir.join(file_name))?;
    Ok(target_dir)
}

/// Parses `HH:MM`; anything unparseable falls back to 02:00 with a warning.
pub fn parse_backup_time(value: &str) -> NaiveTime {
    match NaiveTime::parse_from_str(value, "%H:%M") {
        Ok(time) => time,
        Err(_) => {
            tracing::warn!(value, "unparseable backup time, using {DEFAULT_BACKUP_TIME}");
            NaiveTime::parse_from_str(DEFAULT_BACKUP_TIME, "%H:%M")
                .unwrap_or_else(|_| NaiveTime::MIN)
        }
    }
}

/// The next moment the schedule fires: today at `scheduled` when that is
/// still ahead of `armed`, otherwise tomorrow.
pub fn next_occurrence(armed: NaiveDateTime, scheduled: NaiveTime) -> NaiveDateTime {
    if armed.time() < scheduled {
        armed.date().and_time(scheduled)
    } else {
        armed
            .date()
            .succ_opt()
            .unwrap_or_else(|| armed.date())
            .and_time(scheduled)
    }
}

/// The once-per-day gate: due when the armed occurrence has arrived and no
/// run has been recorded for today.
pub fn is_due(now: NaiveDateTime, next_run: NaiveDateTime, last_run: Option<NaiveDate>) -> bool {
    now >= next_run && last_run != Some(now.date())
}

/// Deletes auto-backup directories whose embedded `YYYYMMDD` stamp is older
/// than `retention_days`. Directories without a parseable stamp are warned
/// about and kept.
pub fn sweep_retention(
    root: &Path,
    retention_days: u32,
    today: NaiveDate,
) -> Result<usize, VaultError> {
    if !root.is_dir() {
        return Ok(0);
    }
    let cutoff = today - chrono::Duration::days(retention_days as i64);
    let mut removed = 0usize;
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        match embedded_date(&name) {
            Some(date) if date < cutoff => {
                if let Err(err) = std::fs::remove_dir_all(&path) {
                    tracing::warn!(%err, dir = %path.display(), "could not delete old auto-backup");
                } else {
                    removed += 1;
                }
            }
            Some(_) => {}
            None => {
                tracing::warn!(dir = %name, "auto-backup directory without a date stamp, kept");
            }
        }
    }
    Ok(removed)
}

/// Finds a `YYYYMMDD` chunk among the underscore-separated parts of a name.
fn embedded_date(name: &str) -> Option<NaiveDate> {
    name.split('_')
        .filter(|part| part.len() == 8 && part.chars().all(|c| c.is_ascii_digit()))
        .find_map(|part| NaiveDate::parse_from_str(part, "%Y%m%d").ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn backup_time_parse_and_fallback() {
        assert_eq!(parse_backup_time("14:30"), time(14, 30));
        assert_eq!(parse_backup_time("garbage"), time(2, 0));
        assert_eq!(parse_backup_time("25:99"), time(2, 0));
    }

    #[test]
    fn due_once_per_day_after_the_armed_occurrence() {
        let today = date(2025, 8, 30);
        let scheduled = time(2, 0);
        let armed = next_occurrence(today.and_time(time(1, 0)), scheduled);
        assert_eq!(armed, today.and_time(scheduled));
        assert!(!is_due(today.and_time(time(1, 59)), armed, None));
        assert!(is_due(today.and_time(time(2, 0)), armed, None));
        assert!(is_due(
            today.and_time(time(23, 0)),
            armed,
            Some(date(2025, 8, 29))
        ));
        assert!(!is_due(today.and_time(time(23, 0)), armed, Some(today)));
    }

    #[test]
    fn arming_after_todays_time_waits_for_tomorrow() {
        let today = date(2025, 8, 30);
        let scheduled = time(2, 0);
        // Enabled at 14:00 with a 02:00 schedule: nothing fires today.
        let armed = next_occurrence(today.and_time(time(14, 0)), scheduled);
        assert_eq!(armed, date(2025, 8, 31).and_time(scheduled));
        assert!(!is_due(today.and_time(time(14, 0)), armed, None));
        assert!(!is_due(today.and_time(time(23, 59)), armed, None));
        assert!(is_due(date(2025, 8, 31).and_time(time(2, 0)), armed, None));
    }

    #[test]
    fn retention_deletes_only_old_stamped_dirs() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        for name in [
            "AutoBackup_20250701_020000", // old
            "AutoBackup_20250829_020000", // recent
            "notes",                      // no stamp, kept
        ] {
            std::fs::create_dir(root.join(name)).unwrap();
        }
        std::fs::write(root.join("loose_file.txt"), b"x").unwrap();

        let removed = sweep_retention(root, 30, date(2025, 8, 30)).unwrap();
        assert_eq!(removed, 1);
        assert!(!root.join("AutoBackup_20250701_020000").exists());
        assert!(root.join("AutoBackup_20250829_020000").exists());
        assert!(root.join("notes").exists());
    }

    #[test]
    fn embedded_date_ignores_non_date_chunks() {
        assert_eq!(embedded_date("AutoBackup_20250830_020000"), Some(date(2025, 8, 30)));
        assert_eq!(embedded_date("AutoBackup"), None);
        assert_eq!(embedded_date("x_99999999_y"), None); // not a real date
    }

    #[test]
    fn configured_settings_round_trip() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path().join("vault.db")).unwrap();

        let config = SchedulerConfig {
            enabled: true,
            backup_time: "03:15".to_string(),
            retention_days: Some(14),
        };
        db.configure_auto_backup("admin", &config).unwrap();
        assert_eq!(SchedulerConfig::from_settings(&db).unwrap(), config);

        // Clearing retention persists as "keep everything".
        let unbounded = SchedulerConfig {
            retention_days: None,
            ..config
        };
        db.configure_auto_backup("admin", &unbounded).unwrap();
        assert_eq!(
            SchedulerConfig::from_settings(&db).unwrap().retention_days,
            None
        );

        let bad = SchedulerConfig {
            backup_time: "quarter past three".to_string(),
            ..unbounded
        };
        assert!(matches!(
            db.configure_auto_backup("admin", &bad),
            Err(VaultError::Config(_))
        ));
    }

    #[test]
    fn run_now_produces_a_backup_directory() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path().join("vault.db")).unwrap();
        let scheduler = BackupScheduler::start(db.clone(), SchedulerConfig::default());
        scheduler.send(SchedulerCommand::RunNow);

        let mut completed = None;
        for _ in 0..10 {
            match scheduler.next_event(Duration::from_secs(5)) {
                Some(SchedulerEvent::BackupCompleted(path)) => {
                    completed = Some(path);
                    break;
                }
                Some(_) => continue,
                None => break,
            }
        }
        let target = completed.expect("backup should complete");
        assert!(target.join("vault.db").exists());
        drop(scheduler);
    }
}

//! Employee CRUD, the archive, and attached file metadata.
//!
//! Every mutation is permission-guarded, retried, and audited. Archive and
//! restore move the full row between `employees` and `archived_employees`
//! inside one transaction so a crash can never leave the record in both
//! tables or neither.

use chrono::{Datelike, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::kernel::db::Db;
use crate::kernel::error::VaultError;
use crate::kernel::models::{
    ArchivedEmployeeRecord, EmployeeFileRecord, EmployeeFilter, EmployeeRecord, FileType,
    Severity, TS_FORMAT,
};
use crate::kernel::retry::{profile, with_retry, RetryPolicy};

const EMPLOYEE_COLUMNS: &str = "emp_id, name, email, phone, department, position, hire_date, \
     resign_date, salary, notes, modified, modified_by, contract_expiry, agency, sss_number, \
     emergency_contact_name, emergency_contact_phone, contract_start_date, contract_months, \
     tin_number, pagibig_number, philhealth_number";

fn filter_clauses(filter: &EmployeeFilter, sql: &mut String, args: &mut Vec<Box<dyn rusqlite::ToSql>>) {
    if let Some(search) = &filter.search {
        sql.push_str(" AND (emp_id LIKE ? OR name LIKE ?)");
        let pattern = format!("%{search}%");
        args.push(Box::new(pattern.clone()));
        args.push(Box::new(pattern));
    }
    if let Some(department) = &filter.department {
        sql.push_str(" AND department = ?");
        args.push(Box::new(department.clone()));
    }
    if let Some(agency) = &filter.agency {
        sql.push_str(" AND agency = ?");
        args.push(Box::new(agency.clone()));
    }
    if filter.active_only {
        sql.push_str(" AND (resign_date IS NULL OR resign_date = '')");
    }
    if filter.resigned_only {
        sql.push_str(" AND resign_date IS NOT NULL AND resign_date != ''");
    }
}

fn record_json(record: &EmployeeRecord) -> Option<String> {
    serde_json::to_string(record).ok()
}

impl Db {
    /// Allocates the next employee id for the current year, `E-NNN-YY`.
    /// The counter restarts each January.
    pub fn next_employee_id(&self) -> Result<String, VaultError> {
        let year = Utc::now().year() % 100;
        let suffix = format!("%-{year:02}");
        self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "allocate employee id", || {
                let max: Option<i64> = conn.query_row(
                    "SELECT MAX(CAST(substr(emp_id, 3, length(emp_id) - 5) AS INTEGER))
                     FROM (
                         SELECT emp_id FROM employees WHERE emp_id LIKE 'E-' || ?1
                         UNION ALL
                         SELECT emp_id FROM archived_employees WHERE emp_id LIKE 'E-' || ?1
                     )",
                    [&suffix],
                    |r| r.get(0),
                )?;
                let next = max.unwrap_or(0) + 1;
                Ok(format!("E-{next:03}-{year:02}"))
            })
        })
    }

    pub fn employee_exists(&self, emp_id: &str) -> Result<bool, VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "check employee exists", || {
                conn.query_row(
                    "SELECT 1 FROM employees WHERE emp_id = ?1",
                    [emp_id],
                    |_| Ok(()),
                )
                .optional()
                .map(|found| found.is_some())
            })
        })
    }

    pub fn get_employee(&self, emp_id: &str) -> Result<Option<EmployeeRecord>, VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "read employee", || {
                conn.query_row(
                    &format!("SELECT {EMPLOYEE_COLUMNS} FROM employees WHERE emp_id = ?1"),
                    [emp_id],
                    EmployeeRecord::from_row,
                )
                .optional()
            })
        })
    }

    /// Filtered, paginated listing ordered by name.
    pub fn get_employees(
        &self,
        filter: &EmployeeFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<EmployeeRecord>, VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "list employees", || {
                let mut sql =
                    format!("SELECT {EMPLOYEE_COLUMNS} FROM employees WHERE 1=1");
                let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
                filter_clauses(filter, &mut sql, &mut args);
                sql.push_str(" ORDER BY name LIMIT ? OFFSET ?");
                args.push(Box::new(limit as i64));
                args.push(Box::new(offset as i64));

                profile(&sql, || {
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt.query_map(
                        rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                        EmployeeRecord::from_row,
                    )?;
                    rows.collect()
                })
            })
        })
    }

    /// Total rows the same filter would return, for pagination.
    pub fn count_employees(&self, filter: &EmployeeFilter) -> Result<i64, VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "count employees", || {
                let mut sql = String::from("SELECT COUNT(*) FROM employees WHERE 1=1");
                let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
                filter_clauses(filter, &mut sql, &mut args);
                conn.query_row(
                    &sql,
                    rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                    |r| r.get(0),
                )
            })
        })
    }

    /// Inserts a new employee. Duplicate ids and duplicate government IDs
    /// surface as integrity errors.
    pub fn add_employee(
        &self,
        acting_user: &str,
        record: &EmployeeRecord,
    ) -> Result<(), VaultError> {
        self.require_permission(acting_user, "add_employee")?;
        validate_employee(record)?;
        let now = Utc::now().format(TS_FORMAT).to_string();
        self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "add employee", || {
                insert_employee(conn, record, &now, acting_user)
            })
        })?;
        self.log_action(
            acting_user,
            "INSERT",
            Some("employees"),
            Some(&record.emp_id),
            None,
            record_json(record).as_deref(),
            None,
        )
    }

    /// Updates an existing employee, capturing the old row in the audit
    /// trail.
    pub fn update_employee(
        &self,
        acting_user: &str,
        record: &EmployeeRecord,
    ) -> Result<(), VaultError> {
        self.require_permission(acting_user, "edit_employee")?;
        validate_employee(record)?;
        let old = self.get_employee(&record.emp_id)?.ok_or_else(|| {
            VaultError::Integrity {
                field: "emp_id".to_string(),
                message: format!("no such employee: {}", record.emp_id),
            }
        })?;
        let now = Utc::now().format(TS_FORMAT).to_string();
        self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "update employee", || {
                conn.execute(
                    "UPDATE employees SET
                         name = ?2, email = ?3, phone = ?4, department = ?5, position = ?6,
                         hire_date = ?7, resign_date = ?8, salary = ?9, notes = ?10,
                         modified = ?11, modified_by = ?12, contract_expiry = ?13,
                         agency = ?14, sss_number = ?15, emergency_contact_name = ?16,
                         emergency_contact_phone = ?17, contract_start_date = ?18,
                         contract_months = ?19, tin_number = ?20, pagibig_number = ?21,
                         philhealth_number = ?22
                     WHERE emp_id = ?1",
                    params![
                        record.emp_id,
                        record.name,
                        record.email,
                        record.phone,
                        record.department,
                        record.position,
                        record.hire_date,
                        record.resign_date,
                        record.salary,
                        record.notes,
                        now,
                        acting_user,
                        record.contract_expiry,
                        record.agency,
                        record.sss_number,
                        record.emergency_contact_name,
                        record.emergency_contact_phone,
                        record.contract_start_date,
                        record.contract_months,
                        record.tin_number,
                        record.pagibig_number,
                        record.philhealth_number
                    ],
                )?;
                Ok(())
            })
        })?;
        self.log_action(
            acting_user,
            "UPDATE",
            Some("employees"),
            Some(&record.emp_id),
            record_json(&old).as_deref(),
            record_json(record).as_deref(),
            None,
        )
    }

    /// Hard-deletes an employee (file metadata cascades).
    pub fn delete_employee(&self, acting_user: &str, emp_id: &str) -> Result<(), VaultError> {
        self.require_permission(acting_user, "delete_employee")?;
        let old = self.get_employee(emp_id)?;
        self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "delete employee", || {
                conn.execute("DELETE FROM employees WHERE emp_id = ?1", [emp_id])?;
                Ok(())
            })
        })?;
        self.log_action(
            acting_user,
            "DELETE",
            Some("employees"),
            Some(emp_id),
            old.as_ref().and_then(record_json).as_deref(),
            None,
            None,
        )?;
        self.log_security_event(
            "EMPLOYEE_DELETED",
            Some(acting_user),
            Some(emp_id),
            Severity::Warning,
            None,
        )
    }

    /// Moves an employee into the archive atomically.
    pub fn archive_employee(
        &self,
        acting_user: &str,
        emp_id: &str,
        reason: Option<&str>,
    ) -> Result<(), VaultError> {
        self.require_permission(acting_user, "archive")?;
        if self.get_employee(emp_id)?.is_none() {
            return Err(VaultError::Integrity {
                field: "emp_id".to_string(),
                message: format!("no such employee: {emp_id}"),
            });
        }
        let now = Utc::now().format(TS_FORMAT).to_string();
        self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "archive employee", || {
                let tx = conn.unchecked_transaction()?;
                tx.execute(
                    &format!(
                        "INSERT INTO archived_employees
                             ({EMPLOYEE_COLUMNS}, archived_date, archived_by, archive_reason)
                         SELECT {EMPLOYEE_COLUMNS}, ?2, ?3, ?4
                         FROM employees WHERE emp_id = ?1"
                    ),
                    params![emp_id, now, acting_user, reason],
                )?;
                tx.execute("DELETE FROM employees WHERE emp_id = ?1", [emp_id])?;
                tx.commit()?;
                Ok(())
            })
        })?;
        self.log_action(
            acting_user,
            "ARCHIVE",
            Some("employees"),
            Some(emp_id),
            None,
            None,
            reason,
        )
    }

    /// Moves an archived employee back, atomically. Fails if the id is live
    /// again.
    pub fn restore_employee(&self, acting_user: &str, emp_id: &str) -> Result<(), VaultError> {
        self.require_permission(acting_user, "archive")?;
        if self.employee_exists(emp_id)? {
            return Err(VaultError::Integrity {
                field: "emp_id".to_string(),
                message: format!("employee {emp_id} already exists; cannot restore over it"),
            });
        }
        let restored = self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "restore employee", || {
                let tx = conn.unchecked_transaction()?;
                let rows = tx.execute(
                    &format!(
                        "INSERT INTO employees ({EMPLOYEE_COLUMNS})
                         SELECT {EMPLOYEE_COLUMNS}
                         FROM archived_employees WHERE emp_id = ?1"
                    ),
                    [emp_id],
                )?;
                tx.execute("DELETE FROM archived_employees WHERE emp_id = ?1", [emp_id])?;
                tx.commit()?;
                Ok(rows > 0)
            })
        })?;
        if !restored {
            return Err(VaultError::Integrity {
                field: "emp_id".to_string(),
                message: format!("no archived employee: {emp_id}"),
            });
        }
        self.log_action(
            acting_user,
            "RESTORE",
            Some("archived_employees"),
            Some(emp_id),
            None,
            None,
            None,
        )
    }

    pub fn list_archived(&self) -> Result<Vec<ArchivedEmployeeRecord>, VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "list archived employees", || {
                let mut stmt = conn.prepare(
                    "SELECT * FROM archived_employees ORDER BY archived_date DESC",
                )?;
                let rows = stmt.query_map([], ArchivedEmployeeRecord::from_row)?;
                rows.collect()
            })
        })
    }

    /// Irreversibly removes an archived record.
    pub fn permanently_delete_archived(
        &self,
        acting_user: &str,
        emp_id: &str,
    ) -> Result<(), VaultError> {
        self.require_permission(acting_user, "delete_employee")?;
        self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "purge archived employee", || {
                conn.execute("DELETE FROM archived_employees WHERE emp_id = ?1", [emp_id])?;
                Ok(())
            })
        })?;
        self.log_action(
            acting_user,
            "PURGE",
            Some("archived_employees"),
            Some(emp_id),
            None,
            None,
            None,
        )?;
        self.log_security_event(
            "ARCHIVED_EMPLOYEE_PURGED",
            Some(acting_user),
            Some(emp_id),
            Severity::Critical,
            None,
        )
    }

    // ---- file metadata ----

    /// Registers a stored file for an employee. Paths live outside the
    /// database; only the metadata is tracked here.
    pub fn add_employee_file(
        &self,
        acting_user: &str,
        emp_id: &str,
        filename: &str,
        file_type: FileType,
    ) -> Result<(), VaultError> {
        self.require_permission(acting_user, "edit_employee")?;
        let now = Utc::now().format(TS_FORMAT).to_string();
        self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "add employee file", || {
                conn.execute(
                    "INSERT OR REPLACE INTO employee_files
                         (emp_id, filename, added_at, file_type)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![emp_id, filename, now, file_type.as_str()],
                )?;
                Ok(())
            })
        })?;
        self.log_action(
            acting_user,
            "ADD_FILE",
            Some("employee_files"),
            Some(emp_id),
            None,
            Some(filename),
            None,
        )
    }

    pub fn get_employee_files(
        &self,
        emp_id: &str,
    ) -> Result<Vec<EmployeeFileRecord>, VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "list employee files", || {
                let mut stmt = conn.prepare(
                    "SELECT * FROM employee_files WHERE emp_id = ?1 ORDER BY added_at",
                )?;
                let rows = stmt.query_map([emp_id], EmployeeFileRecord::from_row)?;
                rows.collect()
            })
        })
    }

    pub fn delete_employee_file(
        &self,
        acting_user: &str,
        emp_id: &str,
        filename: &str,
    ) -> Result<bool, VaultError> {
        self.require_permission(acting_user, "edit_employee")?;
        let removed = self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "delete employee file", || {
                let rows = conn.execute(
                    "DELETE FROM employee_files WHERE emp_id = ?1 AND filename = ?2",
                    params![emp_id, filename],
                )?;
                Ok(rows > 0)
            })
        })?;
        if removed {
            self.log_action(
                acting_user,
                "DELETE_FILE",
                Some("employee_files"),
                Some(emp_id),
                Some(filename),
                None,
                None,
            )?;
        }
        Ok(removed)
    }
}

fn validate_employee(record: &EmployeeRecord) -> Result<(), VaultError> {
    if record.emp_id.trim().is_empty() {
        return Err(VaultError::Integrity {
            field: "emp_id".to_string(),
            message: "employee id must not be empty".to_string(),
        });
    }
    if record.name.trim().is_empty() {
        return Err(VaultError::Integrity {
            field: "name".to_string(),
            message: "name must not be empty".to_string(),
        });
    }
    if record.hire_date.trim().is_empty() {
        return Err(VaultError::Integrity {
            field: "hire_date".to_string(),
            message: "hire date must not be empty".to_string(),
        });
    }
    Ok(())
}

fn insert_employee(
    conn: &Connection,
    record: &EmployeeRecord,
    now: &str,
    acting_user: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO employees ({EMPLOYEE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                     ?16, ?17, ?18, ?19, ?20, ?21, ?22)"
        ),
        params![
            record.emp_id,
            record.name,
            record.email,
            record.phone,
            record.department,
            record.position,
            record.hire_date,
            record.resign_date,
            record.salary,
            record.notes,
            now,
            acting_user,
            record.contract_expiry,
            record.agency,
            record.sss_number,
            record.emergency_contact_name,
            record.emergency_contact_phone,
            record.contract_start_date,
            record.contract_months,
            record.tin_number,
            record.pagibig_number,
            record.philhealth_number
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_db(dir: &TempDir) -> Db {
        Db::open(dir.path().join("vault.db")).unwrap()
    }

    fn sample(emp_id: &str, name: &str) -> EmployeeRecord {
        EmployeeRecord {
            emp_id: emp_id.to_string(),
            name: name.to_string(),
            hire_date: "2024-03-01".to_string(),
            department: Some("Operations".to_string()),
            agency: Some("NEXUS".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn id_allocation_counts_archived_rows_too() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let year = Utc::now().year() % 100;
        assert_eq!(db.next_employee_id().unwrap(), format!("E-001-{year:02}"));

        let first = db.next_employee_id().unwrap();
        db.add_employee("admin", &sample(&first, "Alice Reyes")).unwrap();
        assert_eq!(db.next_employee_id().unwrap(), format!("E-002-{year:02}"));

        db.archive_employee("admin", &first, Some("resigned")).unwrap();
        // Archived ids are never reissued.
        assert_eq!(db.next_employee_id().unwrap(), format!("E-002-{year:02}"));
    }

    #[test]
    fn crud_round_trip_with_audit() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let mut record = sample("E-001-25", "Alice Reyes");
        db.add_employee("admin", &record).unwrap();
        assert!(db.employee_exists("E-001-25").unwrap());

        record.position = Some("Supervisor".to_string());
        db.update_employee("admin", &record).unwrap();
        let stored = db.get_employee("E-001-25").unwrap().unwrap();
        assert_eq!(stored.position.as_deref(), Some("Supervisor"));
        assert_eq!(stored.modified_by.as_deref(), Some("admin"));

        db.delete_employee("admin", "E-001-25").unwrap();
        assert!(!db.employee_exists("E-001-25").unwrap());

        let history = db.get_employee_history("E-001-25").unwrap();
        let actions: Vec<&str> = history.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, ["INSERT", "UPDATE", "DELETE"]);
    }

    #[test]
    fn filters_and_pagination() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        for (id, name, dept) in [
            ("E-001-25", "Alice Reyes", "Operations"),
            ("E-002-25", "Ben Cruz", "Operations"),
            ("E-003-25", "Carla Lim", "Finance"),
        ] {
            let mut record = sample(id, name);
            record.department = Some(dept.to_string());
            db.add_employee("admin", &record).unwrap();
        }
        let mut resigned = sample("E-004-25", "Dan Ong");
        resigned.resign_date = Some("2025-06-30".to_string());
        db.add_employee("admin", &resigned).unwrap();

        let ops = EmployeeFilter {
            department: Some("Operations".to_string()),
            ..Default::default()
        };
        assert_eq!(db.count_employees(&ops).unwrap(), 2);

        let active = EmployeeFilter {
            active_only: true,
            ..Default::default()
        };
        assert_eq!(db.count_employees(&active).unwrap(), 3);

        let resigned_only = EmployeeFilter {
            resigned_only: true,
            ..Default::default()
        };
        let rows = db.get_employees(&resigned_only, 50, 0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].emp_id, "E-004-25");

        let search = EmployeeFilter {
            search: Some("cruz".to_string()),
            ..Default::default()
        };
        assert_eq!(db.get_employees(&search, 50, 0).unwrap().len(), 1);

        let all = EmployeeFilter::default();
        let page1 = db.get_employees(&all, 2, 0).unwrap();
        let page2 = db.get_employees(&all, 2, 2).unwrap();
        assert_eq!(page1.len(), 2);
        assert_eq!(page2.len(), 2);
        assert_ne!(page1[0].emp_id, page2[0].emp_id);
    }

    #[test]
    fn archive_and_restore_are_atomic_moves() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        db.add_employee("admin", &sample("E-001-25", "Alice Reyes")).unwrap();

        db.archive_employee("admin", "E-001-25", Some("end of contract"))
            .unwrap();
        assert!(!db.employee_exists("E-001-25").unwrap());
        let archived = db.list_archived().unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].employee.name, "Alice Reyes");
        assert_eq!(archived[0].archive_reason.as_deref(), Some("end of contract"));

        db.restore_employee("admin", "E-001-25").unwrap();
        assert!(db.employee_exists("E-001-25").unwrap());
        assert!(db.list_archived().unwrap().is_empty());

        // Restoring again: nothing in the archive.
        assert!(db.restore_employee("admin", "E-001-25").is_err());
    }

    #[test]
    fn restore_refuses_to_clobber_a_live_id() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        db.add_employee("admin", &sample("E-001-25", "Alice Reyes")).unwrap();
        db.archive_employee("admin", "E-001-25", None).unwrap();
        db.add_employee("admin", &sample("E-001-25", "Imposter")).unwrap();
        assert!(db.restore_employee("admin", "E-001-25").is_err());
    }

    #[test]
    fn duplicate_government_id_is_an_integrity_error() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let mut a = sample("E-001-25", "Alice Reyes");
        a.sss_number = Some("12-3456789-0".to_string());
        db.add_employee("admin", &a).unwrap();

        let mut b = sample("E-002-25", "Ben Cruz");
        b.sss_number = Some("12-3456789-0".to_string());
        let err = db.add_employee("admin", &b).unwrap_err();
        assert!(matches!(err, VaultError::Integrity { .. }));
    }

    #[test]
    fn files_cascade_with_their_employee() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        db.add_employee("admin", &sample("E-001-25", "Alice Reyes")).unwrap();
        db.add_employee_file("admin", "E-001-25", "contract.pdf", FileType::Document)
            .unwrap();
        db.add_employee_file("admin", "E-001-25", "id-photo.jpg", FileType::Photo)
            .unwrap();
        assert_eq!(db.get_employee_files("E-001-25").unwrap().len(), 2);

        assert!(db
            .delete_employee_file("admin", "E-001-25", "contract.pdf")
            .unwrap());
        assert!(!db
            .delete_employee_file("admin", "E-001-25", "contract.pdf")
            .unwrap());

        db.delete_employee("admin", "E-001-25").unwrap();
        assert!(db.get_employee_files("E-001-25").unwrap().is_empty());
    }
}

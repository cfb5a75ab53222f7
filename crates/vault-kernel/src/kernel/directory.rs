//! Reference directories: agencies, store branches, and letter templates
//! with their generation history.
//!
//! The agency list backs a dropdown on every employee form, so it is cached
//! in the handle for five minutes; writes invalidate the cache.

use rusqlite::{params, OptionalExtension};

use crate::kernel::db::Db;
use crate::kernel::error::VaultError;
use crate::kernel::models::{
    LetterHistoryInput, LetterHistoryRecord, LetterTemplateRecord, StoreRecord,
};
use crate::kernel::retry::{with_retry, RetryPolicy};

impl Db {
    /// Agency names, alphabetical, served from the cache when fresh.
    pub fn get_agencies(&self) -> Result<Vec<String>, VaultError> {
        if let Some(cached) = self.cached_agencies() {
            return Ok(cached);
        }
        let names = self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "list agencies", || {
                let mut stmt = conn.prepare("SELECT name FROM agencies ORDER BY name")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                rows.collect::<Result<Vec<_>, _>>()
            })
        })?;
        self.store_agency_cache(names.clone());
        Ok(names)
    }

    /// Adds an agency. Returns false when it already exists.
    pub fn add_agency(&self, acting_user: &str, name: &str) -> Result<bool, VaultError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(VaultError::Integrity {
                field: "name".to_string(),
                message: "agency name must not be empty".to_string(),
            });
        }
        let added = self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "add agency", || {
                let rows = conn.execute(
                    "INSERT OR IGNORE INTO agencies(name) VALUES(?1)",
                    [name],
                )?;
                Ok(rows > 0)
            })
        })?;
        if added {
            self.invalidate_agency_cache();
            self.log_action(
                acting_user,
                "ADD_AGENCY",
                Some("agencies"),
                Some(name),
                None,
                None,
                None,
            )?;
        }
        Ok(added)
    }

    // ---- stores ----

    pub fn get_all_stores(&self) -> Result<Vec<StoreRecord>, VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "list stores", || {
                let mut stmt = conn.prepare(
                    "SELECT * FROM stores ORDER BY company_name, branch_name",
                )?;
                let rows = stmt.query_map([], StoreRecord::from_row)?;
                rows.collect()
            })
        })
    }

    pub fn get_active_stores(&self) -> Result<Vec<StoreRecord>, VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "list active stores", || {
                let mut stmt = conn.prepare(
                    "SELECT * FROM stores WHERE active = 1
                     ORDER BY company_name, branch_name",
                )?;
                let rows = stmt.query_map([], StoreRecord::from_row)?;
                rows.collect()
            })
        })
    }

    pub fn add_store(
        &self,
        acting_user: &str,
        company_name: &str,
        branch_name: &str,
        address: Option<&str>,
    ) -> Result<i64, VaultError> {
        self.require_permission(acting_user, "settings")?;
        let id = self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "add store", || {
                conn.execute(
                    "INSERT INTO stores(company_name, branch_name, address)
                     VALUES (?1, ?2, ?3)",
                    params![company_name, branch_name, address],
                )?;
                Ok(conn.last_insert_rowid())
            })
        })?;
        self.log_action(
            acting_user,
            "ADD_STORE",
            Some("stores"),
            Some(&id.to_string()),
            None,
            Some(&format!("{company_name} / {branch_name}")),
            None,
        )?;
        Ok(id)
    }

    pub fn update_store(
        &self,
        acting_user: &str,
        id: i64,
        company_name: &str,
        branch_name: &str,
        address: Option<&str>,
    ) -> Result<bool, VaultError> {
        self.require_permission(acting_user, "settings")?;
        let updated = self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "update store", || {
                let rows = conn.execute(
                    "UPDATE stores SET company_name = ?1, branch_name = ?2, address = ?3
                     WHERE id = ?4",
                    params![company_name, branch_name, address, id],
                )?;
                Ok(rows > 0)
            })
        })?;
        if updated {
            self.log_action(
                acting_user,
                "UPDATE_STORE",
                Some("stores"),
                Some(&id.to_string()),
                None,
                Some(&format!("{company_name} / {branch_name}")),
                None,
            )?;
        }
        Ok(updated)
    }

    /// Flips a store's active flag; inactive stores stay selectable in old
    /// history rows but drop out of the active list.
    pub fn set_store_active(
        &self,
        acting_user: &str,
        id: i64,
        active: bool,
    ) -> Result<bool, VaultError> {
        self.require_permission(acting_user, "settings")?;
        let updated = self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "toggle store", || {
                let rows = conn.execute(
                    "UPDATE stores SET active = ?1 WHERE id = ?2",
                    params![active as i64, id],
                )?;
                Ok(rows > 0)
            })
        })?;
        if updated {
            self.log_action(
                acting_user,
                "TOGGLE_STORE",
                Some("stores"),
                Some(&id.to_string()),
                None,
                Some(if active { "active" } else { "inactive" }),
                None,
            )?;
        }
        Ok(updated)
    }

    // ---- letter templates and history ----

    pub fn get_letter_templates(&self) -> Result<Vec<LetterTemplateRecord>, VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "list letter templates", || {
                let mut stmt = conn.prepare("SELECT * FROM letter_templates ORDER BY name")?;
                let rows = stmt.query_map([], LetterTemplateRecord::from_row)?;
                rows.collect()
            })
        })
    }

    pub fn get_letter_template(
        &self,
        id: i64,
    ) -> Result<Option<LetterTemplateRecord>, VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "read letter template", || {
                conn.query_row(
                    "SELECT * FROM letter_templates WHERE id = ?1",
                    [id],
                    LetterTemplateRecord::from_row,
                )
                .optional()
            })
        })
    }

    /// Updates a template's content and bumps its modified stamp.
    pub fn update_letter_template(
        &self,
        acting_user: &str,
        id: i64,
        content: &str,
    ) -> Result<bool, VaultError> {
        self.require_permission(acting_user, "letters")?;
        let updated = self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "update letter template", || {
                let rows = conn.execute(
                    "UPDATE letter_templates
                     SET content = ?1, modified_at = datetime('now')
                     WHERE id = ?2",
                    params![content, id],
                )?;
                Ok(rows > 0)
            })
        })?;
        if updated {
            self.log_action(
                acting_user,
                "UPDATE_TEMPLATE",
                Some("letter_templates"),
                Some(&id.to_string()),
                None,
                None,
                None,
            )?;
        }
        Ok(updated)
    }

    /// Records a generated letter.
    pub fn save_letter_history(&self, input: &LetterHistoryInput) -> Result<i64, VaultError> {
        self.require_permission(&input.created_by, "letters")?;
        let id = self.with_conn(|conn| {
            with_retry(RetryPolicy::writes(), "save letter history", || {
                conn.execute(
                    "INSERT INTO letter_history
                         (employee_id, letter_type, letter_date, store_id, reason,
                          supervisor_name, supervisor_title, file_path, created_by)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        input.employee_id,
                        input.letter_type,
                        input.letter_date,
                        input.store_id,
                        input.reason,
                        input.supervisor_name,
                        input.supervisor_title,
                        input.file_path,
                        input.created_by
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
        })?;
        self.log_action(
            &input.created_by,
            "GENERATE_LETTER",
            Some("letter_history"),
            Some(&input.employee_id),
            None,
            Some(&input.letter_type),
            None,
        )?;
        Ok(id)
    }

    /// Letters generated for one employee, newest first, joined with the
    /// store names for display.
    pub fn get_letter_history(
        &self,
        employee_id: &str,
    ) -> Result<Vec<LetterHistoryRecord>, VaultError> {
        self.with_conn(|conn| {
            with_retry(RetryPolicy::quick(), "read letter history", || {
                let mut stmt = conn.prepare(
                    "SELECT lh.*, s.company_name, s.branch_name
                     FROM letter_history lh
                     LEFT JOIN stores s ON s.id = lh.store_id
                     WHERE lh.employee_id = ?1
                     ORDER BY lh.created_at DESC, lh.id DESC",
                )?;
                let rows = stmt.query_map([employee_id], LetterHistoryRecord::from_row)?;
                rows.collect()
            })
        })
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

    #[test]
    fn seeded_agencies_and_cache_invalidation() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let agencies = db.get_agencies().unwrap();
        assert_eq!(agencies.len(), 6);
        assert!(agencies.contains(&"NEXUS".to_string()));

        assert!(db.add_agency("admin", "AURORA STAFFING").unwrap());
        assert!(!db.add_agency("admin", "AURORA STAFFING").unwrap());
        // Cache was invalidated by the write.
        assert_eq!(db.get_agencies().unwrap().len(), 7);
    }

    #[test]
    fn stores_toggle_out_of_the_active_list() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let id = db
            .add_store("admin", "SUN WU Corp", "Main Branch", Some("123 Rizal Ave"))
            .unwrap();
        db.add_store("admin", "SUN WU Corp", "Annex", None).unwrap();
        assert_eq!(db.get_active_stores().unwrap().len(), 2);

        assert!(db.set_store_active("admin", id, false).unwrap());
        assert_eq!(db.get_active_stores().unwrap().len(), 1);
        assert_eq!(db.get_all_stores().unwrap().len(), 2);

        assert!(db
            .update_store("admin", id, "SUN WU Corp", "Main Branch", Some("456 Bonifacio St"))
            .unwrap());
    }

    #[test]
    fn letter_history_joins_store_names() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let employee = EmployeeRecord {
            emp_id: "E-001-25".to_string(),
            name: "Alice Reyes".to_string(),
            hire_date: "2024-03-01".to_string(),
            ..Default::default()
        };
        db.add_employee("admin", &employee).unwrap();
        let store_id = db
            .add_store("admin", "SUN WU Corp", "Main Branch", None)
            .unwrap();

        let templates = db.get_letter_templates().unwrap();
        assert_eq!(templates.len(), 1); // seeded default

        db.save_letter_history(&LetterHistoryInput {
            employee_id: "E-001-25".to_string(),
            letter_type: "excuse".to_string(),
            letter_date: "2025-08-15".to_string(),
            store_id: Some(store_id),
            reason: Some("medical appointment".to_string()),
            created_by: "admin".to_string(),
            ..Default::default()
        })
        .unwrap();

        let history = db.get_letter_history("E-001-25").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].company_name.as_deref(), Some("SUN WU Corp"));
        assert_eq!(history[0].branch_name.as_deref(), Some("Main Branch"));
    }
}

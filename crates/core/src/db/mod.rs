//! SQLite persistence for the local scope.
//!
//! [`Database`] owns one connection in WAL mode, runs the versioned
//! migrations in [`schema`] and exposes typed helpers (see [`queries`]) for
//! objects, the component index, lanes and the import log.

pub mod queries;
pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::errors::DatabaseError;

/// Handle to the scope database. `Send + Sync`; share it through an `Arc`.
pub struct Database {
    conn: Mutex<Connection>,
}

fn configure(conn: &Connection, on_disk: bool) -> Result<(), DatabaseError> {
    if on_disk {
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
    }
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(())
}

impl Database {
    /// Open or create the database file at `path`. Missing parent
    /// directories are created.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent)?,
            _ => {}
        }
        let conn = Connection::open(path)?;
        configure(&conn, true)?;
        info!(path = %path.display(), "opened scope database");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        configure(&conn, false)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Bring the schema up to date.
    pub fn initialize(&self) -> Result<(), DatabaseError> {
        let conn = self.conn();
        schema::run_migrations(&conn)?;
        debug!(version = schema::current_version(&conn)?, "scope schema ready");
        Ok(())
    }

    /// Lock the connection. A poisoned lock is recovered.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("scope database lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Run `f` in a transaction: committed on `Ok`, rolled back on `Err`.
    pub fn transaction<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::queries::ObjectKind;

    #[test]
    fn test_file_database_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scope").join("objects.db");
        let db = Database::new(&path).unwrap();
        db.initialize().unwrap();
        assert!(path.exists());

        // Migrations are idempotent.
        db.initialize().unwrap();
    }

    #[test]
    fn test_failed_batch_leaves_no_objects() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();

        let result: Result<(), DatabaseError> = db.transaction(|conn| {
            conn.execute(
                "INSERT INTO objects (hash, kind, data, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params!["abc", ObjectKind::File.as_str(), b"data".to_vec(), "2025-01-01T00:00:00Z"],
            )?;
            Err(DatabaseError::NotFound {
                entity: "object".into(),
                id: "forced".into(),
            })
        });
        assert!(result.is_err());
        assert_eq!(db.count_objects().unwrap(), 0);
    }
}

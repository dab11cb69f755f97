//! Typed query helpers for every table in the local scope database.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use super::Database;
use crate::errors::DatabaseError;

// ---------------------------------------------------------------------------
// Row structs returned by queries
// ---------------------------------------------------------------------------

/// Kind of a content-addressed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Version,
    File,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Version => "version",
            Self::File => "file",
        }
    }
}

/// A row from the `components` or `lanes` table: key plus JSON payload.
#[derive(Debug, Clone)]
pub struct JsonRow {
    pub id: String,
    pub data: String,
    pub updated_at: String,
}

/// A row from the `import_log` table.
#[derive(Debug, Clone)]
pub struct ImportLogEntry {
    pub id: String,
    pub mode: String,
    pub requested_count: i64,
    pub imported_count: i64,
    pub missing_count: i64,
    pub success: bool,
    pub details: Option<String>,
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- objects ------------------------------------------------------------

    /// Store an object unless one with the same hash exists. Returns whether
    /// a row was inserted. Existing bytes are never overwritten.
    pub fn insert_object_if_absent(
        &self,
        hash: &str,
        kind: ObjectKind,
        data: &[u8],
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO objects (hash, kind, data, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![hash, kind.as_str(), data, now],
        )?;
        if inserted > 0 {
            debug!(hash, kind = kind.as_str(), "stored object");
        }
        Ok(inserted > 0)
    }

    /// Store a batch of objects in one transaction, skipping hashes that
    /// already exist. Returns the number of rows inserted.
    pub fn insert_objects(&self, objects: &[(String, ObjectKind, Vec<u8>)]) -> Result<usize, DatabaseError> {
        if objects.is_empty() {
            return Ok(0);
        }
        let now = Utc::now().to_rfc3339();
        let inserted = self.transaction(|conn| {
            let mut stmt = conn.prepare(
                "INSERT OR IGNORE INTO objects (hash, kind, data, created_at) VALUES (?1, ?2, ?3, ?4)",
            )?;
            let mut inserted = 0;
            for (hash, kind, data) in objects {
                inserted += stmt.execute(params![hash, kind.as_str(), data, now])?;
            }
            Ok(inserted)
        })?;
        debug!(total = objects.len(), inserted, "stored object batch");
        Ok(inserted)
    }

    /// Fetch the raw bytes of an object of the given kind.
    pub fn get_object(&self, hash: &str, kind: ObjectKind) -> Result<Option<Vec<u8>>, DatabaseError> {
        let conn = self.conn();
        let data = conn
            .query_row(
                "SELECT data FROM objects WHERE hash = ?1 AND kind = ?2",
                params![hash, kind.as_str()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(data)
    }

    /// Whether any object with this hash exists.
    pub fn has_object(&self, hash: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM objects WHERE hash = ?1",
            params![hash],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn count_objects(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM objects", [], |row| row.get(0))?;
        Ok(count)
    }

    // -- components ---------------------------------------------------------

    /// Insert or replace a component index record.
    pub fn upsert_component(
        &self,
        id: &str,
        scope: Option<&str>,
        name: &str,
        data: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO components (id, scope, name, data, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
            params![id, scope, name, data, now],
        )?;
        debug!(id, "upserted component");
        Ok(())
    }

    pub fn get_component(&self, id: &str) -> Result<Option<JsonRow>, DatabaseError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, data, updated_at FROM components WHERE id = ?1",
                params![id],
                |row| {
                    Ok(JsonRow {
                        id: row.get(0)?,
                        data: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// List component records, optionally restricted to one scope.
    pub fn list_components(&self, scope: Option<&str>) -> Result<Vec<JsonRow>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, data, updated_at FROM components
             WHERE ?1 IS NULL OR scope = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![scope], |row| {
                Ok(JsonRow {
                    id: row.get(0)?,
                    data: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- lanes --------------------------------------------------------------

    pub fn upsert_lane(
        &self,
        id: &str,
        scope: &str,
        name: &str,
        data: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO lanes (id, scope, name, data, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
            params![id, scope, name, data, now],
        )?;
        debug!(id, "upserted lane");
        Ok(())
    }

    pub fn get_lane(&self, id: &str) -> Result<Option<JsonRow>, DatabaseError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, data, updated_at FROM lanes WHERE id = ?1",
                params![id],
                |row| {
                    Ok(JsonRow {
                        id: row.get(0)?,
                        data: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_lanes(&self) -> Result<Vec<JsonRow>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, data, updated_at FROM lanes ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(JsonRow {
                    id: row.get(0)?,
                    data: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- import_log ---------------------------------------------------------

    /// Record one import session.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_import_log(
        &self,
        id: Uuid,
        mode: &str,
        requested_count: usize,
        imported_count: usize,
        missing_count: usize,
        success: bool,
        details: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO import_log
             (id, mode, requested_count, imported_count, missing_count, success, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id.to_string(),
                mode,
                requested_count as i64,
                imported_count as i64,
                missing_count as i64,
                success,
                details,
                now
            ],
        )?;
        debug!(%id, mode, "inserted import_log entry");
        Ok(())
    }

    /// List recent import-log entries, newest first.
    pub fn list_import_log(&self, limit: u32) -> Result<Vec<ImportLogEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, mode, requested_count, imported_count, missing_count, success, details, created_at
             FROM import_log ORDER BY created_at DESC, rowid DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit], |row| {
                Ok(ImportLogEntry {
                    id: row.get(0)?,
                    mode: row.get(1)?,
                    requested_count: row.get(2)?,
                    imported_count: row.get(3)?,
                    missing_count: row.get(4)?,
                    success: row.get(5)?,
                    details: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

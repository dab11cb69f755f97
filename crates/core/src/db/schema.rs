//! Scope database schema and its migrations.
//!
//! Migrations are SQL batches applied in order; SQLite's `user_version`
//! pragma records the last one applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
/// Versions start at 1. The current schema version is stored in the SQLite
/// `user_version` pragma.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "object store and component index",
        r#"
        CREATE TABLE IF NOT EXISTS objects (
            hash        TEXT PRIMARY KEY,
            kind        TEXT NOT NULL CHECK (kind IN ('version', 'file')),
            data        BLOB NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_objects_kind ON objects (kind);

        CREATE TABLE IF NOT EXISTS components (
            id          TEXT PRIMARY KEY,
            scope       TEXT,
            name        TEXT NOT NULL,
            data        TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_components_scope ON components (scope);
        "#,
    ),
    (
        2,
        "lanes",
        r#"
        CREATE TABLE IF NOT EXISTS lanes (
            id          TEXT PRIMARY KEY,
            scope       TEXT NOT NULL,
            name        TEXT NOT NULL,
            data        TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        "#,
    ),
    (
        3,
        "import log",
        r#"
        CREATE TABLE IF NOT EXISTS import_log (
            id              TEXT PRIMARY KEY,
            mode            TEXT NOT NULL,
            requested_count INTEGER NOT NULL DEFAULT 0,
            imported_count  INTEGER NOT NULL DEFAULT 0,
            missing_count   INTEGER NOT NULL DEFAULT 0,
            success         INTEGER NOT NULL DEFAULT 1,
            details         TEXT,
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_import_log_created_at ON import_log (created_at);
        "#,
    ),
];

/// Apply every migration newer than the stored `user_version`, one at a
/// time, bumping the version after each.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let from = current_version(conn)?;
    let pending: Vec<_> = MIGRATIONS.iter().filter(|(v, _, _)| *v > from).collect();
    if pending.is_empty() {
        debug!(version = from, "no pending migrations");
        return Ok(());
    }

    for &&(version, description, sql) in &pending {
        info!(version, description, "applying migration");
        conn.execute_batch(sql)
            .map_err(|e| DatabaseError::MigrationFailed {
                version,
                detail: e.to_string(),
            })?;
        conn.pragma_update(None, "user_version", version)?;
    }
    Ok(())
}

/// Schema version recorded in the database.
pub fn current_version(conn: &Connection) -> Result<u32, DatabaseError> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_run_idempotently() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), 3);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect()
        };

        for table in ["objects", "components", "lanes", "import_log"] {
            assert!(tables.contains(&table.to_string()), "missing table {table}");
        }
    }
}

//! Error types for the compsync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

use crate::divergence::DivergedComponent;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Writer(#[from] WriterError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Object model errors
// ---------------------------------------------------------------------------

/// Errors from parsing or validating identity and object-model values.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A component id string could not be parsed.
    #[error("invalid component id '{id}': {detail}")]
    InvalidId { id: String, detail: String },

    /// A lane id string could not be parsed.
    #[error("invalid lane id '{0}', expected '<scope>/<name>'")]
    InvalidLaneId(String),

    /// A content hash string is not a hex SHA-256 digest.
    #[error("invalid object ref '{0}'")]
    InvalidRef(String),

    /// JSON (de)serialization of an object failed.
    #[error("object serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Object store errors
// ---------------------------------------------------------------------------

/// Errors from the local content-addressed store and the remote stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A referenced object or component does not exist in the store.
    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    /// The bytes received for an object do not hash to the expected ref.
    #[error("object hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// No remote store is registered for the scope.
    #[error("no remote registered for scope '{0}'")]
    UnknownScope(String),

    /// The component id has no scope, so there is no remote to ask.
    #[error("component '{0}' has no scope and cannot be fetched from a remote")]
    MissingScope(String),

    /// A version lists a file path that is absolute or leaves the
    /// component directory.
    #[error("version {version} has unsafe file path '{path}'")]
    UnsafePath { version: String, path: String },

    /// A remote store reported a failure.
    #[error("remote '{scope}' error: {detail}")]
    Remote { scope: String, detail: String },

    /// A stored record could not be decoded.
    #[error("corrupted object {id}: {detail}")]
    Corrupt { id: String, detail: String },

    /// Underlying database error.
    #[error("store database error: {0}")]
    Database(#[from] DatabaseError),

    /// Object model error while decoding.
    #[error("store model error: {0}")]
    Model(#[from] ModelError),
}

impl StoreError {
    /// Shorthand for a [`StoreError::NotFound`].
    pub fn not_found(kind: &str, id: impl ToString) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    /// Whether this error means the object is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Merge errors
// ---------------------------------------------------------------------------

/// Errors from the three-way merge subsystem.
#[derive(Debug, Error)]
pub enum MergeError {
    /// The component has no checked-out version to use as merge base.
    #[error("no base version for modified component '{0}'")]
    MissingBase(String),

    /// Reading objects needed for the merge failed.
    #[error("merge store error: {0}")]
    Store(#[from] StoreError),

    /// Reading workspace files needed for the merge failed.
    #[error("merge workspace error: {0}")]
    Workspace(#[from] WorkspaceError),
}

// ---------------------------------------------------------------------------
// Workspace errors
// ---------------------------------------------------------------------------

/// Errors from the workspace mapping and workspace file access.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// The mapping file could not be loaded or saved.
    #[error("workspace mapping file error at '{path}': {detail}")]
    MappingFileError { path: String, detail: String },

    /// TOML parse error when reading the mapping file.
    #[error("workspace mapping parse error: {0}")]
    ParseError(String),

    /// The component is not tracked by the workspace mapping.
    #[error("component '{0}' is not tracked in the workspace")]
    NotTracked(String),

    /// Object lookup failed while computing a component status.
    #[error("workspace store error: {0}")]
    Store(#[from] StoreError),

    /// Generic I/O error.
    #[error("workspace I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Component writer errors
// ---------------------------------------------------------------------------

/// Errors from the component file writer.
#[derive(Debug, Error)]
pub enum WriterError {
    /// The target directory exists and is not the component's own directory.
    #[error("unable to write '{id}': directory '{path}' already exists")]
    ExistingDirectory { id: String, path: String },

    /// A file path would resolve outside the component directory.
    #[error("unable to write '{id}': unsafe file path '{path}'")]
    UnsafePath { id: String, path: String },

    /// A write task panicked or was cancelled.
    #[error("write task failed: {0}")]
    Task(String),

    /// Generic I/O error.
    #[error("writer I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Import session errors
// ---------------------------------------------------------------------------

/// Errors that abort an import session.
#[derive(Debug, Error)]
pub enum ImportError {
    /// The options failed validation at session start.
    #[error("invalid import options: {0}")]
    InvalidOptions(String),

    /// An id given by the caller could not be parsed.
    #[error(transparent)]
    InvalidId(#[from] ModelError),

    /// Diverged components exist and merge mode is off.
    #[error(
        "the following components have diverged histories, use the merge option to reconcile them:\n{}",
        format_diverged(.components)
    )]
    PendingMerge { components: Vec<DivergedComponent> },

    /// Components are not reachable from the active lane, the session lanes or trunk.
    #[error(
        "unable to import the following component(s) as they belong to other lane(s):\n{}\nif you need this specific snap, find the lane it belongs to and merge the component from that lane",
        .ids.join(", ")
    )]
    ComponentsFromAnotherLane { ids: Vec<String> },

    /// Requested components have local changes and neither merge nor override was requested.
    #[error(
        "unable to import the following components due to local changes, use merge to merge your local changes or override to discard them:\n{}",
        .ids.join("\n")
    )]
    LocalModifications { ids: Vec<String> },

    /// The requested id collides with an unscoped local component of the same name.
    #[error("unable to import {id}: the name conflicts with a local component that has no scope, export it first")]
    NameCollision { id: String },

    /// A wildcard matched remote ids, none of which are on the session lanes.
    #[error(
        "the pattern \"{pattern}\" matched component ids, but none of them exist on lane(s) {}; to import them from main, request them explicitly: {}",
        .lanes.join(", "),
        .ids.join(" ")
    )]
    WildcardOutsideLane {
        pattern: String,
        lanes: Vec<String>,
        ids: Vec<String>,
    },

    /// Strict seed fetch was requested and some targets could not be fetched.
    #[error("failed to fetch the following component(s): {}", .ids.join(", "))]
    SeedsNotFound { ids: Vec<String> },

    /// Object store error (including missing versions).
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Merge error.
    #[error(transparent)]
    Merge(#[from] MergeError),

    /// Workspace error.
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    /// The component writer failed.
    #[error(transparent)]
    Write(#[from] WriterError),

    /// The merge strategy prompt failed or was aborted.
    #[error("merge strategy prompt failed: {0}")]
    Prompt(String),

    /// A background task panicked.
    #[error("import task failed: {0}")]
    Task(String),
}

fn format_diverged(components: &[DivergedComponent]) -> String {
    components
        .iter()
        .map(|c| {
            format!(
                "{} (local snaps: {}, remote snaps: {})",
                c.id, c.snaps_local, c.snaps_remote
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = StoreError::not_found("version", "abc123");
        assert_eq!(err.to_string(), "version not found: abc123");
        assert!(err.is_not_found());

        let err = ImportError::ComponentsFromAnotherLane {
            ids: vec!["org/a@1".into(), "org/b@2".into()],
        };
        assert!(err.to_string().contains("org/a@1, org/b@2"));

        let err = ConfigError::InvalidValue {
            field: "fetch.concurrency".into(),
            detail: "must be > 0".into(),
        };
        assert!(err.to_string().contains("fetch.concurrency"));
    }

    #[test]
    fn test_pending_merge_lists_counts() {
        let err = ImportError::PendingMerge {
            components: vec![DivergedComponent {
                id: "org/pkg".into(),
                snaps_local: 2,
                snaps_remote: 3,
            }],
        };
        let msg = err.to_string();
        assert!(msg.contains("org/pkg (local snaps: 2, remote snaps: 3)"));
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let store_err = StoreError::UnknownScope("org".into());
        let core_err: CoreError = store_err.into();
        assert!(matches!(core_err, CoreError::Store(_)));

        let import_err: ImportError = StoreError::not_found("version", "x").into();
        assert!(matches!(import_err, ImportError::Store(_)));
    }
}

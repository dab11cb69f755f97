//! Workspace collaborators: the component mapping, on-disk status and the
//! component writer.
//!
//! The engine talks to these through traits so hosts can plug their own
//! workspace model in. [`MappingFile`], [`FsWorkspace`] and
//! [`FsComponentWriter`] are the filesystem implementations.

pub mod fs;
pub mod fs_writer;
pub mod mapping_file;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{WorkspaceError, WriterError};
use crate::objects::{ComponentId, LaneId};

pub use fs::FsWorkspace;
pub use fs_writer::{DependencyInstaller, FsComponentWriter};
pub use mapping_file::MappingFile;

/// Name of the per-component config file emitted by the writer. It is not
/// part of the component's source files.
pub const COMPONENT_CONFIG_FILE: &str = "component.json";

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

/// One tracked component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    /// Id with the checked-out version. No version means the component was
    /// never snapped.
    pub id: ComponentId,
    /// Directory relative to the workspace root.
    pub root_dir: String,
    /// Set when the component only exists on the current lane.
    #[serde(default)]
    pub on_lane_only: bool,
}

/// Record of which components the workspace tracks, at which version and
/// where.
pub trait WorkspaceMapping: Send {
    fn all_ids(&self) -> Vec<ComponentId>;

    /// Ids that belong to a remote scope.
    fn all_ids_with_scope(&self) -> Vec<ComponentId> {
        self.all_ids().into_iter().filter(|id| id.has_scope()).collect()
    }

    /// The tracked id (with its version) for a component, ignoring the
    /// version of `id`.
    fn find_id(&self, id: &ComponentId) -> Option<ComponentId> {
        self.entry(id).map(|e| e.id)
    }

    fn entry(&self, id: &ComponentId) -> Option<MappingEntry>;

    /// Point a component at `id`'s version, adding it under `root_dir` when
    /// it is not tracked yet.
    fn update_component_id(&mut self, id: &ComponentId, root_dir: &str);

    fn set_lane_only(&mut self, id: &ComponentId, on_lane_only: bool);

    fn persist(&mut self) -> Result<(), WorkspaceError>;
}

/// Mapping shared between the session and the workspace implementation.
pub type SharedMapping = Arc<tokio::sync::Mutex<dyn WorkspaceMapping>>;

/// Wrap a mapping for sharing.
pub fn shared_mapping<M: WorkspaceMapping + 'static>(mapping: M) -> SharedMapping {
    Arc::new(tokio::sync::Mutex::new(mapping))
}

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

/// State of a component on disk compared with its checked-out version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComponentStatus {
    pub tracked: bool,
    pub modified: bool,
    pub newly_created: bool,
}

/// A file as read from or written to the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceFile {
    /// Path relative to the component root, `/`-separated.
    pub path: String,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait Workspace: Send + Sync {
    /// Lane the workspace is checked out on; `None` means trunk.
    async fn current_lane_id(&self) -> Option<LaneId>;

    async fn component_status(&self, id: &ComponentId) -> Result<ComponentStatus, WorkspaceError>;

    /// Current files of a tracked component.
    async fn load_files(&self, id: &ComponentId) -> Result<Vec<WorkspaceFile>, WorkspaceError>;
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ComponentToWrite {
    /// Id with the version being written.
    pub id: ComponentId,
    pub root_dir: String,
    pub files: Vec<WorkspaceFile>,
    /// Paths to delete from the component root.
    pub removed_files: Vec<String>,
    pub dependencies: Vec<ComponentId>,
    pub env: Option<String>,
    /// Whether the component was tracked before this write.
    pub tracked: bool,
}

#[derive(Debug, Clone, Default)]
pub struct WriteRequest {
    pub components: Vec<ComponentToWrite>,
    pub write_to_path: Option<PathBuf>,
    pub skip_dependency_install: bool,
    pub skip_config_files: bool,
    /// Record the components without touching their files.
    pub track_only: bool,
    /// Refuse to write an untracked component into an existing, non-empty
    /// directory.
    pub throw_if_existing_dir: bool,
    /// Ceiling on components written at once; the writer's own limit when
    /// unset.
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct WriterResults {
    pub written: Vec<ComponentId>,
    pub installation_error: Option<String>,
    pub compilation_error: Option<String>,
}

#[async_trait]
pub trait ComponentWriter: Send + Sync {
    async fn write_many(&self, request: WriteRequest) -> Result<WriterResults, WriterError>;
}

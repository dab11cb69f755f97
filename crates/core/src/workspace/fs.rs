//! Filesystem workspace: component status from the files on disk.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{ComponentStatus, SharedMapping, Workspace, WorkspaceFile, COMPONENT_CONFIG_FILE};
use crate::errors::WorkspaceError;
use crate::objects::{ComponentId, LaneId, Ref};
use crate::scope::LocalScope;

pub struct FsWorkspace {
    root: PathBuf,
    mapping: SharedMapping,
    scope: Arc<LocalScope>,
    current_lane: Option<LaneId>,
}

impl FsWorkspace {
    pub fn new<P: AsRef<Path>>(root: P, mapping: SharedMapping, scope: Arc<LocalScope>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            mapping,
            scope,
            current_lane: None,
        }
    }

    /// Check the workspace out on a lane.
    pub fn with_lane(mut self, lane: LaneId) -> Self {
        self.current_lane = Some(lane);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn component_dir(&self, id: &ComponentId) -> Result<PathBuf, WorkspaceError> {
        let mapping = self.mapping.lock().await;
        let entry = mapping
            .entry(id)
            .ok_or_else(|| WorkspaceError::NotTracked(id.to_string_without_version()))?;
        Ok(self.root.join(entry.root_dir))
    }
}

/// Read every file under `dir`, keyed by `/`-separated relative path.
pub(crate) fn collect_files(dir: &Path) -> io::Result<Vec<WorkspaceFile>> {
    fn walk(base: &Path, dir: &Path, out: &mut Vec<WorkspaceFile>) -> io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                walk(base, &path, out)?;
                continue;
            }
            let rel = path
                .strip_prefix(base)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            if rel == COMPONENT_CONFIG_FILE {
                continue;
            }
            out.push(WorkspaceFile {
                path: rel,
                data: std::fs::read(&path)?,
            });
        }
        Ok(())
    }

    let mut out = Vec::new();
    if dir.exists() {
        walk(dir, dir, &mut out)?;
    }
    out.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(out)
}

#[async_trait]
impl Workspace for FsWorkspace {
    async fn current_lane_id(&self) -> Option<LaneId> {
        self.current_lane.clone()
    }

    async fn component_status(&self, id: &ComponentId) -> Result<ComponentStatus, WorkspaceError> {
        let Some(entry) = self.mapping.lock().await.entry(id) else {
            return Ok(ComponentStatus::default());
        };
        let Some(version) = entry.id.version() else {
            return Ok(ComponentStatus {
                tracked: true,
                modified: false,
                newly_created: true,
            });
        };

        let checked_out = match self.scope.get_if_exists(&entry.id)? {
            Some(model) => match self.scope.resolve_version_ref(&model, Some(version)) {
                Some(hash) => self.scope.get_version_if_exists(&hash)?,
                None => None,
            },
            None => None,
        };
        let Some(checked_out) = checked_out else {
            debug!(id = %entry.id, "checked-out version not in the local scope");
            return Ok(ComponentStatus {
                tracked: true,
                modified: false,
                newly_created: false,
            });
        };

        let on_disk = self.load_files(id).await?;
        let disk: BTreeMap<&str, Ref> = on_disk
            .iter()
            .map(|f| (f.path.as_str(), Ref::of(&f.data)))
            .collect();
        let stored: BTreeMap<&str, Ref> = checked_out
            .files
            .iter()
            .map(|f| (f.path.as_str(), f.file.clone()))
            .collect();

        let modified = disk != stored;
        debug!(id = %entry.id, modified, "computed component status");
        Ok(ComponentStatus {
            tracked: true,
            modified,
            newly_created: false,
        })
    }

    async fn load_files(&self, id: &ComponentId) -> Result<Vec<WorkspaceFile>, WorkspaceError> {
        let dir = self.component_dir(id).await?;
        let files = tokio::task::spawn_blocking(move || collect_files(&dir))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{ModelComponent, Version};
    use crate::workspace::{shared_mapping, MappingFile, WorkspaceMapping};

    async fn setup() -> (tempfile::TempDir, FsWorkspace, ComponentId) {
        let dir = tempfile::tempdir().unwrap();
        let scope = Arc::new(LocalScope::in_memory().unwrap());

        let content = b"export const a = 1;\n".to_vec();
        let file_ref = scope.put_file(&content).unwrap();
        let version = Version::builder("alice", "init")
            .file("index.ts", file_ref)
            .build()
            .unwrap();
        scope.put_version(&version).unwrap();
        let id = ComponentId::parse("org/a").unwrap();
        let mut model = ModelComponent::new(&id);
        model.add_tag("1.0.0", version.hash.clone());
        model.head = Some(version.hash.clone());
        scope.put_model_component(&model).unwrap();

        let comp_dir = dir.path().join("components/a");
        std::fs::create_dir_all(&comp_dir).unwrap();
        std::fs::write(comp_dir.join("index.ts"), &content).unwrap();
        std::fs::write(comp_dir.join(COMPONENT_CONFIG_FILE), b"{}").unwrap();

        let mut mapping = MappingFile::new(dir.path().join("mapping.toml"));
        mapping.update_component_id(&id.with_version("1.0.0"), "components/a");
        let workspace = FsWorkspace::new(dir.path(), shared_mapping(mapping), scope);
        (dir, workspace, id)
    }

    #[tokio::test]
    async fn test_clean_component_is_not_modified() {
        let (_dir, ws, id) = setup().await;
        let status = ws.component_status(&id).await.unwrap();
        assert!(status.tracked);
        assert!(!status.modified);
        assert!(!status.newly_created);
    }

    #[tokio::test]
    async fn test_edit_marks_modified() {
        let (dir, ws, id) = setup().await;
        std::fs::write(dir.path().join("components/a/index.ts"), b"changed").unwrap();
        assert!(ws.component_status(&id).await.unwrap().modified);
    }

    #[tokio::test]
    async fn test_untracked_and_new() {
        let (_dir, ws, _) = setup().await;
        let status = ws
            .component_status(&ComponentId::parse("org/other").unwrap())
            .await
            .unwrap();
        assert!(!status.tracked);

        ws.mapping
            .lock()
            .await
            .update_component_id(&ComponentId::parse("fresh").unwrap(), "components/fresh");
        let status = ws
            .component_status(&ComponentId::parse("fresh").unwrap())
            .await
            .unwrap();
        assert!(status.newly_created);
    }

    #[tokio::test]
    async fn test_load_files_skips_config() {
        let (_dir, ws, id) = setup().await;
        let files = ws.load_files(&id).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "index.ts");
    }
}

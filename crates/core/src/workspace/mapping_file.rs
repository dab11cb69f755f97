//! TOML-based workspace mapping file.
//!
//! The file format:
//!
//! ```toml
//! [[components]]
//! id = "org/ui/button@1.0.0"
//! root_dir = "components/ui/button"
//!
//! [[components]]
//! id = "org/pkg-b@0.0.3"
//! root_dir = "components/pkg-b"
//! on_lane_only = false
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{MappingEntry, WorkspaceMapping};
use crate::errors::WorkspaceError;
use crate::objects::ComponentId;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MappingFileData {
    #[serde(default)]
    pub components: Vec<MappingEntry>,
}

/// Workspace mapping backed by a TOML file.
#[derive(Debug, Clone)]
pub struct MappingFile {
    path: PathBuf,
    entries: Vec<MappingEntry>,
    dirty: bool,
}

impl MappingFile {
    /// Empty mapping that will be saved to `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            entries: Vec::new(),
            dirty: false,
        }
    }

    /// Load the mapping file from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, WorkspaceError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading workspace mapping");

        if !path.exists() {
            return Err(WorkspaceError::MappingFileError {
                path: path.display().to_string(),
                detail: "file not found".into(),
            });
        }

        let contents = std::fs::read_to_string(path)?;
        let data: MappingFileData =
            toml::from_str(&contents).map_err(|e| WorkspaceError::ParseError(e.to_string()))?;

        debug!(count = data.components.len(), "loaded mapping entries");
        Ok(Self {
            path: path.to_path_buf(),
            entries: data.components,
            dirty: false,
        })
    }

    /// Load the file if it exists, else start empty.
    pub fn load_or_new<P: AsRef<Path>>(path: P) -> Result<Self, WorkspaceError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::new(path))
        }
    }

    /// Save the mapping back to disk.
    pub fn save(&self) -> Result<(), WorkspaceError> {
        info!(path = %self.path.display(), "saving workspace mapping");

        let data = MappingFileData {
            components: self.entries.clone(),
        };
        let toml_str =
            toml::to_string_pretty(&data).map_err(|e| WorkspaceError::ParseError(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, toml_str).map_err(|e| WorkspaceError::MappingFileError {
            path: self.path.display().to_string(),
            detail: e.to_string(),
        })?;

        debug!(count = self.entries.len(), "saved mapping entries");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[MappingEntry] {
        &self.entries
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Track a component. Replaces any entry for the same component.
    pub fn add(&mut self, entry: MappingEntry) {
        self.entries.retain(|e| !e.id.is_same_component(&entry.id));
        self.entries.push(entry);
        self.dirty = true;
    }
}

impl WorkspaceMapping for MappingFile {
    fn all_ids(&self) -> Vec<ComponentId> {
        self.entries.iter().map(|e| e.id.clone()).collect()
    }

    fn entry(&self, id: &ComponentId) -> Option<MappingEntry> {
        self.entries
            .iter()
            .find(|e| e.id.is_same_component(id))
            .cloned()
    }

    fn update_component_id(&mut self, id: &ComponentId, root_dir: &str) {
        match self.entries.iter_mut().find(|e| e.id.is_same_component(id)) {
            Some(entry) => {
                if &entry.id != id {
                    debug!(from = %entry.id, to = %id, "updating mapping version");
                    entry.id = id.clone();
                    self.dirty = true;
                }
            }
            None => {
                debug!(id = %id, root_dir, "tracking new component");
                self.entries.push(MappingEntry {
                    id: id.clone(),
                    root_dir: root_dir.to_string(),
                    on_lane_only: false,
                });
                self.dirty = true;
            }
        }
    }

    fn set_lane_only(&mut self, id: &ComponentId, on_lane_only: bool) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id.is_same_component(id)) {
            if entry.on_lane_only != on_lane_only {
                entry.on_lane_only = on_lane_only;
                self.dirty = true;
            }
        }
    }

    fn persist(&mut self) -> Result<(), WorkspaceError> {
        if !self.dirty {
            debug!("mapping unchanged, skipping save");
            return Ok(());
        }
        self.save()?;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ComponentId {
        ComponentId::parse(s).unwrap()
    }

    #[test]
    fn test_load_mapping_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.toml");

        let content = r#"
[[components]]
id = "org/ui/button@1.0.0"
root_dir = "components/ui/button"

[[components]]
id = "local-util"
root_dir = "components/local-util"
on_lane_only = true
"#;
        std::fs::write(&path, content).unwrap();

        let mapping = MappingFile::load(&path).unwrap();
        assert_eq!(mapping.all_ids().len(), 2);
        assert_eq!(mapping.all_ids_with_scope(), vec![id("org/ui/button@1.0.0")]);
        assert_eq!(
            mapping.find_id(&id("org/ui/button")),
            Some(id("org/ui/button@1.0.0"))
        );
        assert!(mapping.entry(&id("local-util")).unwrap().on_lane_only);
    }

    #[test]
    fn test_update_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.toml");

        let mut mapping = MappingFile::new(&path);
        mapping.update_component_id(&id("org/a@1"), "components/a");
        mapping.update_component_id(&id("org/a@2"), "ignored");
        mapping.set_lane_only(&id("org/a"), true);
        mapping.persist().unwrap();
        assert!(!mapping.is_dirty());

        let reloaded = MappingFile::load(&path).unwrap();
        let entry = reloaded.entry(&id("org/a")).unwrap();
        assert_eq!(entry.id, id("org/a@2"));
        assert_eq!(entry.root_dir, "components/a");
        assert!(entry.on_lane_only);
    }

    #[test]
    fn test_load_nonexistent() {
        let result = MappingFile::load("/nonexistent/mapping.toml");
        assert!(matches!(result, Err(WorkspaceError::MappingFileError { .. })));
    }

    #[test]
    fn test_load_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.toml");
        std::fs::write(&path, "").unwrap();

        let mapping = MappingFile::load(&path).unwrap();
        assert!(mapping.all_ids().is_empty());
    }
}

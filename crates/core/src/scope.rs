//! The local scope: a content-addressed object store plus the component
//! index and lanes, persisted in SQLite.

use std::collections::{HashSet, VecDeque};
use std::path::Path;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::queries::{ImportLogEntry, ObjectKind};
use crate::db::Database;
use crate::divergence::VersionSource;
use crate::errors::StoreError;
use crate::objects::{ComponentId, Lane, LaneId, ModelComponent, Ref, Version};
use crate::workspace::WorkspaceFile;

/// One import session as written to the import log.
#[derive(Debug, Clone)]
pub struct ImportLogRecord {
    pub session_id: Uuid,
    pub mode: String,
    pub requested: usize,
    pub imported: usize,
    pub missing: usize,
    pub success: bool,
    pub details: Option<String>,
}

/// Local object store and component index.
pub struct LocalScope {
    db: Database,
}

impl LocalScope {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Open (or create) the scope database at `path` and run migrations.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = Database::new(path)?;
        db.initialize()?;
        Ok(Self { db })
    }

    /// In-memory scope (useful for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let db = Database::in_memory()?;
        db.initialize()?;
        Ok(Self { db })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    // -----------------------------------------------------------------------
    // Component index
    // -----------------------------------------------------------------------

    pub fn get_if_exists(&self, id: &ComponentId) -> Result<Option<ModelComponent>, StoreError> {
        let key = id.to_string_without_version();
        match self.db.get_component(&key)? {
            Some(row) => {
                let component = serde_json::from_str(&row.data).map_err(|e| StoreError::Corrupt {
                    id: key,
                    detail: e.to_string(),
                })?;
                Ok(Some(component))
            }
            None => Ok(None),
        }
    }

    pub fn get_model_component(&self, id: &ComponentId) -> Result<ModelComponent, StoreError> {
        self.get_if_exists(id)?
            .ok_or_else(|| StoreError::not_found("component", id.to_string_without_version()))
    }

    /// Write a component record as is.
    pub fn put_model_component(&self, component: &ModelComponent) -> Result<(), StoreError> {
        let id = component.id()?;
        let data = serde_json::to_string(component).map_err(crate::errors::ModelError::from)?;
        self.db.upsert_component(
            &id.to_string_without_version(),
            component.scope.as_deref(),
            &component.name,
            &data,
        )?;
        Ok(())
    }

    pub fn list_components(&self, scope: Option<&str>) -> Result<Vec<ModelComponent>, StoreError> {
        self.db
            .list_components(scope)?
            .into_iter()
            .map(|row| {
                serde_json::from_str(&row.data).map_err(|e| StoreError::Corrupt {
                    id: row.id,
                    detail: e.to_string(),
                })
            })
            .collect()
    }

    /// Merge an incoming record into the local one.
    ///
    /// Tags are appended, never rewritten. The local head only fast-forwards:
    /// it moves to the incoming head when the local head is an ancestor of it.
    /// `remote_head` always records the incoming head.
    pub fn merge_component(&self, incoming: &ModelComponent) -> Result<ModelComponent, StoreError> {
        let id = incoming.id()?;
        let mut local = match self.get_if_exists(&id)? {
            Some(existing) => existing,
            None => {
                let mut fresh = incoming.clone();
                fresh.remote_head = incoming.head.clone();
                self.put_model_component(&fresh)?;
                debug!(id = %id, "added component to local index");
                return Ok(fresh);
            }
        };

        for tag in &incoming.tags {
            if local.add_tag(tag.version.clone(), tag.hash.clone()) {
                debug!(id = %id, tag = %tag.version, "added tag");
            }
        }

        if let Some(incoming_head) = &incoming.head {
            let fast_forward = match &local.head {
                None => true,
                Some(head) if head == incoming_head => false,
                Some(head) => match self.is_ancestor(head, incoming_head) {
                    Ok(is_ancestor) => is_ancestor,
                    Err(e) if e.is_not_found() => {
                        warn!(id = %id, error = %e, "history incomplete, keeping local head");
                        false
                    }
                    Err(e) => return Err(e),
                },
            };
            if fast_forward {
                debug!(id = %id, head = %incoming_head.short(), "fast-forwarded head");
                local.head = Some(incoming_head.clone());
            }
            local.remote_head = Some(incoming_head.clone());
        }
        local.deprecated = incoming.deprecated;

        self.put_model_component(&local)?;
        Ok(local)
    }

    // -----------------------------------------------------------------------
    // Objects
    // -----------------------------------------------------------------------

    /// Load a version, verifying its hash.
    pub fn load_version(&self, hash: &Ref) -> Result<Version, StoreError> {
        self.get_version_if_exists(hash)?
            .ok_or_else(|| StoreError::not_found("version", hash))
    }

    pub fn get_version_if_exists(&self, hash: &Ref) -> Result<Option<Version>, StoreError> {
        let Some(bytes) = self.db.get_object(hash.as_str(), ObjectKind::Version)? else {
            return Ok(None);
        };
        let version: Version = serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            id: hash.to_string(),
            detail: e.to_string(),
        })?;
        if &version.hash != hash {
            return Err(StoreError::HashMismatch {
                expected: hash.to_string(),
                actual: version.hash.to_string(),
            });
        }
        Ok(Some(version))
    }

    /// Store a version. Storing an existing hash is a no-op; returns whether
    /// the version was new.
    pub fn put_version(&self, version: &Version) -> Result<bool, StoreError> {
        version.verify()?;
        let data = serde_json::to_vec(version).map_err(crate::errors::ModelError::from)?;
        Ok(self
            .db
            .insert_object_if_absent(version.hash.as_str(), ObjectKind::Version, &data)?)
    }

    /// Store fetched versions and file blobs in one batch. Every version is
    /// verified before anything is written.
    pub fn put_objects(&self, versions: &[Version], files: &[Vec<u8>]) -> Result<usize, StoreError> {
        let mut batch = Vec::with_capacity(versions.len() + files.len());
        for version in versions {
            version.verify()?;
            let data = serde_json::to_vec(version).map_err(crate::errors::ModelError::from)?;
            batch.push((version.hash.to_string(), ObjectKind::Version, data));
        }
        for bytes in files {
            batch.push((Ref::of(bytes).to_string(), ObjectKind::File, bytes.clone()));
        }
        Ok(self.db.insert_objects(&batch)?)
    }

    /// Store a file blob, returning its hash.
    pub fn put_file(&self, bytes: &[u8]) -> Result<Ref, StoreError> {
        let hash = Ref::of(bytes);
        self.db
            .insert_object_if_absent(hash.as_str(), ObjectKind::File, bytes)?;
        Ok(hash)
    }

    /// Store a file blob received for `expected`, rejecting mismatched bytes.
    pub fn put_file_verified(&self, expected: &Ref, bytes: &[u8]) -> Result<(), StoreError> {
        let actual = Ref::of(bytes);
        if &actual != expected {
            return Err(StoreError::HashMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        self.put_file(bytes)?;
        Ok(())
    }

    pub fn load_file(&self, hash: &Ref) -> Result<Vec<u8>, StoreError> {
        let bytes = self
            .db
            .get_object(hash.as_str(), ObjectKind::File)?
            .ok_or_else(|| StoreError::not_found("file", hash))?;
        if &Ref::of(&bytes) != hash {
            return Err(StoreError::Corrupt {
                id: hash.to_string(),
                detail: "file content does not match its hash".into(),
            });
        }
        Ok(bytes)
    }

    /// Every file of `version`, in the version's order.
    pub fn load_version_files(&self, version: &Version) -> Result<Vec<WorkspaceFile>, StoreError> {
        version
            .files
            .iter()
            .map(|f| {
                Ok(WorkspaceFile {
                    path: f.path.clone(),
                    data: self.load_file(&f.file)?,
                })
            })
            .collect()
    }

    pub fn has_object(&self, hash: &Ref) -> Result<bool, StoreError> {
        Ok(self.db.has_object(hash.as_str())?)
    }

    /// Whether the version and every file blob it references are local.
    pub fn has_version_with_files(&self, hash: &Ref) -> Result<bool, StoreError> {
        let Some(version) = self.get_version_if_exists(hash)? else {
            return Ok(false);
        };
        for file in &version.files {
            if !self.has_object(&file.file)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // History queries
    // -----------------------------------------------------------------------

    /// Resolve a version string (tag or hash) for a component. `None` means
    /// latest: the head, or the latest tag when there is no head.
    pub fn resolve_version_ref(&self, model: &ModelComponent, version: Option<&str>) -> Option<Ref> {
        match version {
            Some(v) => model.ref_for(v),
            None => model
                .head
                .clone()
                .or_else(|| model.latest_tag().map(|t| t.hash.clone())),
        }
    }

    /// The snap an import should bring into the workspace: the lane head
    /// when the component is on `lane`, else the remote head when the local
    /// head has not already moved past it, else the local head.
    pub fn latest_incoming(
        &self,
        model: &ModelComponent,
        lane: Option<&Lane>,
    ) -> Result<Option<Ref>, StoreError> {
        let id = model.id()?;
        if let Some(head) = lane.and_then(|l| l.get_component_head(&id)) {
            return Ok(Some(head.clone()));
        }
        match (&model.head, &model.remote_head) {
            (Some(head), Some(remote)) if head != remote => {
                if self.is_ancestor(remote, head)? {
                    Ok(Some(head.clone()))
                } else {
                    Ok(Some(remote.clone()))
                }
            }
            (Some(head), _) => Ok(Some(head.clone())),
            (None, remote) => Ok(remote.clone()),
        }
    }

    /// Whether `ancestor` is reachable from `descendant` through parent links
    /// (a snap counts as its own ancestor).
    pub fn is_ancestor(&self, ancestor: &Ref, descendant: &Ref) -> Result<bool, StoreError> {
        let mut seen: HashSet<Ref> = HashSet::new();
        let mut queue: VecDeque<Ref> = VecDeque::from([descendant.clone()]);
        while let Some(hash) = queue.pop_front() {
            if &hash == ancestor {
                return Ok(true);
            }
            if !seen.insert(hash.clone()) {
                continue;
            }
            queue.extend(self.parents_of(&hash)?);
        }
        Ok(false)
    }

    fn resolve_id_ref(&self, id: &ComponentId) -> Result<Option<Ref>, StoreError> {
        let Some(model) = self.get_if_exists(id)? else {
            return Ok(None);
        };
        Ok(self.resolve_version_ref(&model, id.version()))
    }

    /// Whether the version of `id` is the lane's head for the component or
    /// one of its ancestors.
    pub fn is_part_of_lane_history(&self, id: &ComponentId, lane: &Lane) -> Result<bool, StoreError> {
        let Some(lane_head) = lane.get_component_head(id) else {
            return Ok(false);
        };
        let target = match id.version() {
            Some(v) => match Ref::parse(v) {
                Ok(hash) => Some(hash),
                Err(_) => self.resolve_id_ref(id)?,
            },
            None => return Ok(true),
        };
        match target {
            Some(hash) => self.is_ancestor(&hash, lane_head),
            None => Ok(false),
        }
    }

    /// Whether the version of `id` belongs to trunk: it is tagged, or it is
    /// reachable from the local or remote trunk head.
    pub fn is_part_of_main_history(&self, id: &ComponentId) -> Result<bool, StoreError> {
        let Some(model) = self.get_if_exists(id)? else {
            return Ok(false);
        };
        let Some(version) = id.version() else {
            return Ok(model.head.is_some() || !model.tags.is_empty());
        };
        if model.tag_ref(version).is_some() {
            return Ok(true);
        }
        let Some(target) = model.ref_for(version) else {
            return Ok(false);
        };
        for head in [&model.head, &model.remote_head].into_iter().flatten() {
            if self.is_ancestor(&target, head)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // -----------------------------------------------------------------------
    // Lanes
    // -----------------------------------------------------------------------

    pub fn get_lane(&self, id: &LaneId) -> Result<Option<Lane>, StoreError> {
        let key = id.to_string();
        match self.db.get_lane(&key)? {
            Some(row) => {
                let lane = serde_json::from_str(&row.data).map_err(|e| StoreError::Corrupt {
                    id: key,
                    detail: e.to_string(),
                })?;
                Ok(Some(lane))
            }
            None => Ok(None),
        }
    }

    pub fn save_lane(&self, lane: &Lane) -> Result<(), StoreError> {
        let data = serde_json::to_string(lane).map_err(crate::errors::ModelError::from)?;
        self.db
            .upsert_lane(&lane.id.to_string(), &lane.id.scope, &lane.id.name, &data)?;
        debug!(lane = %lane.id, components = lane.components.len(), "saved lane");
        Ok(())
    }

    pub fn list_lanes(&self) -> Result<Vec<Lane>, StoreError> {
        self.db
            .list_lanes()?
            .into_iter()
            .map(|row| {
                serde_json::from_str(&row.data).map_err(|e| StoreError::Corrupt {
                    id: row.id,
                    detail: e.to_string(),
                })
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Import log
    // -----------------------------------------------------------------------

    pub fn record_import(&self, record: &ImportLogRecord) -> Result<(), StoreError> {
        self.db.insert_import_log(
            record.session_id,
            &record.mode,
            record.requested,
            record.imported,
            record.missing,
            record.success,
            record.details.as_deref(),
        )?;
        info!(session = %record.session_id, mode = %record.mode, "recorded import session");
        Ok(())
    }

    pub fn list_imports(&self, limit: u32) -> Result<Vec<ImportLogEntry>, StoreError> {
        Ok(self.db.list_import_log(limit)?)
    }
}

impl VersionSource for LocalScope {
    fn parents_of(&self, hash: &Ref) -> Result<Vec<Ref>, StoreError> {
        Ok(self.load_version(hash)?.parents)
    }
}

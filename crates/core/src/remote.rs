//! Remote object stores.
//!
//! The transport is out of scope: a [`RemoteStore`] is anything that can list
//! ids, report heads and ship object bundles. [`Remotes`] maps scope names to
//! stores. [`MemoryRemote`] keeps everything in process and backs the tests
//! and local loopback setups.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::errors::StoreError;
use crate::objects::{ComponentId, Lane, LaneId, ModelComponent, Ref, Version};

/// What to ship in a [`RemoteStore::fetch_objects`] call.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    /// Resolve unversioned ids against this lane's heads.
    pub lane: Option<LaneId>,
    pub include_version_history: bool,
    /// Limit on history snaps per id; `None` ships all of it.
    pub history_depth: Option<u32>,
    pub with_dependencies: bool,
    /// Let the remote answer from its stored dependency graph instead of
    /// reading each dependency.
    pub prefer_dependency_graph: bool,
    pub reason: String,
}

/// Objects shipped for one component.
#[derive(Debug, Clone)]
pub struct ObjectBundle {
    pub component: ModelComponent,
    pub versions: Vec<Version>,
    pub files: Vec<Vec<u8>>,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Scope name served by this store.
    fn name(&self) -> &str;

    /// Component ids (without version) matching a wildcard pattern.
    async fn list(&self, pattern: &str, include_deprecated: bool) -> Result<Vec<ComponentId>, StoreError>;

    /// Current head of a component on trunk, or on `lane` when given and the
    /// lane has the component.
    async fn head(&self, id: &ComponentId, lane: Option<&LaneId>) -> Result<Option<Ref>, StoreError>;

    async fn fetch_objects(
        &self,
        ids: &[ComponentId],
        request: &FetchRequest,
    ) -> Result<Vec<ObjectBundle>, StoreError>;

    /// Raw bytes of a single object.
    async fn get_raw_object(&self, hash: &Ref) -> Result<Vec<u8>, StoreError>;
}

// ---------------------------------------------------------------------------
// Remotes registry
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct Remotes {
    stores: HashMap<String, Arc<dyn RemoteStore>>,
}

impl Remotes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a store under its own name. Replaces any previous store.
    pub fn register(&mut self, store: Arc<dyn RemoteStore>) {
        self.stores.insert(store.name().to_string(), store);
    }

    pub fn get(&self, scope: &str) -> Result<Arc<dyn RemoteStore>, StoreError> {
        self.stores
            .get(scope)
            .cloned()
            .ok_or_else(|| StoreError::UnknownScope(scope.to_string()))
    }

    /// Store for the scope of `id`.
    pub fn for_id(&self, id: &ComponentId) -> Result<Arc<dyn RemoteStore>, StoreError> {
        let scope = id
            .scope()
            .ok_or_else(|| StoreError::MissingScope(id.to_string()))?;
        self.get(scope)
    }

    pub fn scopes(&self) -> Vec<String> {
        let mut scopes: Vec<String> = self.stores.keys().cloned().collect();
        scopes.sort();
        scopes
    }
}

impl std::fmt::Debug for Remotes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remotes").field("scopes", &self.scopes()).finish()
    }
}

// ---------------------------------------------------------------------------
// In-memory remote
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    components: HashMap<String, ModelComponent>,
    versions: HashMap<Ref, Version>,
    files: HashMap<Ref, Vec<u8>>,
    lanes: HashMap<LaneId, Lane>,
    failing: HashSet<String>,
    omit_files: bool,
    fetch_calls: usize,
}

/// A remote scope held in memory.
pub struct MemoryRemote {
    name: String,
    state: Mutex<MemoryState>,
}

impl MemoryRemote {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish a snap on trunk: stores the version and its files, moves the
    /// head and optionally tags it.
    pub fn publish(&self, id: &ComponentId, version: Version, files: Vec<Vec<u8>>, tag: Option<&str>) {
        let mut state = self.state();
        let key = id.to_string_without_version();
        let component = state
            .components
            .entry(key)
            .or_insert_with(|| ModelComponent::new(id));
        component.head = Some(version.hash.clone());
        if let Some(tag) = tag {
            component.add_tag(tag, version.hash.clone());
        }
        for bytes in files {
            state.files.insert(Ref::of(&bytes), bytes);
        }
        state.versions.insert(version.hash.clone(), version);
    }

    /// Store a snap without moving any head (lane-only snaps).
    pub fn add_version(&self, version: Version, files: Vec<Vec<u8>>) {
        let mut state = self.state();
        for bytes in files {
            state.files.insert(Ref::of(&bytes), bytes);
        }
        state.versions.insert(version.hash.clone(), version);
    }

    pub fn set_deprecated(&self, id: &ComponentId, deprecated: bool) {
        if let Some(c) = self.state().components.get_mut(&id.to_string_without_version()) {
            c.deprecated = deprecated;
        }
    }

    pub fn set_lane(&self, lane: Lane) {
        self.state().lanes.insert(lane.id.clone(), lane);
    }

    /// Make every request touching `id` fail.
    pub fn fail_on(&self, id: &ComponentId) {
        self.state().failing.insert(id.to_string_without_version());
    }

    /// Ship bundles without file blobs, so callers must use raw reads.
    pub fn set_omit_files(&self, omit: bool) {
        self.state().omit_files = omit;
    }

    pub fn fetch_calls(&self) -> usize {
        self.state().fetch_calls
    }

    fn check_failing(state: &MemoryState, scope: &str, id: &ComponentId) -> Result<(), StoreError> {
        if state.failing.contains(&id.to_string_without_version()) {
            return Err(StoreError::Remote {
                scope: scope.to_string(),
                detail: format!("simulated failure for {id}"),
            });
        }
        Ok(())
    }

    fn resolve(
        state: &MemoryState,
        id: &ComponentId,
        lane: Option<&LaneId>,
    ) -> Result<(ModelComponent, Ref), StoreError> {
        let component = state
            .components
            .get(&id.to_string_without_version())
            .cloned()
            .ok_or_else(|| StoreError::not_found("component", id.to_string_without_version()))?;
        let lane_head = lane
            .and_then(|l| state.lanes.get(l))
            .and_then(|l| l.get_component_head(id))
            .cloned();
        let target = match id.version() {
            Some(v) => component.ref_for(v),
            None => lane_head.or_else(|| component.head.clone()),
        }
        .ok_or_else(|| StoreError::not_found("version", id.to_string()))?;
        Ok((component, target))
    }

    fn history(state: &MemoryState, start: &Ref, depth: Option<u32>) -> Result<Vec<Version>, StoreError> {
        let limit = depth.map(|d| d as usize).unwrap_or(usize::MAX);
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start.clone()]);
        while let Some(hash) = queue.pop_front() {
            if out.len() >= limit {
                break;
            }
            if !seen.insert(hash.clone()) {
                continue;
            }
            let version = state
                .versions
                .get(&hash)
                .ok_or_else(|| StoreError::not_found("version", &hash))?;
            queue.extend(version.parents.iter().cloned());
            out.push(version.clone());
        }
        Ok(out)
    }

    fn bundle(
        &self,
        state: &MemoryState,
        id: &ComponentId,
        request: &FetchRequest,
    ) -> Result<(ObjectBundle, Version), StoreError> {
        Self::check_failing(state, &self.name, id)?;
        let (component, target) = Self::resolve(state, id, request.lane.as_ref())?;
        let versions = if request.include_version_history {
            Self::history(state, &target, request.history_depth)?
        } else {
            Self::history(state, &target, Some(1))?
        };
        let target_version = versions
            .first()
            .cloned()
            .ok_or_else(|| StoreError::not_found("version", &target))?;
        let files = if state.omit_files {
            Vec::new()
        } else {
            target_version
                .files
                .iter()
                .filter_map(|f| state.files.get(&f.file).cloned())
                .collect()
        };
        Ok((
            ObjectBundle {
                component,
                versions,
                files,
            },
            target_version,
        ))
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(&self, pattern: &str, include_deprecated: bool) -> Result<Vec<ComponentId>, StoreError> {
        let state = self.state();
        let mut ids: Vec<ComponentId> = state
            .components
            .values()
            .filter(|c| include_deprecated || !c.deprecated)
            .filter_map(|c| c.id().ok())
            .filter(|id| id.matches(pattern))
            .collect();
        ids.sort_by_key(|id| id.to_string());
        Ok(ids)
    }

    async fn head(&self, id: &ComponentId, lane: Option<&LaneId>) -> Result<Option<Ref>, StoreError> {
        let state = self.state();
        Self::check_failing(&state, &self.name, id)?;
        let component = state
            .components
            .get(&id.to_string_without_version())
            .ok_or_else(|| StoreError::not_found("component", id.to_string_without_version()))?;
        let lane_head = lane
            .and_then(|l| state.lanes.get(l))
            .and_then(|l| l.get_component_head(id));
        Ok(lane_head.or(component.head.as_ref()).cloned())
    }

    async fn fetch_objects(
        &self,
        ids: &[ComponentId],
        request: &FetchRequest,
    ) -> Result<Vec<ObjectBundle>, StoreError> {
        let mut state = self.state();
        state.fetch_calls += 1;
        debug!(scope = %self.name, ids = ids.len(), reason = %request.reason, "serving fetch");

        let mut bundles = Vec::new();
        let mut shipped: HashSet<String> = HashSet::new();
        for id in ids {
            let (bundle, target) = self.bundle(&state, id, request)?;
            shipped.insert(id.to_string_without_version());
            bundles.push(bundle);

            if request.with_dependencies {
                for dep in &target.flattened_dependencies {
                    if !shipped.insert(dep.to_string_without_version()) {
                        continue;
                    }
                    let dep_request = FetchRequest {
                        lane: None,
                        include_version_history: false,
                        ..request.clone()
                    };
                    let (dep_bundle, _) = self.bundle(&state, dep, &dep_request)?;
                    bundles.push(dep_bundle);
                }
            }
        }
        Ok(bundles)
    }

    async fn get_raw_object(&self, hash: &Ref) -> Result<Vec<u8>, StoreError> {
        self.state()
            .files
            .get(hash)
            .cloned()
            .ok_or_else(|| StoreError::not_found("object", hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ComponentId {
        ComponentId::parse(s).unwrap()
    }

    fn remote_with_history() -> (MemoryRemote, Vec<Ref>) {
        let remote = MemoryRemote::new("org");
        let mut hashes = Vec::new();
        let mut parent: Option<Ref> = None;
        for n in 1..=3 {
            let content = format!("v{n}");
            let mut builder = Version::builder("alice", content.clone())
                .file("index.ts", Ref::of(content.as_bytes()));
            if let Some(p) = &parent {
                builder = builder.parent(p.clone());
            }
            let v = builder.build().unwrap();
            parent = Some(v.hash.clone());
            hashes.push(v.hash.clone());
            remote.publish(&id("org/a"), v, vec![content.into_bytes()], Some(&format!("0.0.{n}")));
        }
        (remote, hashes)
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let mut remotes = Remotes::new();
        remotes.register(Arc::new(MemoryRemote::new("org")));
        assert!(remotes.get("org").is_ok());
        assert!(matches!(remotes.get("other"), Err(StoreError::UnknownScope(_))));
        assert!(matches!(remotes.for_id(&id("local")), Err(StoreError::MissingScope(_))));
    }

    #[tokio::test]
    async fn test_fetch_respects_history_depth() {
        let (remote, hashes) = remote_with_history();
        let request = FetchRequest {
            include_version_history: true,
            history_depth: Some(2),
            ..Default::default()
        };
        let bundles = remote.fetch_objects(&[id("org/a")], &request).await.unwrap();
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].versions.len(), 2);
        assert_eq!(bundles[0].versions[0].hash, hashes[2]);
        assert_eq!(bundles[0].files, vec![b"v3".to_vec()]);

        let pinned = remote
            .fetch_objects(&[id("org/a@0.0.1")], &FetchRequest::default())
            .await
            .unwrap();
        assert_eq!(pinned[0].versions[0].hash, hashes[0]);
    }

    #[tokio::test]
    async fn test_head_prefers_lane() {
        let (remote, hashes) = remote_with_history();
        let mut lane = Lane::new(LaneId::new("org", "dev"), "a", "a@x");
        lane.add_component(&id("org/a"), hashes[0].clone());
        remote.set_lane(lane.clone());

        assert_eq!(remote.head(&id("org/a"), None).await.unwrap(), Some(hashes[2].clone()));
        assert_eq!(
            remote.head(&id("org/a"), Some(&lane.id)).await.unwrap(),
            Some(hashes[0].clone())
        );
    }

    #[tokio::test]
    async fn test_list_filters_deprecated() {
        let (remote, _) = remote_with_history();
        assert_eq!(remote.list("org/*", false).await.unwrap(), vec![id("org/a")]);
        remote.set_deprecated(&id("org/a"), true);
        assert!(remote.list("org/*", false).await.unwrap().is_empty());
        assert_eq!(remote.list("org/*", true).await.unwrap().len(), 1);
    }
}

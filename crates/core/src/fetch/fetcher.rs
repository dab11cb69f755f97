//! Two-phase retrieval of component objects.
//!
//! Phase one brings each component record and its version history into the
//! local scope, without dependencies. Phase two fetches the dependency
//! closure of the targets and any file blob the target version still lacks.
//! Both phases run their per-component network work on a [`WorkerPool`];
//! tasks only read the local scope and hand their bundles back, and the
//! coordinator persists them once the phase has settled.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::errors::{ImportError, StoreError};
use crate::models::VersionDependencies;
use crate::objects::{ComponentId, LaneId, ModelComponent, Ref, Version};
use crate::options::ImportOptions;
use crate::pool::WorkerPool;
use crate::remote::{FetchRequest, ObjectBundle, Remotes};
use crate::scope::LocalScope;

/// Fetch-related settings of a session.
#[derive(Debug, Clone, Default)]
pub struct FetchSettings {
    /// Lane whose heads unversioned ids resolve against.
    pub lane: Option<LaneId>,
    pub all_history: bool,
    pub history_depth: Option<u32>,
    pub fetch_deps: bool,
    pub from_original_scope: bool,
    pub strict_seed_fetch: bool,
    pub reason: String,
}

impl FetchSettings {
    pub fn from_options(options: &ImportOptions, lane: Option<LaneId>) -> Self {
        Self {
            lane,
            all_history: options.all_history,
            history_depth: options.history_depth,
            fetch_deps: options.fetch_deps,
            from_original_scope: options.from_original_scope,
            strict_seed_fetch: options.strict_seed_fetch,
            reason: format!("import ({})", options.mode()),
        }
    }

    fn history_request(&self) -> FetchRequest {
        FetchRequest {
            lane: self.lane.clone(),
            include_version_history: true,
            history_depth: if self.all_history { None } else { self.history_depth },
            with_dependencies: false,
            prefer_dependency_graph: false,
            reason: self.reason.clone(),
        }
    }

    fn closure_request(&self, with_dependencies: bool) -> FetchRequest {
        FetchRequest {
            lane: self.lane.clone(),
            include_version_history: false,
            history_depth: None,
            with_dependencies,
            prefer_dependency_graph: !self.fetch_deps,
            reason: self.reason.clone(),
        }
    }
}

/// An id that could not be fetched.
#[derive(Debug, Clone)]
pub struct FetchFailure {
    pub id: ComponentId,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub components: Vec<VersionDependencies>,
    pub failures: Vec<FetchFailure>,
}

/// Objects brought back by one task.
#[derive(Default)]
struct Shipment {
    bundles: Vec<ObjectBundle>,
    raw: Vec<(Ref, Vec<u8>)>,
}

impl Shipment {
    fn is_empty(&self) -> bool {
        self.bundles.is_empty() && self.raw.is_empty()
    }
}

pub struct ComponentFetcher {
    scope: Arc<LocalScope>,
    remotes: Arc<Remotes>,
    pool: WorkerPool,
}

impl ComponentFetcher {
    pub fn new(scope: Arc<LocalScope>, remotes: Arc<Remotes>, concurrency: usize) -> Self {
        Self {
            scope,
            remotes,
            pool: WorkerPool::new(concurrency),
        }
    }

    /// Phase one: component records and version history, no dependencies.
    /// Failures are logged and returned; phase two records them.
    pub async fn fetch_without_dependencies(
        &self,
        ids: &[ComponentId],
        settings: &FetchSettings,
    ) -> Vec<FetchFailure> {
        info!(count = ids.len(), "fetching components without dependencies");
        let settings = Arc::new(settings.clone());
        let remotes = Arc::clone(&self.remotes);
        let scope = Arc::clone(&self.scope);
        let results = self
            .pool
            .map(ids.to_vec(), move |id| {
                let (remotes, scope, settings) = (remotes.clone(), scope.clone(), settings.clone());
                async move {
                    let result = fetch_history(&remotes, &scope, &id, &settings).await;
                    (id, result)
                }
            })
            .await;
        let failures = self.settle(ids, results);
        for failure in &failures {
            warn!(id = %failure.id, error = %failure.error, "fetch without dependencies failed");
        }
        failures
    }

    /// Phase two: the dependency closure of `ids` and the missing file blobs
    /// of their versions. In strict mode a failed seed fails the session;
    /// other ids only show up in the failures.
    pub async fn fetch_with_dependencies(
        &self,
        ids: &[ComponentId],
        seeds: &[ComponentId],
        settings: &FetchSettings,
    ) -> Result<FetchOutcome, ImportError> {
        info!(count = ids.len(), from_original_scope = settings.from_original_scope, "fetching dependency closure");
        let task_settings = Arc::new(settings.clone());
        let remotes = Arc::clone(&self.remotes);
        let scope = Arc::clone(&self.scope);
        let results = self
            .pool
            .map(ids.to_vec(), move |id| {
                let (remotes, scope, settings) = (remotes.clone(), scope.clone(), task_settings.clone());
                async move {
                    let result = fetch_closure(&remotes, &scope, &id, &settings).await;
                    (id, result)
                }
            })
            .await;

        let mut failures = self.settle(ids, results);
        let failed: HashSet<String> = failures.iter().map(|f| f.id.to_string()).collect();

        let mut components = Vec::new();
        for id in ids.iter().filter(|id| !failed.contains(&id.to_string())) {
            match version_dependencies(&self.scope, id) {
                Ok(Some(fetched)) => components.push(fetched),
                Ok(None) => failures.push(FetchFailure {
                    id: id.clone(),
                    error: "version is not available after fetch".into(),
                }),
                Err(e) => failures.push(FetchFailure {
                    id: id.clone(),
                    error: e.to_string(),
                }),
            }
        }

        for failure in &failures {
            warn!(id = %failure.id, error = %failure.error, "failed to fetch component");
        }
        if settings.strict_seed_fetch {
            let failed_seeds: Vec<String> = failures
                .iter()
                .filter(|f| seeds.iter().any(|s| s.is_same_component(&f.id)))
                .map(|f| f.id.to_string())
                .collect();
            if !failed_seeds.is_empty() {
                return Err(ImportError::SeedsNotFound { ids: failed_seeds });
            }
        }
        info!(fetched = components.len(), failed = failures.len(), "fetch complete");
        Ok(FetchOutcome { components, failures })
    }

    /// Persist every shipment and collect failures, in input order.
    fn settle(
        &self,
        ids: &[ComponentId],
        results: Vec<Result<(ComponentId, Result<Shipment, StoreError>), tokio::task::JoinError>>,
    ) -> Vec<FetchFailure> {
        let mut failures = Vec::new();
        for (idx, result) in results.into_iter().enumerate() {
            let (id, error) = match result {
                Ok((id, Ok(shipment))) => match self.persist(shipment) {
                    Ok(()) => continue,
                    Err(e) => (id, e.to_string()),
                },
                Ok((id, Err(e))) => (id, e.to_string()),
                Err(e) => (ids[idx].clone(), format!("fetch task failed: {e}")),
            };
            failures.push(FetchFailure { id, error });
        }
        failures
    }

    /// Write a shipment: versions first so head fast-forward checks can walk
    /// history, then blobs, then the component records.
    fn persist(&self, shipment: Shipment) -> Result<(), StoreError> {
        if shipment.is_empty() {
            return Ok(());
        }
        for bundle in &shipment.bundles {
            self.scope.put_objects(&bundle.versions, &bundle.files)?;
        }
        for (hash, bytes) in &shipment.raw {
            self.scope.put_file_verified(hash, bytes)?;
        }
        for bundle in &shipment.bundles {
            self.scope.merge_component(&bundle.component)?;
        }
        debug!(
            bundles = shipment.bundles.len(),
            raw = shipment.raw.len(),
            "persisted fetched objects"
        );
        Ok(())
    }
}

async fn fetch_history(
    remotes: &Remotes,
    scope: &LocalScope,
    id: &ComponentId,
    settings: &FetchSettings,
) -> Result<Shipment, StoreError> {
    let remote = remotes.for_id(id)?;
    if let Some(head) = remote.head(id, settings.lane.as_ref()).await? {
        if has_locally(scope, id, &head)? {
            debug!(id = %id, head = %head.short(), "head already local, nothing to fetch");
            return Ok(Shipment::default());
        }
    }
    let bundles = remote
        .fetch_objects(std::slice::from_ref(id), &settings.history_request())
        .await?;
    debug!(id = %id, bundles = bundles.len(), "fetched component history");
    Ok(Shipment {
        bundles,
        raw: Vec::new(),
    })
}

async fn fetch_closure(
    remotes: &Remotes,
    scope: &LocalScope,
    id: &ComponentId,
    settings: &FetchSettings,
) -> Result<Shipment, StoreError> {
    if let Some(local) = version_dependencies(scope, id)? {
        if local.is_complete() && scope.has_version_with_files(&local.version.hash)? {
            debug!(id = %id, "version and dependencies already local");
            return Ok(Shipment::default());
        }
    }

    let remote = remotes.for_id(id)?;
    let mut bundles = if settings.from_original_scope {
        remote
            .fetch_objects(std::slice::from_ref(id), &settings.closure_request(false))
            .await?
    } else {
        remote
            .fetch_objects(std::slice::from_ref(id), &settings.closure_request(true))
            .await?
    };
    let target = bundles
        .first()
        .and_then(|b| b.versions.first())
        .cloned()
        .ok_or_else(|| StoreError::not_found("version", id))?;

    if settings.from_original_scope {
        bundles.extend(fetch_from_original_scopes(remotes, scope, &target, settings).await?);
    }

    // Blobs of the target version that neither the bundles nor the local
    // scope have.
    let shipped: HashSet<Ref> = bundles
        .iter()
        .flat_map(|b| b.files.iter().map(|bytes| Ref::of(bytes)))
        .collect();
    let mut raw = Vec::new();
    for file in &target.files {
        if shipped.contains(&file.file) || scope.has_object(&file.file)? {
            continue;
        }
        debug!(id = %id, path = %file.path, "reading missing file object");
        raw.push((file.file.clone(), remote.get_raw_object(&file.file).await?));
    }
    Ok(Shipment { bundles, raw })
}

/// Ask each dependency's own scope for it, one request per scope.
async fn fetch_from_original_scopes(
    remotes: &Remotes,
    scope: &LocalScope,
    target: &Version,
    settings: &FetchSettings,
) -> Result<Vec<ObjectBundle>, StoreError> {
    let mut by_scope: BTreeMap<String, Vec<ComponentId>> = BTreeMap::new();
    for dep in &target.flattened_dependencies {
        if is_dependency_local(scope, dep)? {
            continue;
        }
        let dep_scope = dep
            .scope()
            .ok_or_else(|| StoreError::MissingScope(dep.to_string()))?;
        by_scope.entry(dep_scope.to_string()).or_default().push(dep.clone());
    }

    let request = FetchRequest {
        lane: None,
        ..settings.closure_request(false)
    };
    let mut bundles = Vec::new();
    for (dep_scope, deps) in by_scope {
        debug!(scope = %dep_scope, count = deps.len(), "fetching dependencies from their scope");
        bundles.extend(remotes.get(&dep_scope)?.fetch_objects(&deps, &request).await?);
    }
    Ok(bundles)
}

/// Whether `head` and, for a versioned id, the requested version are local.
fn has_locally(scope: &LocalScope, id: &ComponentId, head: &Ref) -> Result<bool, StoreError> {
    let Some(model) = scope.get_if_exists(id)? else {
        return Ok(false);
    };
    if scope.get_version_if_exists(head)?.is_none() {
        return Ok(false);
    }
    match id.version() {
        Some(version) => match model.ref_for(version) {
            Some(hash) => Ok(scope.get_version_if_exists(&hash)?.is_some()),
            None => Ok(false),
        },
        None => Ok(true),
    }
}

fn is_dependency_local(scope: &LocalScope, dep: &ComponentId) -> Result<bool, StoreError> {
    let Some(model) = scope.get_if_exists(dep)? else {
        return Ok(false);
    };
    match scope.resolve_version_ref(&model, dep.version()) {
        Some(hash) => scope.has_object(&hash),
        None => Ok(false),
    }
}

/// The version an unversioned id resolves to: the incoming head, or the
/// remote head when local history is too shallow to compare.
fn incoming_ref(scope: &LocalScope, model: &ModelComponent) -> Result<Option<Ref>, StoreError> {
    match scope.latest_incoming(model, None) {
        Ok(Some(hash)) => Ok(Some(hash)),
        Ok(None) => Ok(scope.resolve_version_ref(model, None)),
        Err(e) if e.is_not_found() => Ok(model.remote_head.clone().or_else(|| model.head.clone())),
        Err(e) => Err(e),
    }
}

/// The local version of `id` with its dependencies, if the version is
/// in the local scope.
pub(crate) fn version_dependencies(
    scope: &LocalScope,
    id: &ComponentId,
) -> Result<Option<VersionDependencies>, StoreError> {
    let Some(model) = scope.get_if_exists(id)? else {
        return Ok(None);
    };
    let hash = match id.version() {
        Some(version) => model.ref_for(version),
        None => incoming_ref(scope, &model)?,
    };
    let Some(hash) = hash else {
        return Ok(None);
    };
    let Some(version) = scope.get_version_if_exists(&hash)? else {
        return Ok(None);
    };

    let resolved = match id.version() {
        Some(_) => id.clone(),
        None => id.with_version(model.tag_of(&hash).unwrap_or(hash.as_str())),
    };
    let dependencies = version.flattened_dependencies.clone();
    let mut missing_dependencies = Vec::new();
    for dep in &dependencies {
        if !is_dependency_local(scope, dep)? {
            missing_dependencies.push(dep.clone());
        }
    }
    Ok(Some(VersionDependencies {
        id: resolved,
        version,
        dependencies,
        missing_dependencies,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;

    fn id(s: &str) -> ComponentId {
        ComponentId::parse(s).unwrap()
    }

    fn publish(remote: &MemoryRemote, name: &str, content: &str, tag: &str, deps: &[&str], parent: Option<&Ref>) -> Ref {
        let mut builder = Version::builder("alice", content).file("index.ts", Ref::of(content.as_bytes()));
        for d in deps {
            builder = builder.dependency(id(d));
        }
        if let Some(p) = parent {
            builder = builder.parent(p.clone());
        }
        let v = builder.build().unwrap();
        let hash = v.hash.clone();
        remote.publish(&id(name), v, vec![content.as_bytes().to_vec()], Some(tag));
        hash
    }

    struct Fixture {
        remote: Arc<MemoryRemote>,
        scope: Arc<LocalScope>,
        fetcher: ComponentFetcher,
    }

    fn fixture() -> Fixture {
        let remote = Arc::new(MemoryRemote::new("org"));
        publish(&remote, "org/base", "base", "1.0.0", &[], None);
        let v1 = publish(&remote, "org/app", "app v1", "1.0.0", &["org/base@1.0.0"], None);
        publish(&remote, "org/app", "app v2", "1.0.1", &["org/base@1.0.0"], Some(&v1));

        let mut remotes = Remotes::new();
        remotes.register(remote.clone());
        let scope = Arc::new(LocalScope::in_memory().unwrap());
        let fetcher = ComponentFetcher::new(scope.clone(), Arc::new(remotes), 4);
        Fixture { remote, scope, fetcher }
    }

    #[tokio::test]
    async fn test_two_phase_fetch_brings_history_and_dependencies() {
        let fx = fixture();
        let settings = FetchSettings::default();
        let ids = vec![id("org/app")];

        assert!(fx.fetcher.fetch_without_dependencies(&ids, &settings).await.is_empty());
        let model = fx.scope.get_model_component(&id("org/app")).unwrap();
        assert_eq!(model.list_versions(), vec!["1.0.0", "1.0.1"]);
        assert!(fx.scope.get_if_exists(&id("org/base")).unwrap().is_none());

        let outcome = fx.fetcher.fetch_with_dependencies(&ids, &ids, &settings).await.unwrap();
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.components.len(), 1);
        let fetched = &outcome.components[0];
        assert_eq!(fetched.id, id("org/app@1.0.1"));
        assert_eq!(fetched.dependencies, vec![id("org/base@1.0.0")]);
        assert!(fetched.is_complete());
        assert!(fx.scope.has_version_with_files(&fetched.version.hash).unwrap());
    }

    #[tokio::test]
    async fn test_local_objects_skip_the_network() {
        let fx = fixture();
        let settings = FetchSettings::default();
        let ids = vec![id("org/app")];
        fx.fetcher.fetch_without_dependencies(&ids, &settings).await;
        fx.fetcher.fetch_with_dependencies(&ids, &ids, &settings).await.unwrap();
        let calls = fx.remote.fetch_calls();

        fx.fetcher.fetch_without_dependencies(&ids, &settings).await;
        let outcome = fx.fetcher.fetch_with_dependencies(&ids, &ids, &settings).await.unwrap();
        assert_eq!(fx.remote.fetch_calls(), calls);
        assert_eq!(outcome.components.len(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_isolated_and_strict_mode_fails() {
        let fx = fixture();
        publish(&fx.remote, "org/broken", "broken", "1.0.0", &[], None);
        fx.remote.fail_on(&id("org/broken"));
        let ids = vec![id("org/broken"), id("org/nope"), id("org/app@1.0.0")];
        let mut settings = FetchSettings::default();

        let phase_one = fx.fetcher.fetch_without_dependencies(&ids, &settings).await;
        assert_eq!(phase_one.len(), 2);

        let outcome = fx.fetcher.fetch_with_dependencies(&ids, &ids, &settings).await.unwrap();
        let failed: Vec<String> = outcome.failures.iter().map(|f| f.id.to_string()).collect();
        assert_eq!(failed, vec!["org/broken".to_string(), "org/nope".to_string()]);
        assert_eq!(outcome.components.len(), 1);
        assert_eq!(outcome.components[0].id, id("org/app@1.0.0"));
        assert!(outcome.components[0].is_complete());

        settings.strict_seed_fetch = true;
        let err = fx
            .fetcher
            .fetch_with_dependencies(&[id("org/nope")], &[id("org/nope")], &settings)
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::SeedsNotFound { .. }));
    }

    #[tokio::test]
    async fn test_strict_mode_only_fails_on_seeds() {
        let fx = fixture();
        let settings = FetchSettings {
            strict_seed_fetch: true,
            ..Default::default()
        };
        let seeds = vec![id("org/app@1.0.0")];
        let ids = vec![id("org/app@1.0.0"), id("org/nope")];

        let outcome = fx
            .fetcher
            .fetch_with_dependencies(&ids, &seeds, &settings)
            .await
            .unwrap();
        assert_eq!(outcome.components.len(), 1);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].id, id("org/nope"));

        let err = fx
            .fetcher
            .fetch_with_dependencies(&[id("org/nope"), id("org/app")], &[id("org/nope")], &settings)
            .await
            .unwrap_err();
        match err {
            ImportError::SeedsNotFound { ids } => assert_eq!(ids, vec!["org/nope".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_blobs_are_read_raw() {
        let fx = fixture();
        fx.remote.set_omit_files(true);
        let settings = FetchSettings::default();
        let ids = vec![id("org/base")];
        fx.fetcher.fetch_without_dependencies(&ids, &settings).await;
        let outcome = fx.fetcher.fetch_with_dependencies(&ids, &ids, &settings).await.unwrap();
        let version = &outcome.components[0].version;
        assert_eq!(fx.scope.load_file(&version.files[0].file).unwrap(), b"base");
    }

    #[tokio::test]
    async fn test_from_original_scope() {
        let fx = fixture();
        let settings = FetchSettings {
            from_original_scope: true,
            ..Default::default()
        };
        let ids = vec![id("org/app@1.0.0")];
        let outcome = fx.fetcher.fetch_with_dependencies(&ids, &ids, &settings).await.unwrap();
        assert_eq!(outcome.components.len(), 1);
        assert!(outcome.components[0].is_complete());
    }
}

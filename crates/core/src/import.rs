//! The import session.
//!
//! An [`ImportSession`] runs one import end to end:
//!
//! 1. Resolve the target ids and record the versions known before.
//! 2. Refuse early on local modifications and name collisions.
//! 3. Fetch objects without dependencies, then the dependency closure.
//! 4. Refuse diverged lane heads unless merging, then merge the session
//!    lanes into the local scope.
//! 5. Unless objects-only: check divergence and lane membership, filter by
//!    env, merge locally modified components, write, then update the
//!    mapping and the active lane.
//! 6. Record the session in the import log and build the [`ImportResult`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::divergence::{compute_divergence, DivergeData, DivergedComponent};
use crate::errors::ImportError;
use crate::fetch::{flattened_dependencies, ComponentFetcher, FetchSettings, TargetResolver};
use crate::graph::DependencyGraph;
use crate::lanes::LaneReconciler;
use crate::merge::{FileStatus, MergeCandidate, MergeDisposition, MergeStrategyPrompt, MergeWriter};
use crate::models::{ComponentState, ImportDetails, ImportResult, ImportStatus, VersionDependencies};
use crate::objects::{uniq_ids, ComponentId, Lane, Ref};
use crate::options::{ImportMode, ImportOptions, MergeStrategy};
use crate::remote::Remotes;
use crate::scope::{ImportLogRecord, LocalScope};
use crate::workspace::{
    ComponentToWrite, ComponentWriter, MappingEntry, SharedMapping, WriteRequest, Workspace,
};

/// Collaborators of an import session.
#[derive(Clone)]
pub struct SessionContext {
    pub scope: Arc<LocalScope>,
    pub remotes: Arc<Remotes>,
    pub workspace: Arc<dyn Workspace>,
    pub mapping: SharedMapping,
    pub writer: Arc<dyn ComponentWriter>,
    pub graph: Option<Arc<dyn DependencyGraph>>,
    pub prompt: Option<Arc<dyn MergeStrategyPrompt>>,
}

/// What the workspace phase did.
#[derive(Default)]
struct WorkspaceOutcome {
    written: Vec<ComponentId>,
    files_status: HashMap<String, BTreeMap<String, FileStatus>>,
    installation_error: Option<String>,
    compilation_error: Option<String>,
    merge_strategy: Option<MergeStrategy>,
}

pub struct ImportSession {
    ctx: SessionContext,
    options: ImportOptions,
    session_id: Uuid,
    requested: usize,
    diverge_cache: HashMap<String, DivergeData>,
    states: BTreeMap<String, ComponentState>,
}

fn key(id: &ComponentId) -> String {
    id.to_string_without_version()
}

impl ImportSession {
    /// Validate `options` and prepare a session.
    pub fn new(ctx: SessionContext, options: ImportOptions) -> Result<Self, ImportError> {
        options.validate()?;
        Ok(Self {
            ctx,
            options,
            session_id: Uuid::new_v4(),
            requested: 0,
            diverge_cache: HashMap::new(),
            states: BTreeMap::new(),
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    // -----------------------------------------------------------------------
    // Main entry point
    // -----------------------------------------------------------------------

    /// Run the import. The session is recorded in the import log whether it
    /// succeeds or not.
    pub async fn run(mut self) -> Result<ImportResult, ImportError> {
        let started_at = Utc::now();
        info!(session = %self.session_id, mode = %self.options.mode(), "starting import");

        let result = self.do_run(started_at).await;

        let (success, imported, missing, details) = match &result {
            Ok(r) => (
                true,
                r.imported_ids.len(),
                r.missing_ids.len(),
                format!(
                    "imported: {}, written: {}, missing: {}",
                    r.imported_ids.len(),
                    r.written_components.len(),
                    r.missing_ids.len()
                ),
            ),
            Err(e) => (false, 0, 0, format!("import failed: {e}")),
        };
        let record = ImportLogRecord {
            session_id: self.session_id,
            mode: self.options.mode().to_string(),
            requested: self.requested,
            imported,
            missing,
            success,
            details: Some(details),
        };
        if let Err(e) = self.ctx.scope.record_import(&record) {
            warn!(error = %e, "failed to record import session");
        }

        match &result {
            Ok(r) => info!(
                session = %self.session_id,
                imported = r.imported_ids.len(),
                written = r.written_components.len(),
                missing = r.missing_ids.len(),
                "import complete"
            ),
            Err(e) => warn!(session = %self.session_id, error = %e, "import failed"),
        }
        result
    }

    async fn do_run(&mut self, started_at: DateTime<Utc>) -> Result<ImportResult, ImportError> {
        let session_lanes = self.session_lanes()?;
        let resolver = TargetResolver::new(
            Arc::clone(&self.ctx.remotes),
            Arc::clone(&self.ctx.mapping),
            self.ctx.graph.clone(),
        );

        let mut ids = resolver.resolve(&self.options, &session_lanes).await?;
        let seeds = ids.clone();
        if self.options.import_dependents && !ids.is_empty() {
            let dependents = resolver.dependents_of(&ids).await?;
            for dependent in dependents {
                if !ids.iter().any(|id| id.is_same_component(&dependent)) {
                    ids.push(dependent);
                }
            }
        }
        self.requested = ids.len();

        let mut versions_before = self.versions_before(&ids)?;
        self.check_potential_issues(&ids).await?;

        let lane = match self.options.mode() {
            ImportMode::Lane => session_lanes.first().map(|l| l.id.clone()),
            _ => None,
        };
        let settings = FetchSettings::from_options(&self.options, lane);
        let fetcher = ComponentFetcher::new(
            Arc::clone(&self.ctx.scope),
            Arc::clone(&self.ctx.remotes),
            self.options.fetch_concurrency,
        );
        fetcher.fetch_without_dependencies(&ids, &settings).await;

        if self.options.import_dependencies_directly {
            let deps: Vec<ComponentId> = flattened_dependencies(&self.ctx.scope, &ids)?
                .into_iter()
                .filter(|d| !ids.iter().any(|id| id.is_same_component(d)))
                .collect();
            info!(count = deps.len(), "importing dependencies directly");
            versions_before.extend(self.versions_before(&deps)?);
            fetcher.fetch_without_dependencies(&deps, &settings).await;
            ids.extend(deps);
        }

        for id in &ids {
            self.states.insert(key(id), ComponentState::Pending);
        }
        let outcome = fetcher.fetch_with_dependencies(&ids, &seeds, &settings).await?;
        for component in &outcome.components {
            self.advance(&component.id, ComponentState::Fetched);
        }

        let reconciler = LaneReconciler::new(Arc::clone(&self.ctx.scope), Arc::clone(&self.ctx.mapping));
        if !self.options.merge && !self.options.is_objects_only() {
            self.check_lane_divergence(&reconciler, &session_lanes)?;
        }
        let merged_lanes = reconciler.merge_lanes(&session_lanes)?;

        let workspace_outcome = if self.options.is_objects_only() {
            debug!("objects-only import, workspace untouched");
            WorkspaceOutcome::default()
        } else {
            self.apply_to_workspace(&outcome.components, &merged_lanes, &session_lanes, &reconciler)
                .await?
        };

        let import_details =
            self.import_details(&versions_before, &outcome.components, &workspace_outcome.files_status)?;

        let fetched: HashSet<String> = outcome.components.iter().map(|c| key(&c.id)).collect();
        let mut missing_ids: Vec<String> = Vec::new();
        for id in &ids {
            let k = key(id);
            if !fetched.contains(&k) && !missing_ids.contains(&k) {
                missing_ids.push(k);
            }
        }

        Ok(ImportResult {
            session_id: self.session_id,
            imported_ids: outcome.components.iter().map(|c| c.id.clone()).collect(),
            imported_deps: uniq_ids(outcome.components.iter().flat_map(|c| c.dependencies.iter().cloned())),
            written_components: workspace_outcome.written,
            import_details,
            missing_ids,
            installation_error: workspace_outcome.installation_error,
            compilation_error: workspace_outcome.compilation_error,
            component_states: self.states.clone(),
            merge_strategy: workspace_outcome.merge_strategy,
            started_at,
            finished_at: Utc::now(),
        })
    }

    // -----------------------------------------------------------------------
    // Before fetching
    // -----------------------------------------------------------------------

    /// Lane objects of the session. Requested lanes without an object are
    /// read from the local scope.
    fn session_lanes(&self) -> Result<Vec<Lane>, ImportError> {
        let Some(selection) = &self.options.lanes else {
            return Ok(Vec::new());
        };
        let mut lanes = selection.lanes.clone();
        for lane_id in &selection.lane_ids {
            if lanes.iter().any(|l| &l.id == lane_id) {
                continue;
            }
            match self.ctx.scope.get_lane(lane_id)? {
                Some(lane) => lanes.push(lane),
                None => warn!(lane = %lane_id, "lane not found locally or in the request"),
            }
        }
        Ok(lanes)
    }

    /// Versions known locally for each id, keyed by id without version.
    fn versions_before(&self, ids: &[ComponentId]) -> Result<BTreeMap<String, Vec<String>>, ImportError> {
        let mut before = BTreeMap::new();
        for id in ids {
            let versions = match self.ctx.scope.get_if_exists(id)? {
                Some(model) => model.list_versions(),
                None => Vec::new(),
            };
            before.insert(key(id), versions);
        }
        Ok(before)
    }

    async fn check_potential_issues(&self, ids: &[ComponentId]) -> Result<(), ImportError> {
        if self.options.mode() == ImportMode::Explicit {
            let tracked = self.ctx.mapping.lock().await.all_ids();
            for id in ids {
                if tracked.iter().any(|t| !t.has_scope() && t.name() == id.name()) {
                    return Err(ImportError::NameCollision { id: id.to_string() });
                }
            }
        }

        let opts = &self.options;
        if opts.merge || opts.override_local || opts.is_objects_only() || opts.track_only {
            return Ok(());
        }
        let tracked: Vec<ComponentId> = {
            let mapping = self.ctx.mapping.lock().await;
            ids.iter().filter_map(|id| mapping.find_id(id)).collect()
        };
        let mut modified = Vec::new();
        for id in &tracked {
            let status = self.ctx.workspace.component_status(id).await?;
            if status.modified || status.newly_created {
                modified.push(key(id));
            }
        }
        if modified.is_empty() {
            return Ok(());
        }
        Err(ImportError::LocalModifications { ids: modified })
    }

    // -----------------------------------------------------------------------
    // Workspace
    // -----------------------------------------------------------------------

    async fn apply_to_workspace(
        &mut self,
        components: &[VersionDependencies],
        merged_lanes: &[Lane],
        session_lanes: &[Lane],
        reconciler: &LaneReconciler,
    ) -> Result<WorkspaceOutcome, ImportError> {
        let active_lane_id = self.ctx.workspace.current_lane_id().await;
        let active_lane = match &active_lane_id {
            Some(id) => self.ctx.scope.get_lane(id)?,
            None => None,
        };

        if !self.options.merge {
            self.check_divergence(components, merged_lanes, active_lane.as_ref())?;
        }
        let ids: Vec<ComponentId> = components.iter().map(|c| c.id.clone()).collect();
        // A merged lane may keep a diverged local head, so the incoming
        // lane objects count for membership too.
        let member_lanes: Vec<Lane> = merged_lanes.iter().chain(session_lanes).cloned().collect();
        reconciler.verify_membership(&ids, active_lane.as_ref(), &member_lanes)?;

        let components = self.filter_by_envs(components);

        let mut to_write: Vec<ComponentToWrite> = Vec::new();
        let mut candidates: Vec<MergeCandidate> = Vec::new();
        let mut root_dirs: HashMap<String, String> = HashMap::new();
        for component in &components {
            let entry = self.ctx.mapping.lock().await.entry(&component.id);
            let root_dir = self.root_dir(&component.id, entry.as_ref());
            root_dirs.insert(key(&component.id), root_dir.clone());

            if let Some(entry) = &entry {
                if self.checked_out_ref(&entry.id)?.as_ref() == Some(&component.version.hash) {
                    self.advance(&component.id, ComponentState::UpToDate);
                    continue;
                }
            }

            let status = self.ctx.workspace.component_status(&component.id).await?;
            let locally_changed = status.tracked && (status.modified || status.newly_created);
            if let (true, Some(entry)) = (locally_changed && !self.options.track_only, &entry) {
                if self.options.merge {
                    self.advance(&component.id, ComponentState::ModifiedLocally);
                    self.advance(&component.id, ComponentState::MergePending);
                    candidates.push(MergeCandidate {
                        id: component.id.clone(),
                        current: entry.id.clone(),
                        version: component.version.clone(),
                        root_dir,
                    });
                    continue;
                }
                if !self.options.override_local {
                    warn!(id = %component.id, "component has local changes, leaving it as is");
                    self.advance(&component.id, ComponentState::ModifiedLocally);
                    continue;
                }
            }

            self.advance(&component.id, ComponentState::CleanIncoming);
            to_write.push(self.clean_incoming(component, entry.as_ref(), root_dir, status.tracked)?);
        }

        let mut outcome = WorkspaceOutcome::default();
        let mut bumped: Vec<ComponentId> = Vec::new();
        if !candidates.is_empty() {
            let merge_writer = MergeWriter::new(
                Arc::clone(&self.ctx.scope),
                Arc::clone(&self.ctx.workspace),
                self.ctx.prompt.clone(),
            );
            let (merged, strategy) = merge_writer
                .merge(candidates, self.options.merge_strategy)
                .await?;
            outcome.merge_strategy = strategy;
            for component in merged {
                outcome.files_status.insert(key(&component.id), component.files_status);
                match component.disposition {
                    MergeDisposition::Write(write) => to_write.push(write),
                    MergeDisposition::KeepOurs | MergeDisposition::Unchanged => {
                        self.advance(&component.id, ComponentState::UnchangedAfterMerge);
                        bumped.push(component.id);
                    }
                }
            }
        }

        if !to_write.is_empty() {
            let request = WriteRequest {
                components: to_write,
                write_to_path: self.options.write_to_path.clone(),
                skip_dependency_install: !self.options.install_packages,
                skip_config_files: !self.options.write_config_files,
                track_only: self.options.track_only,
                throw_if_existing_dir: !self.options.override_local,
                concurrency: Some(self.options.write_concurrency),
            };
            info!(count = request.components.len(), "writing components");
            let results = self.ctx.writer.write_many(request).await?;
            for id in &results.written {
                self.advance(id, ComponentState::Written);
            }
            outcome.written = results.written;
            outcome.installation_error = results.installation_error;
            outcome.compilation_error = results.compilation_error;
        }

        {
            let mut mapping = self.ctx.mapping.lock().await;
            for id in outcome.written.iter().chain(bumped.iter()) {
                if let Some(root_dir) = root_dirs.get(&key(id)) {
                    mapping.update_component_id(id, root_dir);
                }
            }
        }

        let lane_entries: Vec<(ComponentId, Ref)> = components
            .iter()
            .map(|c| (c.id.clone(), c.version.hash.clone()))
            .collect();
        reconciler
            .save_lane_data(
                &lane_entries,
                active_lane_id.as_ref(),
                merged_lanes,
                self.options.save_in_lane,
            )
            .await?;

        self.ctx.mapping.lock().await.persist()?;
        Ok(outcome)
    }

    fn check_divergence(
        &mut self,
        components: &[VersionDependencies],
        merged_lanes: &[Lane],
        active_lane: Option<&Lane>,
    ) -> Result<(), ImportError> {
        let mut diverged = Vec::new();
        for component in components {
            let on_lane = merged_lanes
                .iter()
                .chain(active_lane)
                .any(|l| l.has_component(&component.id));
            if on_lane {
                continue;
            }
            let data = self.divergence_of(&component.id)?;
            if data.is_diverged() {
                self.advance(&component.id, ComponentState::Diverged);
                diverged.push(DivergedComponent {
                    id: key(&component.id),
                    snaps_local: data.snaps_on_source_only.len(),
                    snaps_remote: data.snaps_on_target_only.len(),
                });
            }
        }
        if diverged.is_empty() {
            return Ok(());
        }
        warn!(count = diverged.len(), "components have diverged history");
        Err(ImportError::PendingMerge { components: diverged })
    }

    /// Lane heads that moved both locally and remotely need a merge before
    /// the incoming lane may replace them.
    fn check_lane_divergence(&mut self, reconciler: &LaneReconciler, session_lanes: &[Lane]) -> Result<(), ImportError> {
        let diverged = reconciler.diverged_heads(session_lanes)?;
        if diverged.is_empty() {
            return Ok(());
        }
        let mut components = Vec::with_capacity(diverged.len());
        for (id, data) in diverged {
            self.advance(&id, ComponentState::Diverged);
            components.push(DivergedComponent {
                id: key(&id),
                snaps_local: data.snaps_on_source_only.len(),
                snaps_remote: data.snaps_on_target_only.len(),
            });
        }
        warn!(count = components.len(), "lane components have diverged history");
        Err(ImportError::PendingMerge { components })
    }

    fn divergence_of(&mut self, id: &ComponentId) -> Result<DivergeData, ImportError> {
        if let Some(data) = self.diverge_cache.get(&key(id)) {
            return Ok(data.clone());
        }
        let model = self.ctx.scope.get_model_component(id)?;
        let data = compute_divergence(
            self.ctx.scope.as_ref(),
            model.head.as_ref(),
            model.remote_head.as_ref(),
        )?;
        self.diverge_cache.insert(key(id), data.clone());
        Ok(data)
    }

    /// Drop components whose env is not listed. Explicitly requested ids
    /// are always kept.
    fn filter_by_envs<'a>(&self, components: &'a [VersionDependencies]) -> Vec<&'a VersionDependencies> {
        let Some(envs) = &self.options.filter_envs else {
            return components.iter().collect();
        };
        components
            .iter()
            .filter(|c| {
                let explicit = self
                    .options
                    .ids
                    .iter()
                    .any(|raw| *raw == key(&c.id) || *raw == c.id.to_string());
                let env_matches = c.version.env.as_deref().is_some_and(|env| {
                    let without_version = env.split('@').next().unwrap_or(env);
                    envs.iter().any(|e| e == env || e == without_version)
                });
                if !explicit && !env_matches {
                    debug!(id = %c.id, env = ?c.version.env, "filtered out by env");
                }
                explicit || env_matches
            })
            .collect()
    }

    fn root_dir(&self, id: &ComponentId, entry: Option<&MappingEntry>) -> String {
        if let Some(entry) = entry {
            return entry.root_dir.clone();
        }
        match &self.options.write_to_path {
            Some(path) => path.to_string_lossy().into_owned(),
            None => format!("components/{}", id.name()),
        }
    }

    /// Hash of the version the workspace has checked out, if known locally.
    fn checked_out_ref(&self, tracked: &ComponentId) -> Result<Option<Ref>, ImportError> {
        let Some(version) = tracked.version() else {
            return Ok(None);
        };
        Ok(self
            .ctx
            .scope
            .get_if_exists(tracked)?
            .and_then(|model| model.ref_for(version)))
    }

    /// The incoming version as a full write. Files of the checked-out
    /// version that the incoming one no longer has are removed.
    fn clean_incoming(
        &self,
        component: &VersionDependencies,
        entry: Option<&MappingEntry>,
        root_dir: String,
        tracked: bool,
    ) -> Result<ComponentToWrite, ImportError> {
        let files = self.ctx.scope.load_version_files(&component.version)?;
        let mut removed_files = Vec::new();
        if let Some(entry) = entry {
            if let Some(hash) = self.checked_out_ref(&entry.id)? {
                if let Some(base) = self.ctx.scope.get_version_if_exists(&hash)? {
                    removed_files = base
                        .files
                        .iter()
                        .filter(|f| component.version.file_ref(&f.path).is_none())
                        .map(|f| f.path.clone())
                        .collect();
                }
            }
        }
        Ok(ComponentToWrite {
            id: component.id.clone(),
            root_dir,
            files,
            removed_files,
            dependencies: component.dependencies.clone(),
            env: component.version.env.clone(),
            tracked,
        })
    }

    // -----------------------------------------------------------------------
    // Results
    // -----------------------------------------------------------------------

    fn import_details(
        &self,
        versions_before: &BTreeMap<String, Vec<String>>,
        components: &[VersionDependencies],
        files_status: &HashMap<String, BTreeMap<String, FileStatus>>,
    ) -> Result<Vec<ImportDetails>, ImportError> {
        let mut details = Vec::with_capacity(components.len());
        for component in components {
            let id = key(&component.id);
            let model = self.ctx.scope.get_model_component(&component.id)?;
            let before = versions_before.get(&id).cloned().unwrap_or_default();
            let delta: Vec<String> = model
                .list_versions()
                .into_iter()
                .filter(|v| !before.contains(v))
                .collect();
            let latest_version = model
                .head_regardless_of_lane_as_tag_or_hash(true)
                .filter(|v| delta.contains(v));
            let missing_deps = if self.options.fetch_deps {
                component.missing_dependencies.iter().map(|d| d.to_string()).collect()
            } else {
                Vec::new()
            };
            details.push(ImportDetails {
                status: ImportStatus::from_delta(&before, &delta),
                files_status: files_status.get(&id).cloned(),
                deprecated: model.deprecated || component.version.deprecated,
                removed: component.version.removed,
                id,
                versions: delta,
                latest_version,
                missing_deps,
            });
        }
        Ok(details)
    }

    fn advance(&mut self, id: &ComponentId, next: ComponentState) {
        let k = key(id);
        if let Some(current) = self.states.get(&k) {
            if !current.can_advance_to(next) {
                warn!(id = %k, from = %current, to = %next, "unexpected component state transition");
            }
        }
        debug!(id = %k, state = %next, "component state");
        self.states.insert(k, next);
    }
}


//! Resolution of the component ids an import works on.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::errors::ImportError;
use crate::graph::DependencyGraph;
use crate::objects::{has_wildcard, keep_latest_versions, uniq_ids, ComponentId, Lane};
use crate::options::{ImportMode, ImportOptions};
use crate::remote::Remotes;
use crate::scope::LocalScope;
use crate::workspace::SharedMapping;

pub struct TargetResolver {
    remotes: Arc<Remotes>,
    mapping: SharedMapping,
    graph: Option<Arc<dyn DependencyGraph>>,
}

impl TargetResolver {
    pub fn new(
        remotes: Arc<Remotes>,
        mapping: SharedMapping,
        graph: Option<Arc<dyn DependencyGraph>>,
    ) -> Self {
        Self {
            remotes,
            mapping,
            graph,
        }
    }

    /// Ids to import for `options`, before any expansion. `lanes` are the
    /// lane objects of the session.
    pub async fn resolve(&self, options: &ImportOptions, lanes: &[Lane]) -> Result<Vec<ComponentId>, ImportError> {
        let ids = match options.mode() {
            ImportMode::Lane if options.ids.is_empty() => self.ids_for_lanes(lanes).await,
            ImportMode::WorkspaceMapping => self.mapping.lock().await.all_ids_with_scope(),
            ImportMode::Lane | ImportMode::Explicit => self.explicit_ids(options, lanes).await?,
        };
        let ids = uniq_ids(ids);
        info!(mode = %options.mode(), count = ids.len(), "resolved import targets");
        Ok(ids)
    }

    /// Every component of the lanes, plus tracked components with a scope
    /// that are not on them.
    async fn ids_for_lanes(&self, lanes: &[Lane]) -> Vec<ComponentId> {
        let mut ids: Vec<ComponentId> = lanes.iter().flat_map(|l| l.component_ids()).collect();
        let tracked = self.mapping.lock().await.all_ids_with_scope();
        let off_lane: Vec<ComponentId> = tracked
            .into_iter()
            .filter(|id| !ids.iter().any(|l| l.is_same_component(id)))
            .collect();
        debug!(
            on_lane = ids.len(),
            off_lane = off_lane.len(),
            "collected lane targets"
        );
        ids.extend(off_lane);
        ids
    }

    async fn explicit_ids(&self, options: &ImportOptions, lanes: &[Lane]) -> Result<Vec<ComponentId>, ImportError> {
        let in_lane_mode = options.mode() == ImportMode::Lane;
        let mut ids = Vec::new();
        for token in &options.ids {
            if has_wildcard(token) {
                let matches = self.expand_wildcard(token, options.include_deprecated).await?;
                if !in_lane_mode {
                    if matches.is_empty() {
                        warn!(pattern = %token, "wildcard matched no remote components");
                    }
                    ids.extend(matches);
                    continue;
                }
                let on_lanes: Vec<ComponentId> = matches
                    .iter()
                    .filter_map(|m| lane_version_of(lanes, m))
                    .collect();
                if on_lanes.is_empty() && !matches.is_empty() {
                    return Err(ImportError::WildcardOutsideLane {
                        pattern: token.clone(),
                        lanes: lanes.iter().map(|l| l.id.to_string()).collect(),
                        ids: matches.iter().map(|m| m.to_string()).collect(),
                    });
                }
                ids.extend(on_lanes);
                continue;
            }

            let id = ComponentId::parse(token)?;
            if in_lane_mode && !id.has_version() {
                if let Some(on_lane) = lane_version_of(lanes, &id) {
                    debug!(id = %on_lane, "resolved id to its lane head");
                    ids.push(on_lane);
                    continue;
                }
            }
            ids.push(id);
        }
        Ok(ids)
    }

    /// Remote ids matching `pattern`. The pattern's first segment names the
    /// scope; a wildcard there searches every registered scope.
    async fn expand_wildcard(&self, pattern: &str, include_deprecated: bool) -> Result<Vec<ComponentId>, ImportError> {
        let scope = pattern.split('/').next().unwrap_or_default();
        let scopes = if has_wildcard(scope) || !pattern.contains('/') {
            self.remotes.scopes()
        } else {
            vec![scope.to_string()]
        };

        let mut found = Vec::new();
        for scope in scopes {
            let remote = self.remotes.get(&scope)?;
            found.extend(remote.list(pattern, include_deprecated).await?);
        }
        debug!(pattern, count = found.len(), "expanded wildcard");
        Ok(found)
    }

    /// Tracked components with a dependency path into `targets`.
    pub async fn dependents_of(&self, targets: &[ComponentId]) -> Result<Vec<ComponentId>, ImportError> {
        let Some(graph) = &self.graph else {
            warn!("no dependency graph configured, skipping dependents");
            return Ok(Vec::new());
        };
        let sources = self.mapping.lock().await.all_ids_with_scope();
        let dependents = graph.find_ids_from_sources_to_targets(&sources, targets)?;
        info!(count = dependents.len(), "found dependents of the targets");
        Ok(dependents)
    }
}

/// The lane entry for `id`, carrying the lane head as its version. Later
/// lanes win.
fn lane_version_of(lanes: &[Lane], id: &ComponentId) -> Option<ComponentId> {
    lanes
        .iter()
        .rev()
        .find_map(|lane| lane.get_component_head(id).map(|head| id.with_version(head.as_str())))
}

/// Unique flattened dependencies of `targets`, one per component with the
/// latest version winning. Targets whose version is not local contribute
/// nothing.
pub fn flattened_dependencies(scope: &LocalScope, targets: &[ComponentId]) -> Result<Vec<ComponentId>, ImportError> {
    let mut deps = Vec::new();
    for id in targets {
        let Some(model) = scope.get_if_exists(id)? else {
            continue;
        };
        let Some(hash) = scope.resolve_version_ref(&model, id.version()) else {
            continue;
        };
        if let Some(version) = scope.get_version_if_exists(&hash)? {
            deps.extend(version.flattened_dependencies);
        }
    }
    let deps: Vec<ComponentId> = keep_latest_versions(deps)
        .into_iter()
        .filter(|d| !targets.iter().any(|t| t.is_same_component(d)))
        .collect();
    debug!(count = deps.len(), "collected flattened dependencies");
    Ok(deps)
}

//! Dependency graph queries over the local scope.

use std::sync::Arc;

use tracing::debug;

use crate::errors::StoreError;
use crate::objects::ComponentId;
use crate::scope::LocalScope;

pub trait DependencyGraph: Send + Sync {
    /// The subset of `sources` that has a dependency path into any of
    /// `targets`. Versions of targets are ignored.
    fn find_ids_from_sources_to_targets(
        &self,
        sources: &[ComponentId],
        targets: &[ComponentId],
    ) -> Result<Vec<ComponentId>, StoreError>;
}

/// Graph answered from the flattened dependency lists stored on versions.
/// A flattened list is the transitive closure, so a path exists exactly when
/// the target appears in the source's list.
pub struct FlattenedGraph {
    scope: Arc<LocalScope>,
}

impl FlattenedGraph {
    pub fn new(scope: Arc<LocalScope>) -> Self {
        Self { scope }
    }
}

impl DependencyGraph for FlattenedGraph {
    fn find_ids_from_sources_to_targets(
        &self,
        sources: &[ComponentId],
        targets: &[ComponentId],
    ) -> Result<Vec<ComponentId>, StoreError> {
        let mut found = Vec::new();
        for source in sources {
            if targets.iter().any(|t| t.is_same_component(source)) {
                continue;
            }
            let Some(model) = self.scope.get_if_exists(source)? else {
                continue;
            };
            let Some(hash) = self.scope.resolve_version_ref(&model, source.version()) else {
                continue;
            };
            let Some(version) = self.scope.get_version_if_exists(&hash)? else {
                debug!(id = %source, "version not local, skipping dependents check");
                continue;
            };
            let depends = version
                .flattened_dependencies
                .iter()
                .any(|dep| targets.iter().any(|t| t.is_same_component(dep)));
            if depends {
                found.push(source.clone());
            }
        }
        debug!(sources = sources.len(), dependents = found.len(), "resolved dependents");
        Ok(found)
    }
}

//! Import session options.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::errors::ImportError;
use crate::objects::{has_wildcard, Lane, LaneId};
use crate::pool::DEFAULT_CONCURRENCY;

/// How to resolve files that were changed both locally and remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Keep the local files; only the recorded version moves.
    Ours,
    /// Overwrite with the incoming files.
    Theirs,
    /// Write the merge result with conflict markers.
    Manual,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ours => write!(f, "ours"),
            Self::Theirs => write!(f, "theirs"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for MergeStrategy {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ours" => Ok(Self::Ours),
            "theirs" => Ok(Self::Theirs),
            "manual" => Ok(Self::Manual),
            other => Err(ImportError::InvalidOptions(format!(
                "unknown merge strategy '{other}', expected ours, theirs or manual"
            ))),
        }
    }
}

/// Lanes an import works against: the requested ids plus the lane objects
/// obtained from the remote. `lanes` may be empty for a lane that only
/// exists locally.
#[derive(Debug, Clone, Default)]
pub struct LaneSelection {
    pub lane_ids: Vec<LaneId>,
    pub lanes: Vec<Lane>,
}

/// Which ids a session works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Lanes were given; ids (if any) are resolved against them.
    Lane,
    /// Explicit ids, trunk only.
    Explicit,
    /// No ids: everything tracked by the workspace mapping.
    WorkspaceMapping,
}

impl fmt::Display for ImportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lane => write!(f, "lane"),
            Self::Explicit => write!(f, "explicit"),
            Self::WorkspaceMapping => write!(f, "workspace_mapping"),
        }
    }
}

/// Options of one import session. Validated once by the session.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Raw id tokens, possibly with wildcards.
    pub ids: Vec<String>,
    pub lanes: Option<LaneSelection>,
    pub merge: bool,
    pub merge_strategy: Option<MergeStrategy>,
    /// Discard local modifications.
    pub override_local: bool,
    /// Fetch objects only; never touch the workspace.
    pub objects_only: bool,
    pub import_dependencies_directly: bool,
    pub import_dependents: bool,
    pub from_original_scope: bool,
    pub save_in_lane: bool,
    pub all_history: bool,
    pub history_depth: Option<u32>,
    pub fetch_deps: bool,
    pub track_only: bool,
    pub include_deprecated: bool,
    pub write_to_path: Option<PathBuf>,
    pub install_packages: bool,
    pub write_config_files: bool,
    /// Keep only components whose env is listed (explicit ids excepted).
    pub filter_envs: Option<Vec<String>>,
    pub strict_seed_fetch: bool,
    pub fetch_concurrency: usize,
    /// Ceiling on components written at once.
    pub write_concurrency: usize,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            ids: Vec::new(),
            lanes: None,
            merge: false,
            merge_strategy: None,
            override_local: false,
            objects_only: false,
            import_dependencies_directly: false,
            import_dependents: false,
            from_original_scope: false,
            save_in_lane: false,
            all_history: false,
            history_depth: None,
            fetch_deps: false,
            track_only: false,
            include_deprecated: false,
            write_to_path: None,
            install_packages: true,
            write_config_files: true,
            filter_envs: None,
            strict_seed_fetch: false,
            fetch_concurrency: DEFAULT_CONCURRENCY,
            write_concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl ImportOptions {
    /// Options seeded from the engine configuration.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            merge_strategy: config.merge.default_strategy,
            all_history: config.fetch.all_history,
            history_depth: config.fetch.history_depth,
            fetch_deps: config.fetch.fetch_deps,
            strict_seed_fetch: config.fetch.strict_seed_fetch,
            install_packages: config.write.install_dependencies,
            write_config_files: config.write.write_config_files,
            fetch_concurrency: config.fetch.concurrency,
            write_concurrency: config.write.concurrency,
            ..Self::default()
        }
    }

    pub fn mode(&self) -> ImportMode {
        if self.lanes.is_some() {
            ImportMode::Lane
        } else if !self.ids.is_empty() {
            ImportMode::Explicit
        } else {
            ImportMode::WorkspaceMapping
        }
    }

    /// Lane objects of the session (empty outside lane mode).
    pub fn lane_objects(&self) -> &[Lane] {
        self.lanes.as_ref().map(|l| l.lanes.as_slice()).unwrap_or(&[])
    }

    /// Whether the workspace is left untouched. A workspace-mapping import
    /// only fetches objects unless merge or override was asked for.
    pub fn is_objects_only(&self) -> bool {
        match self.mode() {
            ImportMode::WorkspaceMapping => self.objects_only || (!self.merge && !self.override_local),
            _ => self.objects_only,
        }
    }

    pub fn validate(&self) -> Result<(), ImportError> {
        let invalid =
            |msg: &str| -> Result<(), ImportError> { Err(ImportError::InvalidOptions(msg.to_string())) };

        if self.merge && self.override_local {
            return invalid("merge and override cannot be used together");
        }
        if self.objects_only && self.merge {
            return invalid("merge requires writing to the workspace and cannot be combined with objects-only");
        }
        if self.objects_only && self.override_local {
            return invalid("override requires writing to the workspace and cannot be combined with objects-only");
        }
        if self.all_history && self.history_depth.is_some() {
            return invalid("all-history and history-depth are mutually exclusive");
        }
        if self.history_depth == Some(0) {
            return invalid("history depth must be greater than zero");
        }
        if let Some(lanes) = &self.lanes {
            if self.ids.is_empty() && lanes.lane_ids.len() > 1 {
                return invalid("importing a lane without ids supports a single lane only");
            }
            if lanes.lane_ids.is_empty() && lanes.lanes.is_empty() {
                return invalid("lane mode requires at least one lane");
            }
        }
        if self.write_to_path.is_some() {
            let single = self.ids.len() == 1 && !has_wildcard(&self.ids[0]);
            if !single {
                return invalid("a write path can only be given when importing a single component");
            }
            if self.import_dependencies_directly || self.import_dependents {
                return invalid("a write path cannot be combined with importing dependencies or dependents");
            }
        }
        if self.fetch_concurrency == 0 || self.write_concurrency == 0 {
            return invalid("concurrency must be greater than zero");
        }
        if self.ids.iter().any(|id| id.trim().is_empty()) {
            return invalid("component ids must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_selection() {
        let mut opts = ImportOptions::default();
        assert_eq!(opts.mode(), ImportMode::WorkspaceMapping);
        assert!(opts.is_objects_only());

        opts.ids = vec!["org/a".into()];
        assert_eq!(opts.mode(), ImportMode::Explicit);
        assert!(!opts.is_objects_only());

        opts.lanes = Some(LaneSelection {
            lane_ids: vec![LaneId::new("org", "dev")],
            lanes: Vec::new(),
        });
        assert_eq!(opts.mode(), ImportMode::Lane);
    }

    #[test]
    fn test_workspace_mapping_merge_writes() {
        let opts = ImportOptions {
            merge: true,
            ..Default::default()
        };
        assert!(!opts.is_objects_only());
    }

    #[test]
    fn test_validate_rejects_conflicting_flags() {
        let opts = ImportOptions {
            merge: true,
            override_local: true,
            ..Default::default()
        };
        assert!(opts.validate().is_err());

        let opts = ImportOptions {
            all_history: true,
            history_depth: Some(3),
            ..Default::default()
        };
        assert!(opts.validate().is_err());

        let opts = ImportOptions {
            ids: vec!["org/*".into()],
            write_to_path: Some(PathBuf::from("components/a")),
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_write_path_is_for_the_component_alone() {
        let single = ImportOptions {
            ids: vec!["org/a".into()],
            write_to_path: Some(PathBuf::from("vendor/a")),
            ..Default::default()
        };
        assert!(single.validate().is_ok());

        let with_deps = ImportOptions {
            import_dependencies_directly: true,
            ..single.clone()
        };
        assert!(matches!(with_deps.validate(), Err(ImportError::InvalidOptions(_))));

        let with_dependents = ImportOptions {
            import_dependents: true,
            ..single
        };
        assert!(matches!(with_dependents.validate(), Err(ImportError::InvalidOptions(_))));
    }

    #[test]
    fn test_validate_single_lane_without_ids() {
        let opts = ImportOptions {
            lanes: Some(LaneSelection {
                lane_ids: vec![LaneId::new("org", "a"), LaneId::new("org", "b")],
                lanes: Vec::new(),
            }),
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_merge_strategy_parse() {
        assert_eq!("Theirs".parse::<MergeStrategy>().unwrap(), MergeStrategy::Theirs);
        assert!("both".parse::<MergeStrategy>().is_err());
        assert_eq!(MergeStrategy::Manual.to_string(), "manual");
    }

    #[test]
    fn test_from_config() {
        let mut config = EngineConfig::default();
        config.fetch.concurrency = 5;
        config.merge.default_strategy = Some(MergeStrategy::Ours);
        let opts = ImportOptions::from_config(&config);
        assert_eq!(opts.fetch_concurrency, 5);
        assert_eq!(opts.write_concurrency, config.write.concurrency);
        assert_eq!(opts.merge_strategy, Some(MergeStrategy::Ours));
        assert!(opts.validate().is_ok());
    }
}

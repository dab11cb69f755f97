//! Report types of an import session.
//!
//! These are returned to the caller and serialize to JSON for reports and
//! the import log.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::merge::FileStatus;
use crate::objects::{ComponentId, Version};
use crate::options::MergeStrategy;

// ---------------------------------------------------------------------------
// Fetched components
// ---------------------------------------------------------------------------

/// A fetched component with its version and flattened dependencies.
#[derive(Debug, Clone)]
pub struct VersionDependencies {
    /// Id with the resolved version (tag when tagged, else the hash).
    pub id: ComponentId,
    pub version: Version,
    pub dependencies: Vec<ComponentId>,
    /// Dependencies whose version is not in the local scope.
    pub missing_dependencies: Vec<ComponentId>,
}

impl VersionDependencies {
    pub fn is_complete(&self) -> bool {
        self.missing_dependencies.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Per-component state
// ---------------------------------------------------------------------------

/// Where a component is in the session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    Pending,
    Fetched,
    UpToDate,
    Diverged,
    ModifiedLocally,
    MergePending,
    CleanIncoming,
    Written,
    UnchangedAfterMerge,
}

impl ComponentState {
    /// Whether moving from `self` to `next` is a legal step.
    pub fn can_advance_to(self, next: ComponentState) -> bool {
        use ComponentState::*;
        matches!(
            (self, next),
            (Pending, Fetched)
                | (Fetched, UpToDate | Diverged | ModifiedLocally | CleanIncoming)
                | (ModifiedLocally, MergePending)
                | (MergePending, Written | UnchangedAfterMerge)
                | (CleanIncoming, Written)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::UpToDate | Self::Diverged | Self::Written | Self::UnchangedAfterMerge
        )
    }
}

impl std::fmt::Display for ComponentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Fetched => write!(f, "fetched"),
            Self::UpToDate => write!(f, "up_to_date"),
            Self::Diverged => write!(f, "diverged"),
            Self::ModifiedLocally => write!(f, "modified_locally"),
            Self::MergePending => write!(f, "merge_pending"),
            Self::CleanIncoming => write!(f, "clean_incoming"),
            Self::Written => write!(f, "written"),
            Self::UnchangedAfterMerge => write!(f, "unchanged_after_merge"),
        }
    }
}

// ---------------------------------------------------------------------------
// Import details
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ImportStatus {
    #[serde(rename = "added")]
    Added,
    #[serde(rename = "updated")]
    Updated,
    #[serde(rename = "up to date")]
    UpToDate,
}

impl ImportStatus {
    /// Status from the versions known before the import and the delta.
    pub fn from_delta(versions_before: &[String], delta: &[String]) -> Self {
        if delta.is_empty() {
            Self::UpToDate
        } else if versions_before.is_empty() {
            Self::Added
        } else {
            Self::Updated
        }
    }
}

impl std::fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Added => write!(f, "added"),
            Self::Updated => write!(f, "updated"),
            Self::UpToDate => write!(f, "up to date"),
        }
    }
}

/// What an import did to one component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportDetails {
    /// Id without version.
    pub id: String,
    /// Versions that were not known locally before the import.
    pub versions: Vec<String>,
    pub latest_version: Option<String>,
    pub status: ImportStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_status: Option<BTreeMap<String, FileStatus>>,
    #[serde(default)]
    pub missing_deps: Vec<String>,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub removed: bool,
}

// ---------------------------------------------------------------------------
// Import result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ImportResult {
    pub session_id: Uuid,
    pub imported_ids: Vec<ComponentId>,
    pub imported_deps: Vec<ComponentId>,
    pub written_components: Vec<ComponentId>,
    pub import_details: Vec<ImportDetails>,
    /// Requested ids that produced no fetched component.
    pub missing_ids: Vec<String>,
    pub installation_error: Option<String>,
    pub compilation_error: Option<String>,
    /// Final state per component, keyed by id without version.
    pub component_states: BTreeMap<String, ComponentState>,
    /// Strategy applied to conflicting components, if any.
    pub merge_strategy: Option<MergeStrategy>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ImportResult {
    pub fn details_for(&self, id: &str) -> Option<&ImportDetails> {
        self.import_details.iter().find(|d| d.id == id)
    }

    /// Whether nothing changed: every component is up to date.
    pub fn is_up_to_date(&self) -> bool {
        self.import_details
            .iter()
            .all(|d| d.status == ImportStatus::UpToDate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_status_from_delta() {
        let before = vec!["1.0.0".to_string()];
        let delta = vec!["1.0.1".to_string()];
        assert_eq!(ImportStatus::from_delta(&before, &[]), ImportStatus::UpToDate);
        assert_eq!(ImportStatus::from_delta(&[], &delta), ImportStatus::Added);
        assert_eq!(ImportStatus::from_delta(&before, &delta), ImportStatus::Updated);
        assert_eq!(ImportStatus::UpToDate.to_string(), "up to date");
    }

    #[test]
    fn test_import_status_serializes_with_spaces() {
        let json = serde_json::to_string(&ImportStatus::UpToDate).unwrap();
        assert_eq!(json, "\"up to date\"");
    }

    #[test]
    fn test_state_transitions() {
        use ComponentState::*;
        assert!(Pending.can_advance_to(Fetched));
        assert!(Fetched.can_advance_to(ModifiedLocally));
        assert!(ModifiedLocally.can_advance_to(MergePending));
        assert!(MergePending.can_advance_to(UnchangedAfterMerge));
        assert!(CleanIncoming.can_advance_to(Written));
        assert!(!Pending.can_advance_to(Written));
        assert!(!Fetched.can_advance_to(MergePending));
        assert!(Written.is_terminal());
        assert!(!CleanIncoming.is_terminal());
    }
}

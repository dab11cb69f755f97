//! File-granular merge of one component.
//!
//! Every path present in the base, the workspace copy ("current") or the
//! incoming version ("other") gets a [`FileStatus`]. Text files changed on
//! both sides go through [`Merger`]; anything that is not valid UTF-8 and
//! was changed on both sides is a binary conflict.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::merger::{MergeLabels, Merger};
use crate::options::MergeStrategy;
use crate::workspace::WorkspaceFile;

/// Outcome for one file of a merged component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// The workspace copy already holds the right content.
    Unchanged,
    /// Changed only on the incoming side.
    Updated,
    /// New on the incoming side.
    Added,
    /// Deleted on the incoming side.
    Removed,
    /// Changed on both sides, merged cleanly.
    Merged,
    /// Changed on both sides, written with conflict markers.
    Manual,
    /// Conflict resolved by taking the incoming content.
    Overridden,
    /// Non-text content changed on both sides.
    BinaryConflict,
}

impl FileStatus {
    pub fn is_conflict(self) -> bool {
        matches!(self, Self::Manual | Self::BinaryConflict)
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unchanged => write!(f, "unchanged"),
            Self::Updated => write!(f, "updated"),
            Self::Added => write!(f, "added"),
            Self::Removed => write!(f, "removed"),
            Self::Merged => write!(f, "merged"),
            Self::Manual => write!(f, "manual"),
            Self::Overridden => write!(f, "overridden"),
            Self::BinaryConflict => write!(f, "binary-conflict"),
        }
    }
}

/// One file of a merge result.
#[derive(Debug, Clone)]
pub struct MergedFile {
    pub path: String,
    pub status: FileStatus,
    /// Content to leave on disk. `None` deletes the file.
    pub content: Option<Vec<u8>>,
    /// Incoming content, kept for conflicts so a strategy can take it.
    pub incoming: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct ComponentMergeResult {
    pub files: Vec<MergedFile>,
}

impl ComponentMergeResult {
    pub fn has_conflicts(&self) -> bool {
        self.files.iter().any(|f| f.status.is_conflict())
    }

    /// Nothing on disk needs to change.
    pub fn is_unchanged(&self) -> bool {
        self.files.iter().all(|f| f.status == FileStatus::Unchanged)
    }

    pub fn files_status(&self) -> BTreeMap<String, FileStatus> {
        self.files.iter().map(|f| (f.path.clone(), f.status)).collect()
    }

    /// Resolve conflicted files with `strategy`. `Ours` leaves the result
    /// untouched; the caller skips writing such components.
    pub fn apply_strategy(&mut self, strategy: MergeStrategy) {
        if strategy != MergeStrategy::Theirs {
            return;
        }
        for file in self.files.iter_mut().filter(|f| f.status.is_conflict()) {
            file.content = file.incoming.clone();
            file.status = FileStatus::Overridden;
        }
    }

    /// Files to write, excluding unchanged and deleted ones.
    pub fn files_to_write(&self) -> Vec<WorkspaceFile> {
        self.files
            .iter()
            .filter(|f| f.status != FileStatus::Unchanged)
            .filter_map(|f| {
                f.content.as_ref().map(|data| WorkspaceFile {
                    path: f.path.clone(),
                    data: data.clone(),
                })
            })
            .collect()
    }

    /// Paths to delete from the component directory.
    pub fn files_to_remove(&self) -> Vec<String> {
        self.files
            .iter()
            .filter(|f| f.status != FileStatus::Unchanged && f.content.is_none())
            .map(|f| f.path.clone())
            .collect()
    }
}

fn index(files: &[WorkspaceFile]) -> BTreeMap<&str, &[u8]> {
    files.iter().map(|f| (f.path.as_str(), f.data.as_slice())).collect()
}

/// Merge the files of one component.
pub fn merge_component_files(
    base: &[WorkspaceFile],
    current: &[WorkspaceFile],
    other: &[WorkspaceFile],
    labels: &MergeLabels,
) -> ComponentMergeResult {
    let base = index(base);
    let current = index(current);
    let other = index(other);
    let paths: BTreeSet<&str> = base
        .keys()
        .chain(current.keys())
        .chain(other.keys())
        .copied()
        .collect();

    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let b = base.get(path).copied();
        let c = current.get(path).copied();
        let o = other.get(path).copied();
        files.push(merge_file(path, b, c, o, labels));
    }

    let result = ComponentMergeResult { files };
    debug!(
        files = result.files.len(),
        conflicts = result.has_conflicts(),
        "merged component files"
    );
    result
}

fn merge_file(
    path: &str,
    base: Option<&[u8]>,
    current: Option<&[u8]>,
    other: Option<&[u8]>,
    labels: &MergeLabels,
) -> MergedFile {
    let file = |status, content: Option<&[u8]>| MergedFile {
        path: path.to_string(),
        status,
        content: content.map(<[u8]>::to_vec),
        incoming: None,
    };

    if current == other || other == base {
        return file(FileStatus::Unchanged, current);
    }
    if current == base {
        let status = match (base, other) {
            (_, None) => FileStatus::Removed,
            (None, Some(_)) => FileStatus::Added,
            (Some(_), Some(_)) => FileStatus::Updated,
        };
        return file(status, other);
    }

    // Changed on both sides.
    let conflict = |status, content: Option<&[u8]>| MergedFile {
        incoming: other.map(<[u8]>::to_vec),
        ..file(status, content)
    };
    let (Some(cur), Some(inc)) = (current, other) else {
        // Edited on one side, deleted on the other: keep what exists.
        return conflict(FileStatus::Manual, current.or(other));
    };
    let base_text = std::str::from_utf8(base.unwrap_or_default());
    let (Ok(base_text), Ok(cur_text), Ok(inc_text)) =
        (base_text, std::str::from_utf8(cur), std::str::from_utf8(inc))
    else {
        debug!(path, "binary file changed on both sides");
        return conflict(FileStatus::BinaryConflict, Some(cur));
    };

    let merged = Merger::three_way_merge(base_text, cur_text, inc_text, labels);
    if merged.has_conflicts {
        conflict(FileStatus::Manual, Some(merged.merged_content.as_bytes()))
    } else {
        file(FileStatus::Merged, Some(merged.merged_content.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(path: &str, data: &[u8]) -> WorkspaceFile {
        WorkspaceFile {
            path: path.into(),
            data: data.to_vec(),
        }
    }

    fn labels() -> MergeLabels {
        MergeLabels::new("1.0.0 (modified)", "1.0.1 (incoming)")
    }

    fn status_of(result: &ComponentMergeResult, path: &str) -> FileStatus {
        result.files_status()[path]
    }

    #[test]
    fn test_incoming_only_changes() {
        let base = vec![f("a.ts", b"a\n"), f("gone.ts", b"x\n")];
        let current = base.clone();
        let other = vec![f("a.ts", b"A\n"), f("new.ts", b"n\n")];

        let result = merge_component_files(&base, &current, &other, &labels());
        assert_eq!(status_of(&result, "a.ts"), FileStatus::Updated);
        assert_eq!(status_of(&result, "new.ts"), FileStatus::Added);
        assert_eq!(status_of(&result, "gone.ts"), FileStatus::Removed);
        assert!(!result.has_conflicts());
        assert_eq!(result.files_to_remove(), vec!["gone.ts".to_string()]);
        assert_eq!(result.files_to_write().len(), 2);
    }

    #[test]
    fn test_local_only_changes_are_unchanged() {
        let base = vec![f("a.ts", b"a\n")];
        let current = vec![f("a.ts", b"local\n"), f("scratch.ts", b"s\n")];
        let result = merge_component_files(&base, &current, &base, &labels());
        assert!(result.is_unchanged());
        assert!(result.files_to_write().is_empty());
    }

    #[test]
    fn test_clean_and_conflicting_text_merge() {
        let base = vec![
            f("clean.ts", b"1\n2\n3\n4\n5\n"),
            f("conflict.ts", b"x\noriginal\ny\n"),
        ];
        let current = vec![
            f("clean.ts", b"ONE\n2\n3\n4\n5\n"),
            f("conflict.ts", b"x\nlocal\ny\n"),
        ];
        let other = vec![
            f("clean.ts", b"1\n2\n3\n4\nFIVE\n"),
            f("conflict.ts", b"x\nremote\ny\n"),
        ];

        let result = merge_component_files(&base, &current, &other, &labels());
        assert_eq!(status_of(&result, "clean.ts"), FileStatus::Merged);
        assert_eq!(status_of(&result, "conflict.ts"), FileStatus::Manual);
        assert!(result.has_conflicts());

        let written = result.files_to_write();
        let conflict = written.iter().find(|w| w.path == "conflict.ts").unwrap();
        let text = String::from_utf8(conflict.data.clone()).unwrap();
        assert!(text.contains("<<<<<<< 1.0.0 (modified)"));
        assert!(text.contains(">>>>>>> 1.0.1 (incoming)"));
    }

    #[test]
    fn test_binary_conflict_and_theirs() {
        let base = vec![f("logo.png", &[0x89, 0x50, 0xff, 0x00])];
        let current = vec![f("logo.png", &[0x89, 0x50, 0xfe, 0x01])];
        let other = vec![f("logo.png", &[0x89, 0x50, 0xfd, 0x02])];

        let mut result = merge_component_files(&base, &current, &other, &labels());
        assert_eq!(status_of(&result, "logo.png"), FileStatus::BinaryConflict);

        result.apply_strategy(MergeStrategy::Theirs);
        assert_eq!(status_of(&result, "logo.png"), FileStatus::Overridden);
        assert_eq!(result.files_to_write()[0].data, vec![0x89, 0x50, 0xfd, 0x02]);
    }

    #[test]
    fn test_edit_delete_conflict_keeps_existing() {
        let base = vec![f("a.ts", b"a\n")];
        let current = vec![f("a.ts", b"edited\n")];
        let other: Vec<WorkspaceFile> = Vec::new();

        let mut result = merge_component_files(&base, &current, &other, &labels());
        assert_eq!(status_of(&result, "a.ts"), FileStatus::Manual);
        assert_eq!(result.files_to_write()[0].data, b"edited\n");

        result.apply_strategy(MergeStrategy::Theirs);
        assert_eq!(result.files_to_remove(), vec!["a.ts".to_string()]);
    }

    #[test]
    fn test_file_status_display() {
        assert_eq!(FileStatus::BinaryConflict.to_string(), "binary-conflict");
        assert_eq!(FileStatus::Overridden.to_string(), "overridden");
    }
}

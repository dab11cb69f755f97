//! Three-way text merge.
//!
//! Uses the `diffy` crate for a line-based three-way merge of a base, "ours"
//! (the workspace copy) and "theirs" (the incoming version) of a file.
//! Conflict markers are relabelled with caller-supplied version labels.

use tracing::debug;

/// Labels printed after the conflict markers.
#[derive(Debug, Clone)]
pub struct MergeLabels {
    pub ours: String,
    pub theirs: String,
}

impl MergeLabels {
    pub fn new(ours: impl Into<String>, theirs: impl Into<String>) -> Self {
        Self {
            ours: ours.into(),
            theirs: theirs.into(),
        }
    }
}

/// The result of a three-way merge attempt.
#[derive(Debug, Clone)]
pub struct MergeResult {
    /// The merged content (contains conflict markers if `has_conflicts`).
    pub merged_content: String,
    pub has_conflicts: bool,
    pub conflict_markers: Vec<ConflictMarker>,
}

/// A single conflict region within merged output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictMarker {
    /// Line (1-indexed) of the opening `<<<<<<<` marker.
    pub start_line: usize,
    /// Line (1-indexed) of the closing `>>>>>>>` marker.
    pub end_line: usize,
}

const OURS_MARKER: &str = "<<<<<<< ours";
const THEIRS_MARKER: &str = ">>>>>>> theirs";

/// Stateless three-way merge engine.
pub struct Merger;

impl Merger {
    /// Merge `base`, `ours` and `theirs`. The result always carries merged
    /// content; on conflict the regions are wrapped in
    /// `<<<<<<< {ours}` / `=======` / `>>>>>>> {theirs}` markers.
    pub fn three_way_merge(base: &str, ours: &str, theirs: &str, labels: &MergeLabels) -> MergeResult {
        if ours == base || ours == theirs {
            debug!("ours unchanged or identical to theirs, taking theirs");
            return clean(theirs);
        }
        if theirs == base {
            debug!("theirs == base, keeping ours");
            return clean(ours);
        }

        let mut options = diffy::MergeOptions::new();
        options.set_conflict_style(diffy::ConflictStyle::Merge);
        match options.merge(base, ours, theirs) {
            Ok(merged) => {
                debug!("clean three-way merge");
                clean(&merged)
            }
            Err(conflicted) => {
                let (merged_content, conflict_markers) = relabel(&conflicted, labels);
                debug!(conflicts = conflict_markers.len(), "three-way merge has conflicts");
                MergeResult {
                    merged_content,
                    has_conflicts: true,
                    conflict_markers,
                }
            }
        }
    }

    /// Quick check: can these three versions be merged without conflicts?
    pub fn can_auto_merge(base: &str, ours: &str, theirs: &str) -> bool {
        if ours == base || theirs == base || ours == theirs {
            return true;
        }
        diffy::merge(base, ours, theirs).is_ok()
    }
}

fn clean(content: &str) -> MergeResult {
    MergeResult {
        merged_content: content.to_string(),
        has_conflicts: false,
        conflict_markers: Vec::new(),
    }
}

/// Replace diffy's default marker labels and record conflict regions.
fn relabel(conflicted: &str, labels: &MergeLabels) -> (String, Vec<ConflictMarker>) {
    let mut out = String::with_capacity(conflicted.len());
    let mut markers = Vec::new();
    let mut open: Option<usize> = None;

    for (idx, line) in conflicted.split_inclusive('\n').enumerate() {
        let line_no = idx + 1;
        let (text, ending) = match line.strip_suffix('\n') {
            Some(text) => (text, "\n"),
            None => (line, ""),
        };
        if text == OURS_MARKER {
            open = Some(line_no);
            out.push_str(&format!("<<<<<<< {}{ending}", labels.ours));
        } else if text == THEIRS_MARKER {
            if let Some(start_line) = open.take() {
                markers.push(ConflictMarker {
                    start_line,
                    end_line: line_no,
                });
            }
            out.push_str(&format!(">>>>>>> {}{ending}", labels.theirs));
        } else {
            out.push_str(line);
        }
    }
    (out, markers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> MergeLabels {
        MergeLabels::new("1.0.0 (modified)", "1.0.1 (incoming)")
    }

    #[test]
    fn test_identical_files() {
        let base = "line1\nline2\nline3\n";
        let result = Merger::three_way_merge(base, base, base, &labels());
        assert!(!result.has_conflicts);
        assert_eq!(result.merged_content, base);
    }

    #[test]
    fn test_only_ours_changed() {
        let base = "line1\nline2\nline3\n";
        let ours = "line1\nmodified\nline3\n";
        let result = Merger::three_way_merge(base, ours, base, &labels());
        assert!(!result.has_conflicts);
        assert_eq!(result.merged_content, ours);
    }

    #[test]
    fn test_only_theirs_changed() {
        let base = "line1\nline2\nline3\n";
        let theirs = "line1\nline2\nmodified\n";
        let result = Merger::three_way_merge(base, base, theirs, &labels());
        assert!(!result.has_conflicts);
        assert_eq!(result.merged_content, theirs);
    }

    #[test]
    fn test_non_overlapping_changes() {
        let base = "aaa\nbbb\nccc\nddd\neee\n";
        let ours = "AAA\nbbb\nccc\nddd\neee\n";
        let theirs = "aaa\nbbb\nccc\nddd\nEEE\n";
        let result = Merger::three_way_merge(base, ours, theirs, &labels());
        assert!(!result.has_conflicts);
        assert_eq!(result.merged_content, "AAA\nbbb\nccc\nddd\nEEE\n");
    }

    #[test]
    fn test_conflicting_changes_use_labels() {
        let base = "line1\noriginal\nline3\n";
        let ours = "line1\nours_version\nline3\n";
        let theirs = "line1\ntheirs_version\nline3\n";
        let result = Merger::three_way_merge(base, ours, theirs, &labels());
        assert!(result.has_conflicts);
        assert!(result.merged_content.contains("<<<<<<< 1.0.0 (modified)\n"));
        assert!(result.merged_content.contains("=======\n"));
        assert!(result.merged_content.contains(">>>>>>> 1.0.1 (incoming)\n"));
        assert!(result.merged_content.contains("ours_version"));
        assert!(result.merged_content.contains("theirs_version"));
        assert_eq!(result.conflict_markers.len(), 1);
        assert_eq!(result.conflict_markers[0].start_line, 2);
    }

    #[test]
    fn test_can_auto_merge() {
        let base = "aaa\nbbb\nccc\n";
        assert!(Merger::can_auto_merge(base, base, base));
        assert!(Merger::can_auto_merge(base, "AAA\nbbb\nccc\n", base));
        assert!(Merger::can_auto_merge(base, "XXX\nbbb\nccc\n", "XXX\nbbb\nccc\n"));
        assert!(!Merger::can_auto_merge(
            "line1\noriginal\nline3\n",
            "line1\nours\nline3\n",
            "line1\ntheirs\nline3\n"
        ));
    }
}

//! Merging incoming versions into locally modified components.

pub mod files;
pub mod merger;
pub mod writer;

use async_trait::async_trait;

use crate::objects::ComponentId;
use crate::options::MergeStrategy;

pub use files::{merge_component_files, ComponentMergeResult, FileStatus, MergedFile};
pub use merger::{ConflictMarker, MergeLabels, MergeResult, Merger};
pub use writer::{MergeCandidate, MergeDisposition, MergeWriter, MergedComponent};

/// Asks the user how to resolve conflicts. Called at most once per session.
#[async_trait]
pub trait MergeStrategyPrompt: Send + Sync {
    async fn choose_strategy(&self, conflicted: &[ComponentId]) -> anyhow::Result<MergeStrategy>;
}

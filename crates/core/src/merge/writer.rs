//! Merge of locally modified components with their incoming versions.
//!
//! For each candidate the base (the checked-out version), the incoming
//! version and the files on disk are merged file by file. When any component
//! conflicts and no strategy was given, the [`MergeStrategyPrompt`] is asked
//! once for the whole batch.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::files::{merge_component_files, ComponentMergeResult, FileStatus};
use super::merger::MergeLabels;
use super::MergeStrategyPrompt;
use crate::errors::{ImportError, MergeError};
use crate::objects::{ComponentId, Version};
use crate::options::MergeStrategy;
use crate::scope::LocalScope;
use crate::workspace::{ComponentToWrite, Workspace};

/// A locally modified component with an incoming version.
#[derive(Debug, Clone)]
pub struct MergeCandidate {
    /// Incoming id, with version.
    pub id: ComponentId,
    /// Checked-out id from the workspace mapping, with version.
    pub current: ComponentId,
    pub version: Version,
    pub root_dir: String,
}

/// What happens to a merged component.
#[derive(Debug, Clone)]
pub enum MergeDisposition {
    /// Write the merge result.
    Write(ComponentToWrite),
    /// Keep the local files; only the mapping moves ("ours").
    KeepOurs,
    /// Every file already matches; nothing to write.
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct MergedComponent {
    pub id: ComponentId,
    pub files_status: BTreeMap<String, FileStatus>,
    pub has_conflicts: bool,
    pub disposition: MergeDisposition,
}

pub struct MergeWriter {
    scope: Arc<LocalScope>,
    workspace: Arc<dyn Workspace>,
    prompt: Option<Arc<dyn MergeStrategyPrompt>>,
}

impl MergeWriter {
    pub fn new(
        scope: Arc<LocalScope>,
        workspace: Arc<dyn Workspace>,
        prompt: Option<Arc<dyn MergeStrategyPrompt>>,
    ) -> Self {
        Self {
            scope,
            workspace,
            prompt,
        }
    }

    /// Merge every candidate and decide what to write. Returns the merged
    /// components and the strategy applied to conflicts, if any.
    pub async fn merge(
        &self,
        candidates: Vec<MergeCandidate>,
        strategy: Option<MergeStrategy>,
    ) -> Result<(Vec<MergedComponent>, Option<MergeStrategy>), ImportError> {
        let mut merged = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let result = self.merge_one(&candidate).await?;
            merged.push((candidate, result));
        }

        let conflicted: Vec<ComponentId> = merged
            .iter()
            .filter(|(_, r)| r.has_conflicts())
            .map(|(c, _)| c.id.clone())
            .collect();

        let strategy = match (strategy, conflicted.is_empty()) {
            (_, true) => strategy,
            (Some(s), false) => Some(s),
            (None, false) => Some(self.ask(&conflicted).await?),
        };

        let components = merged
            .into_iter()
            .map(|(candidate, result)| resolve(candidate, result, strategy))
            .collect();
        Ok((components, strategy))
    }

    async fn ask(&self, conflicted: &[ComponentId]) -> Result<MergeStrategy, ImportError> {
        let Some(prompt) = &self.prompt else {
            debug!("no merge prompt configured, leaving conflict markers");
            return Ok(MergeStrategy::Manual);
        };
        info!(count = conflicted.len(), "asking for a merge strategy");
        prompt
            .choose_strategy(conflicted)
            .await
            .map_err(|e| ImportError::Prompt(e.to_string()))
    }

    async fn merge_one(&self, candidate: &MergeCandidate) -> Result<ComponentMergeResult, ImportError> {
        let base_version = self.base_version(&candidate.current)?;
        let base = self.scope.load_version_files(&base_version)?;
        let other = self.scope.load_version_files(&candidate.version)?;
        let current = self.workspace.load_files(&candidate.current).await?;

        let labels = MergeLabels::new(
            format!("{} (modified)", candidate.current.version().unwrap_or("local")),
            format!("{} (incoming)", candidate.id.version().unwrap_or("latest")),
        );
        let result = merge_component_files(&base, &current, &other, &labels);
        debug!(
            id = %candidate.id,
            conflicts = result.has_conflicts(),
            unchanged = result.is_unchanged(),
            "merged component"
        );
        Ok(result)
    }

    fn base_version(&self, current: &ComponentId) -> Result<Version, ImportError> {
        let missing = || MergeError::MissingBase(current.to_string());
        let model = self.scope.get_if_exists(current)?.ok_or_else(missing)?;
        let hash = current
            .version()
            .and_then(|v| self.scope.resolve_version_ref(&model, Some(v)))
            .ok_or_else(missing)?;
        match self.scope.get_version_if_exists(&hash)? {
            Some(version) => Ok(version),
            None => Err(missing().into()),
        }
    }
}

fn resolve(
    candidate: MergeCandidate,
    mut result: ComponentMergeResult,
    strategy: Option<MergeStrategy>,
) -> MergedComponent {
    let has_conflicts = result.has_conflicts();
    let disposition = if result.is_unchanged() {
        MergeDisposition::Unchanged
    } else if has_conflicts && strategy == Some(MergeStrategy::Ours) {
        MergeDisposition::KeepOurs
    } else {
        if has_conflicts {
            if let Some(strategy) = strategy {
                result.apply_strategy(strategy);
            }
        }
        MergeDisposition::Write(ComponentToWrite {
            id: candidate.id.clone(),
            root_dir: candidate.root_dir,
            files: result.files_to_write(),
            removed_files: result.files_to_remove(),
            dependencies: candidate.version.flattened_dependencies.clone(),
            env: candidate.version.env.clone(),
            tracked: true,
        })
    };
    debug!(id = %candidate.id, disposition = kind(&disposition), "resolved merge");
    MergedComponent {
        id: candidate.id,
        files_status: result.files_status(),
        has_conflicts,
        disposition,
    }
}

fn kind(disposition: &MergeDisposition) -> &'static str {
    match disposition {
        MergeDisposition::Write(_) => "write",
        MergeDisposition::KeepOurs => "ours",
        MergeDisposition::Unchanged => "unchanged",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::ModelComponent;
    use crate::workspace::{shared_mapping, FsWorkspace, MappingFile, WorkspaceMapping};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPrompt {
        calls: AtomicUsize,
        answer: MergeStrategy,
    }

    #[async_trait::async_trait]
    impl MergeStrategyPrompt for CountingPrompt {
        async fn choose_strategy(&self, _conflicted: &[ComponentId]) -> anyhow::Result<MergeStrategy> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer)
        }
    }

    fn snap(scope: &LocalScope, files: &[(&str, &str)], parent: Option<&Version>) -> Version {
        let mut builder = Version::builder("alice", "snap");
        if let Some(parent) = parent {
            builder = builder.parent(parent.hash.clone());
        }
        for (path, content) in files {
            builder = builder.file(*path, scope.put_file(content.as_bytes()).unwrap());
        }
        let version = builder.build().unwrap();
        scope.put_version(&version).unwrap();
        version
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        scope: Arc<LocalScope>,
        workspace: Arc<dyn Workspace>,
        candidate: MergeCandidate,
    }

    /// `org/a@1.0.0` checked out in `components/a`, `1.0.1` incoming.
    fn fixture(on_disk: &str, incoming: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let scope = Arc::new(LocalScope::in_memory().unwrap());
        let v1 = snap(&scope, &[("index.ts", "a\nb\nc\nd\ne\n"), ("util.ts", "u\n")], None);
        let v2 = snap(&scope, &[("index.ts", incoming), ("util.ts", "u\n")], Some(&v1));

        let id = ComponentId::parse("org/a").unwrap();
        let mut model = ModelComponent::new(&id);
        model.add_tag("1.0.0", v1.hash.clone());
        model.add_tag("1.0.1", v2.hash.clone());
        model.head = Some(v2.hash.clone());
        scope.put_model_component(&model).unwrap();

        let comp_dir = dir.path().join("components/a");
        std::fs::create_dir_all(&comp_dir).unwrap();
        std::fs::write(comp_dir.join("index.ts"), on_disk).unwrap();
        std::fs::write(comp_dir.join("util.ts"), "u\n").unwrap();

        let mut mapping = MappingFile::new(dir.path().join("mapping.toml"));
        mapping.update_component_id(&id.with_version("1.0.0"), "components/a");
        let workspace: Arc<dyn Workspace> = Arc::new(FsWorkspace::new(
            dir.path(),
            shared_mapping(mapping),
            scope.clone(),
        ));

        let candidate = MergeCandidate {
            id: id.with_version("1.0.1"),
            current: id.with_version("1.0.0"),
            version: v2,
            root_dir: "components/a".into(),
        };
        Fixture {
            _dir: dir,
            scope,
            workspace,
            candidate,
        }
    }

    #[tokio::test]
    async fn test_clean_merge_is_written_without_prompt() {
        let fx = fixture("A\nb\nc\nd\ne\n", "a\nb\nc\nd\nE\n");
        let prompt = Arc::new(CountingPrompt {
            calls: AtomicUsize::new(0),
            answer: MergeStrategy::Theirs,
        });
        let writer = MergeWriter::new(fx.scope.clone(), fx.workspace.clone(), Some(prompt.clone()));

        let (merged, strategy) = writer.merge(vec![fx.candidate.clone()], None).await.unwrap();
        assert_eq!(prompt.calls.load(Ordering::SeqCst), 0);
        assert_eq!(strategy, None);
        assert_eq!(merged[0].files_status["index.ts"], FileStatus::Merged);
        let MergeDisposition::Write(component) = &merged[0].disposition else {
            panic!("expected a write");
        };
        assert_eq!(component.files[0].data, b"A\nb\nc\nd\nE\n");
    }

    #[tokio::test]
    async fn test_conflict_prompts_once_and_keeps_ours() {
        let fx = fixture("a\nlocal\nc\nd\ne\n", "a\nremote\nc\nd\ne\n");
        let prompt = Arc::new(CountingPrompt {
            calls: AtomicUsize::new(0),
            answer: MergeStrategy::Ours,
        });
        let writer = MergeWriter::new(fx.scope.clone(), fx.workspace.clone(), Some(prompt.clone()));

        let candidates = vec![fx.candidate.clone(), fx.candidate.clone()];
        let (merged, strategy) = writer.merge(candidates, None).await.unwrap();
        assert_eq!(prompt.calls.load(Ordering::SeqCst), 1);
        assert_eq!(strategy, Some(MergeStrategy::Ours));
        assert!(merged
            .iter()
            .all(|m| matches!(m.disposition, MergeDisposition::KeepOurs)));
    }

    #[tokio::test]
    async fn test_theirs_and_manual_without_prompt() {
        let fx = fixture("a\nlocal\nc\nd\ne\n", "a\nremote\nc\nd\ne\n");
        let writer = MergeWriter::new(fx.scope.clone(), fx.workspace.clone(), None);

        let (merged, _) = writer
            .merge(vec![fx.candidate.clone()], Some(MergeStrategy::Theirs))
            .await
            .unwrap();
        assert_eq!(merged[0].files_status["index.ts"], FileStatus::Overridden);
        let MergeDisposition::Write(component) = &merged[0].disposition else {
            panic!("expected a write");
        };
        assert_eq!(component.files[0].data, b"a\nremote\nc\nd\ne\n");

        let (merged, strategy) = writer.merge(vec![fx.candidate.clone()], None).await.unwrap();
        assert_eq!(strategy, Some(MergeStrategy::Manual));
        let MergeDisposition::Write(component) = &merged[0].disposition else {
            panic!("expected a write");
        };
        let text = String::from_utf8(component.files[0].data.clone()).unwrap();
        assert!(text.contains("<<<<<<< 1.0.0 (modified)"));
        assert!(text.contains(">>>>>>> 1.0.1 (incoming)"));
    }

    #[tokio::test]
    async fn test_unchanged_component_is_dropped() {
        let fx = fixture("a\nb\nc\nd\ne\nlocal tail\n", "a\nb\nc\nd\ne\n");
        let writer = MergeWriter::new(fx.scope.clone(), fx.workspace.clone(), None);
        let (merged, _) = writer.merge(vec![fx.candidate.clone()], None).await.unwrap();
        assert!(matches!(merged[0].disposition, MergeDisposition::Unchanged));
    }

    #[tokio::test]
    async fn test_missing_base_fails() {
        let mut fx = fixture("x\n", "y\n");
        fx.candidate.current = ComponentId::parse("org/a@9.9.9").unwrap();
        let writer = MergeWriter::new(fx.scope.clone(), fx.workspace.clone(), None);
        let err = writer.merge(vec![fx.candidate.clone()], None).await.unwrap_err();
        assert!(matches!(err, ImportError::Merge(MergeError::MissingBase(_))));
    }
}

//! Filesystem component writer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{ComponentToWrite, ComponentWriter, WriteRequest, WriterResults, COMPONENT_CONFIG_FILE};
use crate::errors::WriterError;
use crate::objects::is_safe_relative_path;
use crate::pool::WorkerPool;

/// Installs package dependencies for freshly written components.
#[async_trait]
pub trait DependencyInstaller: Send + Sync {
    async fn install(&self, component_dirs: &[PathBuf]) -> anyhow::Result<()>;
}

#[derive(Serialize)]
struct ComponentConfig<'a> {
    id: String,
    env: Option<&'a str>,
    dependencies: Vec<String>,
}

/// Writes component files under a workspace root with bounded concurrency.
/// A request that carries its own concurrency gets a pool of that size.
pub struct FsComponentWriter {
    root: PathBuf,
    pool: WorkerPool,
    installer: Option<Arc<dyn DependencyInstaller>>,
}

impl FsComponentWriter {
    pub fn new<P: AsRef<Path>>(root: P, concurrency: usize) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            pool: WorkerPool::new(concurrency),
            installer: None,
        }
    }

    pub fn with_installer(mut self, installer: Arc<dyn DependencyInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    fn pool_for(&self, request: &WriteRequest) -> WorkerPool {
        match request.concurrency {
            Some(limit) if limit != self.pool.limit() => WorkerPool::new(limit),
            _ => self.pool.clone(),
        }
    }

    fn target_dir(&self, component: &ComponentToWrite, write_to_path: Option<&Path>) -> PathBuf {
        match write_to_path {
            Some(path) => self.root.join(path),
            None => self.root.join(&component.root_dir),
        }
    }
}

/// Reject any file or removal that would land outside the component
/// directory, before anything is written.
fn check_paths(component: &ComponentToWrite) -> Result<(), WriterError> {
    let unsafe_path = component
        .files
        .iter()
        .map(|f| &f.path)
        .chain(component.removed_files.iter())
        .find(|path| !is_safe_relative_path(path));
    match unsafe_path {
        Some(path) => Err(WriterError::UnsafePath {
            id: component.id.to_string(),
            path: path.clone(),
        }),
        None => Ok(()),
    }
}

fn write_component(
    dir: &Path,
    component: &ComponentToWrite,
    write_config: bool,
) -> Result<(), WriterError> {
    check_paths(component)?;
    std::fs::create_dir_all(dir)?;
    for path in &component.removed_files {
        let target = dir.join(path);
        if target.exists() {
            std::fs::remove_file(&target)?;
        }
    }
    for file in &component.files {
        let target = dir.join(&file.path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, &file.data)?;
    }
    if write_config {
        let config = ComponentConfig {
            id: component.id.to_string(),
            env: component.env.as_deref(),
            dependencies: component.dependencies.iter().map(|d| d.to_string()).collect(),
        };
        let json = serde_json::to_vec_pretty(&config)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(dir.join(COMPONENT_CONFIG_FILE), json)?;
    }
    Ok(())
}

fn is_non_empty_dir(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

#[async_trait]
impl ComponentWriter for FsComponentWriter {
    async fn write_many(&self, request: WriteRequest) -> Result<WriterResults, WriterError> {
        let write_to_path = request.write_to_path.as_deref();
        let mut jobs = Vec::with_capacity(request.components.len());
        for component in &request.components {
            check_paths(component)?;
            let dir = self.target_dir(component, write_to_path);
            if request.throw_if_existing_dir && !component.tracked && is_non_empty_dir(&dir) {
                return Err(WriterError::ExistingDirectory {
                    id: component.id.to_string(),
                    path: dir.display().to_string(),
                });
            }
            jobs.push((dir, component.clone()));
        }

        let dirs: Vec<PathBuf> = jobs.iter().map(|(dir, _)| dir.clone()).collect();
        let written = request.components.iter().map(|c| c.id.clone()).collect();

        if request.track_only {
            info!(count = jobs.len(), "track-only import, no files written");
            return Ok(WriterResults {
                written,
                ..Default::default()
            });
        }

        let write_config = !request.skip_config_files;
        let pool = self.pool_for(&request);
        debug!(count = jobs.len(), limit = pool.limit(), "writing component files");
        let results = pool
            .map(jobs, move |(dir, component)| async move {
                tokio::task::spawn_blocking(move || write_component(&dir, &component, write_config))
                    .await
                    .unwrap_or_else(|e| Err(WriterError::Task(e.to_string())))
            })
            .await;
        for result in results {
            result.map_err(|e| WriterError::Task(e.to_string()))??;
        }
        info!(count = dirs.len(), "wrote components");

        let mut installation_error = None;
        if !request.skip_dependency_install {
            if let Some(installer) = &self.installer {
                debug!(count = dirs.len(), "installing dependencies");
                if let Err(e) = installer.install(&dirs).await {
                    warn!(error = %e, "dependency installation failed");
                    installation_error = Some(e.to_string());
                }
            }
        }

        Ok(WriterResults {
            written,
            installation_error,
            compilation_error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::ComponentId;
    use crate::workspace::WorkspaceFile;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn component(root_dir: &str, tracked: bool) -> ComponentToWrite {
        ComponentToWrite {
            id: ComponentId::parse("org/a@1.0.0").unwrap(),
            root_dir: root_dir.to_string(),
            files: vec![
                WorkspaceFile {
                    path: "index.ts".into(),
                    data: b"export {}".to_vec(),
                },
                WorkspaceFile {
                    path: "lib/util.ts".into(),
                    data: b"export const u = 1".to_vec(),
                },
            ],
            removed_files: vec!["old.ts".into()],
            dependencies: vec![ComponentId::parse("org/b@2.0.0").unwrap()],
            env: Some("org/envs/node".into()),
            tracked,
        }
    }

    struct FailingInstaller(AtomicUsize);

    #[async_trait]
    impl DependencyInstaller for FailingInstaller {
        async fn install(&self, _dirs: &[PathBuf]) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("registry unreachable")
        }
    }

    #[tokio::test]
    async fn test_write_many_writes_files_and_config() {
        let dir = tempfile::tempdir().unwrap();
        let comp_dir = dir.path().join("components/a");
        std::fs::create_dir_all(&comp_dir).unwrap();
        std::fs::write(comp_dir.join("old.ts"), b"stale").unwrap();

        let writer = FsComponentWriter::new(dir.path(), 4);
        let result = writer
            .write_many(WriteRequest {
                components: vec![component("components/a", true)],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(result.written.len(), 1);
        assert_eq!(std::fs::read(comp_dir.join("lib/util.ts")).unwrap(), b"export const u = 1");
        assert!(!comp_dir.join("old.ts").exists());
        let config = std::fs::read_to_string(comp_dir.join(COMPONENT_CONFIG_FILE)).unwrap();
        assert!(config.contains("org/b@2.0.0"));
    }

    #[tokio::test]
    async fn test_existing_dir_is_rejected_for_untracked() {
        let dir = tempfile::tempdir().unwrap();
        let comp_dir = dir.path().join("components/a");
        std::fs::create_dir_all(&comp_dir).unwrap();
        std::fs::write(comp_dir.join("README.md"), b"someone else's").unwrap();

        let writer = FsComponentWriter::new(dir.path(), 4);
        let err = writer
            .write_many(WriteRequest {
                components: vec![component("components/a", false)],
                throw_if_existing_dir: true,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WriterError::ExistingDirectory { .. }));
    }

    #[tokio::test]
    async fn test_track_only_and_installer_errors() {
        let dir = tempfile::tempdir().unwrap();
        let installer = Arc::new(FailingInstaller(AtomicUsize::new(0)));
        let writer = FsComponentWriter::new(dir.path(), 2).with_installer(installer.clone());

        let result = writer
            .write_many(WriteRequest {
                components: vec![component("components/a", false)],
                track_only: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.written.len(), 1);
        assert!(!dir.path().join("components/a").exists());

        let result = writer
            .write_many(WriteRequest {
                components: vec![component("components/a", false)],
                skip_config_files: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.installation_error.as_deref(), Some("registry unreachable"));
        assert_eq!(installer.0.load(Ordering::SeqCst), 1);
        assert!(!dir.path().join("components/a").join(COMPONENT_CONFIG_FILE).exists());
    }

    #[tokio::test]
    async fn test_unsafe_paths_are_rejected_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FsComponentWriter::new(dir.path().join("ws"), 4);

        let mut escaping = component("components/a", false);
        escaping.files.push(WorkspaceFile {
            path: "../../escaped.txt".into(),
            data: b"gotcha".to_vec(),
        });
        let err = writer
            .write_many(WriteRequest {
                components: vec![escaping],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WriterError::UnsafePath { ref path, .. } if path == "../../escaped.txt"));
        assert!(!dir.path().join("escaped.txt").exists());
        assert!(!dir.path().join("ws/components/a").exists());

        let mut removing = component("components/a", true);
        removing.removed_files = vec!["/etc/hosts".into()];
        let err = writer
            .write_many(WriteRequest {
                components: vec![removing],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WriterError::UnsafePath { .. }));
    }

    #[test]
    fn test_request_concurrency_sizes_the_pool() {
        let writer = FsComponentWriter::new("/tmp/ws", 4);
        assert_eq!(writer.pool_for(&WriteRequest::default()).limit(), 4);

        let request = WriteRequest {
            concurrency: Some(2),
            ..Default::default()
        };
        assert_eq!(writer.pool_for(&request).limit(), 2);
    }
}

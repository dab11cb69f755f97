//! Content-addressed version objects.

use std::fmt;
use std::path::{Component, Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::id::ComponentId;
use crate::errors::{ModelError, StoreError};

// ---------------------------------------------------------------------------
// Ref
// ---------------------------------------------------------------------------

/// Hex-encoded SHA-256 content hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ref(String);

impl Ref {
    /// Hash raw bytes.
    pub fn of(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Parse a 64-character hex digest.
    pub fn parse(s: &str) -> Result<Self, ModelError> {
        let valid = s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit());
        if !valid {
            return Err(ModelError::InvalidRef(s.to_string()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    /// Whether a version string looks like a hash rather than a tag.
    pub fn is_hash(s: &str) -> bool {
        Self::parse(s).is_ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log output.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(9)]
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// A file of a version: workspace-relative path plus the blob hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: String,
    pub file: Ref,
}

/// Whether `path` stays inside the directory it is joined to: relative,
/// non-empty and free of `..` segments.
pub fn is_safe_relative_path(path: &str) -> bool {
    if path.is_empty() || path.contains('\\') {
        return false;
    }
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Build outcome recorded on a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Succeed,
    Failed,
    Skipped,
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Succeed => write!(f, "succeed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionLog {
    pub author: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Immutable snapshot of a component, keyed by the hash of its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub hash: Ref,
    pub parents: Vec<Ref>,
    pub files: Vec<SourceFile>,
    pub flattened_dependencies: Vec<ComponentId>,
    pub build_status: BuildStatus,
    pub deprecated: bool,
    pub removed: bool,
    pub env: Option<String>,
    pub log: VersionLog,
}

/// Everything but the hash, serialized to compute the hash.
#[derive(Serialize)]
struct HashedContent<'a> {
    parents: &'a [Ref],
    files: &'a [SourceFile],
    flattened_dependencies: &'a [ComponentId],
    build_status: BuildStatus,
    deprecated: bool,
    removed: bool,
    env: Option<&'a str>,
    log: &'a VersionLog,
}

impl Version {
    pub fn builder(author: impl Into<String>, message: impl Into<String>) -> VersionBuilder {
        VersionBuilder::new(author, message)
    }

    /// Recompute the content hash.
    pub fn compute_hash(&self) -> Result<Ref, ModelError> {
        let content = HashedContent {
            parents: &self.parents,
            files: &self.files,
            flattened_dependencies: &self.flattened_dependencies,
            build_status: self.build_status,
            deprecated: self.deprecated,
            removed: self.removed,
            env: self.env.as_deref(),
            log: &self.log,
        };
        Ok(Ref::of(&serde_json::to_vec(&content)?))
    }

    /// Check that the stored hash matches the content and that every file
    /// path is relative to the component directory.
    pub fn verify(&self) -> Result<(), StoreError> {
        let actual = self.compute_hash()?;
        if actual != self.hash {
            return Err(StoreError::HashMismatch {
                expected: self.hash.to_string(),
                actual: actual.to_string(),
            });
        }
        if let Some(file) = self.files.iter().find(|f| !is_safe_relative_path(&f.path)) {
            return Err(StoreError::UnsafePath {
                version: self.hash.to_string(),
                path: file.path.clone(),
            });
        }
        Ok(())
    }

    /// The blob hash for a file path, if the version contains it.
    pub fn file_ref(&self, path: &str) -> Option<&Ref> {
        self.files.iter().find(|f| f.path == path).map(|f| &f.file)
    }
}

/// Builder for [`Version`]; `build()` computes the hash.
#[derive(Debug, Clone)]
pub struct VersionBuilder {
    parents: Vec<Ref>,
    files: Vec<SourceFile>,
    flattened_dependencies: Vec<ComponentId>,
    build_status: BuildStatus,
    deprecated: bool,
    removed: bool,
    env: Option<String>,
    log: VersionLog,
}

impl VersionBuilder {
    pub fn new(author: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            parents: Vec::new(),
            files: Vec::new(),
            flattened_dependencies: Vec::new(),
            build_status: BuildStatus::Pending,
            deprecated: false,
            removed: false,
            env: None,
            log: VersionLog {
                author: author.into(),
                message: message.into(),
                timestamp: Utc::now(),
            },
        }
    }

    pub fn parent(mut self, parent: Ref) -> Self {
        self.parents.push(parent);
        self
    }

    pub fn file(mut self, path: impl Into<String>, file: Ref) -> Self {
        self.files.push(SourceFile {
            path: path.into(),
            file,
        });
        self
    }

    pub fn dependency(mut self, id: ComponentId) -> Self {
        self.flattened_dependencies.push(id);
        self
    }

    pub fn build_status(mut self, status: BuildStatus) -> Self {
        self.build_status = status;
        self
    }

    pub fn deprecated(mut self, deprecated: bool) -> Self {
        self.deprecated = deprecated;
        self
    }

    pub fn removed(mut self, removed: bool) -> Self {
        self.removed = removed;
        self
    }

    pub fn env(mut self, env: impl Into<String>) -> Self {
        self.env = Some(env.into());
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.log.timestamp = timestamp;
        self
    }

    pub fn build(self) -> Result<Version, ModelError> {
        let mut version = Version {
            hash: Ref::of(b""),
            parents: self.parents,
            files: self.files,
            flattened_dependencies: self.flattened_dependencies,
            build_status: self.build_status,
            deprecated: self.deprecated,
            removed: self.removed,
            env: self.env,
            log: self.log,
        };
        version.hash = version.compute_hash()?;
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_of_is_sha256_hex() {
        let r = Ref::of(b"hello");
        assert_eq!(
            r.as_str(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(r.short(), "2cf24dba5");
        assert!(Ref::is_hash(r.as_str()));
        assert!(!Ref::is_hash("1.0.0"));
    }

    #[test]
    fn test_version_hash_is_content_addressed() {
        let ts = Utc::now();
        let a = Version::builder("alice", "init")
            .file("index.ts", Ref::of(b"export {}"))
            .timestamp(ts)
            .build()
            .unwrap();
        let b = Version::builder("alice", "init")
            .file("index.ts", Ref::of(b"export {}"))
            .timestamp(ts)
            .build()
            .unwrap();
        let c = Version::builder("alice", "init")
            .file("index.ts", Ref::of(b"export const x = 1"))
            .timestamp(ts)
            .build()
            .unwrap();
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.hash, c.hash);
        a.verify().unwrap();
    }

    #[test]
    fn test_verify_detects_tampering() {
        let mut v = Version::builder("bob", "x").build().unwrap();
        v.deprecated = true;
        assert!(matches!(v.verify(), Err(StoreError::HashMismatch { .. })));
    }

    #[test]
    fn test_verify_rejects_paths_leaving_the_component() {
        for path in ["../../escaped.txt", "/etc/passwd", "lib/../../x.ts", "", "a\\..\\b"] {
            let v = Version::builder("mallory", "x")
                .file(path, Ref::of(b"x"))
                .build()
                .unwrap();
            assert!(
                matches!(v.verify(), Err(StoreError::UnsafePath { .. })),
                "accepted {path:?}"
            );
        }
        assert!(is_safe_relative_path("lib/./util.ts"));
        assert!(is_safe_relative_path(".config/settings.json"));
    }
}

//! Component identifiers.
//!
//! A [`ComponentId`] is written `scope/name[@version]`. The first path
//! segment is the scope; ids without a `/` belong to no scope (local
//! components that were never exported).

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::ModelError;

/// Version string meaning "the latest version".
pub const LATEST: &str = "latest";

fn scope_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9._-]*$").expect("valid scope regex"))
}

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9._/-]*$").expect("valid name regex"))
}

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9.+_-]*$").expect("valid version regex"))
}

/// Immutable component identifier.
///
/// Equality and hashing are structural over `(scope, name, version)`. Use
/// [`ComponentId::is_same_component`] to compare ignoring the version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ComponentId {
    scope: Option<String>,
    name: String,
    version: Option<String>,
}

impl ComponentId {
    /// Build an id from parts. A version of `latest` is normalized to `None`.
    pub fn new(
        scope: Option<&str>,
        name: &str,
        version: Option<&str>,
    ) -> Result<Self, ModelError> {
        let raw = match (scope, version) {
            (Some(s), Some(v)) => format!("{s}/{name}@{v}"),
            (Some(s), None) => format!("{s}/{name}"),
            (None, Some(v)) => format!("{name}@{v}"),
            (None, None) => name.to_string(),
        };
        Self::parse(&raw)
    }

    /// Parse `scope/name[@version]`.
    pub fn parse(raw: &str) -> Result<Self, ModelError> {
        let invalid = |detail: &str| ModelError::InvalidId {
            id: raw.to_string(),
            detail: detail.to_string(),
        };

        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty id"));
        }

        let (path, version) = match trimmed.rsplit_once('@') {
            Some((path, v)) => (path, Some(v)),
            None => (trimmed, None),
        };

        let version = match version {
            Some("") => return Err(invalid("empty version after '@'")),
            Some(LATEST) | None => None,
            Some(v) if version_regex().is_match(v) => Some(v.to_string()),
            Some(_) => return Err(invalid("version contains invalid characters")),
        };

        let (scope, name) = match path.split_once('/') {
            Some((scope, name)) => (Some(scope), name),
            None => (None, path),
        };

        if let Some(scope) = scope {
            if !scope_regex().is_match(scope) {
                return Err(invalid("scope must be lowercase alphanumerics, '.', '_' or '-'"));
            }
        }
        if !name_regex().is_match(name) {
            return Err(invalid(
                "name must be lowercase alphanumerics, '.', '_', '-' or '/'",
            ));
        }

        Ok(Self {
            scope: scope.map(str::to_string),
            name: name.to_string(),
            version,
        })
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn has_scope(&self) -> bool {
        self.scope.is_some()
    }

    pub fn has_version(&self) -> bool {
        self.version.is_some()
    }

    /// Return a copy of this id pointing at `version`.
    pub fn with_version(&self, version: impl Into<String>) -> Self {
        let version = version.into();
        Self {
            scope: self.scope.clone(),
            name: self.name.clone(),
            version: (version != LATEST).then_some(version),
        }
    }

    /// Return a copy of this id with no version.
    pub fn without_version(&self) -> Self {
        Self {
            scope: self.scope.clone(),
            name: self.name.clone(),
            version: None,
        }
    }

    /// `scope/name`, or `name` when unscoped.
    pub fn to_string_without_version(&self) -> String {
        match &self.scope {
            Some(scope) => format!("{scope}/{}", self.name),
            None => self.name.clone(),
        }
    }

    /// Whether both ids name the same component, ignoring the version.
    pub fn is_same_component(&self, other: &ComponentId) -> bool {
        self.scope == other.scope && self.name == other.name
    }

    /// Whether this id (without version) matches a wildcard pattern.
    pub fn matches(&self, pattern: &str) -> bool {
        let pattern = pattern.split('@').next().unwrap_or(pattern);
        glob_match::glob_match(pattern, &self.to_string_without_version())
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_without_version())?;
        if let Some(version) = &self.version {
            write!(f, "@{version}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ComponentId {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ComponentId {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ComponentId> for String {
    fn from(id: ComponentId) -> Self {
        id.to_string()
    }
}

// ---------------------------------------------------------------------------
// Id list helpers
// ---------------------------------------------------------------------------

/// Whether a raw id token contains wildcard characters.
pub fn has_wildcard(token: &str) -> bool {
    token.contains(['*', '?', '[', '{', '!'])
}

/// Remove duplicates, preserving the first occurrence.
pub fn uniq_ids(ids: impl IntoIterator<Item = ComponentId>) -> Vec<ComponentId> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

/// Keep one id per component; the latest version wins.
///
/// An id without version ("latest") beats any concrete version. Versions are
/// compared as dotted numbers; when they cannot be compared numerically the
/// later occurrence wins. Output order follows the first occurrence of each
/// component.
pub fn keep_latest_versions(ids: impl IntoIterator<Item = ComponentId>) -> Vec<ComponentId> {
    let mut out: Vec<ComponentId> = Vec::new();
    for id in ids {
        match out.iter_mut().find(|existing| existing.is_same_component(&id)) {
            Some(existing) => {
                if is_newer_or_incomparable(id.version(), existing.version()) {
                    *existing = id;
                }
            }
            None => out.push(id),
        }
    }
    out
}

fn is_newer_or_incomparable(candidate: Option<&str>, current: Option<&str>) -> bool {
    match (candidate, current) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(a), Some(b)) => match compare_versions(a, b) {
            Some(Ordering::Less) => false,
            Some(Ordering::Equal) => false,
            Some(Ordering::Greater) | None => true,
        },
    }
}

/// Compare two versions as dotted numbers (`1.10.0 > 1.9.3`).
///
/// Returns `None` when either side has a non-numeric segment.
pub fn compare_versions(a: &str, b: &str) -> Option<Ordering> {
    let parse = |v: &str| -> Option<Vec<u64>> {
        v.split('.').map(|part| part.parse::<u64>().ok()).collect()
    };
    let (pa, pb) = (parse(a)?, parse(b)?);
    let len = pa.len().max(pb.len());
    for i in 0..len {
        let x = pa.get(i).copied().unwrap_or(0);
        let y = pb.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return Some(other),
        }
    }
    Some(Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ComponentId {
        ComponentId::parse(s).unwrap()
    }

    #[test]
    fn test_parse_full_id() {
        let parsed = id("org/ui/button@1.2.0");
        assert_eq!(parsed.scope(), Some("org"));
        assert_eq!(parsed.name(), "ui/button");
        assert_eq!(parsed.version(), Some("1.2.0"));
        assert_eq!(parsed.to_string(), "org/ui/button@1.2.0");
    }

    #[test]
    fn test_parse_unscoped_and_latest() {
        let local = id("button");
        assert!(!local.has_scope());
        assert!(!local.has_version());

        let latest = id("org/button@latest");
        assert_eq!(latest.version(), None);
        assert_eq!(latest.to_string(), "org/button");
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(ComponentId::parse("").is_err());
        assert!(ComponentId::parse("Org/button").is_err());
        assert!(ComponentId::parse("org/button@").is_err());
        assert!(ComponentId::parse("org/bu tton").is_err());
    }

    #[test]
    fn test_same_component_ignores_version() {
        assert!(id("org/a@1").is_same_component(&id("org/a@2")));
        assert!(!id("org/a@1").is_same_component(&id("other/a@1")));
        assert_ne!(id("org/a@1"), id("org/a@2"));
    }

    #[test]
    fn test_wildcard_matching() {
        assert!(has_wildcard("org/ui/*"));
        assert!(!has_wildcard("org/ui/button"));
        assert!(id("org/ui/button@1").matches("org/ui/*"));
        assert!(!id("org/core/button").matches("org/ui/*"));
        assert!(id("org/ui/forms/input").matches("org/ui/**"));
    }

    #[test]
    fn test_uniq_ids_preserves_first_occurrence() {
        let ids = uniq_ids(vec![id("org/b"), id("org/a"), id("org/b")]);
        assert_eq!(ids, vec![id("org/b"), id("org/a")]);
    }

    #[test]
    fn test_keep_latest_versions() {
        let ids = keep_latest_versions(vec![
            id("org/a@1.9.0"),
            id("org/b@2"),
            id("org/a@1.10.0"),
            id("org/a@1.2.0"),
        ]);
        assert_eq!(ids, vec![id("org/a@1.10.0"), id("org/b@2")]);
    }

    #[test]
    fn test_keep_latest_versions_incomparable_later_wins() {
        let ids = keep_latest_versions(vec![id("org/a@abc"), id("org/a@def")]);
        assert_eq!(ids, vec![id("org/a@def")]);

        let ids = keep_latest_versions(vec![id("org/a"), id("org/a@3")]);
        assert_eq!(ids, vec![id("org/a")]);
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&id("org/a@1")).unwrap();
        assert_eq!(json, "\"org/a@1\"");
        let back: ComponentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id("org/a@1"));
    }
}

//! Per-component version index.

use serde::{Deserialize, Serialize};

use super::id::ComponentId;
use super::version::Ref;
use crate::errors::ModelError;

/// A released version name pointing at a version hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub version: String,
    pub hash: Ref,
}

/// Index of one component: its tags, trunk heads and deprecation flag.
///
/// `head` is the local trunk head; `remote_head` is the last trunk head seen
/// on the component's remote scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelComponent {
    pub scope: Option<String>,
    pub name: String,
    #[serde(default)]
    pub tags: Vec<Tag>,
    pub head: Option<Ref>,
    #[serde(default)]
    pub remote_head: Option<Ref>,
    #[serde(default)]
    pub deprecated: bool,
}

impl ModelComponent {
    pub fn new(id: &ComponentId) -> Self {
        Self {
            scope: id.scope().map(str::to_string),
            name: id.name().to_string(),
            tags: Vec::new(),
            head: None,
            remote_head: None,
            deprecated: false,
        }
    }

    /// The component id, without version.
    pub fn id(&self) -> Result<ComponentId, ModelError> {
        ComponentId::new(self.scope.as_deref(), &self.name, None)
    }

    pub fn has_head(&self) -> bool {
        self.head.is_some()
    }

    /// Hash a tag points at.
    pub fn tag_ref(&self, version: &str) -> Option<&Ref> {
        self.tags.iter().find(|t| t.version == version).map(|t| &t.hash)
    }

    /// Tag name of a hash, if it was tagged.
    pub fn tag_of(&self, hash: &Ref) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| &t.hash == hash)
            .map(|t| t.version.as_str())
    }

    /// Most recently added tag.
    pub fn latest_tag(&self) -> Option<&Tag> {
        self.tags.last()
    }

    /// Append a tag unless it already exists. Existing tags are never
    /// rewritten. Returns whether the tag was added.
    pub fn add_tag(&mut self, version: impl Into<String>, hash: Ref) -> bool {
        let version = version.into();
        if self.tag_ref(&version).is_some() {
            return false;
        }
        self.tags.push(Tag { version, hash });
        true
    }

    /// Tags in order, plus the head hash when the head is untagged.
    pub fn list_versions(&self) -> Vec<String> {
        let mut versions: Vec<String> = self.tags.iter().map(|t| t.version.clone()).collect();
        if let Some(head) = &self.head {
            if self.tag_of(head).is_none() {
                versions.push(head.to_string());
            }
        }
        versions
    }

    /// The head's tag when `prefer_tag` is set and the head is tagged, else
    /// the head hash. Without a head, falls back to the latest tag.
    pub fn head_regardless_of_lane_as_tag_or_hash(&self, prefer_tag: bool) -> Option<String> {
        match &self.head {
            Some(head) => {
                let tag = if prefer_tag { self.tag_of(head) } else { None };
                Some(tag.map(str::to_string).unwrap_or_else(|| head.to_string()))
            }
            None => self.latest_tag().map(|t| t.version.clone()),
        }
    }

    /// Resolve a version string (tag or hash) to a ref known to this index.
    pub fn ref_for(&self, version: &str) -> Option<Ref> {
        if let Some(hash) = self.tag_ref(version) {
            return Some(hash.clone());
        }
        Ref::parse(version).ok()
    }
}

//! Lanes: named, mutable sets of component heads.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::ComponentId;
use super::version::Ref;
use crate::errors::ModelError;

/// Lane identifier, written `scope/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LaneId {
    pub scope: String,
    pub name: String,
}

impl LaneId {
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ModelError> {
        match raw.trim().split_once('/') {
            Some((scope, name)) if !scope.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(scope, name))
            }
            _ => Err(ModelError::InvalidLaneId(raw.to_string())),
        }
    }
}

impl fmt::Display for LaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.name)
    }
}

impl TryFrom<String> for LaneId {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<LaneId> for String {
    fn from(id: LaneId) -> Self {
        id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneLog {
    pub author: String,
    pub email: String,
    pub timestamp: DateTime<Utc>,
}

/// One component entry on a lane. `id` carries no version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneComponent {
    pub id: ComponentId,
    pub head: Ref,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lane {
    pub id: LaneId,
    #[serde(default)]
    pub is_new: bool,
    pub forked_from: Option<LaneId>,
    pub log: LaneLog,
    #[serde(default)]
    pub components: Vec<LaneComponent>,
}

impl Lane {
    pub fn new(id: LaneId, author: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id,
            is_new: true,
            forked_from: None,
            log: LaneLog {
                author: author.into(),
                email: email.into(),
                timestamp: Utc::now(),
            },
            components: Vec::new(),
        }
    }

    /// Set the head of a component; the last write for a component wins and
    /// keeps its original position. Returns whether the lane changed.
    pub fn add_component(&mut self, id: &ComponentId, head: Ref) -> bool {
        match self.components.iter_mut().find(|c| c.id.is_same_component(id)) {
            Some(existing) if existing.head == head => false,
            Some(existing) => {
                existing.head = head;
                true
            }
            None => {
                self.components.push(LaneComponent {
                    id: id.without_version(),
                    head,
                });
                true
            }
        }
    }

    pub fn get_component_head(&self, id: &ComponentId) -> Option<&Ref> {
        self.components
            .iter()
            .find(|c| c.id.is_same_component(id))
            .map(|c| &c.head)
    }

    pub fn has_component(&self, id: &ComponentId) -> bool {
        self.get_component_head(id).is_some()
    }

    /// Component ids with the lane head as version.
    pub fn component_ids(&self) -> Vec<ComponentId> {
        self.components
            .iter()
            .map(|c| c.id.with_version(c.head.to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lane() -> Lane {
        Lane::new(LaneId::new("org", "feature-x"), "alice", "alice@example.com")
    }

    #[test]
    fn test_lane_id_parse() {
        let id = LaneId::parse("org/feature-x").unwrap();
        assert_eq!(id.scope, "org");
        assert_eq!(id.to_string(), "org/feature-x");
        assert!(LaneId::parse("feature-x").is_err());
        assert!(LaneId::parse("org/a/b").is_err());
    }

    #[test]
    fn test_add_component_last_writer_wins() {
        let mut l = lane();
        let a = ComponentId::parse("org/a@1.0.0").unwrap();
        let b = ComponentId::parse("org/b").unwrap();
        assert!(l.add_component(&a, Ref::of(b"1")));
        assert!(l.add_component(&b, Ref::of(b"b")));
        assert!(l.add_component(&a, Ref::of(b"2")));
        assert!(!l.add_component(&a, Ref::of(b"2")));

        assert_eq!(l.components.len(), 2);
        assert_eq!(l.components[0].id.to_string(), "org/a");
        assert_eq!(l.get_component_head(&a), Some(&Ref::of(b"2")));
    }

    #[test]
    fn test_component_ids_carry_head() {
        let mut l = lane();
        let a = ComponentId::parse("org/a").unwrap();
        l.add_component(&a, Ref::of(b"1"));
        let ids = l.component_ids();
        assert_eq!(ids[0].version(), Some(Ref::of(b"1").as_str()));
    }
}

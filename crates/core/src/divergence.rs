//! History divergence between a local head and a remote head.
//!
//! Walks parent links through a [`VersionSource`]; no network access. The
//! remote walk stops as soon as it reaches local history, so only the snaps
//! after the common ancestor are visited on the remote side.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::StoreError;
use crate::objects::Ref;

/// Anything that can resolve the parents of a version hash.
pub trait VersionSource {
    /// Parents of `hash`. A version that cannot be located is a
    /// `StoreError::NotFound`.
    fn parents_of(&self, hash: &Ref) -> Result<Vec<Ref>, StoreError>;
}

/// Result of comparing two heads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DivergeData {
    pub common_ancestor: Option<Ref>,
    /// Snaps reachable from the local head only, newest first.
    pub snaps_on_source_only: Vec<Ref>,
    /// Snaps reachable from the remote head only, newest first.
    pub snaps_on_target_only: Vec<Ref>,
}

impl DivergeData {
    pub fn is_diverged(&self) -> bool {
        !self.snaps_on_source_only.is_empty() && !self.snaps_on_target_only.is_empty()
    }

    /// Remote has snaps the local side lacks, and nothing is local-only.
    pub fn is_target_ahead(&self) -> bool {
        !self.snaps_on_target_only.is_empty() && self.snaps_on_source_only.is_empty()
    }

    pub fn is_source_ahead(&self) -> bool {
        !self.snaps_on_source_only.is_empty() && self.snaps_on_target_only.is_empty()
    }

    pub fn is_up_to_date(&self) -> bool {
        self.snaps_on_source_only.is_empty() && self.snaps_on_target_only.is_empty()
    }
}

/// A diverged component as reported to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivergedComponent {
    pub id: String,
    pub snaps_local: usize,
    pub snaps_remote: usize,
}

struct ParentCache<'a, S: ?Sized> {
    source: &'a S,
    parents: HashMap<Ref, Vec<Ref>>,
}

impl<'a, S: VersionSource + ?Sized> ParentCache<'a, S> {
    fn parents(&mut self, hash: &Ref) -> Result<Vec<Ref>, StoreError> {
        if let Some(parents) = self.parents.get(hash) {
            return Ok(parents.clone());
        }
        let parents = self.source.parents_of(hash)?;
        self.parents.insert(hash.clone(), parents.clone());
        Ok(parents)
    }

    /// Breadth-first walk from `starts`, returning every reachable snap in
    /// visit order. `stop` nodes are neither returned nor expanded.
    fn walk(&mut self, starts: &[Ref], stop: &HashSet<Ref>) -> Result<Vec<Ref>, StoreError> {
        let mut seen: HashSet<Ref> = HashSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<Ref> = starts.iter().cloned().collect();
        while let Some(hash) = queue.pop_front() {
            if stop.contains(&hash) || !seen.insert(hash.clone()) {
                continue;
            }
            for parent in self.parents(&hash)? {
                queue.push_back(parent);
            }
            order.push(hash);
        }
        Ok(order)
    }
}

/// Compare `local_head` (source) with `remote_head` (target).
pub fn compute_divergence<S: VersionSource + ?Sized>(
    source: &S,
    local_head: Option<&Ref>,
    remote_head: Option<&Ref>,
) -> Result<DivergeData, StoreError> {
    let mut cache = ParentCache {
        source,
        parents: HashMap::new(),
    };
    let none = HashSet::new();

    let (local, remote) = match (local_head, remote_head) {
        (None, None) => return Ok(DivergeData::default()),
        (Some(local), None) => {
            return Ok(DivergeData {
                common_ancestor: None,
                snaps_on_source_only: cache.walk(std::slice::from_ref(local), &none)?,
                snaps_on_target_only: Vec::new(),
            })
        }
        (None, Some(remote)) => {
            return Ok(DivergeData {
                common_ancestor: None,
                snaps_on_source_only: Vec::new(),
                snaps_on_target_only: cache.walk(std::slice::from_ref(remote), &none)?,
            })
        }
        (Some(local), Some(remote)) => (local, remote),
    };

    let local_history = cache.walk(std::slice::from_ref(local), &none)?;
    let local_set: HashSet<Ref> = local_history.iter().cloned().collect();

    // Walk the remote side until local history is reached.
    let mut target_only = Vec::new();
    let mut frontier: Vec<Ref> = Vec::new();
    let mut seen: HashSet<Ref> = HashSet::new();
    let mut queue: VecDeque<Ref> = VecDeque::from([remote.clone()]);
    while let Some(hash) = queue.pop_front() {
        if !seen.insert(hash.clone()) {
            continue;
        }
        if local_set.contains(&hash) {
            frontier.push(hash);
            continue;
        }
        for parent in cache.parents(&hash)? {
            queue.push_back(parent);
        }
        target_only.push(hash);
    }

    let shared: HashSet<Ref> = cache.walk(&frontier, &none)?.into_iter().collect();
    let source_only: Vec<Ref> = local_history
        .into_iter()
        .filter(|h| !shared.contains(h))
        .collect();

    let data = DivergeData {
        common_ancestor: frontier.first().cloned(),
        snaps_on_source_only: source_only,
        snaps_on_target_only: target_only,
    };
    debug!(
        local = %local.short(),
        remote = %remote.short(),
        source_only = data.snaps_on_source_only.len(),
        target_only = data.snaps_on_target_only.len(),
        "computed divergence"
    );
    Ok(data)
}

//! Lane reconciliation: divergence of lane heads, merging incoming lanes,
//! the lane-membership guard and lane heads after a write.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::divergence::{compute_divergence, DivergeData};
use crate::errors::ImportError;
use crate::objects::{ComponentId, Lane, LaneId, Ref};
use crate::scope::LocalScope;
use crate::workspace::SharedMapping;

pub struct LaneReconciler {
    scope: Arc<LocalScope>,
    mapping: SharedMapping,
}

impl LaneReconciler {
    pub fn new(scope: Arc<LocalScope>, mapping: SharedMapping) -> Self {
        Self { scope, mapping }
    }

    /// Compare the local and incoming head of every component the two
    /// copies of a lane share. Heads whose history is not fully local are
    /// skipped.
    pub fn diverged_heads(&self, incoming: &[Lane]) -> Result<Vec<(ComponentId, DivergeData)>, ImportError> {
        let mut diverged = Vec::new();
        for lane in incoming {
            let Some(local) = self.scope.get_lane(&lane.id)? else {
                continue;
            };
            for entry in &lane.components {
                let Some(local_head) = local.get_component_head(&entry.id) else {
                    continue;
                };
                if local_head == &entry.head {
                    continue;
                }
                if let Some(data) = self.compare_heads(local_head, &entry.head)? {
                    if data.is_diverged() {
                        debug!(lane = %lane.id, id = %entry.id, "lane heads have diverged");
                        diverged.push((entry.id.with_version(entry.head.as_str()), data));
                    }
                }
            }
        }
        Ok(diverged)
    }

    /// Merge each incoming lane into the local lane of the same id, creating
    /// it when absent. An incoming head replaces the local one only when it
    /// is a fast-forward or its history is not local; a local head that is
    /// ahead or has diverged stays. Returns the merged lanes in input order.
    pub fn merge_lanes(&self, incoming: &[Lane]) -> Result<Vec<Lane>, ImportError> {
        let mut merged = Vec::with_capacity(incoming.len());
        for lane in incoming {
            let local = match self.scope.get_lane(&lane.id)? {
                Some(mut local) => {
                    let (mut changed, mut kept) = (0, 0);
                    for entry in &lane.components {
                        if self.keeps_local_head(&local, &entry.id, &entry.head)? {
                            kept += 1;
                            continue;
                        }
                        if local.add_component(&entry.id, entry.head.clone()) {
                            changed += 1;
                        }
                    }
                    debug!(lane = %lane.id, changed, kept, "merged incoming lane");
                    local
                }
                None => {
                    debug!(lane = %lane.id, components = lane.components.len(), "saving new lane");
                    lane.clone()
                }
            };
            self.scope.save_lane(&local)?;
            merged.push(local);
        }
        if !merged.is_empty() {
            info!(count = merged.len(), "merged session lanes");
        }
        Ok(merged)
    }

    fn keeps_local_head(&self, local: &Lane, id: &ComponentId, incoming: &Ref) -> Result<bool, ImportError> {
        match local.get_component_head(id) {
            Some(head) if head != incoming => Ok(self
                .compare_heads(head, incoming)?
                .is_some_and(|data| !data.snaps_on_source_only.is_empty())),
            _ => Ok(false),
        }
    }

    fn compare_heads(&self, local: &Ref, incoming: &Ref) -> Result<Option<DivergeData>, ImportError> {
        match compute_divergence(self.scope.as_ref(), Some(local), Some(incoming)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.is_not_found() => {
                debug!(local = %local.short(), incoming = %incoming.short(), "lane head history is not local");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Every id must be reachable from the active lane, one of the session
    /// lanes, or trunk. All offenders are reported together.
    pub fn verify_membership(
        &self,
        ids: &[ComponentId],
        active_lane: Option<&Lane>,
        session_lanes: &[Lane],
    ) -> Result<(), ImportError> {
        let mut offenders = Vec::new();
        for id in ids {
            if !self.is_member(id, active_lane, session_lanes)? {
                offenders.push(id.to_string());
            }
        }
        if offenders.is_empty() {
            return Ok(());
        }
        warn!(count = offenders.len(), "components belong to other lanes");
        Err(ImportError::ComponentsFromAnotherLane { ids: offenders })
    }

    fn is_member(&self, id: &ComponentId, active_lane: Option<&Lane>, session_lanes: &[Lane]) -> Result<bool, ImportError> {
        if let Some(lane) = active_lane {
            if self.scope.is_part_of_lane_history(id, lane)? {
                return Ok(true);
            }
        }
        for lane in session_lanes {
            if self.scope.is_part_of_lane_history(id, lane)? {
                return Ok(true);
            }
        }
        Ok(self.scope.is_part_of_main_history(id)?)
    }

    /// Record written components on the active lane. Components that exist
    /// on a session lane, or all of them with `save_in_lane`, get the written
    /// version as their lane head; the rest are trunk components and are
    /// marked as not lane-only in the mapping.
    pub async fn save_lane_data(
        &self,
        written: &[(ComponentId, Ref)],
        active_lane: Option<&LaneId>,
        session_lanes: &[Lane],
        save_in_lane: bool,
    ) -> Result<Option<Lane>, ImportError> {
        let Some(lane_id) = active_lane else {
            return Ok(None);
        };
        let Some(mut lane) = self.scope.get_lane(lane_id)? else {
            warn!(lane = %lane_id, "active lane is not in the local scope, skipping lane update");
            return Ok(None);
        };

        let mut added = 0;
        {
            let mut mapping = self.mapping.lock().await;
            for (id, head) in written {
                let on_session_lane = session_lanes.iter().any(|l| l.has_component(id));
                if !on_session_lane && !save_in_lane {
                    mapping.set_lane_only(id, false);
                    continue;
                }
                if lane.add_component(id, head.clone()) {
                    added += 1;
                }
            }
        }

        self.scope.save_lane(&lane)?;
        debug!(lane = %lane.id, added, "saved lane data");
        Ok(Some(lane))
    }
}

//! [`WaypointSequencer`] – mission plan plus progress pointer.
//!
//! The index only moves forward, one waypoint per [`advance`] call.
//! [`reset_to_current`] keeps the index and forgets that the current waypoint
//! was sent, so the controller sends the same waypoint again after an
//! avoidance hold.
//!
//! [`advance`]: WaypointSequencer::advance
//! [`reset_to_current`]: WaypointSequencer::reset_to_current

use rescuelink_types::{MissionPlan, Waypoint};

#[derive(Debug, Clone)]
pub struct WaypointSequencer {
    plan: MissionPlan,
    current_index: usize,
    dispatched: bool,
}

impl WaypointSequencer {
    pub fn new(plan: MissionPlan) -> Self {
        Self {
            plan,
            current_index: 0,
            dispatched: false,
        }
    }

    /// The waypoint being flown to, or `None` once the plan is complete.
    pub fn current(&self) -> Option<&Waypoint> {
        self.plan.get(self.current_index)
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    /// Move to the next waypoint and return it.  Returns `None` when the
    /// plan is (or becomes) complete.
    pub fn advance(&mut self) -> Option<Waypoint> {
        if self.is_complete() {
            return None;
        }
        self.current_index += 1;
        self.dispatched = false;
        self.current().copied()
    }

    pub fn reset_to_current(&mut self) {
        self.dispatched = false;
    }

    /// Record that the current waypoint was acknowledged by the link.
    pub fn mark_dispatched(&mut self) {
        self.dispatched = true;
    }

    pub fn is_dispatched(&self) -> bool {
        self.dispatched
    }

    pub fn is_complete(&self) -> bool {
        self.current_index >= self.plan.len()
    }

    pub fn len(&self) -> usize {
        self.plan.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plan.is_empty()
    }

    pub fn plan(&self) -> &MissionPlan {
        &self.plan
    }
}

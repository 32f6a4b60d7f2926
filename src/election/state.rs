// Election state - the controller's authoritative view of leadership

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Mutable leadership state, owned by the election controller.
///
/// Only the election loop writes it; everything else reads snapshots.
#[derive(Debug, Clone, Default)]
pub(crate) struct ElectionState {
    pub running: bool,
    pub is_leader: bool,
    pub current_leader: Option<String>,
    pub last_transition_time: Option<DateTime<Utc>>,
    pub leadership_changes: u64,
    pub acquisition_errors: u64,
    pub renewal_errors: u64,
}

/// What changed when an election round was applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Transition {
    pub became_leader: bool,
    pub lost_leadership: bool,
    pub leader_changed: bool,
}

impl ElectionState {
    /// Apply the outcome of a successful round.
    pub fn observe(
        &mut self,
        is_leader: bool,
        current_leader: Option<String>,
        now: DateTime<Utc>,
    ) -> Transition {
        let was_leader = self.is_leader;
        let leader_changed = self.current_leader != current_leader;

        self.is_leader = is_leader;
        self.current_leader = current_leader;
        if was_leader != is_leader {
            self.record_transition(now);
        }

        Transition {
            became_leader: !was_leader && is_leader,
            lost_leadership: was_leader && !is_leader,
            leader_changed,
        }
    }

    /// A failed round counts against `acquisition_errors` while leading and
    /// `renewal_errors` otherwise.
    pub fn record_attempt_error(&mut self) {
        if self.is_leader {
            self.acquisition_errors += 1;
        } else {
            self.renewal_errors += 1;
        }
    }

    /// Drop local leadership. Returns whether we were leading.
    ///
    /// The last known leader was us, which is no longer trustworthy, so
    /// the leader becomes unknown until the next successful round.
    pub fn step_down(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_leader {
            return false;
        }
        self.is_leader = false;
        self.current_leader = None;
        self.record_transition(now);
        true
    }

    pub fn metrics(&self) -> ElectionMetrics {
        ElectionMetrics {
            running: self.running,
            is_leader: self.is_leader,
            current_leader: self.current_leader.clone(),
            leadership_changes: self.leadership_changes,
            acquisition_errors: self.acquisition_errors,
            renewal_errors: self.renewal_errors,
            last_transition_time: self.last_transition_time,
        }
    }

    fn record_transition(&mut self, now: DateTime<Utc>) {
        self.leadership_changes += 1;
        self.last_transition_time = Some(now);
    }
}

/// Read-only snapshot of the election state for health and readiness
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionMetrics {
    pub running: bool,
    pub is_leader: bool,
    pub current_leader: Option<String>,
    pub leadership_changes: u64,
    pub acquisition_errors: u64,
    pub renewal_errors: u64,
    pub last_transition_time: Option<DateTime<Utc>>,
}

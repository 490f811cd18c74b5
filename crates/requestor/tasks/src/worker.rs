//! Worker slot lifecycle

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of one worker slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerState {
    /// No activity bound
    Unbound,
    NegotiatingAgreement,
    PreparingActivity,
    /// Activity ready, waiting for a task
    Idle,
    /// Executing a task
    Running,
    /// Tearing the activity down
    Stopping,
}

impl WorkerState {
    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Unbound, NegotiatingAgreement)
                | (Unbound, PreparingActivity)
                | (Unbound, Idle)
                | (NegotiatingAgreement, PreparingActivity)
                | (NegotiatingAgreement, Unbound)
                | (PreparingActivity, Idle)
                | (PreparingActivity, Unbound)
                | (Idle, Running)
                | (Running, Idle)
                | (Idle, Stopping)
                | (Running, Stopping)
                | (Stopping, Unbound)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Unbound => "unbound",
            WorkerState::NegotiatingAgreement => "negotiating",
            WorkerState::PreparingActivity => "preparing",
            WorkerState::Idle => "idle",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts consecutive task failures of one activity
#[derive(Debug, Clone)]
pub struct FailureTracker {
    threshold: u32,
    consecutive: u32,
}

impl FailureTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Returns true once the activity failed `threshold` times in a row.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= self.threshold
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Slot state with transition checking
#[derive(Debug)]
pub struct WorkerSlot {
    index: usize,
    state: WorkerState,
}

impl WorkerSlot {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            state: WorkerState::Unbound,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Move to `next`; invalid transitions are refused and logged.
    pub fn transition(&mut self, next: WorkerState) -> bool {
        if self.state == next {
            return true;
        }
        if !self.state.can_transition_to(next) {
            tracing::warn!(worker = self.index, from = %self.state, to = %next, "Invalid worker transition");
            return false;
        }
        tracing::debug!(worker = self.index, from = %self.state, to = %next, "Worker state changed");
        self.state = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_cycle() {
        let mut slot = WorkerSlot::new(0);
        for next in [
            WorkerState::NegotiatingAgreement,
            WorkerState::PreparingActivity,
            WorkerState::Idle,
            WorkerState::Running,
            WorkerState::Idle,
            WorkerState::Stopping,
            WorkerState::Unbound,
        ] {
            assert!(slot.transition(next), "to {}", next);
        }
        assert!(!slot.transition(WorkerState::Running));
        assert_eq!(slot.state(), WorkerState::Unbound);
    }

    #[test]
    fn test_failure_threshold() {
        let mut tracker = FailureTracker::new(3);
        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());
        tracker.record_success();
        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());
        assert!(tracker.record_failure());
        assert_eq!(tracker.consecutive(), 3);
    }
}

//! Loop prevention for routing decisions.
//!
//! Naive role-based routing can oscillate indefinitely when a stage's output
//! is ambiguous. The guard counts repeated identical `(stage, status)`
//! routing decisions and forces termination past a threshold.

use cadence_types::{RoutingEntry, StageKind, WorkflowState};

/// Watches `routing_history` for repeated identical decisions.
#[derive(Debug, Clone)]
pub struct CycleGuard {
    loop_threshold: usize,
}

impl CycleGuard {
    pub fn new(loop_threshold: usize) -> Self {
        Self { loop_threshold }
    }

    /// Append the candidate `(stage, current status)` pair to the history.
    /// Returns the occurrence count once the pair has recurred
    /// `loop_threshold` or more times, `None` otherwise.
    ///
    /// Pairs recorded while the task is paused in `HumanReview` never count:
    /// re-checking a held gate is an external resume, not a routing loop.
    pub fn record(&self, state: &mut WorkflowState, stage: StageKind) -> Option<usize> {
        let entry = RoutingEntry {
            stage,
            status: state.status,
        };
        state.routing_history.push(entry);

        if entry.status.is_paused() {
            return None;
        }
        let occurrences = state
            .routing_history
            .iter()
            .filter(|e| **e == entry)
            .count();
        (occurrences >= self.loop_threshold).then_some(occurrences)
    }

    pub fn loop_threshold(&self) -> usize {
        self.loop_threshold
    }
}

impl Default for CycleGuard {
    fn default() -> Self {
        Self::new(3)
    }
}

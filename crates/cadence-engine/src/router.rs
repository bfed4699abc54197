//! Status- and role-based routing.
//!
//! Given the current state, decides the next stage to run. Status-based
//! routes take priority; the remaining statuses route by the task-type
//! discriminator. The embedded cycle guard can override any decision to
//! terminate when the same decision keeps recurring.

use cadence_types::{CadenceError, ErrorInfo, StageKind, TaskStatus, WorkflowState};

use crate::cycle::CycleGuard;

/// A routing decision for the next driver step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Run(StageKind),
    Terminate,
}

/// Chooses the next stage for a task.
pub struct Router {
    guard: CycleGuard,
}

impl Router {
    pub fn new() -> Self {
        Self {
            guard: CycleGuard::default(),
        }
    }

    pub fn with_loop_threshold(threshold: usize) -> Self {
        Self {
            guard: CycleGuard::new(threshold),
        }
    }

    /// Decide the next stage for `state`.
    ///
    /// On a detected loop, marks the state blocked and returns `Terminate`;
    /// the caller must not run any further stages.
    pub fn next(&self, state: &mut WorkflowState) -> RouteDecision {
        let candidate = match state.status {
            // Deterministic status-based routes.
            TaskStatus::QaPending => StageKind::Qa,
            TaskStatus::Documentation => StageKind::Documentation,
            TaskStatus::HumanReview => StageKind::Checkpoint,
            TaskStatus::Done | TaskStatus::Blocked => return RouteDecision::Terminate,
            // Role-and-task-type routes.
            TaskStatus::Created => StageKind::Coordinator,
            TaskStatus::Planned | TaskStatus::InProgress => {
                implementation_kind(&state.task_id)
            }
        };

        if let Some(occurrences) = self.guard.record(state, candidate) {
            let err = CadenceError::LoopDetected {
                stage: candidate,
                occurrences,
            };
            tracing::warn!(task = %state.task_id, stage = %candidate, "Routing loop detected");
            state.block(ErrorInfo::from_error(&err, Some(candidate)));
            return RouteDecision::Terminate;
        }

        RouteDecision::Run(candidate)
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Task-type discriminator: the task-id prefix selects the implementation
/// stage (`BE-` backend, `FE-` frontend, anything else technical).
pub fn implementation_kind(task_id: &str) -> StageKind {
    let upper = task_id.to_ascii_uppercase();
    if upper.starts_with("BE-") {
        StageKind::Backend
    } else if upper.starts_with("FE-") {
        StageKind::Frontend
    } else {
        StageKind::Technical
    }
}

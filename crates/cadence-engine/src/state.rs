//! Lifecycle transition table.
//!
//! Pure data: maps `(current status, stage kind)` to the next status, with a
//! per-kind wildcard default. No behavior beyond lookup.

use std::collections::HashMap;

use cadence_types::{StageKind, TaskStatus};

/// Immutable mapping from `(current_status, stage_kind)` to the next status.
///
/// Built once at startup. Lookup order in [`next_status`](Self::next_status):
/// exact entry, then the per-kind default, then the current status unchanged.
/// New states are never invented by a miss.
#[derive(Debug, Clone)]
pub struct TransitionTable {
    entries: HashMap<(TaskStatus, StageKind), TaskStatus>,
    defaults: HashMap<StageKind, TaskStatus>,
}

impl TransitionTable {
    /// An empty table: every successful transition leaves the status unchanged.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            defaults: HashMap::new(),
        }
    }

    /// The standard lifecycle: coordinator plans, an implementation stage
    /// moves work to QA, QA hands off to documentation, documentation closes.
    pub fn standard() -> Self {
        let mut table = Self::new();
        table.insert(TaskStatus::Created, StageKind::Coordinator, TaskStatus::Planned);
        for kind in [StageKind::Backend, StageKind::Frontend, StageKind::Technical] {
            table.insert(TaskStatus::Planned, kind, TaskStatus::QaPending);
            table.insert(TaskStatus::InProgress, kind, TaskStatus::QaPending);
            table.set_default(kind, TaskStatus::QaPending);
        }
        table.insert(TaskStatus::QaPending, StageKind::Qa, TaskStatus::Documentation);
        table.insert(
            TaskStatus::Documentation,
            StageKind::Documentation,
            TaskStatus::Done,
        );
        table.set_default(StageKind::Coordinator, TaskStatus::Planned);
        table.set_default(StageKind::Qa, TaskStatus::Documentation);
        table.set_default(StageKind::Documentation, TaskStatus::Done);
        table
    }

    /// Add an exact `(from, kind) -> to` entry.
    pub fn insert(&mut self, from: TaskStatus, kind: StageKind, to: TaskStatus) {
        self.entries.insert((from, kind), to);
    }

    /// Set the wildcard default for a stage kind.
    pub fn set_default(&mut self, kind: StageKind, to: TaskStatus) {
        self.defaults.insert(kind, to);
    }

    /// Resolve the status after a stage of `kind` ran against `current`.
    ///
    /// An unsuccessful stage always resolves to [`TaskStatus::Blocked`].
    pub fn next_status(&self, current: TaskStatus, kind: StageKind, success: bool) -> TaskStatus {
        if !success {
            return TaskStatus::Blocked;
        }
        if let Some(next) = self.entries.get(&(current, kind)) {
            return *next;
        }
        if let Some(next) = self.defaults.get(&kind) {
            return *next;
        }
        current
    }

    /// True only for the absorbing states `Done` and `Blocked`.
    pub fn is_terminal(&self, status: TaskStatus) -> bool {
        status.is_terminal()
    }
}

impl Default for TransitionTable {
    fn default() -> Self {
        Self::standard()
    }
}

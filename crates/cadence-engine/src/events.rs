//! Workflow event stream for observability.
//!
//! Emits [`WorkflowEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (loggers, dashboards, reporting) can follow execution
//! progress without coupling to the driver internals.

use serde::{Deserialize, Serialize};

use cadence_types::{StageKind, TaskStatus};

/// Events emitted while a task moves through its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkflowEvent {
    TaskStarted {
        task_id: String,
    },
    StageStarted {
        task_id: String,
        stage: StageKind,
        attempt: u32,
    },
    StageCompleted {
        task_id: String,
        stage: StageKind,
        status: TaskStatus,
        duration_ms: u64,
    },
    StageFailed {
        task_id: String,
        stage: StageKind,
        error: String,
    },
    StageRetrying {
        task_id: String,
        stage: StageKind,
        attempt: u32,
    },
    StatusChanged {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    CheckpointHeld {
        task_id: String,
        review_id: String,
    },
    CheckpointResolved {
        task_id: String,
        review_id: String,
    },
    TaskBlocked {
        task_id: String,
        reason: String,
    },
    TaskCompleted {
        task_id: String,
        iterations: u32,
    },
    EscalationRaised {
        task_id: String,
        reason: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<WorkflowEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_sends_and_receives() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(WorkflowEvent::TaskStarted {
            task_id: "t1".into(),
        });

        match rx.recv().await.unwrap() {
            WorkflowEvent::TaskStarted { task_id } => assert_eq!(task_id, "t1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::new(16);
        emitter.emit(WorkflowEvent::TaskBlocked {
            task_id: "t1".into(),
            reason: "loop detected".into(),
        });
    }

    #[test]
    fn event_serialization_round_trip() {
        let event = WorkflowEvent::StageCompleted {
            task_id: "t1".into(),
            stage: StageKind::Qa,
            status: TaskStatus::Documentation,
            duration_ms: 42,
        };
        let json = serde_json::to_string(&event).unwrap();
        let restored: WorkflowEvent = serde_json::from_str(&json).unwrap();
        match restored {
            WorkflowEvent::StageCompleted {
                stage, duration_ms, ..
            } => {
                assert_eq!(stage, StageKind::Qa);
                assert_eq!(duration_ms, 42);
            }
            other => panic!("unexpected variant after round-trip: {other:?}"),
        }
    }
}

//! Escalation hand-off to an external policy engine.
//!
//! The engine only produces [`EscalationEvent`]s; escalation levels,
//! notification channels, and policy lookup live outside this crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use cadence_types::{Result, StageKind};

/// Why a task is being handed off for higher-level attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    StageTimeout,
    LoopDetected,
    RepeatedRejection,
    ReviewOverdue,
}

/// A single escalation hand-off record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationEvent {
    pub id: uuid::Uuid,
    pub task_id: String,
    pub stage: Option<StageKind>,
    pub reason: EscalationReason,
    pub raised_at: chrono::DateTime<chrono::Utc>,
}

impl EscalationEvent {
    pub fn new(task_id: impl Into<String>, stage: Option<StageKind>, reason: EscalationReason) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            task_id: task_id.into(),
            stage,
            reason,
            raised_at: chrono::Utc::now(),
        }
    }
}

/// Consumer of escalation events.
#[async_trait]
pub trait EscalationSink: Send + Sync {
    async fn raise(&self, event: EscalationEvent) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Built-in sinks
// ---------------------------------------------------------------------------

/// Sink that only logs the escalation. The default when no external policy
/// engine is wired up.
pub struct LogEscalationSink;

#[async_trait]
impl EscalationSink for LogEscalationSink {
    async fn raise(&self, event: EscalationEvent) -> Result<()> {
        tracing::warn!(
            task = %event.task_id,
            reason = ?event.reason,
            stage = ?event.stage,
            "Task escalated"
        );
        Ok(())
    }
}

/// Records raised events in memory for test inspection.
pub struct RecordingEscalationSink {
    events: std::sync::Mutex<Vec<EscalationEvent>>,
}

impl RecordingEscalationSink {
    pub fn new() -> Self {
        Self {
            events: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<EscalationEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Default for RecordingEscalationSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EscalationSink for RecordingEscalationSink {
    async fn raise(&self, event: EscalationEvent) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

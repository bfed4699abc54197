//! Shared types, errors, and workflow state for the Cadence engine.
//!
//! This crate provides the foundational types used across the Cadence crates:
//! - `CadenceError` — unified error taxonomy
//! - `TaskStatus` / `StageKind` — the closed lifecycle and stage enums
//! - `WorkflowState` — the per-task mutable record driven through the lifecycle
//! - `StageUpdate` — partial result returned by a stage implementation
//! - `ExecutionRecord` — append-only audit trail of stage attempts

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// StageKind — closed set of stage capabilities
// ---------------------------------------------------------------------------

/// The closed set of stage kinds a task can be routed through.
///
/// A closed enum rather than a free-form role string: a misspelled role can
/// no longer fall through to a generic handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Coordinator,
    Backend,
    Frontend,
    Technical,
    Qa,
    Documentation,
    Checkpoint,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Coordinator => "coordinator",
            StageKind::Backend => "backend",
            StageKind::Frontend => "frontend",
            StageKind::Technical => "technical",
            StageKind::Qa => "qa",
            StageKind::Documentation => "documentation",
            StageKind::Checkpoint => "checkpoint",
        }
    }

    /// The three implementation kinds selectable by the task-type discriminator.
    pub fn is_implementation(&self) -> bool {
        matches!(
            self,
            StageKind::Backend | StageKind::Frontend | StageKind::Technical
        )
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TaskStatus — the task lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle status of a task. `Done` and `Blocked` are absorbing;
/// `HumanReview` is a soft-terminal pause awaiting an external approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Planned,
    InProgress,
    QaPending,
    Documentation,
    HumanReview,
    Done,
    Blocked,
}

impl TaskStatus {
    /// True only for the absorbing states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Blocked)
    }

    /// True for the soft-terminal pause state.
    pub fn is_paused(&self) -> bool {
        matches!(self, TaskStatus::HumanReview)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Planned => "planned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::QaPending => "qa_pending",
            TaskStatus::Documentation => "documentation",
            TaskStatus::HumanReview => "human_review",
            TaskStatus::Done => "done",
            TaskStatus::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CadenceError — unified error taxonomy
// ---------------------------------------------------------------------------

/// Unified error type for all Cadence subsystems.
#[derive(Debug, thiserror::Error)]
pub enum CadenceError {
    // === Stage execution errors ===
    #[error("stage '{stage}' failed: {message}")]
    StageFailure { stage: StageKind, message: String },

    #[error("stage '{stage}' timed out after {timeout_ms}ms")]
    StageTimeout { stage: StageKind, timeout_ms: u64 },

    #[error("max retry attempts reached for stage '{stage}' after {attempts} attempts")]
    RetriesExhausted { stage: StageKind, attempts: u32 },

    // === Control-flow errors ===
    #[error("loop detected: stage '{stage}' routed {occurrences} times with an identical status")]
    LoopDetected { stage: StageKind, occurrences: usize },

    #[error("iteration limit reached after {iterations} iterations")]
    RecursionLimitReached { iterations: u32 },

    // === Wiring errors ===
    #[error("no stage implementation registered for '{stage}'")]
    UnknownStage { stage: StageKind },

    // === Collaborator errors ===
    #[error("status store error: {0}")]
    Store(String),

    #[error("approval signal error: {0}")]
    Signal(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl CadenceError {
    /// Returns `true` when the executor's retry wrapper may re-invoke the
    /// stage. Timeouts are deliberately not retryable: the abandoned worker
    /// may still be running.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CadenceError::StageFailure { .. })
    }

    /// Classify the error for structured `error_info` reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CadenceError::StageFailure { .. } | CadenceError::RetriesExhausted { .. } => {
                ErrorKind::StageFailure
            }
            CadenceError::StageTimeout { .. } => ErrorKind::StageTimeout,
            CadenceError::LoopDetected { .. } => ErrorKind::LoopDetected,
            CadenceError::RecursionLimitReached { .. } => ErrorKind::RecursionLimitReached,
            CadenceError::UnknownStage { .. } => ErrorKind::UnknownStage,
            _ => ErrorKind::Internal,
        }
    }
}

/// A convenience alias for `Result<T, CadenceError>`.
pub type Result<T> = std::result::Result<T, CadenceError>;

/// Error classification stored in [`ErrorInfo`]. Serialized by variant name
/// (e.g. `"UnknownStage"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    StageFailure,
    StageTimeout,
    LoopDetected,
    RecursionLimitReached,
    UnknownStage,
    Internal,
}

// ---------------------------------------------------------------------------
// ErrorInfo — structured error captured on the workflow state
// ---------------------------------------------------------------------------

/// Structured error attached to a blocked (or timed-out) workflow state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub stage: Option<StageKind>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>, kind: ErrorKind, stage: Option<StageKind>) -> Self {
        Self {
            message: message.into(),
            kind,
            stage,
        }
    }

    /// Capture a [`CadenceError`] into its reportable form.
    pub fn from_error(err: &CadenceError, stage: Option<StageKind>) -> Self {
        Self {
            message: err.to_string(),
            kind: err.kind(),
            stage,
        }
    }
}

// ---------------------------------------------------------------------------
// StageUpdate — partial result returned by a stage implementation
// ---------------------------------------------------------------------------

/// Verdict a stage reports about its own work. A rejection is not an error:
/// the stage ran to completion but its result should not advance the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageVerdict {
    Completed,
    Rejected,
}

/// Partial state produced by one stage invocation. Merged into the owning
/// [`WorkflowState`] by the executor; stages never mutate state directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageUpdate {
    pub verdict: StageVerdict,
    pub outputs: HashMap<String, serde_json::Value>,
    pub notes: String,
    pub rejection_reason: Option<String>,
    /// Explicit next status, bypassing the transition table. Used by stages
    /// that own their transition, such as the checkpoint gate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_override: Option<TaskStatus>,
    /// When set, updates the state's `checkpoint_resolved` flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_resolved: Option<bool>,
}

impl StageUpdate {
    /// A completed update with the given notes.
    pub fn completed(notes: impl Into<String>) -> Self {
        Self {
            verdict: StageVerdict::Completed,
            outputs: HashMap::new(),
            notes: notes.into(),
            rejection_reason: None,
            status_override: None,
            checkpoint_resolved: None,
        }
    }

    /// A rejection with the given reason. Counts against the retry budget.
    pub fn rejected(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            verdict: StageVerdict::Rejected,
            outputs: HashMap::new(),
            notes: String::new(),
            rejection_reason: Some(reason),
            status_override: None,
            checkpoint_resolved: None,
        }
    }

    /// Attach an output value to this update.
    pub fn with_output(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.outputs.insert(key.into(), value);
        self
    }

    /// Set an explicit next status, bypassing the transition table.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status_override = Some(status);
        self
    }

    /// Mark the checkpoint flag on the owning state.
    pub fn with_checkpoint_resolved(mut self, resolved: bool) -> Self {
        self.checkpoint_resolved = Some(resolved);
        self
    }
}

// ---------------------------------------------------------------------------
// ExecutionRecord — append-only audit trail
// ---------------------------------------------------------------------------

/// Outcome of a single stage invocation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failed,
    TimedOut,
}

/// One entry per stage invocation attempt, written by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub stage: StageKind,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub ended_at: chrono::DateTime<chrono::Utc>,
    pub outcome: AttemptOutcome,
    pub error_message: Option<String>,
}

// ---------------------------------------------------------------------------
// WorkflowState — the per-task record
// ---------------------------------------------------------------------------

/// One `(stage, status)` routing decision, as appended by the cycle guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingEntry {
    pub stage: StageKind,
    pub status: TaskStatus,
}

/// Creation / mutation timestamps carried on the state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timestamps {
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    /// Set when the task first enters `HumanReview`; cleared on approval.
    pub review_requested_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// The mutable record for one task run. Owned exclusively by one driver
/// instance for the lifetime of the run; never shared across tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub task_id: String,
    pub status: TaskStatus,
    pub current_stage: Option<StageKind>,
    pub output: HashMap<String, serde_json::Value>,
    pub error_info: Option<ErrorInfo>,
    pub attempt_count: u32,
    pub iteration_count: u32,
    pub routing_history: Vec<RoutingEntry>,
    pub records: Vec<ExecutionRecord>,
    pub checkpoint_resolved: bool,
    pub timestamps: Timestamps,
}

impl WorkflowState {
    /// Fresh state for a new task, status `Created`.
    pub fn new(task_id: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Created,
            current_stage: None,
            output: HashMap::new(),
            error_info: None,
            attempt_count: 0,
            iteration_count: 0,
            routing_history: Vec::new(),
            records: Vec::new(),
            checkpoint_resolved: false,
            timestamps: Timestamps {
                created_at: now,
                updated_at: now,
                review_requested_at: None,
            },
        }
    }

    /// The review identifier the checkpoint gate keys its approval lookup by.
    pub fn review_id(&self) -> String {
        format!("review-{}", self.task_id)
    }

    /// Merge a stage's partial outputs into the accumulated output map.
    pub fn merge_outputs(&mut self, outputs: HashMap<String, serde_json::Value>) {
        self.output.extend(outputs);
        self.touch();
    }

    /// Record a status transition and refresh `updated_at`.
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.touch();
    }

    /// Mark the state blocked with structured error information.
    pub fn block(&mut self, info: ErrorInfo) {
        self.error_info = Some(info);
        self.set_status(TaskStatus::Blocked);
    }

    /// Append an audit record for a stage attempt.
    pub fn push_record(&mut self, record: ExecutionRecord) {
        self.records.push(record);
        self.touch();
    }

    fn touch(&mut self) {
        self.timestamps.updated_at = chrono::Utc::now();
    }
}

//! Checkpoint gate — pauses a task pending an external human approval.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use cadence_types::{Result, StageKind, StageUpdate, TaskStatus, WorkflowState};

use crate::stage::Stage;

// ---------------------------------------------------------------------------
// ApprovalSignal
// ---------------------------------------------------------------------------

/// External boolean approval signal, keyed by review identifier.
///
/// The engine only reads this signal; the approval UI and its storage format
/// live outside this crate.
#[async_trait]
pub trait ApprovalSignal: Send + Sync {
    async fn is_approved(&self, review_id: &str) -> Result<bool>;
}

/// In-memory approval signal. Reviews are approved by calling
/// [`approve`](MemoryApprovalSignal::approve).
pub struct MemoryApprovalSignal {
    approved: std::sync::Mutex<HashSet<String>>,
}

impl MemoryApprovalSignal {
    pub fn new() -> Self {
        Self {
            approved: std::sync::Mutex::new(HashSet::new()),
        }
    }

    pub fn approve(&self, review_id: impl Into<String>) {
        self.approved.lock().unwrap().insert(review_id.into());
    }

    pub fn revoke(&self, review_id: &str) {
        self.approved.lock().unwrap().remove(review_id);
    }
}

impl Default for MemoryApprovalSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApprovalSignal for MemoryApprovalSignal {
    async fn is_approved(&self, review_id: &str) -> Result<bool> {
        Ok(self.approved.lock().unwrap().contains(review_id))
    }
}

/// Signal with a constant answer. Useful for auto-approving demos and tests.
pub struct StaticApprovalSignal(pub bool);

#[async_trait]
impl ApprovalSignal for StaticApprovalSignal {
    async fn is_approved(&self, _review_id: &str) -> Result<bool> {
        Ok(self.0)
    }
}

// ---------------------------------------------------------------------------
// CheckpointGate
// ---------------------------------------------------------------------------

/// A specialized stage with no computation of its own.
///
/// On invocation it checks the approval signal for the state's review id.
/// Approved: transitions to the configured post-approval status and marks the
/// checkpoint resolved. Absent: holds the task in `HumanReview` — the driver
/// treats this as a pause, not a failure.
pub struct CheckpointGate {
    signal: Arc<dyn ApprovalSignal>,
    post_approval_status: TaskStatus,
}

impl CheckpointGate {
    pub fn new(signal: Arc<dyn ApprovalSignal>) -> Self {
        Self {
            signal,
            post_approval_status: TaskStatus::Documentation,
        }
    }

    pub fn with_post_approval_status(mut self, status: TaskStatus) -> Self {
        self.post_approval_status = status;
        self
    }
}

#[async_trait]
impl Stage for CheckpointGate {
    fn kind(&self) -> StageKind {
        StageKind::Checkpoint
    }

    async fn execute(&self, state: &WorkflowState) -> Result<StageUpdate> {
        let review_id = state.review_id();
        let approved = self.signal.is_approved(&review_id).await?;

        if approved {
            tracing::info!(task = %state.task_id, review = %review_id, "Checkpoint approved");
            Ok(StageUpdate::completed("approval granted")
                .with_status(self.post_approval_status)
                .with_checkpoint_resolved(true))
        } else {
            tracing::debug!(task = %state.task_id, review = %review_id, "Checkpoint held");
            Ok(StageUpdate::completed("awaiting approval")
                .with_status(TaskStatus::HumanReview)
                .with_checkpoint_resolved(false))
        }
    }
}

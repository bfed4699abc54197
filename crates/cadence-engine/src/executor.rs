//! Stage execution with timeout isolation and bounded retry.
//!
//! The executor invokes a stage on a spawned worker task with a hard
//! wall-clock deadline, converts failures and timeouts into structured
//! terminal results on the state, and never lets a stage error propagate
//! up the call stack.

use std::collections::HashMap;
use std::time::Duration;

use cadence_types::{
    AttemptOutcome, CadenceError, ErrorInfo, ExecutionRecord, StageKind, StageUpdate,
    StageVerdict, WorkflowState,
};

use crate::events::{EventEmitter, WorkflowEvent};
use crate::retry::BackoffPolicy;
use crate::stage::RegisteredStage;
use crate::state::TransitionTable;

// ---------------------------------------------------------------------------
// ExecutionContext — per-run counters
// ---------------------------------------------------------------------------

/// Attempt and rejection counters for one task run.
///
/// Owned and passed by the driver, so concurrent task runs can never share
/// or corrupt each other's counters.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    attempts: HashMap<StageKind, u32>,
    rejections: HashMap<StageKind, u32>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self, kind: StageKind) -> u32 {
        self.attempts.get(&kind).copied().unwrap_or(0)
    }

    pub fn rejections(&self, kind: StageKind) -> u32 {
        self.rejections.get(&kind).copied().unwrap_or(0)
    }

    fn bump_attempt(&mut self, kind: StageKind) -> u32 {
        let count = self.attempts.entry(kind).or_insert(0);
        *count += 1;
        *count
    }

    fn bump_rejection(&mut self, kind: StageKind) -> u32 {
        let count = self.rejections.entry(kind).or_insert(0);
        *count += 1;
        *count
    }

    fn reset_attempts(&mut self, kind: StageKind) {
        self.attempts.insert(kind, 0);
    }
}

// ---------------------------------------------------------------------------
// StageExecutor
// ---------------------------------------------------------------------------

/// How a single driver step resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Stage succeeded and the status advanced.
    Advanced,
    /// Stage exhausted its retry budget or failed terminally.
    Blocked,
    /// The wall-clock deadline elapsed; the worker was abandoned.
    TimedOut,
}

/// Runs registered stages against a workflow state.
pub struct StageExecutor {
    table: TransitionTable,
    backoff: BackoffPolicy,
    max_retries: u32,
    stage_timeout: Duration,
    events: EventEmitter,
}

impl StageExecutor {
    pub fn new(
        table: TransitionTable,
        backoff: BackoffPolicy,
        max_retries: u32,
        stage_timeout: Duration,
        events: EventEmitter,
    ) -> Self {
        Self {
            table,
            backoff,
            max_retries,
            stage_timeout,
            events,
        }
    }

    /// Run one stage to a step resolution, retrying failed or rejected
    /// attempts up to the stage's retry budget.
    ///
    /// Mutates `state` (status, outputs, records, error info) and the per-run
    /// counters in `ctx`. Stage errors are captured, never returned.
    pub async fn run(
        &self,
        registered: &RegisteredStage,
        state: &mut WorkflowState,
        ctx: &mut ExecutionContext,
    ) -> StepOutcome {
        let kind = registered.descriptor.kind;
        state.current_stage = Some(kind);

        let timeout = registered.descriptor.timeout.unwrap_or(self.stage_timeout);
        let max_retries = registered
            .descriptor
            .max_retries
            .unwrap_or(self.max_retries)
            .max(1);

        loop {
            self.events.emit(WorkflowEvent::StageStarted {
                task_id: state.task_id.clone(),
                stage: kind,
                attempt: ctx.attempts(kind),
            });

            let started_at = chrono::Utc::now();
            let invocation = self.invoke_once(registered, state, timeout).await;
            let ended_at = chrono::Utc::now();

            match invocation {
                Invocation::Update(update) if update.verdict == StageVerdict::Completed => {
                    state.push_record(ExecutionRecord {
                        stage: kind,
                        started_at,
                        ended_at,
                        outcome: AttemptOutcome::Success,
                        error_message: None,
                    });
                    ctx.reset_attempts(kind);
                    state.attempt_count = 0;

                    let previous = state.status;
                    state.merge_outputs(update.outputs);
                    if let Some(resolved) = update.checkpoint_resolved {
                        state.checkpoint_resolved = resolved;
                    }
                    let next = update
                        .status_override
                        .unwrap_or_else(|| self.table.next_status(previous, kind, true));
                    state.set_status(next);

                    self.events.emit(WorkflowEvent::StageCompleted {
                        task_id: state.task_id.clone(),
                        stage: kind,
                        status: next,
                        duration_ms: (ended_at - started_at).num_milliseconds().max(0) as u64,
                    });
                    if next != previous {
                        self.events.emit(WorkflowEvent::StatusChanged {
                            task_id: state.task_id.clone(),
                            from: previous,
                            to: next,
                        });
                    }
                    tracing::info!(task = %state.task_id, stage = %kind, status = %next, "Stage completed");
                    return StepOutcome::Advanced;
                }

                Invocation::Update(update) => {
                    // Rejection: the stage ran but its result must not advance
                    // the task. Counts against the retry budget.
                    let reason = update
                        .rejection_reason
                        .unwrap_or_else(|| "stage rejected its result".to_string());
                    state.push_record(ExecutionRecord {
                        stage: kind,
                        started_at,
                        ended_at,
                        outcome: AttemptOutcome::Failed,
                        error_message: Some(reason.clone()),
                    });
                    ctx.bump_rejection(kind);
                    let err = CadenceError::StageFailure {
                        stage: kind,
                        message: reason,
                    };
                    if let Some(outcome) =
                        self.handle_retryable(kind, err, state, ctx, max_retries).await
                    {
                        return outcome;
                    }
                }

                Invocation::Failed(err) => {
                    state.push_record(ExecutionRecord {
                        stage: kind,
                        started_at,
                        ended_at,
                        outcome: AttemptOutcome::Failed,
                        error_message: Some(err.to_string()),
                    });
                    self.events.emit(WorkflowEvent::StageFailed {
                        task_id: state.task_id.clone(),
                        stage: kind,
                        error: err.to_string(),
                    });
                    if let Some(outcome) =
                        self.handle_retryable(kind, err, state, ctx, max_retries).await
                    {
                        return outcome;
                    }
                }

                Invocation::TimedOut => {
                    let err = CadenceError::StageTimeout {
                        stage: kind,
                        timeout_ms: timeout.as_millis() as u64,
                    };
                    state.push_record(ExecutionRecord {
                        stage: kind,
                        started_at,
                        ended_at,
                        outcome: AttemptOutcome::TimedOut,
                        error_message: Some(err.to_string()),
                    });
                    tracing::warn!(task = %state.task_id, stage = %kind, timeout_ms = timeout.as_millis() as u64, "Stage timed out; worker abandoned");
                    state.block(ErrorInfo::from_error(&err, Some(kind)));
                    self.events.emit(WorkflowEvent::TaskBlocked {
                        task_id: state.task_id.clone(),
                        reason: err.to_string(),
                    });
                    return StepOutcome::TimedOut;
                }
            }
        }
    }

    /// Invoke the stage once on an isolated worker with a hard deadline.
    ///
    /// On timeout the join handle is dropped, not aborted: the stage
    /// implementation is opaque and may not be safely interruptible. A late
    /// result is discarded, never merged.
    async fn invoke_once(
        &self,
        registered: &RegisteredStage,
        state: &WorkflowState,
        timeout: Duration,
    ) -> Invocation {
        let stage = registered.stage.clone();
        let snapshot = state.clone();
        let handle = tokio::task::spawn(async move { stage.execute(&snapshot).await });

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(Ok(update))) => Invocation::Update(update),
            Ok(Ok(Err(err))) => Invocation::Failed(err),
            Ok(Err(join_err)) => Invocation::Failed(CadenceError::StageFailure {
                stage: registered.descriptor.kind,
                message: format!("stage worker panicked: {join_err}"),
            }),
            Err(_elapsed) => Invocation::TimedOut,
        }
    }

    /// Shared retry accounting for failures and rejections.
    ///
    /// Returns `Some(StepOutcome)` when the budget is exhausted and the state
    /// has been blocked, `None` when the caller should retry.
    async fn handle_retryable(
        &self,
        kind: StageKind,
        err: CadenceError,
        state: &mut WorkflowState,
        ctx: &mut ExecutionContext,
        max_retries: u32,
    ) -> Option<StepOutcome> {
        let attempt = ctx.bump_attempt(kind);
        state.attempt_count = attempt;

        if attempt < max_retries {
            let delay = self.backoff.delay_for_attempt(attempt - 1);
            tracing::info!(task = %state.task_id, stage = %kind, attempt, delay_ms = %delay.as_millis(), "Retrying stage");
            self.events.emit(WorkflowEvent::StageRetrying {
                task_id: state.task_id.clone(),
                stage: kind,
                attempt,
            });
            tokio::time::sleep(delay).await;
            return None;
        }

        ctx.reset_attempts(kind);
        state.attempt_count = 0;
        let exhausted = CadenceError::RetriesExhausted {
            stage: kind,
            attempts: attempt,
        };
        tracing::warn!(task = %state.task_id, stage = %kind, attempts = attempt, last_error = %err, "Retry budget exhausted");
        state.block(ErrorInfo::from_error(&exhausted, Some(kind)));
        self.events.emit(WorkflowEvent::TaskBlocked {
            task_id: state.task_id.clone(),
            reason: exhausted.to_string(),
        });
        Some(StepOutcome::Blocked)
    }

    /// Resolve a state to blocked for a stage that has no registered
    /// implementation. Detected before any worker is spawned.
    pub fn block_unknown_stage(&self, kind: StageKind, state: &mut WorkflowState) {
        let err = CadenceError::UnknownStage { stage: kind };
        tracing::error!(task = %state.task_id, stage = %kind, "No stage implementation registered");
        state.block(ErrorInfo::from_error(&err, Some(kind)));
        self.events.emit(WorkflowEvent::TaskBlocked {
            task_id: state.task_id.clone(),
            reason: err.to_string(),
        });
    }
}

enum Invocation {
    Update(StageUpdate),
    Failed(CadenceError),
    TimedOut,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use cadence_types::{Result, TaskStatus};

    use crate::stage::{Stage, StageDescriptor};

    struct AlwaysFails;

    #[async_trait]
    impl Stage for AlwaysFails {
        fn kind(&self) -> StageKind {
            StageKind::Backend
        }
        async fn execute(&self, _state: &WorkflowState) -> Result<StageUpdate> {
            Err(CadenceError::StageFailure {
                stage: StageKind::Backend,
                message: "intentional".into(),
            })
        }
    }

    struct FailsThenSucceeds {
        failures: usize,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Stage for FailsThenSucceeds {
        fn kind(&self) -> StageKind {
            StageKind::Backend
        }
        async fn execute(&self, _state: &WorkflowState) -> Result<StageUpdate> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(CadenceError::StageFailure {
                    stage: StageKind::Backend,
                    message: format!("failure {n}"),
                })
            } else {
                Ok(StageUpdate::completed("recovered"))
            }
        }
    }

    struct Sleeps(Duration);

    #[async_trait]
    impl Stage for Sleeps {
        fn kind(&self) -> StageKind {
            StageKind::Qa
        }
        async fn execute(&self, _state: &WorkflowState) -> Result<StageUpdate> {
            tokio::time::sleep(self.0).await;
            Ok(StageUpdate::completed("slow"))
        }
    }

    fn executor(max_retries: u32, timeout: Duration) -> StageExecutor {
        StageExecutor::new(
            TransitionTable::standard(),
            BackoffPolicy::None,
            max_retries,
            timeout,
            EventEmitter::default(),
        )
    }

    fn registered(stage: impl Stage + 'static) -> RegisteredStage {
        RegisteredStage {
            descriptor: StageDescriptor::new(stage.kind()),
            stage: Arc::new(stage),
        }
    }

    #[tokio::test]
    async fn success_advances_status_via_table() {
        let exec = executor(3, Duration::from_secs(1));
        let reg = registered(FailsThenSucceeds {
            failures: 0,
            calls: Arc::new(AtomicUsize::new(0)),
        });
        let mut state = WorkflowState::new("BE-1");
        state.status = TaskStatus::Planned;
        let mut ctx = ExecutionContext::new();

        let outcome = exec.run(&reg, &mut state, &mut ctx).await;
        assert_eq!(outcome, StepOutcome::Advanced);
        assert_eq!(state.status, TaskStatus::QaPending);
        assert_eq!(state.records.len(), 1);
        assert_eq!(state.records[0].outcome, AttemptOutcome::Success);
    }

    #[tokio::test]
    async fn always_failing_stage_blocks_after_budget() {
        let exec = executor(2, Duration::from_secs(1));
        let reg = registered(AlwaysFails);
        let mut state = WorkflowState::new("BE-1");
        state.status = TaskStatus::Planned;
        let mut ctx = ExecutionContext::new();

        let outcome = exec.run(&reg, &mut state, &mut ctx).await;
        assert_eq!(outcome, StepOutcome::Blocked);
        assert_eq!(state.status, TaskStatus::Blocked);
        // Counter resets after exhaustion.
        assert_eq!(state.attempt_count, 0);
        assert_eq!(ctx.attempts(StageKind::Backend), 0);
        let info = state.error_info.as_ref().unwrap();
        assert!(info.message.contains("max retry attempts"));
        // Two attempts, both failed.
        assert_eq!(state.records.len(), 2);
        assert!(state
            .records
            .iter()
            .all(|r| r.outcome == AttemptOutcome::Failed));
    }

    #[tokio::test]
    async fn retry_then_succeed_advances_as_if_first_try() {
        let calls = Arc::new(AtomicUsize::new(0));
        let exec = executor(3, Duration::from_secs(1));
        let reg = registered(FailsThenSucceeds {
            failures: 1,
            calls: calls.clone(),
        });
        let mut state = WorkflowState::new("BE-1");
        state.status = TaskStatus::Planned;
        let mut ctx = ExecutionContext::new();

        let outcome = exec.run(&reg, &mut state, &mut ctx).await;
        assert_eq!(outcome, StepOutcome::Advanced);
        assert_eq!(state.status, TaskStatus::QaPending);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // One failed record followed by one success.
        assert_eq!(state.records.len(), 2);
        assert_eq!(state.records[0].outcome, AttemptOutcome::Failed);
        assert_eq!(state.records[1].outcome, AttemptOutcome::Success);
    }

    #[tokio::test]
    async fn timeout_blocks_promptly_with_timed_out_message() {
        let exec = executor(3, Duration::from_millis(50));
        let reg = registered(Sleeps(Duration::from_secs(30)));
        let mut state = WorkflowState::new("t");
        state.status = TaskStatus::QaPending;
        let mut ctx = ExecutionContext::new();

        let started = std::time::Instant::now();
        let outcome = exec.run(&reg, &mut state, &mut ctx).await;
        assert!(started.elapsed() < Duration::from_secs(2));

        assert_eq!(outcome, StepOutcome::TimedOut);
        assert_eq!(state.status, TaskStatus::Blocked);
        let info = state.error_info.as_ref().unwrap();
        assert!(info.message.contains("timed out"));
        assert_eq!(state.records.len(), 1);
        assert_eq!(state.records[0].outcome, AttemptOutcome::TimedOut);
    }

    #[tokio::test]
    async fn timeout_is_not_retried() {
        let exec = executor(3, Duration::from_millis(20));
        let reg = registered(Sleeps(Duration::from_secs(30)));
        let mut state = WorkflowState::new("t");
        state.status = TaskStatus::QaPending;
        let mut ctx = ExecutionContext::new();

        exec.run(&reg, &mut state, &mut ctx).await;
        // Exactly one attempt recorded.
        assert_eq!(state.records.len(), 1);
        assert_eq!(ctx.attempts(StageKind::Qa), 0);
    }

    struct Rejects {
        rejections: usize,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Stage for Rejects {
        fn kind(&self) -> StageKind {
            StageKind::Qa
        }
        async fn execute(&self, _state: &WorkflowState) -> Result<StageUpdate> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.rejections {
                Ok(StageUpdate::rejected("quality bar not met"))
            } else {
                Ok(StageUpdate::completed("approved"))
            }
        }
    }

    #[tokio::test]
    async fn rejection_twice_then_success_with_budget_three() {
        let exec = executor(3, Duration::from_secs(1));
        let reg = registered(Rejects {
            rejections: 2,
            calls: Arc::new(AtomicUsize::new(0)),
        });
        let mut state = WorkflowState::new("t");
        state.status = TaskStatus::QaPending;
        let mut ctx = ExecutionContext::new();

        let outcome = exec.run(&reg, &mut state, &mut ctx).await;
        assert_eq!(outcome, StepOutcome::Advanced);
        assert_eq!(state.status, TaskStatus::Documentation);
        assert_eq!(ctx.rejections(StageKind::Qa), 2);
    }

    #[tokio::test]
    async fn rejection_twice_with_budget_two_blocks() {
        let exec = executor(2, Duration::from_secs(1));
        let reg = registered(Rejects {
            rejections: 2,
            calls: Arc::new(AtomicUsize::new(0)),
        });
        let mut state = WorkflowState::new("t");
        state.status = TaskStatus::QaPending;
        let mut ctx = ExecutionContext::new();

        let outcome = exec.run(&reg, &mut state, &mut ctx).await;
        assert_eq!(outcome, StepOutcome::Blocked);
        assert_eq!(state.status, TaskStatus::Blocked);
        assert!(state
            .error_info
            .as_ref()
            .unwrap()
            .message
            .contains("max retry attempts"));
    }

    #[tokio::test]
    async fn status_override_bypasses_table() {
        struct Overrides;
        #[async_trait]
        impl Stage for Overrides {
            fn kind(&self) -> StageKind {
                StageKind::Checkpoint
            }
            async fn execute(&self, _state: &WorkflowState) -> Result<StageUpdate> {
                Ok(StageUpdate::completed("held")
                    .with_status(TaskStatus::HumanReview)
                    .with_checkpoint_resolved(false))
            }
        }

        let exec = executor(3, Duration::from_secs(1));
        let reg = registered(Overrides);
        let mut state = WorkflowState::new("t");
        state.status = TaskStatus::HumanReview;
        let mut ctx = ExecutionContext::new();

        let outcome = exec.run(&reg, &mut state, &mut ctx).await;
        assert_eq!(outcome, StepOutcome::Advanced);
        assert_eq!(state.status, TaskStatus::HumanReview);
        assert!(!state.checkpoint_resolved);
    }

    #[tokio::test]
    async fn unknown_stage_blocks_without_spawning() {
        let exec = executor(3, Duration::from_secs(1));
        let mut state = WorkflowState::new("t");
        exec.block_unknown_stage(StageKind::Frontend, &mut state);

        assert_eq!(state.status, TaskStatus::Blocked);
        let info = state.error_info.as_ref().unwrap();
        assert_eq!(info.kind, cadence_types::ErrorKind::UnknownStage);
        assert!(state.records.is_empty());
    }

    #[tokio::test]
    async fn stage_outputs_merge_into_state() {
        struct Produces;
        #[async_trait]
        impl Stage for Produces {
            fn kind(&self) -> StageKind {
                StageKind::Coordinator
            }
            async fn execute(&self, _state: &WorkflowState) -> Result<StageUpdate> {
                Ok(StageUpdate::completed("planned")
                    .with_output("plan", serde_json::json!(["a", "b"])))
            }
        }

        let exec = executor(3, Duration::from_secs(1));
        let reg = registered(Produces);
        let mut state = WorkflowState::new("t");
        let mut ctx = ExecutionContext::new();

        exec.run(&reg, &mut state, &mut ctx).await;
        assert_eq!(state.output["plan"], serde_json::json!(["a", "b"]));
        assert_eq!(state.status, TaskStatus::Planned);
    }
}

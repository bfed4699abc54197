//! The top-level execution loop.
//!
//! Builds (or resumes) a task's workflow state, then alternates router and
//! executor until the task reaches an absorbing state, pauses for human
//! review, or hits the iteration cap. State is persisted unconditionally
//! after every step.

use std::sync::Arc;
use std::time::Duration;

use cadence_types::{
    CadenceError, ErrorInfo, Result, StageKind, TaskStatus, WorkflowState,
};

use crate::escalate::{EscalationEvent, EscalationReason, EscalationSink, LogEscalationSink};
use crate::events::{EventEmitter, WorkflowEvent};
use crate::executor::{ExecutionContext, StageExecutor, StepOutcome};
use crate::persist::StatusStore;
use crate::retry::BackoffPolicy;
use crate::router::{RouteDecision, Router};
use crate::stage::StageRegistry;
use crate::state::TransitionTable;

// ---------------------------------------------------------------------------
// DriverConfig
// ---------------------------------------------------------------------------

/// Tunables for a driver instance. One config serves all tasks the driver
/// runs; per-stage descriptor overrides still apply.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Total attempts allowed per stage before blocking.
    pub max_retries: u32,
    /// Wall-clock deadline for a single stage invocation.
    pub stage_timeout: Duration,
    /// Delay policy between retry attempts.
    pub backoff: BackoffPolicy,
    /// Identical routing decisions tolerated before forced termination.
    pub loop_threshold: usize,
    /// Hard cap on driver iterations per run.
    pub recursion_limit: u32,
    /// Rejections of one stage that trigger an escalation hand-off.
    pub rejection_escalation_threshold: u32,
    /// How long a review may be held before escalating as overdue.
    pub review_hold_limit: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            stage_timeout: Duration::from_secs(120),
            backoff: BackoffPolicy::default(),
            loop_threshold: 3,
            recursion_limit: 25,
            rejection_escalation_threshold: 2,
            review_hold_limit: Duration::from_secs(24 * 60 * 60),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionDriver
// ---------------------------------------------------------------------------

/// Drives one task at a time through its lifecycle. Multiple independent
/// tasks may run concurrently as separate driver calls; each run owns its
/// state and counters, so no cross-task locking is needed.
pub struct ExecutionDriver {
    registry: StageRegistry,
    router: Router,
    executor: StageExecutor,
    store: Arc<dyn StatusStore>,
    escalation: Arc<dyn EscalationSink>,
    events: EventEmitter,
    config: DriverConfig,
}

impl ExecutionDriver {
    pub fn new(
        registry: StageRegistry,
        table: TransitionTable,
        store: Arc<dyn StatusStore>,
        config: DriverConfig,
    ) -> Self {
        let events = EventEmitter::default();
        let executor = StageExecutor::new(
            table,
            config.backoff.clone(),
            config.max_retries,
            config.stage_timeout,
            events.clone(),
        );
        Self {
            registry,
            router: Router::with_loop_threshold(config.loop_threshold),
            executor,
            store,
            escalation: Arc::new(LogEscalationSink),
            events,
            config,
        }
    }

    /// Replace the default log-only escalation sink.
    pub fn with_escalation(mut self, sink: Arc<dyn EscalationSink>) -> Self {
        self.escalation = sink;
        self
    }

    /// Event stream for external observers.
    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Run (or resume) a task to its next resting point: an absorbing state,
    /// a held checkpoint, or the iteration cap.
    ///
    /// A task paused in `HumanReview` is resumed by calling `run` again once
    /// the approval signal is present. A persistence failure never aborts the
    /// step that produced it; it is returned as the run's error before the
    /// next step starts.
    pub async fn run(&self, task_id: &str) -> Result<WorkflowState> {
        let mut state = match self.store.load_status(task_id).await? {
            Some(existing) => {
                if existing.status.is_terminal() {
                    return Ok(existing);
                }
                tracing::info!(task = %task_id, status = %existing.status, "Resuming task");
                existing
            }
            None => {
                tracing::info!(task = %task_id, "Starting task");
                self.events.emit(WorkflowEvent::TaskStarted {
                    task_id: task_id.to_string(),
                });
                WorkflowState::new(task_id)
            }
        };
        let mut store_failure = self.persist(&state).await.err();

        let mut ctx = ExecutionContext::new();
        let mut rejection_escalated: std::collections::HashSet<StageKind> =
            std::collections::HashSet::new();

        loop {
            // A store failure from the previous step surfaces here, before
            // any further stage runs against unpersisted state.
            if let Some(err) = store_failure.take() {
                return Err(err);
            }

            if state.iteration_count >= self.config.recursion_limit {
                let err = CadenceError::RecursionLimitReached {
                    iterations: state.iteration_count,
                };
                tracing::warn!(task = %task_id, iterations = state.iteration_count, "Iteration cap reached");
                state.block(ErrorInfo::from_error(&err, state.current_stage));
                self.events.emit(WorkflowEvent::TaskBlocked {
                    task_id: task_id.to_string(),
                    reason: err.to_string(),
                });
                self.persist(&state).await.ok();
                return Ok(state);
            }

            let decision = self.router.next(&mut state);
            state.iteration_count = state.routing_history.len() as u32;

            let kind = match decision {
                RouteDecision::Terminate => {
                    self.persist(&state).await.ok();
                    self.finish(&mut state).await;
                    return Ok(state);
                }
                RouteDecision::Run(kind) => kind,
            };

            let Some(registered) = self.registry.get(kind).cloned() else {
                self.executor.block_unknown_stage(kind, &mut state);
                self.persist(&state).await.ok();
                return Ok(state);
            };

            let outcome = self.executor.run(&registered, &mut state, &mut ctx).await;

            if ctx.rejections(kind) >= self.config.rejection_escalation_threshold
                && rejection_escalated.insert(kind)
            {
                self.escalate(&state, Some(kind), EscalationReason::RepeatedRejection)
                    .await;
            }

            store_failure = self.persist(&state).await.err();

            match outcome {
                StepOutcome::TimedOut => {
                    self.escalate(&state, Some(kind), EscalationReason::StageTimeout)
                        .await;
                    return Ok(state);
                }
                StepOutcome::Blocked => {
                    return Ok(state);
                }
                StepOutcome::Advanced => {
                    if kind == StageKind::Checkpoint {
                        if state.checkpoint_resolved {
                            let review_id = state.review_id();
                            state.timestamps.review_requested_at = None;
                            self.events.emit(WorkflowEvent::CheckpointResolved {
                                task_id: task_id.to_string(),
                                review_id,
                            });
                        } else if state.status.is_paused() {
                            return Ok(self.hold_for_review(state).await);
                        }
                    }
                }
            }
        }
    }

    /// Park a task whose checkpoint is still unapproved.
    async fn hold_for_review(&self, mut state: WorkflowState) -> WorkflowState {
        let now = chrono::Utc::now();
        let requested_at = *state
            .timestamps
            .review_requested_at
            .get_or_insert(now);

        self.events.emit(WorkflowEvent::CheckpointHeld {
            task_id: state.task_id.clone(),
            review_id: state.review_id(),
        });
        tracing::info!(task = %state.task_id, "Task held for human review");

        let overdue = chrono::Duration::from_std(self.config.review_hold_limit)
            .map_or(false, |limit| now - requested_at > limit);
        if overdue {
            self.escalate(&state, Some(StageKind::Checkpoint), EscalationReason::ReviewOverdue)
                .await;
        }

        self.persist(&state).await.ok();
        state
    }

    async fn finish(&self, state: &mut WorkflowState) {
        match state.status {
            TaskStatus::Done => {
                self.events.emit(WorkflowEvent::TaskCompleted {
                    task_id: state.task_id.clone(),
                    iterations: state.iteration_count,
                });
                tracing::info!(task = %state.task_id, iterations = state.iteration_count, "Task completed");
            }
            TaskStatus::Blocked => {
                if let Some(info) = &state.error_info {
                    if info.kind == cadence_types::ErrorKind::LoopDetected {
                        self.escalate(state, info.stage, EscalationReason::LoopDetected)
                            .await;
                    }
                }
            }
            _ => {}
        }
    }

    async fn escalate(
        &self,
        state: &WorkflowState,
        stage: Option<StageKind>,
        reason: EscalationReason,
    ) {
        let event = EscalationEvent::new(state.task_id.clone(), stage, reason);
        self.events.emit(WorkflowEvent::EscalationRaised {
            task_id: state.task_id.clone(),
            reason: format!("{reason:?}"),
        });
        if let Err(err) = self.escalation.raise(event).await {
            tracing::error!(task = %state.task_id, error = %err, "Escalation hand-off failed");
        }
    }

    /// Persist the latest snapshot. A store failure is logged and returned;
    /// the step that produced it still completes.
    async fn persist(&self, state: &WorkflowState) -> Result<()> {
        if let Err(err) = self.store.write_status(&state.task_id, state).await {
            tracing::error!(task = %state.task_id, error = %err, "Failed to persist workflow state");
            return Err(err);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

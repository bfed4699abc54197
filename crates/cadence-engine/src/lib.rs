//! Cadence workflow engine.
//!
//! This crate implements the control plane that routes a task through its
//! lifecycle: the transition table, stage registry and executor, retry and
//! timeout isolation, status- and role-based routing with loop prevention,
//! checkpoint gating on an external approval, and the top-level driver loop
//! with per-step persistence and escalation hand-off.

pub mod cycle;
pub mod driver;
pub mod escalate;
pub mod events;
pub mod executor;
pub mod gate;
pub mod persist;
pub mod retry;
pub mod router;
pub mod stage;
pub mod state;

pub use cycle::CycleGuard;
pub use driver::{DriverConfig, ExecutionDriver};
pub use escalate::{
    EscalationEvent, EscalationReason, EscalationSink, LogEscalationSink, RecordingEscalationSink,
};
pub use events::{EventEmitter, WorkflowEvent};
pub use executor::{ExecutionContext, StageExecutor, StepOutcome};
pub use gate::{ApprovalSignal, CheckpointGate, MemoryApprovalSignal, StaticApprovalSignal};
pub use persist::{JsonStatusStore, MemoryStatusStore, StatusStore};
pub use retry::BackoffPolicy;
pub use router::{implementation_kind, RouteDecision, Router};
pub use stage::{
    default_registry, default_registry_with_signal, NoopStage, RegisteredStage, Stage,
    StageDescriptor, StageRegistry,
};
pub use state::TransitionTable;

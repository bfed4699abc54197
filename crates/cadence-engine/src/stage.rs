//! Stage trait, descriptors, and the stage registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use cadence_types::{CadenceError, Result, StageKind, StageUpdate, WorkflowState};

// ---------------------------------------------------------------------------
// Stage trait
// ---------------------------------------------------------------------------

/// A pluggable unit of work performed during one phase of a task's lifecycle.
///
/// Implementations must not mutate the input state (they receive it by shared
/// reference and return a partial update) and must be safe to invoke more
/// than once with the same input, since the executor may retry them.
#[async_trait]
pub trait Stage: Send + Sync {
    /// The stage kind this implementation handles.
    fn kind(&self) -> StageKind;

    /// Perform the stage's work and return a partial state update.
    async fn execute(&self, state: &WorkflowState) -> Result<StageUpdate>;
}

// ---------------------------------------------------------------------------
// StageDescriptor
// ---------------------------------------------------------------------------

/// Static description of a registered stage. Immutable after registration.
#[derive(Debug, Clone)]
pub struct StageDescriptor {
    pub kind: StageKind,
    pub name: String,
    /// Stage kinds that must have completed before this stage runs.
    pub dependencies: Vec<StageKind>,
    /// Per-stage override of the driver's wall-clock timeout.
    pub timeout: Option<Duration>,
    /// Per-stage override of the driver's retry budget.
    pub max_retries: Option<u32>,
}

impl StageDescriptor {
    pub fn new(kind: StageKind) -> Self {
        Self {
            kind,
            name: kind.as_str().to_string(),
            dependencies: Vec::new(),
            timeout: None,
            max_retries: None,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<StageKind>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }
}

// ---------------------------------------------------------------------------
// StageRegistry
// ---------------------------------------------------------------------------

/// A descriptor paired with its implementation.
#[derive(Clone)]
pub struct RegisteredStage {
    pub descriptor: StageDescriptor,
    pub stage: Arc<dyn Stage>,
}

/// Maps each [`StageKind`] to a registered implementation.
///
/// A lookup miss is a wiring defect ([`CadenceError::UnknownStage`]), not a
/// runtime failure of task content.
pub struct StageRegistry {
    stages: HashMap<StageKind, RegisteredStage>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            stages: HashMap::new(),
        }
    }

    /// Register a stage under a default descriptor derived from its kind.
    pub fn register(&mut self, stage: impl Stage + 'static) {
        let descriptor = StageDescriptor::new(stage.kind());
        self.register_with(descriptor, Arc::new(stage));
    }

    /// Register a stage with an explicit descriptor.
    pub fn register_with(&mut self, descriptor: StageDescriptor, stage: Arc<dyn Stage>) {
        self.stages.insert(descriptor.kind, RegisteredStage { descriptor, stage });
    }

    pub fn get(&self, kind: StageKind) -> Option<&RegisteredStage> {
        self.stages.get(&kind)
    }

    pub fn has(&self, kind: StageKind) -> bool {
        self.stages.contains_key(&kind)
    }

    /// Check that every declared dependency refers to a registered stage.
    pub fn validate(&self) -> Result<()> {
        for registered in self.stages.values() {
            for dep in &registered.descriptor.dependencies {
                if !self.stages.contains_key(dep) {
                    return Err(CadenceError::UnknownStage { stage: *dep });
                }
            }
        }
        Ok(())
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Built-in stages
// ---------------------------------------------------------------------------

/// No-op stage that completes immediately. Backs the default registry so
/// wiring can be exercised without real stage content.
pub struct NoopStage {
    kind: StageKind,
}

impl NoopStage {
    pub fn new(kind: StageKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl Stage for NoopStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn execute(&self, _state: &WorkflowState) -> Result<StageUpdate> {
        Ok(StageUpdate::completed(format!("{} completed", self.kind)))
    }
}

// ---------------------------------------------------------------------------
// Default registry factories
// ---------------------------------------------------------------------------

/// Registry with a no-op implementation for each work stage kind.
pub fn default_registry() -> StageRegistry {
    let mut reg = StageRegistry::new();
    reg.register(NoopStage::new(StageKind::Coordinator));
    reg.register(NoopStage::new(StageKind::Backend));
    reg.register(NoopStage::new(StageKind::Frontend));
    reg.register(NoopStage::new(StageKind::Technical));
    reg.register(NoopStage::new(StageKind::Qa));
    reg.register(NoopStage::new(StageKind::Documentation));
    reg
}

/// Default registry plus a checkpoint gate backed by the given approval
/// signal. Use this when the transition table routes into `HumanReview`.
pub fn default_registry_with_signal(
    signal: Arc<dyn crate::gate::ApprovalSignal>,
) -> StageRegistry {
    let mut reg = default_registry();
    reg.register(crate::gate::CheckpointGate::new(signal));
    reg
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_get_stage() {
        let mut reg = StageRegistry::new();
        reg.register(NoopStage::new(StageKind::Qa));
        assert!(reg.has(StageKind::Qa));
        assert!(reg.get(StageKind::Qa).is_some());
        assert!(!reg.has(StageKind::Backend));
        assert!(reg.get(StageKind::Backend).is_none());
    }

    #[test]
    fn default_registry_has_all_work_stages() {
        let reg = default_registry();
        for kind in [
            StageKind::Coordinator,
            StageKind::Backend,
            StageKind::Frontend,
            StageKind::Technical,
            StageKind::Qa,
            StageKind::Documentation,
        ] {
            assert!(reg.has(kind), "missing {kind}");
        }
        assert!(!reg.has(StageKind::Checkpoint));
    }

    #[test]
    fn validate_flags_missing_dependency() {
        let mut reg = StageRegistry::new();
        let descriptor = StageDescriptor::new(StageKind::Qa)
            .with_dependencies(vec![StageKind::Backend]);
        reg.register_with(descriptor, Arc::new(NoopStage::new(StageKind::Qa)));

        let err = reg.validate().unwrap_err();
        assert!(matches!(
            err,
            CadenceError::UnknownStage {
                stage: StageKind::Backend
            }
        ));
    }

    #[test]
    fn validate_passes_when_dependencies_registered() {
        let mut reg = StageRegistry::new();
        reg.register(NoopStage::new(StageKind::Backend));
        let descriptor = StageDescriptor::new(StageKind::Qa)
            .with_dependencies(vec![StageKind::Backend]);
        reg.register_with(descriptor, Arc::new(NoopStage::new(StageKind::Qa)));
        assert!(reg.validate().is_ok());
    }

    #[test]
    fn descriptor_builder_overrides() {
        let d = StageDescriptor::new(StageKind::Backend)
            .with_timeout(Duration::from_secs(5))
            .with_max_retries(2);
        assert_eq!(d.name, "backend");
        assert_eq!(d.timeout, Some(Duration::from_secs(5)));
        assert_eq!(d.max_retries, Some(2));
    }

    #[tokio::test]
    async fn noop_stage_completes() {
        let stage = NoopStage::new(StageKind::Coordinator);
        let state = WorkflowState::new("t");
        let update = stage.execute(&state).await.unwrap();
        assert_eq!(update.verdict, cadence_types::StageVerdict::Completed);
        assert!(update.notes.contains("coordinator"));
    }
}

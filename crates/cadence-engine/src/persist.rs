//! Workflow state persistence.
//!
//! The driver writes the state after every step so external observers always
//! see the latest snapshot and a crashed run can resume from disk. Exactly
//! one driver instance writes a given task's record, so no write-write race
//! exists; readers must tolerate last-complete-write-wins semantics.

use std::path::PathBuf;

use async_trait::async_trait;

use cadence_types::{CadenceError, Result, WorkflowState};

/// Persistence sink for per-task workflow state.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Persist the latest snapshot for a task.
    async fn write_status(&self, task_id: &str, state: &WorkflowState) -> Result<()>;

    /// Load the latest snapshot, or `None` when the task has never run.
    async fn load_status(&self, task_id: &str) -> Result<Option<WorkflowState>>;

    /// Remove the persisted snapshot for a task.
    async fn clear_status(&self, task_id: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// JsonStatusStore
// ---------------------------------------------------------------------------

/// File-backed store: one pretty-printed JSON file per task under `root`.
pub struct JsonStatusStore {
    root: PathBuf,
}

impl JsonStatusStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        self.root.join(format!("{task_id}.json"))
    }
}

#[async_trait]
impl StatusStore for JsonStatusStore {
    async fn write_status(&self, task_id: &str, state: &WorkflowState) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path_for(task_id);
        let json = serde_json::to_string_pretty(state)?;
        tokio::fs::write(&path, json).await?;
        tracing::debug!(path = %path.display(), task = %task_id, "Status persisted");
        Ok(())
    }

    async fn load_status(&self, task_id: &str) -> Result<Option<WorkflowState>> {
        let path = self.path_for(task_id);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let json = tokio::fs::read_to_string(&path).await?;
        let state: WorkflowState = serde_json::from_str(&json)?;
        Ok(Some(state))
    }

    async fn clear_status(&self, task_id: &str) -> Result<()> {
        let path = self.path_for(task_id);
        if tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryStatusStore
// ---------------------------------------------------------------------------

/// In-memory store for tests and embedded use.
pub struct MemoryStatusStore {
    states: std::sync::Mutex<std::collections::HashMap<String, WorkflowState>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self {
            states: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl Default for MemoryStatusStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn write_status(&self, task_id: &str, state: &WorkflowState) -> Result<()> {
        self.states
            .lock()
            .map_err(|e| CadenceError::Store(e.to_string()))?
            .insert(task_id.to_string(), state.clone());
        Ok(())
    }

    async fn load_status(&self, task_id: &str) -> Result<Option<WorkflowState>> {
        Ok(self
            .states
            .lock()
            .map_err(|e| CadenceError::Store(e.to_string()))?
            .get(task_id)
            .cloned())
    }

    async fn clear_status(&self, task_id: &str) -> Result<()> {
        self.states
            .lock()
            .map_err(|e| CadenceError::Store(e.to_string()))?
            .remove(task_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::TaskStatus;

    #[tokio::test]
    async fn json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStatusStore::new(dir.path());

        let mut state = WorkflowState::new("BE-9");
        state.set_status(TaskStatus::QaPending);
        store.write_status("BE-9", &state).await.unwrap();

        let loaded = store.load_status("BE-9").await.unwrap().unwrap();
        assert_eq!(loaded.task_id, "BE-9");
        assert_eq!(loaded.status, TaskStatus::QaPending);
    }

    #[tokio::test]
    async fn json_store_missing_task_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStatusStore::new(dir.path().join("never_created"));
        assert!(store.load_status("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn json_store_clear_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStatusStore::new(dir.path());

        let state = WorkflowState::new("t");
        store.write_status("t", &state).await.unwrap();
        assert!(dir.path().join("t.json").exists());

        store.clear_status("t").await.unwrap();
        assert!(!dir.path().join("t.json").exists());
        // Clearing twice is fine.
        store.clear_status("t").await.unwrap();
    }

    #[tokio::test]
    async fn json_store_overwrites_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStatusStore::new(dir.path());

        let mut state = WorkflowState::new("t");
        store.write_status("t", &state).await.unwrap();
        state.set_status(TaskStatus::Done);
        store.write_status("t", &state).await.unwrap();

        let loaded = store.load_status("t").await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryStatusStore::new();
        let state = WorkflowState::new("t");
        store.write_status("t", &state).await.unwrap();
        assert!(store.load_status("t").await.unwrap().is_some());
        store.clear_status("t").await.unwrap();
        assert!(store.load_status("t").await.unwrap().is_none());
    }
}

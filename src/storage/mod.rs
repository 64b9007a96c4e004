// apiflow — Workflow and execution persistence

pub mod file;

use crate::workflow::{Workflow, WorkflowExecution};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to (de)serialize record: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Storage trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert or replace an execution record (keyed by execution id).
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), StorageError>;
    /// All executions of a workflow, oldest first.
    async fn load_executions_by_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<WorkflowExecution>, StorageError>;
    async fn load_workflows(&self) -> Result<Vec<Workflow>, StorageError>;
    /// Insert or replace a workflow (keyed by workflow id).
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StorageError>;
}

// ---------------------------------------------------------------------------
// In-memory storage
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MemoryStorage {
    executions: Arc<RwLock<HashMap<String, WorkflowExecution>>>,
    workflows: Arc<RwLock<HashMap<String, Workflow>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn execution(&self, id: &str) -> Option<WorkflowExecution> {
        self.executions.read().await.get(id).cloned()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), StorageError> {
        self.executions
            .write()
            .await
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn load_executions_by_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<WorkflowExecution>, StorageError> {
        let mut found: Vec<WorkflowExecution> = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect();
        found.sort_by_key(|e| e.started_at);
        Ok(found)
    }

    async fn load_workflows(&self) -> Result<Vec<Workflow>, StorageError> {
        let mut all: Vec<Workflow> = self.workflows.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StorageError> {
        self.workflows
            .write()
            .await
            .insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }
}

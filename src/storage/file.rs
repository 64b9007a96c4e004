// apiflow — File-backed storage (one JSON document per record)
//
// Layout:
//   <root>/workflows/<workflow-id>.json
//   <root>/executions/<workflow-id>/<execution-id>.json

use super::{Storage, StorageError};
use crate::workflow::{Workflow, WorkflowExecution};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn workflows_dir(&self) -> PathBuf {
        self.root.join("workflows")
    }

    fn executions_dir(&self, workflow_id: &str) -> PathBuf {
        self.root.join("executions").join(safe_name(workflow_id))
    }
}

/// Percent-encode `key` into a single path component. Distinct keys always
/// map to distinct names, and `.`/`..` can never escape the directory.
fn safe_name(key: &str) -> String {
    url::form_urlencoded::byte_serialize(key.as_bytes())
        .collect::<String>()
        .replace('.', "%2E")
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // Atomic write: write to a per-call temp file then rename, so concurrent
    // saves of the same record never share a temp path.
    let tmp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    let content = serde_json::to_string_pretty(value)?;
    tokio::fs::write(&tmp_path, &content).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

async fn read_dir_json<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StorageError> {
    let mut out = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let content = tokio::fs::read_to_string(&path).await?;
        match serde_json::from_str(&content) {
            Ok(record) => out.push(record),
            Err(e) => tracing::warn!(path = %path.display(), "Skipping unreadable record: {}", e),
        }
    }
    Ok(out)
}

#[async_trait]
impl Storage for FileStorage {
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), StorageError> {
        let path = self
            .executions_dir(&execution.workflow_id)
            .join(format!("{}.json", safe_name(&execution.id)));
        write_json(&path, execution).await
    }

    async fn load_executions_by_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<WorkflowExecution>, StorageError> {
        let mut found: Vec<WorkflowExecution> =
            read_dir_json(&self.executions_dir(workflow_id)).await?;
        found.retain(|e| e.workflow_id == workflow_id);
        found.sort_by_key(|e| e.started_at);
        Ok(found)
    }

    async fn load_workflows(&self) -> Result<Vec<Workflow>, StorageError> {
        let mut all: Vec<Workflow> = read_dir_json(&self.workflows_dir()).await?;
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StorageError> {
        let path = self
            .workflows_dir()
            .join(format!("{}.json", safe_name(&workflow.id)));
        write_json(&path, workflow).await
    }
}

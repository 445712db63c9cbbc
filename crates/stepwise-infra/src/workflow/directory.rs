//! Directory-backed workflow reader.
//!
//! Every `*.json`, `*.yaml` and `*.yml` file below the root (recursively) is
//! a candidate definition. The directory is rescanned on every call, so an
//! edited file is picked up by the next request and the engine's hash check
//! can notice the change. Files that fail to parse are skipped with a
//! warning; when two files declare the same id, the first path in sorted
//! order wins.

use std::path::{Path, PathBuf};

use stepwise_core::repository::workflow::WorkflowReader;
use stepwise_types::error::RepositoryError;
use stepwise_types::workflow::{WorkflowDefinition, WorkflowSummary};

/// Reads workflow definitions from a directory tree.
#[derive(Debug, Clone)]
pub struct DirectoryWorkflowReader {
    root: PathBuf,
}

impl DirectoryWorkflowReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Candidate files, sorted by path. A missing root yields none.
    async fn candidate_files(&self) -> Result<Vec<PathBuf>, RepositoryError> {
        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(RepositoryError::Storage(format!("{}: {err}", dir.display()))),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| RepositoryError::Storage(format!("{}: {e}", dir.display())))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| RepositoryError::Storage(format!("{}: {e}", path.display())))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if is_workflow_file(&path) {
                    files.push(path);
                }
            }
        }

        files.sort();
        Ok(files)
    }

    /// Parse every candidate, skipping unparseable files and duplicate ids.
    async fn load_all(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut definitions: Vec<WorkflowDefinition> = Vec::new();
        for path in self.candidate_files().await? {
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| RepositoryError::Storage(format!("{}: {e}", path.display())))?;
            match parse_workflow_file(&path, &content) {
                Ok(definition) => {
                    if definitions.iter().any(|d| d.id == definition.id) {
                        tracing::warn!(?path, workflow_id = %definition.id, "duplicate workflow id, keeping the first");
                        continue;
                    }
                    definitions.push(definition);
                }
                Err(err) => {
                    tracing::warn!(?path, error = %err, "skipping unparseable workflow file");
                }
            }
        }
        Ok(definitions)
    }
}

fn is_workflow_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("json" | "yaml" | "yml")
    )
}

/// Parse a definition, choosing the format from the file extension.
pub fn parse_workflow_file(path: &Path, content: &str) -> Result<WorkflowDefinition, RepositoryError> {
    let parse_error = |message: String| RepositoryError::Parse {
        source_name: path.display().to_string(),
        message,
    };
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(content).map_err(|e| parse_error(e.to_string())),
        Some("yaml" | "yml") => serde_yaml_ng::from_str(content).map_err(|e| parse_error(e.to_string())),
        _ => Err(parse_error("unsupported workflow file extension".to_string())),
    }
}

impl WorkflowReader for DirectoryWorkflowReader {
    async fn get_workflow_by_id(&self, id: &str) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.load_all().await?.into_iter().find(|definition| definition.id == id))
    }

    async fn list_summaries(&self) -> Result<Vec<WorkflowSummary>, RepositoryError> {
        let mut summaries: Vec<WorkflowSummary> = self.load_all().await?.iter().map(WorkflowSummary::from).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }
}

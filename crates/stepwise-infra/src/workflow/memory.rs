use dashmap::DashMap;
use stepwise_core::repository::workflow::WorkflowReader;
use stepwise_types::error::RepositoryError;
use stepwise_types::workflow::{WorkflowDefinition, WorkflowSummary};

/// In-memory workflow reader keyed by workflow id.
#[derive(Debug, Default)]
pub struct MemoryWorkflowReader {
    definitions: DashMap<String, WorkflowDefinition>,
}

impl MemoryWorkflowReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a reader preloaded with `definitions`.
    pub fn with_definitions(definitions: impl IntoIterator<Item = WorkflowDefinition>) -> Self {
        let reader = Self::new();
        for definition in definitions {
            reader.insert(definition);
        }
        reader
    }

    /// Register or replace a definition.
    pub fn insert(&self, definition: WorkflowDefinition) {
        self.definitions.insert(definition.id.clone(), definition);
    }

    pub fn remove(&self, id: &str) -> Option<WorkflowDefinition> {
        self.definitions.remove(id).map(|(_, definition)| definition)
    }
}

impl WorkflowReader for MemoryWorkflowReader {
    async fn get_workflow_by_id(&self, id: &str) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.definitions.get(id).map(|entry| entry.value().clone()))
    }

    async fn list_summaries(&self) -> Result<Vec<WorkflowSummary>, RepositoryError> {
        let mut summaries: Vec<WorkflowSummary> = self
            .definitions
            .iter()
            .map(|entry| WorkflowSummary::from(entry.value()))
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn definition(id: &str, version: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            id: id.to_string(),
            name: id.to_uppercase(),
            description: None,
            version: version.to_string(),
            steps: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn insert_replaces_and_lists_sorted() {
        let reader = MemoryWorkflowReader::with_definitions([definition("b", "1.0.0"), definition("a", "1.0.0")]);
        reader.insert(definition("b", "2.0.0"));

        let ids: Vec<String> = reader.list_summaries().await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(reader.get_workflow_by_id("b").await.unwrap().unwrap().version, "2.0.0");

        reader.remove("a");
        assert!(reader.get_workflow_by_id("a").await.unwrap().is_none());
    }
}

//! Workflow reader trait definition.
//!
//! Definitions are authored elsewhere (files, fixtures) and only ever read by
//! the engine. `stepwise-infra` provides directory-backed and in-memory
//! implementations.

use stepwise_types::error::RepositoryError;
use stepwise_types::workflow::{WorkflowDefinition, WorkflowSummary};

/// Read-only access to workflow definitions.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowReader: Send + Sync {
    /// Get a workflow definition by id. `Ok(None)` when it does not exist.
    fn get_workflow_by_id(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// List summaries of every available workflow, sorted by id.
    fn list_summaries(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowSummary>, RepositoryError>> + Send;
}

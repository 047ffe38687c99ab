use futures::future::BoxFuture;

use crate::error::{ExecutorError, Result};
use crate::types::*;

/// Turns a rendered message into text plus tool-call records.
///
/// Implementations should watch `request.cancel` and return promptly once it
/// fires. The engine makes exactly one call per step.
pub trait AgentExecutor: Send + Sync + 'static {
    fn invoke(
        &self,
        request: AgentRequest,
    ) -> BoxFuture<'_, std::result::Result<AgentResponse, ExecutorError>>;
}

/// Durable storage for workflow runs, keyed by run id.
pub trait RunRepository: Send + Sync + 'static {
    /// Insert or replace the stored record for `run.run_id`.
    fn save(&self, run: &WorkflowRun) -> BoxFuture<'_, Result<()>>;

    /// Load a run by id.
    fn load(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<WorkflowRun>>>;

    /// Summaries ordered by start time, most recent first.
    fn list(&self, limit: usize, offset: usize) -> BoxFuture<'_, Result<Vec<RunSummary>>>;
}

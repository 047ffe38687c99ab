use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use stepflow_core::error::{FlowError, Result};
use stepflow_core::traits::RunRepository;
use stepflow_core::types::{RunId, RunStatusReport, RunSummary, WorkflowRun};

/// Repository that keeps runs in process memory.
#[derive(Default)]
pub struct MemoryRunStore {
    runs: RwLock<HashMap<RunId, WorkflowRun>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunRepository for MemoryRunStore {
    fn save(&self, run: &WorkflowRun) -> BoxFuture<'_, Result<()>> {
        let run = run.clone();
        Box::pin(async move {
            self.runs.write().await.insert(run.run_id.clone(), run);
            Ok(())
        })
    }

    fn load(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<WorkflowRun>>> {
        let run_id = run_id.clone();
        Box::pin(async move { Ok(self.runs.read().await.get(&run_id).cloned()) })
    }

    fn list(&self, limit: usize, offset: usize) -> BoxFuture<'_, Result<Vec<RunSummary>>> {
        Box::pin(async move {
            let runs = self.runs.read().await;
            let mut summaries: Vec<RunSummary> = runs.values().map(WorkflowRun::summary).collect();
            summaries.sort_by(|a, b| {
                b.started_at
                    .cmp(&a.started_at)
                    .then_with(|| a.run_id.cmp(&b.run_id))
            });
            Ok(summaries.into_iter().skip(offset).take(limit).collect())
        })
    }
}

/// Keeps the committed view of every run.
///
/// The scheduler owns the live `WorkflowRun` while it executes and hands the
/// tracker whole snapshots after each step transition. Readers only ever see
/// those snapshots, never a run in the middle of an update. Active runs are
/// served from memory; finished runs come from the repository.
pub struct RunTracker {
    repository: Arc<dyn RunRepository>,
    active: RwLock<HashMap<RunId, WorkflowRun>>,
    persist_each_step: bool,
}

impl RunTracker {
    pub fn new(repository: Arc<dyn RunRepository>) -> Self {
        Self {
            repository,
            active: RwLock::new(HashMap::new()),
            persist_each_step: true,
        }
    }

    /// Tracker over a fresh `MemoryRunStore`.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryRunStore::new()))
    }

    /// Whether each committed snapshot is also saved to the repository.
    pub fn with_persist_each_step(mut self, persist: bool) -> Self {
        self.persist_each_step = persist;
        self
    }

    /// Register a newly created run and persist its initial record.
    pub async fn begin(&self, run: &WorkflowRun) -> Result<()> {
        self.active
            .write()
            .await
            .insert(run.run_id.clone(), run.clone());
        self.repository.save(run).await
    }

    /// Publish a step-level snapshot of a running workflow.
    pub async fn commit(&self, run: &WorkflowRun) {
        self.active
            .write()
            .await
            .insert(run.run_id.clone(), run.clone());

        if self.persist_each_step {
            if let Err(e) = self.repository.save(run).await {
                warn!(run_id = %run.run_id, error = %e, "Failed to persist run snapshot");
            }
        }
    }

    /// Store a run that has reached a terminal state.
    pub async fn record(&self, run: &WorkflowRun) -> Result<()> {
        if !run.status.is_terminal() {
            return Err(FlowError::RunNotTerminal(run.run_id.to_string()));
        }

        self.active
            .write()
            .await
            .insert(run.run_id.clone(), run.clone());
        self.repository.save(run).await?;
        self.active.write().await.remove(&run.run_id);

        debug!(run_id = %run.run_id, status = %run.status, "Recorded run");
        Ok(())
    }

    pub async fn get(&self, run_id: &RunId) -> Result<WorkflowRun> {
        if let Some(run) = self.active.read().await.get(run_id) {
            return Ok(run.clone());
        }
        self.repository
            .load(run_id)
            .await?
            .ok_or_else(|| FlowError::RunNotFound(run_id.to_string()))
    }

    pub async fn status(&self, run_id: &RunId) -> Result<RunStatusReport> {
        Ok(self.get(run_id).await?.status_report())
    }

    /// Run summaries, most recent first.
    pub async fn list(&self, limit: usize, offset: usize) -> Result<Vec<RunSummary>> {
        self.repository.list(limit, offset).await
    }
}

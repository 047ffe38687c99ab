use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

use stepflow_core::config::EngineConfig;
use stepflow_core::error::{FlowError, Result};
use stepflow_core::event::EventBus;
use stepflow_core::traits::{AgentExecutor, RunRepository};
use stepflow_core::types::{
    ChainRequest, RunId, RunInputs, RunStatusReport, RunSummary, Submission, WorkflowRequest,
    WorkflowRun,
};

use crate::graph::{ExecutionPlan, PlanLimits};
use crate::scheduler::{Scheduler, SchedulerOptions};
use crate::tracker::RunTracker;

/// Page size used when history is requested without a limit.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

struct ActiveRun {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Entry point for transports: submit workflows, cancel them and query runs.
///
/// Submissions are validated synchronously; a rejected workflow never gets a
/// run id. Accepted runs execute on their own task.
pub struct WorkflowService {
    scheduler: Arc<Scheduler>,
    limits: PlanLimits,
    active: Arc<Mutex<HashMap<RunId, ActiveRun>>>,
}

impl WorkflowService {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler: Arc::new(scheduler),
            limits: PlanLimits::default(),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wire a service from engine settings.
    pub fn from_config(
        config: &EngineConfig,
        executor: Arc<dyn AgentExecutor>,
        repository: Arc<dyn RunRepository>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let tracker = RunTracker::new(repository).with_persist_each_step(config.persist_each_step);
        let scheduler = Scheduler::new(executor, Arc::new(tracker))
            .with_event_bus(event_bus)
            .with_options(SchedulerOptions::from(config));
        Self::new(scheduler).with_limits(PlanLimits::from(config))
    }

    pub fn with_limits(mut self, limits: PlanLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn tracker(&self) -> &Arc<RunTracker> {
        self.scheduler.tracker()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        self.scheduler.event_bus()
    }

    /// Validate a request and build its plan without running anything.
    pub fn plan(&self, request: WorkflowRequest) -> Result<ExecutionPlan> {
        Ok(ExecutionPlan::build(request.into_definition(), self.limits)?)
    }

    /// Validate and start a workflow, returning as soon as it is accepted.
    pub async fn submit(&self, request: WorkflowRequest) -> Result<Submission> {
        self.submit_with_inputs(request, RunInputs::new()).await
    }

    pub async fn submit_with_inputs(
        &self,
        request: WorkflowRequest,
        inputs: RunInputs,
    ) -> Result<Submission> {
        let plan = self.plan(request)?;
        let run = WorkflowRun::new(plan.definition());
        self.tracker().begin(&run).await?;

        let submission = Submission {
            run_id: run.run_id.clone(),
            status: run.status,
        };
        info!(
            run_id = %run.run_id,
            workflow = %run.workflow_name,
            steps = plan.len(),
            "Workflow accepted"
        );

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        self.active.lock().await.insert(
            run.run_id.clone(),
            ActiveRun {
                cancel: cancel.clone(),
                done: done_rx,
            },
        );

        let scheduler = self.scheduler.clone();
        let active = self.active.clone();
        tokio::spawn(async move {
            let run = scheduler.execute(&plan, run, inputs, cancel).await;
            active.lock().await.remove(&run.run_id);
            let _ = done_tx.send(true);
        });

        Ok(submission)
    }

    /// Validate and run a workflow to completion on the caller's task.
    pub async fn execute(&self, request: WorkflowRequest, inputs: RunInputs) -> Result<WorkflowRun> {
        let submission = self.submit_with_inputs(request, inputs).await?;
        self.wait(&submission.run_id).await
    }

    /// Run the same message through a list of agents.
    pub async fn submit_chain(&self, chain: ChainRequest) -> Result<Submission> {
        self.submit(chain.into_request()).await
    }

    /// Wait until a run is terminal and return it.
    pub async fn wait(&self, run_id: &RunId) -> Result<WorkflowRun> {
        let done = self
            .active
            .lock()
            .await
            .get(run_id)
            .map(|active| active.done.clone());
        if let Some(mut done) = done {
            // A closed channel means the task ended; the tracker has the result.
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.tracker().get(run_id).await
    }

    /// Request cancellation of an active run.
    ///
    /// Returns `false` when the run exists but has already finished.
    pub async fn cancel(&self, run_id: &RunId) -> Result<bool> {
        if let Some(active) = self.active.lock().await.get(run_id) {
            info!(run_id = %run_id, "Cancelling workflow run");
            active.cancel.cancel();
            return Ok(true);
        }
        let run = self.tracker().get(run_id).await?;
        if run.status.is_terminal() {
            Ok(false)
        } else {
            Err(FlowError::RunNotFound(run_id.to_string()))
        }
    }

    pub async fn status(&self, run_id: &RunId) -> Result<RunStatusReport> {
        self.tracker().status(run_id).await
    }

    /// The full run: outputs, tool calls and error messages.
    pub async fn details(&self, run_id: &RunId) -> Result<WorkflowRun> {
        self.tracker().get(run_id).await
    }

    /// Run summaries, most recent first.
    pub async fn history(&self, limit: Option<usize>, offset: usize) -> Result<Vec<RunSummary>> {
        self.tracker()
            .list(limit.unwrap_or(DEFAULT_HISTORY_LIMIT), offset)
            .await
    }
}

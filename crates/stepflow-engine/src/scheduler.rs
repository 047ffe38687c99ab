use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stepflow_core::config::EngineConfig;
use stepflow_core::error::{format_duration, ExecutorError};
use stepflow_core::event::EventBus;
use stepflow_core::traits::AgentExecutor;
use stepflow_core::types::{
    AgentRequest, AgentResponse, FlowEvent, RunInputs, RunStatus, StepStatus, WorkflowRun,
};

use crate::context::ExecutionContext;
use crate::graph::ExecutionPlan;
use crate::tracker::RunTracker;

/// Runtime limits for a run.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Overall deadline for the run.
    pub run_timeout: Option<Duration>,
    /// Deadline for each agent call.
    pub step_timeout: Option<Duration>,
    /// Cap on concurrently running steps in parallel mode.
    pub max_parallelism: Option<usize>,
    /// How long in-flight calls get to wind down after cancellation.
    pub cancel_grace: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            run_timeout: None,
            step_timeout: None,
            max_parallelism: None,
            cancel_grace: Duration::from_secs(2),
        }
    }
}

impl From<&EngineConfig> for SchedulerOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            run_timeout: config.run_timeout(),
            step_timeout: config.step_timeout(),
            max_parallelism: config.parallelism_limit(),
            cancel_grace: config.cancel_grace(),
        }
    }
}

/// Drives a planned workflow to a terminal state.
///
/// Sequential runs use a single execution unit and stop at the first failure.
/// Parallel runs launch every step whose dependencies have all succeeded and
/// skip everything downstream of a failure, while independent branches keep
/// going.
pub struct Scheduler {
    executor: Arc<dyn AgentExecutor>,
    tracker: Arc<RunTracker>,
    event_bus: Arc<EventBus>,
    options: SchedulerOptions,
}

impl Scheduler {
    pub fn new(executor: Arc<dyn AgentExecutor>, tracker: Arc<RunTracker>) -> Self {
        Self {
            executor,
            tracker,
            event_bus: Arc::new(EventBus::default()),
            options: SchedulerOptions::default(),
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn with_options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn tracker(&self) -> &Arc<RunTracker> {
        &self.tracker
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Create a run for the plan, execute it and return the terminal run.
    pub async fn run(&self, plan: &ExecutionPlan, inputs: RunInputs) -> WorkflowRun {
        let run = WorkflowRun::new(plan.definition());
        if let Err(e) = self.tracker.begin(&run).await {
            warn!(run_id = %run.run_id, error = %e, "Failed to persist new run");
        }
        self.execute(plan, run, inputs, CancellationToken::new())
            .await
    }

    /// Execute a run that has already been registered with the tracker.
    ///
    /// Firing `cancel` stops dispatch and cancels in-flight calls. The run
    /// always comes back terminal.
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        run: WorkflowRun,
        inputs: RunInputs,
        cancel: CancellationToken,
    ) -> WorkflowRun {
        let mut execution = Execution::new(self, plan, run, inputs, &cancel);
        execution.start().await;
        let interrupt = execution.drive(&cancel).await;
        if let Some(interrupt) = interrupt {
            execution.interrupt(interrupt).await;
        }
        execution.finish().await
    }
}

#[derive(Debug, Clone, Copy)]
enum Interrupt {
    Cancelled,
    TimedOut,
}

type UnitOutcome = Result<AgentResponse, ExecutorError>;

const UNIT_LOST: &str = "execution unit terminated unexpectedly";

/// Mutable state of one run while it executes. Only the coordinating task
/// touches it; execution units hand their results back through the join set.
struct Execution<'a> {
    scheduler: &'a Scheduler,
    plan: &'a ExecutionPlan,
    run: WorkflowRun,
    context: ExecutionContext,
    units: JoinSet<(usize, UnitOutcome)>,
    /// Step index of each live unit, for units that fail to join.
    unit_steps: HashMap<task::Id, usize>,
    in_flight: usize,
    limit: usize,
    parallel: bool,
    /// First failed step in sequential mode.
    halted_by: Option<usize>,
    /// Token handed to agents; fires on explicit cancel or deadline.
    cancel: CancellationToken,
    deadline: Option<Instant>,
    started: Instant,
}

impl<'a> Execution<'a> {
    fn new(
        scheduler: &'a Scheduler,
        plan: &'a ExecutionPlan,
        run: WorkflowRun,
        inputs: RunInputs,
        cancel: &CancellationToken,
    ) -> Self {
        let parallel = plan.is_parallel();
        let limit = if parallel {
            scheduler.options.max_parallelism.unwrap_or(usize::MAX).max(1)
        } else {
            1
        };

        Self {
            scheduler,
            plan,
            run,
            context: ExecutionContext::with_inputs(inputs),
            units: JoinSet::new(),
            unit_steps: HashMap::new(),
            in_flight: 0,
            limit,
            parallel,
            halted_by: None,
            cancel: cancel.child_token(),
            deadline: scheduler.options.run_timeout.map(|d| Instant::now() + d),
            started: Instant::now(),
        }
    }

    async fn start(&mut self) {
        self.run.status = RunStatus::Running;
        self.scheduler.tracker.commit(&self.run).await;

        info!(
            run_id = %self.run.run_id,
            workflow = %self.run.workflow_name,
            steps = self.run.steps.len(),
            parallel = self.parallel,
            "Workflow run started"
        );
        self.scheduler.event_bus.publish(FlowEvent::RunStarted {
            run_id: self.run.run_id.clone(),
            workflow_name: self.run.workflow_name.clone(),
            step_count: self.run.steps.len(),
            parallel: self.parallel,
        });
    }

    /// Dispatch and collect until nothing is left to run, or until the run
    /// is cancelled or its deadline passes.
    async fn drive(&mut self, cancel: &CancellationToken) -> Option<Interrupt> {
        loop {
            if cancel.is_cancelled() {
                return Some(Interrupt::Cancelled);
            }
            if self.deadline.is_some_and(|d| Instant::now() >= d) {
                return Some(Interrupt::TimedOut);
            }

            if self.dispatch() {
                self.scheduler.tracker.commit(&self.run).await;
            }
            if self.units.is_empty() {
                return None;
            }

            let deadline = self.deadline;
            let joined = tokio::select! {
                _ = cancel.cancelled() => return Some(Interrupt::Cancelled),
                _ = wait_until(deadline) => return Some(Interrupt::TimedOut),
                joined = self.units.join_next_with_id() => joined,
            };

            match joined {
                Some(Ok((id, (index, outcome)))) => {
                    self.unit_steps.remove(&id);
                    self.in_flight = self.in_flight.saturating_sub(1);
                    self.complete(index, outcome);
                    self.scheduler.tracker.commit(&self.run).await;
                }
                Some(Err(e)) => {
                    self.in_flight = self.in_flight.saturating_sub(1);
                    error!(run_id = %self.run.run_id, error = %e, "Execution unit failed to join");
                    if let Some(index) = self.unit_steps.remove(&e.id()) {
                        self.lose(index);
                        self.scheduler.tracker.commit(&self.run).await;
                    }
                }
                None => return None,
            }
        }
    }

    /// One pass over the plan order: skip steps behind a failure and launch
    /// every step whose dependencies all succeeded, up to the limit.
    /// Returns whether any step changed state.
    fn dispatch(&mut self) -> bool {
        let mut changed = false;

        for &index in self.plan.order() {
            if self.halted_by.is_some() {
                break;
            }
            if self.run.steps[index].status != StepStatus::Pending {
                continue;
            }

            let deps = self.plan.dependencies(index);
            if let Some(&blocker) = deps.iter().find(|&&d| {
                matches!(
                    self.run.steps[d].status,
                    StepStatus::Failed | StepStatus::Skipped
                )
            }) {
                let reason = match self.run.steps[blocker].status {
                    StepStatus::Skipped => format!(
                        "dependency '{}' was skipped",
                        self.run.steps[blocker].step_name
                    ),
                    _ => format!("dependency '{}' failed", self.run.steps[blocker].step_name),
                };
                self.skip(index, reason);
                changed = true;
                continue;
            }

            if !deps
                .iter()
                .all(|&d| self.run.steps[d].status == StepStatus::Succeeded)
            {
                continue;
            }
            if self.in_flight >= self.limit {
                continue;
            }

            let step = self.plan.step(index);
            match self.plan.template(index).render(&step.depends_on, &self.context) {
                Ok(message) => self.launch(index, message),
                Err(e) => {
                    warn!(
                        run_id = %self.run.run_id,
                        step = %step.step_name,
                        error = %e,
                        "Step message could not be rendered"
                    );
                    self.fail(index, e.to_string());
                }
            }
            changed = true;
        }

        changed
    }

    fn launch(&mut self, index: usize, message: String) {
        let step = self.plan.step(index);
        self.run.steps[index].start(message.clone());

        info!(
            run_id = %self.run.run_id,
            step = %step.step_name,
            agent = %step.agent_ref,
            "Step started"
        );
        self.scheduler.event_bus.publish(FlowEvent::StepStarted {
            run_id: self.run.run_id.clone(),
            step_name: step.step_name.clone(),
            agent_ref: step.agent_ref.clone(),
        });

        let step_timeout = self.scheduler.options.step_timeout;
        let call_deadline = match (self.deadline, step_timeout) {
            (Some(run), Some(step)) => Some(run.min(Instant::now() + step)),
            (Some(run), None) => Some(run),
            (None, Some(step)) => Some(Instant::now() + step),
            (None, None) => None,
        };
        let request = AgentRequest {
            run_id: self.run.run_id.clone(),
            step_name: step.step_name.clone(),
            agent_ref: step.agent_ref.clone(),
            message,
            deadline: call_deadline,
            cancel: self.cancel.clone(),
        };

        let executor = self.scheduler.executor.clone();
        let handle = self.units.spawn(async move {
            let outcome = AssertUnwindSafe(invoke(executor, request, step_timeout))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(ExecutorError::new(format!(
                        "agent panicked: {}",
                        panic_message(panic.as_ref())
                    )))
                });
            (index, outcome)
        });
        self.unit_steps.insert(handle.id(), index);
        self.in_flight += 1;
    }

    fn complete(&mut self, index: usize, outcome: UnitOutcome) {
        if self.run.steps[index].status != StepStatus::Running {
            return;
        }

        match outcome {
            Ok(response) => {
                let name = self.run.steps[index].step_name.clone();
                if let Err(e) = self.context.publish(&name, response.output.clone()) {
                    warn!(run_id = %self.run.run_id, error = %e, "Output already published");
                }
                self.run.steps[index].succeed(response.output, response.tool_calls);
                self.emit_finished(index);
            }
            Err(e) => {
                warn!(
                    run_id = %self.run.run_id,
                    step = %self.run.steps[index].step_name,
                    error = %e,
                    "Step failed"
                );
                self.fail(index, e.message);
            }
        }
    }

    /// Fail a step whose execution unit vanished without an outcome.
    fn lose(&mut self, index: usize) {
        if self.run.steps[index].status == StepStatus::Running {
            self.fail(index, UNIT_LOST.to_string());
        }
    }

    fn fail(&mut self, index: usize, message: String) {
        self.run.steps[index].fail(message);
        if !self.parallel && self.halted_by.is_none() {
            self.halted_by = Some(index);
        }
        self.emit_finished(index);
    }

    fn skip(&mut self, index: usize, reason: String) {
        debug!(
            run_id = %self.run.run_id,
            step = %self.run.steps[index].step_name,
            reason = %reason,
            "Step skipped"
        );
        self.scheduler.event_bus.publish(FlowEvent::StepSkipped {
            run_id: self.run.run_id.clone(),
            step_name: self.run.steps[index].step_name.clone(),
            reason: reason.clone(),
        });
        self.run.steps[index].skip(reason);
    }

    fn emit_finished(&self, index: usize) {
        let result = &self.run.steps[index];
        let elapsed_ms = result.elapsed_ms.unwrap_or(0);
        debug!(
            run_id = %self.run.run_id,
            step = %result.step_name,
            status = %result.status,
            elapsed_ms,
            "Step finished"
        );
        self.scheduler.event_bus.publish(FlowEvent::StepFinished {
            run_id: self.run.run_id.clone(),
            step_name: result.step_name.clone(),
            status: result.status,
            elapsed_ms,
            error: result.error_message.clone(),
        });
    }

    /// Cancel in-flight calls and give them the grace period. Steps that
    /// still succeed inside it keep their result; every step that is not
    /// terminal afterwards is forced into `Failed`.
    async fn interrupt(&mut self, interrupt: Interrupt) {
        let message = match interrupt {
            Interrupt::Cancelled => "workflow run cancelled".to_string(),
            Interrupt::TimedOut => format!(
                "workflow run timed out after {}",
                format_duration(self.scheduler.options.run_timeout.unwrap_or_default())
            ),
        };
        warn!(run_id = %self.run.run_id, reason = %message, "Workflow run interrupted");

        self.cancel.cancel();
        let grace = tokio::time::sleep(self.scheduler.options.cancel_grace);
        tokio::pin!(grace);
        loop {
            tokio::select! {
                _ = &mut grace => break,
                joined = self.units.join_next_with_id() => match joined {
                    Some(Ok((id, (index, Ok(response))))) => {
                        self.unit_steps.remove(&id);
                        self.complete(index, Ok(response));
                    }
                    Some(Ok((id, (_, Err(_))))) => {
                        self.unit_steps.remove(&id);
                    }
                    Some(Err(e)) => {
                        self.unit_steps.remove(&e.id());
                    }
                    None => break,
                }
            }
        }
        self.units.shutdown().await;
        self.unit_steps.clear();
        self.in_flight = 0;

        for index in 0..self.run.steps.len() {
            if !self.run.steps[index].status.is_terminal() {
                self.run.steps[index].fail(message.clone());
                self.emit_finished(index);
            }
        }
        self.run.error = Some(message);
    }

    async fn finish(mut self) -> WorkflowRun {
        if let Some(failed) = self.halted_by {
            let reason = format!(
                "workflow halted after step '{}' failed",
                self.run.steps[failed].step_name
            );
            for index in 0..self.run.steps.len() {
                if self.run.steps[index].status == StepStatus::Pending {
                    self.skip(index, reason.clone());
                }
            }
        }

        // Units lost to a join error leave their steps unresolved.
        for index in 0..self.run.steps.len() {
            if !self.run.steps[index].status.is_terminal() {
                self.run.steps[index].fail(UNIT_LOST);
                self.emit_finished(index);
            }
        }

        let total = self.run.steps.len();
        let succeeded = self.run.count(StepStatus::Succeeded);
        let failed = self.run.count(StepStatus::Failed);

        self.run.status = if succeeded == total {
            RunStatus::Succeeded
        } else if self.parallel && succeeded > 0 {
            RunStatus::PartiallyFailed
        } else {
            RunStatus::Failed
        };

        if self.run.error.is_none() && self.run.status != RunStatus::Succeeded {
            self.run.error = Some(match self.halted_by {
                Some(index) => {
                    let step = &self.run.steps[index];
                    format!(
                        "step '{}' failed: {}",
                        step.step_name,
                        step.error_message.as_deref().unwrap_or("unknown error")
                    )
                }
                None => format!("{} of {} steps failed", failed, total),
            });
        }

        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        self.run.completed_at = Some(Utc::now());
        self.run.total_elapsed_ms = Some(elapsed_ms);

        info!(
            run_id = %self.run.run_id,
            status = %self.run.status,
            succeeded,
            failed,
            skipped = self.run.count(StepStatus::Skipped),
            elapsed_ms,
            "Workflow run finished"
        );
        self.scheduler.event_bus.publish(FlowEvent::RunFinished {
            run_id: self.run.run_id.clone(),
            status: self.run.status,
            total_elapsed_ms: elapsed_ms,
            error: self.run.error.clone(),
        });

        if let Err(e) = self.scheduler.tracker.record(&self.run).await {
            error!(run_id = %self.run.run_id, error = %e, "Failed to record finished run");
        }
        self.run
    }
}

async fn invoke(
    executor: Arc<dyn AgentExecutor>,
    request: AgentRequest,
    step_timeout: Option<Duration>,
) -> UnitOutcome {
    match step_timeout {
        Some(limit) => match tokio::time::timeout(limit, executor.invoke(request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ExecutorError::timeout(limit)),
        },
        None => executor.invoke(request).await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => futures::future::pending().await,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique workflow run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Definitions ─────────────────────────────────────────────────

/// One step of a workflow, bound to a single agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub step_name: String,
    pub agent_ref: String,
    pub message_template: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl StepDefinition {
    pub fn new(
        step_name: impl Into<String>,
        agent_ref: impl Into<String>,
        message_template: impl Into<String>,
    ) -> Self {
        Self {
            step_name: step_name.into(),
            agent_ref: agent_ref.into(),
            message_template: message_template.into(),
            depends_on: vec![],
        }
    }

    /// Set the dependencies, collapsing duplicates in first-seen order.
    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = dedup(deps.into_iter().map(Into::into));
        self
    }
}

/// An immutable workflow as handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub parallel_execution: bool,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<StepDefinition>, parallel_execution: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            steps,
            parallel_execution,
        }
    }
}

/// A step as submitted by a caller. The name is optional and defaults to
/// `step_{n}` by position.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepRequest {
    #[serde(default)]
    pub step_name: Option<String>,
    #[serde(alias = "agent_id", alias = "agent")]
    pub agent_ref: String,
    pub message: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Submission payload for a multi-step workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowRequest {
    #[serde(default, alias = "name")]
    pub workflow_name: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepRequest>,
    #[serde(default)]
    pub parallel_execution: bool,
}

impl WorkflowRequest {
    /// Normalise the request into a definition. Structural checks happen when
    /// the definition is planned, not here.
    pub fn into_definition(self) -> WorkflowDefinition {
        let steps = self
            .steps
            .into_iter()
            .enumerate()
            .map(|(i, step)| StepDefinition {
                step_name: step
                    .step_name
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| format!("step_{}", i + 1)),
                agent_ref: step.agent_ref,
                message_template: step.message,
                depends_on: dedup(step.depends_on.into_iter()),
            })
            .collect();

        WorkflowDefinition::new(
            self.workflow_name
                .unwrap_or_else(|| "Multi-Step Workflow".to_string()),
            steps,
            self.parallel_execution,
        )
    }
}

/// Flat chain of agents that all receive the same message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainRequest {
    #[serde(alias = "agent_ids")]
    pub agent_refs: Vec<String>,
    pub message: String,
    #[serde(default)]
    pub workflow_name: Option<String>,
    #[serde(default)]
    pub parallel_execution: bool,
}

impl ChainRequest {
    /// Expand into an explicit workflow request. Sequential chains make each
    /// step depend on every earlier one; parallel chains have no edges.
    pub fn into_request(self) -> WorkflowRequest {
        let count = self.agent_refs.len();
        let steps = self
            .agent_refs
            .into_iter()
            .enumerate()
            .map(|(i, agent_ref)| StepRequest {
                step_name: Some(format!("step_{}", i + 1)),
                agent_ref,
                message: self.message.clone(),
                depends_on: if self.parallel_execution {
                    vec![]
                } else {
                    (1..=i).map(|j| format!("step_{}", j)).collect()
                },
            })
            .collect();

        WorkflowRequest {
            workflow_name: Some(
                self.workflow_name
                    .unwrap_or_else(|| format!("Simple Chain - {} agents", count)),
            ),
            steps,
            parallel_execution: self.parallel_execution,
        }
    }
}

fn dedup(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

// ── Runs ────────────────────────────────────────────────────────

/// Lifecycle of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    PartiallyFailed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::PartiallyFailed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::PartiallyFailed => "partially_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            "partially_failed" => Some(RunStatus::PartiallyFailed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Lifecycle of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// A tool invocation reported by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    #[serde(default)]
    pub result: String,
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,
    pub agent_ref: String,
    pub status: StepStatus,
    /// The rendered message actually sent to the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StepResult {
    pub fn pending(step: &StepDefinition) -> Self {
        Self {
            step_name: step.step_name.clone(),
            agent_ref: step.agent_ref.clone(),
            status: StepStatus::Pending,
            input: None,
            output: None,
            tool_calls: vec![],
            started_at: None,
            finished_at: None,
            elapsed_ms: None,
            error_message: None,
        }
    }

    /// Pending -> Running.
    pub fn start(&mut self, input: String) {
        self.status = StepStatus::Running;
        self.input = Some(input);
        self.started_at = Some(Utc::now());
    }

    /// Running -> Succeeded.
    pub fn succeed(&mut self, output: String, tool_calls: Vec<ToolCallRecord>) {
        self.status = StepStatus::Succeeded;
        self.output = Some(output);
        self.tool_calls = tool_calls;
        self.finish();
    }

    /// Pending or Running -> Failed. A step that fails before it starts
    /// (template errors, cancellation) still gets a start timestamp.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.status = StepStatus::Failed;
        self.error_message = Some(message.into());
        self.finish();
    }

    /// Pending -> Skipped. The agent is never called.
    pub fn skip(&mut self, reason: impl Into<String>) {
        self.status = StepStatus::Skipped;
        self.error_message = Some(reason.into());
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.elapsed_ms = self
            .started_at
            .map(|start| (now - start).num_milliseconds().max(0) as u64);
    }
}

/// One execution attempt of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: RunId,
    pub definition_id: String,
    pub workflow_name: String,
    pub parallel_execution: bool,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_elapsed_ms: Option<u64>,
    /// Step results in declaration order, keyed by `step_name`.
    pub steps: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowRun {
    /// Create a run in `Pending` with one pending result per step.
    pub fn new(definition: &WorkflowDefinition) -> Self {
        Self {
            run_id: RunId::new(),
            definition_id: definition.id.clone(),
            workflow_name: definition.name.clone(),
            parallel_execution: definition.parallel_execution,
            status: RunStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            total_elapsed_ms: None,
            steps: definition.steps.iter().map(StepResult::pending).collect(),
            error: None,
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_name == name)
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            workflow_name: self.workflow_name.clone(),
            status: self.status,
            step_count: self.steps.len(),
            succeeded_steps: self.count(StepStatus::Succeeded),
            failed_steps: self.count(StepStatus::Failed),
            skipped_steps: self.count(StepStatus::Skipped),
            started_at: self.started_at,
            completed_at: self.completed_at,
            total_elapsed_ms: self.total_elapsed_ms,
        }
    }

    pub fn status_report(&self) -> RunStatusReport {
        RunStatusReport {
            run_id: self.run_id.clone(),
            status: self.status,
            steps: self
                .steps
                .iter()
                .map(|s| StepStatusEntry {
                    step_name: s.step_name.clone(),
                    status: s.status,
                })
                .collect(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            step_count: self.steps.len(),
            succeeded_steps: self.count(StepStatus::Succeeded),
            failed_steps: self.count(StepStatus::Failed),
            skipped_steps: self.count(StepStatus::Skipped),
        }
    }
}

/// History row for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub workflow_name: String,
    pub status: RunStatus,
    pub step_count: usize,
    pub succeeded_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_elapsed_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStatusEntry {
    pub step_name: String,
    pub status: StepStatus,
}

/// Answer to a status poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusReport {
    pub run_id: RunId,
    pub status: RunStatus,
    pub steps: Vec<StepStatusEntry>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub step_count: usize,
    pub succeeded_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
}

/// Returned by an accepted submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub run_id: RunId,
    pub status: RunStatus,
}

// ── Agent calls ─────────────────────────────────────────────────

/// A single agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub run_id: RunId,
    pub step_name: String,
    pub agent_ref: String,
    pub message: String,
    /// Point after which the call should give up.
    pub deadline: Option<Instant>,
    /// Fires when the run is cancelled or its deadline passes.
    pub cancel: CancellationToken,
}

/// What an agent produced for a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub output: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
}

impl AgentResponse {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            tool_calls: vec![],
        }
    }
}

// ── Events ──────────────────────────────────────────────────────

/// Workflow event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    /// A run entered `Running`.
    RunStarted {
        run_id: RunId,
        workflow_name: String,
        step_count: usize,
        parallel: bool,
    },
    /// A step was handed to its agent.
    StepStarted {
        run_id: RunId,
        step_name: String,
        agent_ref: String,
    },
    /// A step reached `Succeeded` or `Failed`.
    StepFinished {
        run_id: RunId,
        step_name: String,
        status: StepStatus,
        elapsed_ms: u64,
        error: Option<String>,
    },
    /// A step was skipped without calling its agent.
    StepSkipped {
        run_id: RunId,
        step_name: String,
        reason: String,
    },
    /// A run reached a terminal state.
    RunFinished {
        run_id: RunId,
        status: RunStatus,
        total_elapsed_ms: u64,
        error: Option<String>,
    },
}

impl FlowEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            FlowEvent::RunStarted { run_id, .. }
            | FlowEvent::StepStarted { run_id, .. }
            | FlowEvent::StepFinished { run_id, .. }
            | FlowEvent::StepSkipped { run_id, .. }
            | FlowEvent::RunFinished { run_id, .. } => run_id,
        }
    }
}

/// Seed values a run starts with, addressable from templates as `{{input.key}}`.
pub type RunInputs = BTreeMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults_step_names() {
        let request = WorkflowRequest {
            workflow_name: None,
            steps: vec![
                StepRequest {
                    agent_ref: "github".into(),
                    message: "list repos".into(),
                    ..Default::default()
                },
                StepRequest {
                    step_name: Some("notify".into()),
                    agent_ref: "slack".into(),
                    message: "post summary".into(),
                    depends_on: vec!["step_1".into(), "step_1".into()],
                },
            ],
            parallel_execution: false,
        };

        let def = request.into_definition();
        assert_eq!(def.name, "Multi-Step Workflow");
        assert_eq!(def.steps[0].step_name, "step_1");
        assert_eq!(def.steps[1].step_name, "notify");
        assert_eq!(def.steps[1].depends_on, vec!["step_1"]);
    }

    #[test]
    fn test_request_accepts_agent_id_alias() {
        let json = r#"{
            "workflow_name": "Repo review",
            "steps": [{"agent_id": "gh", "message": "hi", "step_name": "a"}]
        }"#;
        let request: WorkflowRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.steps[0].agent_ref, "gh");
        assert!(!request.parallel_execution);
    }

    #[test]
    fn test_sequential_chain_depends_on_all_previous() {
        let chain = ChainRequest {
            agent_refs: vec!["a".into(), "b".into(), "c".into()],
            message: "hello".into(),
            workflow_name: None,
            parallel_execution: false,
        };
        let request = chain.into_request();
        assert_eq!(request.workflow_name.as_deref(), Some("Simple Chain - 3 agents"));
        assert!(request.steps[0].depends_on.is_empty());
        assert_eq!(request.steps[2].depends_on, vec!["step_1", "step_2"]);
        assert!(request.steps.iter().all(|s| s.message == "hello"));
    }

    #[test]
    fn test_parallel_chain_has_no_edges() {
        let chain = ChainRequest {
            agent_refs: vec!["a".into(), "b".into()],
            message: "hello".into(),
            workflow_name: Some("fan out".into()),
            parallel_execution: true,
        };
        let request = chain.into_request();
        assert!(request.parallel_execution);
        assert!(request.steps.iter().all(|s| s.depends_on.is_empty()));
    }

    #[test]
    fn test_new_run_is_pending() {
        let def = WorkflowDefinition::new(
            "wf",
            vec![
                StepDefinition::new("a", "agent", "x"),
                StepDefinition::new("b", "agent", "y").with_depends_on(["a"]),
            ],
            true,
        );
        let run = WorkflowRun::new(&def);
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.count(StepStatus::Pending), 2);
        assert!(run.parallel_execution);
        assert_eq!(run.step("b").unwrap().agent_ref, "agent");
    }

    #[test]
    fn test_step_transitions_record_times() {
        let def = StepDefinition::new("a", "agent", "x");
        let mut result = StepResult::pending(&def);
        result.start("rendered".into());
        assert_eq!(result.status, StepStatus::Running);
        assert!(result.started_at.is_some());

        result.succeed("done".into(), vec![]);
        assert_eq!(result.status, StepStatus::Succeeded);
        assert_eq!(result.output.as_deref(), Some("done"));
        assert!(result.finished_at.is_some());
        assert!(result.elapsed_ms.is_some());
    }

    #[test]
    fn test_skip_never_starts() {
        let def = StepDefinition::new("a", "agent", "x");
        let mut result = StepResult::pending(&def);
        result.skip("dependency 'z' failed");
        assert_eq!(result.status, StepStatus::Skipped);
        assert!(result.started_at.is_none());
        assert!(result.input.is_none());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&RunStatus::PartiallyFailed).unwrap(),
            "\"partially_failed\""
        );
        assert_eq!(RunStatus::parse("partially_failed"), Some(RunStatus::PartiallyFailed));
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn test_summary_counts() {
        let def = WorkflowDefinition::new(
            "wf",
            vec![
                StepDefinition::new("a", "x", "m"),
                StepDefinition::new("b", "x", "m"),
                StepDefinition::new("c", "x", "m"),
            ],
            true,
        );
        let mut run = WorkflowRun::new(&def);
        run.steps[0].start("m".into());
        run.steps[0].succeed("ok".into(), vec![]);
        run.steps[1].fail("boom");
        run.steps[2].skip("dependency 'b' failed");
        run.status = RunStatus::PartiallyFailed;

        let summary = run.summary();
        assert_eq!(summary.step_count, 3);
        assert_eq!(summary.succeeded_steps, 1);
        assert_eq!(summary.failed_steps, 1);
        assert_eq!(summary.skipped_steps, 1);

        let report = run.status_report();
        assert_eq!(report.steps[2].status, StepStatus::Skipped);
    }
}

use std::sync::Arc;

use stepflow_agents::{AgentRegistry, EchoAgent};
use stepflow_core::config::{load_workflow, EngineConfig};
use stepflow_core::error::{FlowError, ValidationError};
use stepflow_core::event::EventBus;
use stepflow_core::traits::RunRepository;
use stepflow_core::types::{RunInputs, RunStatus, StepStatus};
use stepflow_engine::{build_plan, WorkflowService};
use stepflow_store::SqliteRunStore;

const REPORT_TOML: &str = r#"
name = "Weekly report"

[[steps]]
step_name = "fetch"
agent_ref = "github"
message = "list open PRs for {{input.repo}}"

[[steps]]
step_name = "summarize"
agent_ref = "writer"
message = "summarize: {{fetch.output}}"
depends_on = ["fetch"]

[[steps]]
step_name = "post"
agent_ref = "writer"
message = "post it"
depends_on = ["summarize", "summarize"]
"#;

fn write(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).expect("write workflow file");
    path
}

fn registry() -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    registry.register("github", EchoAgent::new(Some("PRs: ".into())));
    registry.register("writer", EchoAgent::default());
    registry
}

#[test]
fn test_toml_workflow_file() {
    let dir = tempfile::tempdir().unwrap();
    let request = load_workflow(&write(&dir, "report.toml", REPORT_TOML)).unwrap();
    assert_eq!(request.workflow_name.as_deref(), Some("Weekly report"));

    let definition = request.into_definition();
    assert_eq!(definition.steps[2].depends_on, vec!["summarize"]);

    let plan = build_plan(definition).unwrap();
    assert_eq!(plan.ordered_names(), vec!["fetch", "summarize", "post"]);
}

#[test]
fn test_json_workflow_file_with_aliases() {
    let dir = tempfile::tempdir().unwrap();
    let json = r#"{
        "workflow_name": "fan-out",
        "parallel_execution": true,
        "steps": [
            {"agent_id": "github", "message": "a"},
            {"agent_id": "writer", "message": "b"}
        ]
    }"#;
    let request = load_workflow(&write(&dir, "fan.JSON", json)).unwrap();
    let definition = request.into_definition();
    assert!(definition.parallel_execution);
    assert_eq!(definition.steps[0].step_name, "step_1");
    assert_eq!(definition.steps[1].agent_ref, "writer");
}

#[test]
fn test_cyclic_workflow_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let toml = r#"
[[steps]]
step_name = "a"
agent_ref = "x"
message = "m"
depends_on = ["b"]

[[steps]]
step_name = "b"
agent_ref = "x"
message = "m"
depends_on = ["a"]
"#;
    let request = load_workflow(&write(&dir, "cycle.toml", toml)).unwrap();
    let err = build_plan(request.into_definition()).unwrap_err();
    assert!(matches!(err, ValidationError::CyclicDependency { .. }));
}

#[test]
fn test_unreadable_workflow_file() {
    let err = load_workflow(std::path::Path::new("/nonexistent/wf.toml")).unwrap_err();
    assert!(matches!(err, FlowError::Io(_)));
}

#[tokio::test]
async fn test_workflow_file_runs_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let request = load_workflow(&write(&dir, "report.toml", REPORT_TOML)).unwrap();
    let db_path = dir.path().join("runs.db");

    let service = WorkflowService::from_config(
        &EngineConfig::default(),
        Arc::new(registry()),
        Arc::new(SqliteRunStore::open(&db_path).unwrap()),
        Arc::new(EventBus::default()),
    );

    let mut inputs = RunInputs::new();
    inputs.insert("repo".into(), "stepflow".into());
    let run = service.execute(request, inputs).await.unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(
        run.step("fetch").unwrap().output.as_deref(),
        Some("PRs: list open PRs for stepflow")
    );
    assert_eq!(
        run.step("summarize").unwrap().input.as_deref(),
        Some("summarize: PRs: list open PRs for stepflow")
    );
    assert_eq!(
        run.step("post").unwrap().input.as_deref(),
        Some("post it\n\nContext from summarize: summarize: PRs: list open PRs for stepflow")
    );

    drop(service);
    let store = SqliteRunStore::open(&db_path).unwrap();
    let stored = store.load(&run.run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Succeeded);
    assert!(stored
        .steps
        .iter()
        .all(|s| s.status == StepStatus::Succeeded));

    let history = store.list(10, 0).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].workflow_name, "Weekly report");
    assert_eq!(history[0].succeeded_steps, 3);
}

#[tokio::test]
async fn test_unknown_agent_fails_its_step() {
    let dir = tempfile::tempdir().unwrap();
    let toml = r#"
[[steps]]
step_name = "only"
agent_ref = "ghost"
message = "hello"
"#;
    let request = load_workflow(&write(&dir, "ghost.toml", toml)).unwrap();
    let service = WorkflowService::from_config(
        &EngineConfig::default(),
        Arc::new(registry()),
        Arc::new(SqliteRunStore::in_memory().unwrap()),
        Arc::new(EventBus::default()),
    );

    let run = service.execute(request, RunInputs::new()).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(
        run.step("only").unwrap().error_message.as_deref(),
        Some("unknown agent 'ghost'")
    );
}

//! Shared test helpers: a scripted agent executor and definition fixtures.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;

use stepflow_core::error::ExecutorError;
use stepflow_core::traits::AgentExecutor;
use stepflow_core::types::{
    AgentRequest, AgentResponse, StepDefinition, ToolCallRecord, WorkflowDefinition,
};

/// What a scripted agent does when called.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Return the rendered message unchanged.
    Echo,
    Reply(String),
    ReplyAfter(Duration, String),
    ReplyWithTools(String, Vec<ToolCallRecord>),
    Fail(String),
    FailAfter(Duration, String),
    /// Block until the cancellation token fires, then report cancellation.
    Hang,
    /// Block forever, ignoring cancellation.
    Stuck,
    Panic(String),
}

/// One recorded call.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub step_name: String,
    pub agent_ref: String,
    pub message: String,
    pub started: Instant,
    pub finished: Option<Instant>,
}

/// Agent executor whose behaviour is scripted per step name or agent ref.
///
/// Lookups try the step name first, then the agent ref, then the default.
pub struct ScriptedAgent {
    scripts: HashMap<String, Behavior>,
    default: Behavior,
    calls: Arc<Mutex<Vec<Invocation>>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            default: Behavior::Echo,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Script a step name or agent ref.
    pub fn with(mut self, key: impl Into<String>, behavior: Behavior) -> Self {
        self.scripts.insert(key.into(), behavior);
        self
    }

    pub fn with_default(mut self, behavior: Behavior) -> Self {
        self.default = behavior;
        self
    }

    /// All calls so far, in start order.
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// The call made for a step, if any.
    pub fn call_for(&self, step_name: &str) -> Option<Invocation> {
        self.calls().into_iter().find(|c| c.step_name == step_name)
    }

    pub fn was_called(&self, step_name: &str) -> bool {
        self.call_for(step_name).is_some()
    }

    fn behavior_for(&self, request: &AgentRequest) -> Behavior {
        self.scripts
            .get(&request.step_name)
            .or_else(|| self.scripts.get(&request.agent_ref))
            .unwrap_or(&self.default)
            .clone()
    }
}

impl Default for ScriptedAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentExecutor for ScriptedAgent {
    fn invoke(
        &self,
        request: AgentRequest,
    ) -> BoxFuture<'_, Result<AgentResponse, ExecutorError>> {
        let behavior = self.behavior_for(&request);
        let index = {
            let mut calls = self.calls.lock().expect("calls lock");
            calls.push(Invocation {
                step_name: request.step_name.clone(),
                agent_ref: request.agent_ref.clone(),
                message: request.message.clone(),
                started: Instant::now(),
                finished: None,
            });
            calls.len() - 1
        };
        let calls = self.calls.clone();

        Box::pin(async move {
            let result = match behavior {
                Behavior::Echo => Ok(AgentResponse::text(request.message.clone())),
                Behavior::Reply(text) => Ok(AgentResponse::text(text)),
                Behavior::ReplyAfter(delay, text) => {
                    tokio::time::sleep(delay).await;
                    Ok(AgentResponse::text(text))
                }
                Behavior::ReplyWithTools(text, tool_calls) => Ok(AgentResponse {
                    output: text,
                    tool_calls,
                }),
                Behavior::Fail(message) => Err(ExecutorError::new(message)),
                Behavior::FailAfter(delay, message) => {
                    tokio::time::sleep(delay).await;
                    Err(ExecutorError::new(message))
                }
                Behavior::Hang => {
                    request.cancel.cancelled().await;
                    Err(ExecutorError::cancelled())
                }
                Behavior::Stuck => futures::future::pending().await,
                Behavior::Panic(message) => panic!("{}", message),
            };

            if let Ok(mut calls) = calls.lock() {
                if let Some(call) = calls.get_mut(index) {
                    call.finished = Some(Instant::now());
                }
            }
            result
        })
    }
}

/// Build a step definition.
pub fn step(name: &str, agent: &str, message: &str, depends_on: &[&str]) -> StepDefinition {
    StepDefinition::new(name, agent, message).with_depends_on(depends_on.iter().copied())
}

/// Build a workflow definition named `test-workflow`.
pub fn definition(steps: Vec<StepDefinition>, parallel: bool) -> WorkflowDefinition {
    WorkflowDefinition::new("test-workflow", steps, parallel)
}

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use stepflow_core::config::AgentConfig;
use stepflow_core::error::ExecutorError;
use stepflow_core::traits::AgentExecutor;
use stepflow_core::types::{AgentRequest, AgentResponse, WorkflowDefinition};

use crate::command::CommandAgent;
use crate::echo::EchoAgent;

/// Resolves `agent_ref` to a registered executor and forwards the call.
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn AgentExecutor>>,
    fallback: Option<Arc<dyn AgentExecutor>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
            fallback: None,
        }
    }

    /// Build a registry from the `[agents.*]` config tables.
    pub fn from_config(agents: &HashMap<String, AgentConfig>) -> Self {
        let mut registry = Self::new();
        for (name, config) in agents {
            match config {
                AgentConfig::Command(cmd) => {
                    registry.register(name.clone(), CommandAgent::new(name.clone(), cmd.clone()))
                }
                AgentConfig::Echo { prefix } => {
                    registry.register(name.clone(), EchoAgent::new(prefix.clone()))
                }
            }
        }
        registry
    }

    /// Register an agent under a reference.
    pub fn register(&mut self, name: impl Into<String>, agent: impl AgentExecutor) {
        self.agents.insert(name.into(), Arc::new(agent));
    }

    /// Executor used for references with no registered agent.
    pub fn with_fallback(mut self, agent: impl AgentExecutor) -> Self {
        self.fallback = Some(Arc::new(agent));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentExecutor>> {
        self.agents
            .get(name)
            .or(self.fallback.as_ref())
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// Registered references, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.agents.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Agent references in a definition that this registry cannot serve.
    pub fn unresolved(&self, definition: &WorkflowDefinition) -> Vec<String> {
        if self.fallback.is_some() {
            return vec![];
        }
        definition
            .steps
            .iter()
            .map(|s| s.agent_ref.as_str())
            .filter(|name| !self.contains(name))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(String::from)
            .collect()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentExecutor for AgentRegistry {
    fn invoke(
        &self,
        request: AgentRequest,
    ) -> BoxFuture<'_, Result<AgentResponse, ExecutorError>> {
        match self.get(&request.agent_ref) {
            Some(agent) => {
                debug!(agent = %request.agent_ref, step = %request.step_name, "Dispatching to agent");
                Box::pin(async move { agent.invoke(request).await })
            }
            None => {
                let message = format!("unknown agent '{}'", request.agent_ref);
                Box::pin(async move { Err(ExecutorError::new(message)) })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow_core::config::CommandAgentConfig;
    use stepflow_core::types::{RunId, StepDefinition};
    use tokio_util::sync::CancellationToken;

    fn request(agent_ref: &str, message: &str) -> AgentRequest {
        AgentRequest {
            run_id: RunId::new(),
            step_name: "s".into(),
            agent_ref: agent_ref.into(),
            message: message.into(),
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_routes_by_agent_ref() {
        let mut registry = AgentRegistry::new();
        registry.register("loud", EchoAgent::new(Some("LOUD ".into())));
        registry.register("quiet", EchoAgent::default());

        let loud = registry.invoke(request("loud", "hi")).await.unwrap();
        let quiet = registry.invoke(request("quiet", "hi")).await.unwrap();
        assert_eq!(loud.output, "LOUD hi");
        assert_eq!(quiet.output, "hi");
        assert_eq!(registry.list(), vec!["loud", "quiet"]);
    }

    #[tokio::test]
    async fn test_unknown_agent_fails_the_call() {
        let registry = AgentRegistry::new();
        let err = registry.invoke(request("github", "hi")).await.unwrap_err();
        assert_eq!(err.message, "unknown agent 'github'");
    }

    #[tokio::test]
    async fn test_fallback_serves_everything() {
        let registry = AgentRegistry::new().with_fallback(EchoAgent::default());
        let response = registry.invoke(request("anything", "ping")).await.unwrap();
        assert_eq!(response.output, "ping");
    }

    #[test]
    fn test_from_config_and_unresolved() {
        let mut agents = HashMap::new();
        agents.insert(
            "github".to_string(),
            AgentConfig::Command(CommandAgentConfig {
                command: "github-agent".into(),
                args: vec![],
                env: HashMap::new(),
                working_dir: None,
                timeout_secs: None,
            }),
        );
        agents.insert("dry".to_string(), AgentConfig::Echo { prefix: None });
        let registry = AgentRegistry::from_config(&agents);
        assert!(registry.contains("github"));
        assert!(registry.contains("dry"));

        let def = WorkflowDefinition::new(
            "wf",
            vec![
                StepDefinition::new("a", "github", "m"),
                StepDefinition::new("b", "slack", "m"),
                StepDefinition::new("c", "slack", "m"),
            ],
            false,
        );
        assert_eq!(registry.unresolved(&def), vec!["slack"]);
    }
}

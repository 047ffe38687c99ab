use futures::future::BoxFuture;

use stepflow_core::error::ExecutorError;
use stepflow_core::traits::AgentExecutor;
use stepflow_core::types::{AgentRequest, AgentResponse};

/// Replies with the rendered message, for dry runs.
#[derive(Debug, Clone, Default)]
pub struct EchoAgent {
    prefix: Option<String>,
}

impl EchoAgent {
    pub fn new(prefix: Option<String>) -> Self {
        Self { prefix }
    }
}

impl AgentExecutor for EchoAgent {
    fn invoke(
        &self,
        request: AgentRequest,
    ) -> BoxFuture<'_, Result<AgentResponse, ExecutorError>> {
        let output = match &self.prefix {
            Some(prefix) => format!("{}{}", prefix, request.message),
            None => request.message,
        };
        Box::pin(async move { Ok(AgentResponse::text(output)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow_core::types::RunId;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_echo_with_prefix() {
        let agent = EchoAgent::new(Some("dry-run: ".into()));
        let response = agent
            .invoke(AgentRequest {
                run_id: RunId::new(),
                step_name: "a".into(),
                agent_ref: "echo".into(),
                message: "post to #general".into(),
                deadline: None,
                cancel: CancellationToken::new(),
            })
            .await
            .unwrap();
        assert_eq!(response.output, "dry-run: post to #general");
    }
}

use std::process::{Output, Stdio};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use stepflow_core::config::CommandAgentConfig;
use stepflow_core::error::ExecutorError;
use stepflow_core::traits::AgentExecutor;
use stepflow_core::types::{AgentRequest, AgentResponse};

const MAX_STDERR_CHARS: usize = 2000;

/// Agent backed by an external program.
///
/// Each call spawns the program, writes the rendered message to its stdin and
/// reads stdout. A stdout holding a JSON object with an `output` field (and
/// optionally `tool_calls`) is decoded as the full response; anything else is
/// taken as plain text.
pub struct CommandAgent {
    name: String,
    config: CommandAgentConfig,
}

impl CommandAgent {
    pub fn new(name: impl Into<String>, config: CommandAgentConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(stepflow_core::config::expand_home(dir));
        }
        cmd
    }

    async fn call(&self, message: String) -> Result<Output, ExecutorError> {
        let mut child = self.command().spawn().map_err(|e| {
            ExecutorError::new(format!(
                "failed to start agent '{}' ({}): {}",
                self.name, self.config.command, e
            ))
        })?;

        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // The program may exit without reading its input.
                if let Err(e) = stdin.write_all(message.as_bytes()).await {
                    debug!(error = %e, "Agent did not consume stdin");
                }
                stdin.shutdown().await.ok();
            }
        };

        let ((), output) = tokio::join!(feed, child.wait_with_output());
        output.map_err(|e| ExecutorError::new(format!("agent '{}' I/O error: {}", self.name, e)))
    }
}

impl AgentExecutor for CommandAgent {
    fn invoke(
        &self,
        request: AgentRequest,
    ) -> BoxFuture<'_, Result<AgentResponse, ExecutorError>> {
        let AgentRequest {
            step_name,
            message,
            deadline,
            cancel,
            ..
        } = request;

        Box::pin(async move {
            let started = Instant::now();
            let own_deadline = self
                .config
                .timeout_secs
                .map(|secs| started + Duration::from_secs(secs));
            let deadline = match (own_deadline, deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            debug!(
                agent = %self.name,
                step = %step_name,
                command = %self.config.command,
                "Invoking command agent"
            );

            // Dropping the call future drops the child, which kills it.
            let output = tokio::select! {
                _ = cancel.cancelled() => return Err(ExecutorError::cancelled()),
                _ = wait_until(deadline) => {
                    let limit = deadline
                        .map(|d| d.saturating_duration_since(started))
                        .unwrap_or_default();
                    return Err(ExecutorError::timeout(limit));
                }
                output = self.call(message) => output?,
            };

            parse_output(&self.name, output)
        })
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => futures::future::pending().await,
    }
}

fn parse_output(name: &str, output: Output) -> Result<AgentResponse, ExecutorError> {
    if !output.status.success() {
        let code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr: String = stderr.trim().chars().take(MAX_STDERR_CHARS).collect();
        return Err(ExecutorError::new(format!(
            "agent '{}' exited with code {}: {}",
            name, code, stderr
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let text = stdout.trim();
    if text.starts_with('{') {
        if let Ok(response) = serde_json::from_str::<AgentResponse>(text) {
            return Ok(response);
        }
    }
    Ok(AgentResponse::text(text))
}

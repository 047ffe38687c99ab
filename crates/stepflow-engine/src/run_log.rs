use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use stepflow_core::event::EventBus;
use stepflow_core::types::FlowEvent;

/// JSONL workflow logger.
///
/// Subscribes to the EventBus and appends one JSON object per line to
/// `{log_dir}/{run_id}.jsonl`. Every line is flushed as it is written, so a
/// crash never loses an entry that was already logged.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1 = run events, 2 = step events too.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    pub fn log_path(&self, run_id: &str) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", run_id))
    }

    /// Subscribe now and write in a background task until cancelled or the
    /// bus closes. Events published after this returns are never missed.
    pub fn spawn(self, event_bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, cancel))
    }

    async fn run(self, mut rx: Receiver<FlowEvent>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, dir = %self.log_dir.display(), "Failed to create log directory");
            return;
        }
        info!(dir = %self.log_dir.display(), "RunLogger started");

        let mut writers: HashMap<String, BufWriter<File>> = HashMap::new();

        loop {
            let event = tokio::select! {
                biased;
                result = rx.recv() => match result {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "RunLogger lagged, skipped events");
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        debug!("EventBus closed, RunLogger stopping");
                        break;
                    }
                },
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
            };

            let Some(entry) = self.event_to_entry(&event) else {
                continue;
            };
            let run_id = entry.run_id.clone();

            if !writers.contains_key(&run_id) {
                match open_log(&self.log_path(&run_id)).await {
                    Ok(writer) => {
                        writers.insert(run_id.clone(), writer);
                    }
                    Err(e) => {
                        error!(error = %e, run_id = %run_id, "Failed to open run log");
                        continue;
                    }
                }
            }
            let Some(writer) = writers.get_mut(&run_id) else {
                continue;
            };

            if let Ok(json) = serde_json::to_string(&entry) {
                let line = format!("{}\n", json);
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    error!(error = %e, run_id = %run_id, "Failed to write log entry");
                }
                if let Err(e) = writer.flush().await {
                    error!(error = %e, run_id = %run_id, "Failed to flush log");
                }
            }

            if matches!(event, FlowEvent::RunFinished { .. }) {
                writers.remove(&run_id);
            }
        }

        for (_, mut writer) in writers {
            writer.flush().await.ok();
        }
        debug!("RunLogger finished");
    }

    /// Convert an event to a log entry, or `None` if the level filters it out.
    fn event_to_entry(&self, event: &FlowEvent) -> Option<LogEntry> {
        let entry = |event_type, step: Option<&String>, detail| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: event.run_id().to_string(),
            event_type,
            step: step.cloned(),
            detail,
        };

        match event {
            FlowEvent::RunStarted {
                workflow_name,
                step_count,
                parallel,
                ..
            } => Some(entry(
                "run_started",
                None,
                Some(serde_json::json!({
                    "workflow_name": workflow_name,
                    "step_count": step_count,
                    "parallel": parallel,
                })),
            )),
            FlowEvent::RunFinished {
                status,
                total_elapsed_ms,
                error,
                ..
            } => Some(entry(
                "run_finished",
                None,
                Some(serde_json::json!({
                    "status": status,
                    "total_elapsed_ms": total_elapsed_ms,
                    "error": error,
                })),
            )),

            FlowEvent::StepStarted {
                step_name,
                agent_ref,
                ..
            } if self.level >= 2 => Some(entry(
                "step_started",
                Some(step_name),
                Some(serde_json::json!({ "agent": agent_ref })),
            )),
            FlowEvent::StepFinished {
                step_name,
                status,
                elapsed_ms,
                error,
                ..
            } if self.level >= 2 => Some(entry(
                "step_finished",
                Some(step_name),
                Some(serde_json::json!({
                    "status": status,
                    "elapsed_ms": elapsed_ms,
                    "error": error,
                })),
            )),
            FlowEvent::StepSkipped {
                step_name, reason, ..
            } if self.level >= 2 => Some(entry(
                "step_skipped",
                Some(step_name),
                Some(serde_json::json!({ "reason": reason })),
            )),

            _ => None,
        }
    }
}

async fn open_log(path: &Path) -> std::io::Result<BufWriter<File>> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    Ok(BufWriter::new(file))
}

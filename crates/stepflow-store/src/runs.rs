use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use stepflow_core::error::{FlowError, Result};
use stepflow_core::traits::RunRepository;
use stepflow_core::types::{RunId, RunStatus, RunSummary, WorkflowRun};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS workflow_runs (
        run_id TEXT PRIMARY KEY,
        workflow_name TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        started_ms INTEGER NOT NULL,
        completed_at TEXT,
        total_elapsed_ms INTEGER,
        step_count INTEGER NOT NULL,
        succeeded_steps INTEGER NOT NULL,
        failed_steps INTEGER NOT NULL,
        skipped_steps INTEGER NOT NULL,
        run_json TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_runs_started
        ON workflow_runs(started_ms DESC);";

/// SQLite-backed run repository.
///
/// One row per run, keyed by run id. The full run is stored as JSON next to
/// the summary columns that history listings read.
pub struct SqliteRunStore {
    conn: Mutex<Connection>,
}

fn db_err(e: impl std::fmt::Display) -> FlowError {
    FlowError::Database(e.to_string())
}

impl SqliteRunStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| FlowError::Database(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Run store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Number of stored runs.
    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().map_err(db_err)?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM workflow_runs", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(n as usize)
    }
}

impl RunRepository for SqliteRunStore {
    fn save(&self, run: &WorkflowRun) -> BoxFuture<'_, Result<()>> {
        let encoded = serde_json::to_string(run);
        let summary = run.summary();

        Box::pin(async move {
            let run_json = encoded?;
            let conn = self.conn.lock().map_err(db_err)?;

            conn.execute(
                "INSERT INTO workflow_runs (
                    run_id, workflow_name, status, started_at, started_ms, completed_at,
                    total_elapsed_ms, step_count, succeeded_steps, failed_steps,
                    skipped_steps, run_json
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(run_id) DO UPDATE SET
                    workflow_name = excluded.workflow_name,
                    status = excluded.status,
                    completed_at = excluded.completed_at,
                    total_elapsed_ms = excluded.total_elapsed_ms,
                    step_count = excluded.step_count,
                    succeeded_steps = excluded.succeeded_steps,
                    failed_steps = excluded.failed_steps,
                    skipped_steps = excluded.skipped_steps,
                    run_json = excluded.run_json",
                params![
                    summary.run_id.0,
                    summary.workflow_name,
                    summary.status.as_str(),
                    summary.started_at.to_rfc3339(),
                    summary.started_at.timestamp_millis(),
                    summary.completed_at.map(|t| t.to_rfc3339()),
                    summary.total_elapsed_ms.map(|ms| ms as i64),
                    summary.step_count as i64,
                    summary.succeeded_steps as i64,
                    summary.failed_steps as i64,
                    summary.skipped_steps as i64,
                    run_json,
                ],
            )
            .map_err(db_err)?;

            Ok(())
        })
    }

    fn load(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<WorkflowRun>>> {
        let run_id = run_id.0.clone();

        Box::pin(async move {
            let json: Option<String> = {
                let conn = self.conn.lock().map_err(db_err)?;
                conn.query_row(
                    "SELECT run_json FROM workflow_runs WHERE run_id = ?1",
                    params![run_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?
            };

            match json {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
    }

    fn list(&self, limit: usize, offset: usize) -> BoxFuture<'_, Result<Vec<RunSummary>>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;

            let mut stmt = conn
                .prepare(
                    "SELECT run_id, workflow_name, status, started_at, completed_at,
                            total_elapsed_ms, step_count, succeeded_steps, failed_steps,
                            skipped_steps
                     FROM workflow_runs
                     ORDER BY started_ms DESC, run_id ASC
                     LIMIT ?1 OFFSET ?2",
                )
                .map_err(db_err)?;

            let rows = stmt
                .query_map(params![limit as i64, offset as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                        row.get::<_, i64>(9)?,
                    ))
                })
                .map_err(db_err)?;

            let mut summaries = Vec::new();
            for row in rows {
                let (
                    run_id,
                    workflow_name,
                    status,
                    started_at,
                    completed_at,
                    total_elapsed_ms,
                    step_count,
                    succeeded,
                    failed,
                    skipped,
                ) = row.map_err(db_err)?;

                let status = RunStatus::parse(&status)
                    .ok_or_else(|| FlowError::Database(format!("unknown run status '{}'", status)))?;

                summaries.push(RunSummary {
                    run_id: RunId(run_id),
                    workflow_name,
                    status,
                    step_count: step_count as usize,
                    succeeded_steps: succeeded as usize,
                    failed_steps: failed as usize,
                    skipped_steps: skipped as usize,
                    started_at: parse_time(&started_at)?,
                    completed_at: completed_at.as_deref().map(parse_time).transpose()?,
                    total_elapsed_ms: total_elapsed_ms.map(|ms| ms as u64),
                });
            }

            Ok(summaries)
        })
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| FlowError::Database(format!("bad timestamp '{}': {}", s, e)))
}

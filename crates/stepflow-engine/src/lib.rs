pub mod context;
pub mod graph;
pub mod run_log;
pub mod scheduler;
pub mod service;
pub mod template;
pub mod tracker;

pub use context::ExecutionContext;
pub use graph::{build_plan, ExecutionPlan, PlanLimits};
pub use run_log::RunLogger;
pub use scheduler::{Scheduler, SchedulerOptions};
pub use service::WorkflowService;
pub use template::{render, MessageTemplate};
pub use tracker::{MemoryRunStore, RunTracker};

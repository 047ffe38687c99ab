//! Workflow graph planning.
//!
//! A workflow is a set of steps joined by `depends_on` edges. Planning checks
//! the definition's structure, rejects cycles and produces a deterministic
//! execution order plus the waves of steps that may run concurrently.

pub mod plan;
mod validate;

pub use plan::{build_plan, ExecutionPlan, PlanLimits};

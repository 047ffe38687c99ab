use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use stepflow_core::types::RunInputs;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("step '{0}' already published an output")]
pub struct AlreadyPublished(pub String);

/// Data flowing between the steps of one run.
///
/// Holds the run inputs plus the output of every step that has succeeded so
/// far. Outputs are append-only: once a step has published, its entry never
/// changes, so anything rendered from it stays reproducible.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    inputs: RunInputs,
    outputs: HashMap<String, String>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context seeded with run inputs.
    pub fn with_inputs(inputs: RunInputs) -> Self {
        Self {
            inputs,
            outputs: HashMap::new(),
        }
    }

    /// Record a step's output.
    pub fn publish(
        &mut self,
        step_name: &str,
        output: String,
    ) -> Result<(), AlreadyPublished> {
        if self.outputs.contains_key(step_name) {
            return Err(AlreadyPublished(step_name.to_string()));
        }
        self.outputs.insert(step_name.to_string(), output);
        Ok(())
    }

    pub fn output(&self, step_name: &str) -> Option<&str> {
        self.outputs.get(step_name).map(String::as_str)
    }

    pub fn input(&self, key: &str) -> Option<&str> {
        self.inputs.get(key).map(String::as_str)
    }

    pub fn inputs(&self) -> &RunInputs {
        &self.inputs
    }

    /// Number of published outputs.
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Submission errors
    #[error("Invalid workflow: {0}")]
    Validation(#[from] ValidationError),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    // Tracker errors
    #[error("Workflow run not found: {0}")]
    RunNotFound(String),

    #[error("Workflow run is not terminal: {0}")]
    RunNotTerminal(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;

/// Whole seconds as `90s`, anything else in milliseconds (`150ms`).
pub fn format_duration(duration: Duration) -> String {
    if duration.subsec_millis() == 0 && duration.as_secs() > 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// Rejections raised while a workflow is submitted, before anything runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("workflow must have at least one step")]
    EmptyWorkflow,

    #[error("workflow has {count} steps, the limit is {max}")]
    TooManySteps { count: usize, max: usize },

    #[error("step #{index} has an empty name")]
    EmptyStepName { index: usize },

    #[error("step '{step}' has no agent reference")]
    EmptyAgentRef { step: String },

    #[error("step '{step}' has an empty message")]
    EmptyMessage { step: String },

    #[error("duplicate step name '{0}'")]
    DuplicateStep(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("cyclic dependency: {}", .steps.join(" -> "))]
    CyclicDependency { steps: Vec<String> },

    #[error("step '{step}': {source}")]
    Template {
        step: String,
        #[source]
        source: TemplateError,
    },
}

/// A message template that cannot be parsed or rendered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unterminated reference starting at byte {offset}")]
    Unterminated { offset: usize },

    #[error("empty reference at byte {offset}")]
    EmptyReference { offset: usize },

    #[error("'{reference}' is not a declared dependency")]
    NotADependency { reference: String },

    #[error("dependency '{reference}' has no published output")]
    UnresolvedReference { reference: String },

    #[error("no input named '{key}'")]
    MissingInput { key: String },
}

/// Failure reported by an agent executor.
///
/// Opaque to the engine beyond the message; `retryable` is carried through
/// for callers but never acted on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExecutorError {
    pub message: String,
    pub retryable: bool,
}

impl ExecutorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Agent call exceeded its deadline.
    pub fn timeout(limit: Duration) -> Self {
        Self::retryable(format!("agent call timed out after {}", format_duration(limit)))
    }

    /// Agent call observed the cancellation token.
    pub fn cancelled() -> Self {
        Self::new("agent call cancelled")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let err = ValidationError::CyclicDependency {
            steps: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cyclic dependency: a -> b -> a");
    }

    #[test]
    fn test_template_error_wrapped_in_validation() {
        let err = ValidationError::Template {
            step: "notify".into(),
            source: TemplateError::NotADependency {
                reference: "fetch".into(),
            },
        };
        assert_eq!(
            err.to_string(),
            "step 'notify': 'fetch' is not a declared dependency"
        );
        let flow: FlowError = err.into();
        assert!(matches!(flow, FlowError::Validation(_)));
    }

    #[test]
    fn test_executor_error_helpers() {
        assert!(ExecutorError::timeout(Duration::from_secs(30)).retryable);
        assert_eq!(
            ExecutorError::timeout(Duration::from_secs(30)).to_string(),
            "agent call timed out after 30s"
        );
        assert!(!ExecutorError::new("boom").retryable);
        assert!(!ExecutorError::cancelled().retryable);
        assert_eq!(
            ExecutorError::timeout(Duration::from_millis(150)).message,
            "agent call timed out after 150ms"
        );
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
        assert_eq!(format_duration(Duration::from_millis(100)), "100ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::ZERO), "0ms");
    }
}

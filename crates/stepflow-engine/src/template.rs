//! Step message templates.
//!
//! A template is plain text with `{{...}}` references:
//!
//! - `{{fetch}}` or `{{fetch.output}}`: the published output of dependency `fetch`
//! - `{{input.topic}}`: the run input `topic`
//!
//! Templates are parsed once, when the plan is built, and every step
//! reference is checked against the step's `depends_on`. Rendering checks the
//! same rule again, so a template can never read a step it does not depend on.

use std::sync::OnceLock;

use regex::Regex;

use stepflow_core::error::TemplateError;
use stepflow_core::types::StepDefinition;

use crate::context::ExecutionContext;

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{([^{}]*)\}\}").unwrap())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Output(String),
    Input(String),
}

/// A parsed step message template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplate {
    segments: Vec<Segment>,
}

impl MessageTemplate {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut last = 0;

        for caps in reference_pattern().captures_iter(source) {
            let Some(whole) = caps.get(0) else { continue };
            push_text(&mut segments, source, last, whole.start())?;

            let inner = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            let segment = match inner.strip_prefix("input.") {
                Some(key) => Segment::Input(key.trim().to_string()),
                None => Segment::Output(
                    inner
                        .strip_suffix(".output")
                        .unwrap_or(inner)
                        .trim()
                        .to_string(),
                ),
            };
            let empty = match &segment {
                Segment::Output(name) | Segment::Input(name) => name.is_empty(),
                Segment::Text(_) => false,
            };
            if empty {
                return Err(TemplateError::EmptyReference {
                    offset: whole.start(),
                });
            }

            segments.push(segment);
            last = whole.end();
        }

        push_text(&mut segments, source, last, source.len())?;
        Ok(Self { segments })
    }

    /// Step names this template reads, in order of appearance.
    pub fn step_references(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Output(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Run input keys this template reads.
    pub fn input_references(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Input(key) => Some(key.as_str()),
            _ => None,
        })
    }

    pub fn has_step_references(&self) -> bool {
        self.step_references().next().is_some()
    }

    /// Reject references to steps outside `depends_on`.
    pub fn check_dependencies(&self, depends_on: &[String]) -> Result<(), TemplateError> {
        match self
            .step_references()
            .find(|name| !depends_on.iter().any(|d| d == name))
        {
            Some(name) => Err(TemplateError::NotADependency {
                reference: name.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Produce the literal message for an agent.
    ///
    /// Templates without step references get a context block per dependency
    /// appended, in declared order.
    pub fn render(
        &self,
        depends_on: &[String],
        context: &ExecutionContext,
    ) -> Result<String, TemplateError> {
        self.check_dependencies(depends_on)?;

        let mut message = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => message.push_str(text),
                Segment::Output(name) => message.push_str(resolve_output(context, name)?),
                Segment::Input(key) => {
                    let value = context.input(key).ok_or_else(|| TemplateError::MissingInput {
                        key: key.clone(),
                    })?;
                    message.push_str(value);
                }
            }
        }

        if !self.has_step_references() {
            for dep in depends_on {
                let output = resolve_output(context, dep)?;
                message.push_str(&format!("\n\nContext from {}: {}", dep, output));
            }
        }

        Ok(message)
    }
}

fn resolve_output<'a>(context: &'a ExecutionContext, name: &str) -> Result<&'a str, TemplateError> {
    context
        .output(name)
        .ok_or_else(|| TemplateError::UnresolvedReference {
            reference: name.to_string(),
        })
}

fn push_text(
    segments: &mut Vec<Segment>,
    source: &str,
    start: usize,
    end: usize,
) -> Result<(), TemplateError> {
    let text = &source[start..end];
    if let Some(pos) = text.find("{{") {
        return Err(TemplateError::Unterminated { offset: start + pos });
    }
    if !text.is_empty() {
        segments.push(Segment::Text(text.to_string()));
    }
    Ok(())
}

/// Render a step's message against the context in one go.
pub fn render(step: &StepDefinition, context: &ExecutionContext) -> Result<String, TemplateError> {
    MessageTemplate::parse(&step.message_template)?.render(&step.depends_on, context)
}

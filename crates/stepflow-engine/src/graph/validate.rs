use std::collections::{HashMap, HashSet};

use stepflow_core::error::ValidationError;
use stepflow_core::types::WorkflowDefinition;

use crate::template::MessageTemplate;

/// Structural facts about a definition that passed every per-step check.
pub(super) struct Checked {
    /// Dependency indices per step, in declared order.
    pub dependencies: Vec<Vec<usize>>,
    pub templates: Vec<MessageTemplate>,
}

/// Collapse repeated `depends_on` entries, keeping first occurrences.
pub(super) fn normalize_dependencies(definition: &mut WorkflowDefinition) {
    for step in &mut definition.steps {
        let mut seen = HashSet::with_capacity(step.depends_on.len());
        step.depends_on.retain(|dep| seen.insert(dep.clone()));
    }
}

/// Per-step checks: names, agents, messages, dependencies and templates.
/// Cycles are left to the planner.
pub(super) fn check_steps(
    definition: &WorkflowDefinition,
    max_steps: usize,
) -> Result<Checked, ValidationError> {
    let steps = &definition.steps;
    if steps.is_empty() {
        return Err(ValidationError::EmptyWorkflow);
    }
    if max_steps > 0 && steps.len() > max_steps {
        return Err(ValidationError::TooManySteps {
            count: steps.len(),
            max: max_steps,
        });
    }

    let mut index: HashMap<&str, usize> = HashMap::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        if step.step_name.trim().is_empty() {
            return Err(ValidationError::EmptyStepName { index: i + 1 });
        }
        if index.insert(step.step_name.as_str(), i).is_some() {
            return Err(ValidationError::DuplicateStep(step.step_name.clone()));
        }
    }

    let mut dependencies = Vec::with_capacity(steps.len());
    let mut templates = Vec::with_capacity(steps.len());

    for step in steps {
        if step.agent_ref.trim().is_empty() {
            return Err(ValidationError::EmptyAgentRef {
                step: step.step_name.clone(),
            });
        }
        if step.message_template.trim().is_empty() {
            return Err(ValidationError::EmptyMessage {
                step: step.step_name.clone(),
            });
        }

        let mut deps = Vec::with_capacity(step.depends_on.len());
        for dep in &step.depends_on {
            if *dep == step.step_name {
                return Err(ValidationError::CyclicDependency {
                    steps: vec![dep.clone(), dep.clone()],
                });
            }
            match index.get(dep.as_str()) {
                Some(&j) => deps.push(j),
                None => {
                    return Err(ValidationError::UnknownDependency {
                        step: step.step_name.clone(),
                        dependency: dep.clone(),
                    })
                }
            }
        }
        dependencies.push(deps);

        let template = MessageTemplate::parse(&step.message_template)
            .and_then(|t| t.check_dependencies(&step.depends_on).map(|_| t))
            .map_err(|source| ValidationError::Template {
                step: step.step_name.clone(),
                source,
            })?;
        templates.push(template);
    }

    Ok(Checked {
        dependencies,
        templates,
    })
}

/// Find one cycle among the steps the planner could not order.
///
/// Returns the step indices along the cycle with the first one repeated at
/// the end, following "depends on" edges.
pub(super) fn find_cycle(dependencies: &[Vec<usize>], stuck: &[bool]) -> Vec<usize> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        OnStack,
        Done,
    }

    let mut marks = vec![Mark::New; dependencies.len()];
    let mut path: Vec<usize> = Vec::new();

    for start in (0..dependencies.len()).filter(|&i| stuck[i]) {
        if marks[start] != Mark::New {
            continue;
        }
        // Iterative DFS: (node, next dependency position).
        let mut frames: Vec<(usize, usize)> = vec![(start, 0)];
        marks[start] = Mark::OnStack;
        path.push(start);

        while let Some(frame) = frames.last_mut() {
            let (node, pos) = *frame;
            match dependencies[node].get(pos) {
                Some(&next) => {
                    frame.1 += 1;
                    if !stuck[next] {
                        continue;
                    }
                    match marks[next] {
                        Mark::OnStack => {
                            let from = path.iter().position(|&n| n == next).unwrap_or(0);
                            let mut cycle = path[from..].to_vec();
                            cycle.push(next);
                            return cycle;
                        }
                        Mark::New => {
                            marks[next] = Mark::OnStack;
                            path.push(next);
                            frames.push((next, 0));
                        }
                        Mark::Done => {}
                    }
                }
                None => {
                    marks[node] = Mark::Done;
                    path.pop();
                    frames.pop();
                }
            }
        }
    }

    Vec::new()
}

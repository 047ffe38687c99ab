use std::collections::BTreeSet;

use stepflow_core::config::EngineConfig;
use stepflow_core::error::ValidationError;
use stepflow_core::types::{StepDefinition, WorkflowDefinition};

use super::validate::{check_steps, find_cycle, normalize_dependencies};
use crate::template::MessageTemplate;

/// Limits applied while building a plan.
#[derive(Debug, Clone, Copy)]
pub struct PlanLimits {
    /// Maximum number of steps (0 = unlimited).
    pub max_steps: usize,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self { max_steps: 50 }
    }
}

impl From<&EngineConfig> for PlanLimits {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_steps: config.max_steps,
        }
    }
}

/// A validated workflow together with a total order that respects every
/// dependency and the waves of steps that may run side by side.
///
/// Steps are addressed by their declaration index. Among steps that become
/// ready at the same time, lower indices come first, so the order is stable
/// for a given definition.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    definition: WorkflowDefinition,
    templates: Vec<MessageTemplate>,
    dependencies: Vec<Vec<usize>>,
    order: Vec<usize>,
    waves: Vec<Vec<usize>>,
}

/// Validate a definition with default limits and order its steps.
pub fn build_plan(definition: WorkflowDefinition) -> Result<ExecutionPlan, ValidationError> {
    ExecutionPlan::build(definition, PlanLimits::default())
}

impl ExecutionPlan {
    pub fn build(
        mut definition: WorkflowDefinition,
        limits: PlanLimits,
    ) -> Result<Self, ValidationError> {
        normalize_dependencies(&mut definition);
        let checked = check_steps(&definition, limits.max_steps)?;
        let n = definition.steps.len();
        let dependencies = checked.dependencies;

        let mut dependents = vec![Vec::new(); n];
        for (i, deps) in dependencies.iter().enumerate() {
            for &d in deps {
                dependents[d].push(i);
            }
        }

        // Kahn's algorithm, always taking the lowest ready index.
        let mut remaining: Vec<usize> = dependencies.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &dependent in &dependents[next] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() < n {
            let stuck: Vec<bool> = remaining.iter().map(|&r| r > 0).collect();
            let cycle = find_cycle(&dependencies, &stuck);
            return Err(ValidationError::CyclicDependency {
                steps: cycle
                    .into_iter()
                    .map(|i| definition.steps[i].step_name.clone())
                    .collect(),
            });
        }

        let waves = compute_waves(&dependencies);

        Ok(Self {
            definition,
            templates: checked.templates,
            dependencies,
            order,
            waves,
        })
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn len(&self) -> usize {
        self.definition.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definition.steps.is_empty()
    }

    pub fn is_parallel(&self) -> bool {
        self.definition.parallel_execution
    }

    pub fn step(&self, index: usize) -> &StepDefinition {
        &self.definition.steps[index]
    }

    pub fn template(&self, index: usize) -> &MessageTemplate {
        &self.templates[index]
    }

    pub fn dependencies(&self, index: usize) -> &[usize] {
        &self.dependencies[index]
    }

    /// Step indices in execution order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn ordered_names(&self) -> Vec<&str> {
        self.order
            .iter()
            .map(|&i| self.definition.steps[i].step_name.as_str())
            .collect()
    }

    /// Groups of steps whose dependencies all lie in earlier groups.
    pub fn wave_names(&self) -> Vec<Vec<&str>> {
        self.waves
            .iter()
            .map(|wave| {
                wave.iter()
                    .map(|&i| self.definition.steps[i].step_name.as_str())
                    .collect()
            })
            .collect()
    }
}

fn compute_waves(dependencies: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let n = dependencies.len();
    let mut placed = vec![false; n];
    let mut waves = Vec::new();
    let mut count = 0;

    while count < n {
        let wave: Vec<usize> = (0..n)
            .filter(|&i| !placed[i] && dependencies[i].iter().all(|&d| placed[d]))
            .collect();
        if wave.is_empty() {
            break;
        }
        for &i in &wave {
            placed[i] = true;
        }
        count += wave.len();
        waves.push(wave);
    }
    waves
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use stepflow_core::error::TemplateError;

    fn step(name: &str, deps: &[&str]) -> StepDefinition {
        StepDefinition::new(name, "agent", format!("do {}", name))
            .with_depends_on(deps.iter().copied())
    }

    fn def(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition::new("wf", steps, false)
    }

    #[test]
    fn test_diamond_order_and_waves() {
        let plan = build_plan(def(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ]))
        .unwrap();

        assert_eq!(plan.ordered_names(), vec!["a", "b", "c", "d"]);
        assert_eq!(
            plan.wave_names(),
            vec![vec!["a"], vec!["b", "c"], vec!["d"]]
        );
    }

    #[test]
    fn test_order_respects_dependencies_over_declaration() {
        let plan = build_plan(def(vec![
            step("report", &["fetch", "analyze"]),
            step("analyze", &["fetch"]),
            step("fetch", &[]),
        ]))
        .unwrap();
        assert_eq!(plan.ordered_names(), vec!["fetch", "analyze", "report"]);
    }

    #[test]
    fn test_order_is_stable_across_builds() {
        let steps = vec![
            step("x", &[]),
            step("y", &[]),
            step("z", &["y"]),
            step("w", &[]),
        ];
        let first = build_plan(def(steps.clone())).unwrap();
        let second = build_plan(def(steps)).unwrap();
        assert_eq!(first.order(), second.order());
        assert_eq!(first.ordered_names(), vec!["x", "y", "z", "w"]);
    }

    #[test]
    fn test_every_dependency_precedes_its_dependent() {
        let plan = build_plan(def(vec![
            step("e", &["c", "d"]),
            step("d", &["b"]),
            step("c", &["a", "b"]),
            step("b", &[]),
            step("a", &[]),
        ]))
        .unwrap();
        let position: HashMap<usize, usize> = plan
            .order()
            .iter()
            .enumerate()
            .map(|(pos, &i)| (i, pos))
            .collect();
        for i in 0..plan.len() {
            for &d in plan.dependencies(i) {
                assert!(position[&d] < position[&i]);
            }
        }
    }

    #[test]
    fn test_cycle_names_steps() {
        let err = build_plan(def(vec![step("a", &["b"]), step("b", &["a"])])).unwrap_err();
        match err {
            ValidationError::CyclicDependency { steps } => {
                assert_eq!(steps, vec!["a", "b", "a"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_longer_cycle_behind_valid_steps() {
        let err = build_plan(def(vec![
            step("root", &[]),
            step("p", &["root", "r"]),
            step("q", &["p"]),
            step("r", &["q"]),
        ]))
        .unwrap_err();
        assert_eq!(err.to_string(), "cyclic dependency: p -> r -> q -> p");
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = build_plan(def(vec![step("a", &["a"])])).unwrap_err();
        assert_eq!(
            err,
            ValidationError::CyclicDependency {
                steps: vec!["a".into(), "a".into()]
            }
        );
    }

    #[test]
    fn test_structural_rejections() {
        assert_eq!(
            build_plan(def(vec![])).unwrap_err(),
            ValidationError::EmptyWorkflow
        );
        assert_eq!(
            build_plan(def(vec![step("a", &[]), step("a", &[])])).unwrap_err(),
            ValidationError::DuplicateStep("a".into())
        );
        assert_eq!(
            build_plan(def(vec![step("a", &["ghost"])])).unwrap_err(),
            ValidationError::UnknownDependency {
                step: "a".into(),
                dependency: "ghost".into()
            }
        );
        assert!(matches!(
            build_plan(def(vec![StepDefinition::new("a", " ", "m")])).unwrap_err(),
            ValidationError::EmptyAgentRef { .. }
        ));
        assert!(matches!(
            build_plan(def(vec![StepDefinition::new("a", "x", "  ")])).unwrap_err(),
            ValidationError::EmptyMessage { .. }
        ));
        assert_eq!(
            build_plan(def(vec![StepDefinition::new("", "x", "m")])).unwrap_err(),
            ValidationError::EmptyStepName { index: 1 }
        );
    }

    #[test]
    fn test_too_many_steps() {
        let steps = (0..3).map(|i| step(&format!("s{}", i), &[])).collect();
        let err = ExecutionPlan::build(def(steps), PlanLimits { max_steps: 2 }).unwrap_err();
        assert_eq!(err, ValidationError::TooManySteps { count: 3, max: 2 });
    }

    #[test]
    fn test_template_reference_must_be_dependency() {
        let steps = vec![
            step("a", &[]),
            StepDefinition::new("e", "agent", "Use {{a}}"),
        ];
        let err = build_plan(def(steps)).unwrap_err();
        assert_eq!(
            err,
            ValidationError::Template {
                step: "e".into(),
                source: TemplateError::NotADependency {
                    reference: "a".into()
                },
            }
        );
    }

    #[test]
    fn test_dependencies_are_indices_in_declared_order() {
        let plan = build_plan(def(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["b", "a"]),
            step("d", &[]),
        ]))
        .unwrap();
        assert_eq!(plan.dependencies(2), &[1, 0]);
        assert!(plan.dependencies(3).is_empty());
        assert_eq!(plan.wave_names(), vec![vec!["a", "d"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn test_repeated_dependencies_are_collapsed() {
        let mut repeated = StepDefinition::new("b", "agent", "summarize");
        repeated.depends_on = vec!["a".into(), "a".into()];
        let plan = build_plan(def(vec![step("a", &[]), repeated])).unwrap();

        assert_eq!(plan.step(1).depends_on, vec!["a"]);
        assert_eq!(plan.dependencies(1), &[0]);
    }
}

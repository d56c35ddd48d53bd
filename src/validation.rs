use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::operation::{ArgValue, OperationRegistry};
use crate::operations::flow::{CONDITIONAL_JUMP, FORK, JUMP, LABEL, MERGE};
use crate::recipe::{RECIPE_VERSION, Recipe, RecipeStep};

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_recipe(recipe: &Recipe, registry: &OperationRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if recipe.version != RECIPE_VERSION {
        report
            .errors
            .push(format!("Unsupported recipe version: {}", recipe.version));
    }

    if recipe.steps.is_empty() {
        report
            .warnings
            .push("Recipe has no steps; baking returns the input unchanged".into());
    }

    for (idx, step) in recipe.steps.iter().enumerate() {
        report.merge(
            validate_step(step, registry)
                .with_context(|| format!("Step {} ('{}')", idx + 1, step.op))
                .unwrap_or_else(|err| ValidationReport {
                    errors: vec![format!("{err:#}")],
                    warnings: vec![],
                }),
        );
    }

    report.merge(validate_labels(&recipe.steps));
    report.merge(validate_forks(&recipe.steps));
    report
}

fn validate_step(step: &RecipeStep, registry: &OperationRegistry) -> Result<ValidationReport> {
    let mut report = ValidationReport::default();
    let operation = registry.resolve(&step.op)?;
    operation
        .descriptor()
        .bind_args(&step.args)
        .map_err(anyhow::Error::msg)
        .context("Invalid arguments")?;
    if step.disabled && step.breakpoint {
        report.warnings.push(format!(
            "Breakpoint on disabled step '{}' never pauses",
            step.op
        ));
    }
    Ok(report)
}

fn label_arg(step: &RecipeStep, idx: usize) -> &str {
    step.args
        .get(idx)
        .and_then(ArgValue::as_str)
        .unwrap_or_default()
}

fn validate_labels(steps: &[RecipeStep]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut labels: HashMap<&str, usize> = HashMap::new();

    for (idx, step) in steps.iter().enumerate() {
        if step.disabled || step.op != LABEL {
            continue;
        }
        let name = label_arg(step, 0);
        if let Some(first) = labels.get(name) {
            report.warnings.push(format!(
                "Label '{name}' at step {} repeats step {}; jumps resolve to the first",
                idx + 1,
                first + 1
            ));
        } else {
            labels.insert(name, idx);
        }
    }

    for (idx, step) in steps.iter().enumerate() {
        let target = match step.op.as_str() {
            JUMP => label_arg(step, 0),
            CONDITIONAL_JUMP => label_arg(step, 2),
            _ => continue,
        };
        if step.disabled || target.contains("$R") || labels.contains_key(target) {
            continue;
        }
        report.warnings.push(format!(
            "Step {} ('{}') targets missing label '{target}' and will fall through",
            idx + 1,
            step.op
        ));
    }

    report
}

fn validate_forks(steps: &[RecipeStep]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut open_fork: Option<usize> = None;

    for (idx, step) in steps.iter().enumerate() {
        if step.disabled {
            continue;
        }
        match step.op.as_str() {
            FORK => {
                open_fork.get_or_insert(idx);
            }
            MERGE => {
                if open_fork.take().is_none() {
                    report
                        .warnings
                        .push(format!("Merge at step {} has no open Fork", idx + 1));
                }
            }
            _ => {}
        }
    }

    if let Some(idx) = open_fork {
        report.warnings.push(format!(
            "Fork at step {} has no Merge; it runs to the end of the recipe",
            idx + 1
        ));
    }

    report
}

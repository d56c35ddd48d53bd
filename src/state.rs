use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;

use crate::dish::{Dish, DishType, DishValue};
use crate::error::OperationError;
use crate::operation::ArgValue;
use crate::operations::flow::MERGE;
use crate::pipeline::BoundStep;

/// `$R{name}` or `$R<digits>`, optionally escaped with a leading backslash.
static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\\)?\$R(?:\{(\w+)\}|(\d+))").expect("register placeholder pattern is valid")
});

/// Named text values captured by `Register` steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Registers {
    values: BTreeMap<String, String>,
    #[serde(skip)]
    next_numbered: usize,
}

impl Registers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn bind(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    /// Binds under the next free numeric name and returns that name.
    pub fn bind_numbered(&mut self, value: impl Into<String>) -> String {
        let name = self.next_numbered.to_string();
        self.next_numbered += 1;
        self.bind(name.clone(), value);
        name
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.values.clone()
    }

    /// Replaces register placeholders in `text`. Unknown registers stay as
    /// written; an escaped placeholder loses its backslash.
    pub fn substitute(&self, text: &str) -> String {
        if !text.contains("$R") {
            return text.to_string();
        }
        PLACEHOLDER
            .replace_all(text, |caps: &Captures| {
                let whole = &caps[0];
                if caps.get(1).is_some() {
                    return whole[1..].to_string();
                }
                let name = caps
                    .get(2)
                    .or_else(|| caps.get(3))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                self.get(name)
                    .map(str::to_string)
                    .unwrap_or_else(|| whole.to_string())
            })
            .into_owned()
    }

    /// Substitutes into every text-bearing argument.
    pub fn substitute_args(&self, args: &[ArgValue]) -> Vec<ArgValue> {
        args.iter()
            .map(|arg| match arg {
                ArgValue::Text(text) => ArgValue::Text(self.substitute(text)),
                ArgValue::Toggle { string, option } => ArgValue::Toggle {
                    string: self.substitute(string),
                    option: option.clone(),
                },
                other => other.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BakePhase {
    Running,
    /// Inside a flow-control step.
    Branching,
    Paused,
    Completed,
    Failed,
}

/// Everything a bake threads from step to step. Exclusively owned by one
/// bake; a fork branch gets its own copy.
pub struct ExecutionState {
    pub progress: usize,
    pub dish: Dish,
    pub jumps_taken: u32,
    pub registers: Registers,
    steps: Arc<[BoundStep]>,
    scope: Range<usize>,
    phase: BakePhase,
}

impl fmt::Debug for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionState")
            .field("progress", &self.progress)
            .field("dish_type", &self.dish.dish_type())
            .field("jumps_taken", &self.jumps_taken)
            .field("registers", &self.registers)
            .field("scope", &self.scope)
            .field("phase", &self.phase)
            .finish()
    }
}

impl ExecutionState {
    pub fn new(steps: Arc<[BoundStep]>, dish: Dish) -> Self {
        let scope = 0..steps.len();
        Self {
            progress: 0,
            dish,
            jumps_taken: 0,
            registers: Registers::new(),
            steps,
            scope,
            phase: BakePhase::Running,
        }
    }

    pub fn steps(&self) -> &[BoundStep] {
        &self.steps
    }

    pub(crate) fn shared_steps(&self) -> Arc<[BoundStep]> {
        Arc::clone(&self.steps)
    }

    /// Range of steps this state may execute: the whole recipe, or the
    /// forked section for a branch.
    pub fn scope(&self) -> Range<usize> {
        self.scope.clone()
    }

    pub fn phase(&self) -> BakePhase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: BakePhase) {
        self.phase = phase;
    }

    /// First `Label` step named `name` inside the scope.
    pub fn find_label(&self, name: &str) -> Option<usize> {
        self.scope().find(|&idx| self.steps[idx].is_label(name))
    }

    /// First enabled `Merge` after `after` inside the scope.
    pub fn find_merge(&self, after: usize) -> Option<usize> {
        (after + 1..self.scope.end)
            .find(|&idx| !self.steps[idx].disabled && self.steps[idx].name() == MERGE)
    }

    /// State for one fork branch over `scope`, starting from `dish`. Registers
    /// are copied, never shared.
    pub fn branch(&self, dish: Dish, scope: Range<usize>) -> ExecutionState {
        ExecutionState {
            progress: scope.start,
            dish,
            jumps_taken: 0,
            registers: self.registers.clone(),
            steps: Arc::clone(&self.steps),
            scope,
            phase: BakePhase::Running,
        }
    }

    /// Dish as text for flow-control inputs. Failure here is structural, so
    /// it is reported as a defect rather than a user error.
    pub fn text(&self) -> Result<String, OperationError> {
        match self.dish.get(DishType::String) {
            Ok(DishValue::String(text)) => Ok(text),
            Ok(other) => Err(OperationError::defect(format!(
                "expected text, got {}",
                other.dish_type()
            ))),
            Err(err) => Err(OperationError::defect(format!(
                "flow-control input is not text: {err}"
            ))),
        }
    }
}

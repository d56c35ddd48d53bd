//! Flow-control operations. They receive the whole execution state and move
//! its cursor; the executor advances one past wherever they leave it.

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use super::{arg_bool, arg_f64, arg_str, unescape};
use crate::dish::{Dish, DishType, DishValue};
use crate::error::{FailureKind, OperationError};
use crate::operation::{ArgSpec, Operation, OperationDescriptor, OperationRegistry};
use crate::pipeline::FlowStep;
use crate::state::ExecutionState;

pub const LABEL: &str = "Label";
pub const JUMP: &str = "Jump";
pub const CONDITIONAL_JUMP: &str = "Conditional Jump";
pub const REGISTER: &str = "Register";
pub const FORK: &str = "Fork";
pub const MERGE: &str = "Merge";
pub const RETURN: &str = "Return";
pub const COMMENT: &str = "Comment";

const DEFAULT_MAX_JUMPS: f64 = 10.0;

pub(super) fn register(registry: &mut OperationRegistry) {
    registry.register(Marker::new(
        LABEL,
        "Marks a position that Jump and Conditional Jump can move to.",
        Some(ArgSpec::string("Name", "")),
    ));
    registry.register(Marker::new(
        MERGE,
        "Ends the section started by Fork and joins the branch outputs.",
        None,
    ));
    registry.register(Marker::new(
        COMMENT,
        "Does nothing; annotates the recipe.",
        Some(ArgSpec::text("Comment", "")),
    ));
    registry.register(Jump::new());
    registry.register(ConditionalJump::new());
    registry.register(Register::new());
    registry.register(Fork::new());
    registry.register(Return::new());
}

fn flow_descriptor(name: &str, description: &str) -> OperationDescriptor {
    OperationDescriptor::new(name, DishType::String, DishType::String)
        .with_description(description)
        .flow()
}

fn max_jumps_arg() -> ArgSpec {
    ArgSpec::number("Maximum jumps (if jumping backwards)", DEFAULT_MAX_JUMPS)
        .range(Some(0.0), None)
}

fn max_jumps(step: &FlowStep<'_>, idx: usize) -> u32 {
    arg_f64(step.args, idx)
        .unwrap_or(DEFAULT_MAX_JUMPS)
        .clamp(0.0, f64::from(u32::MAX)) as u32
}

fn regex_error(pattern: &str, err: regex::Error) -> OperationError {
    OperationError::invalid(format!("Invalid regular expression '{pattern}': {err}"))
}

/// Moves the cursor onto `label` if it exists in scope and the jump budget
/// allows; otherwise resets the counter and falls through.
fn jump(state: &mut ExecutionState, label: &str, max_jumps: u32) -> bool {
    match state.find_label(label) {
        Some(target) if state.jumps_taken < max_jumps => {
            state.jumps_taken += 1;
            debug!(label, target, jumps = state.jumps_taken, "Jumping");
            state.progress = target;
            true
        }
        Some(_) => {
            debug!(label, max_jumps, "Jump limit reached, falling through");
            state.jumps_taken = 0;
            false
        }
        None => {
            debug!(label, "Jump target not found, falling through");
            state.jumps_taken = 0;
            false
        }
    }
}

/// Label, Merge and Comment: positions in the recipe with no behaviour of
/// their own.
pub struct Marker {
    descriptor: OperationDescriptor,
}

impl Marker {
    pub fn new(name: &str, description: &str, arg: Option<ArgSpec>) -> Self {
        let mut descriptor = flow_descriptor(name, description);
        descriptor.args.extend(arg);
        Self { descriptor }
    }
}

#[async_trait]
impl Operation for Marker {
    fn descriptor(&self) -> &OperationDescriptor {
        &self.descriptor
    }

    async fn run_flow(&self, _step: FlowStep<'_>) -> Result<(), OperationError> {
        Ok(())
    }
}

pub struct Jump {
    descriptor: OperationDescriptor,
}

impl Jump {
    pub fn new() -> Self {
        Self {
            descriptor: flow_descriptor(JUMP, "Moves execution to the named Label.")
                .with_arg(ArgSpec::string("Label name", ""))
                .with_arg(max_jumps_arg()),
        }
    }
}

impl Default for Jump {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Operation for Jump {
    fn descriptor(&self) -> &OperationDescriptor {
        &self.descriptor
    }

    async fn run_flow(&self, step: FlowStep<'_>) -> Result<(), OperationError> {
        let max = max_jumps(&step, 1);
        let label = arg_str(step.args, 0);
        jump(step.state, label, max);
        Ok(())
    }
}

pub struct ConditionalJump {
    descriptor: OperationDescriptor,
}

impl ConditionalJump {
    pub fn new() -> Self {
        Self {
            descriptor: flow_descriptor(
                CONDITIONAL_JUMP,
                "Jumps to the named Label if the dish matches a regular expression.",
            )
            .with_arg(ArgSpec::string("Match (regex)", ""))
            .with_arg(ArgSpec::boolean("Invert match", false))
            .with_arg(ArgSpec::string("Label name", ""))
            .with_arg(max_jumps_arg()),
        }
    }
}

impl Default for ConditionalJump {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Operation for ConditionalJump {
    fn descriptor(&self) -> &OperationDescriptor {
        &self.descriptor
    }

    async fn run_flow(&self, step: FlowStep<'_>) -> Result<(), OperationError> {
        let pattern = arg_str(step.args, 0);
        let invert = arg_bool(step.args, 1);
        let label = arg_str(step.args, 2);
        let max = max_jumps(&step, 3);

        let taken = if pattern.is_empty() {
            false
        } else {
            let text = step.state.text()?;
            let re = Regex::new(pattern).map_err(|err| regex_error(pattern, err))?;
            re.is_match(&text) != invert
        };

        if taken {
            jump(step.state, label, max);
        } else {
            step.state.jumps_taken = 0;
        }
        Ok(())
    }
}

pub struct Register {
    descriptor: OperationDescriptor,
}

impl Register {
    pub fn new() -> Self {
        Self {
            descriptor: flow_descriptor(
                REGISTER,
                "Captures regex groups from the dish into registers usable as $R{name} in later arguments.",
            )
            .with_arg(ArgSpec::string("Extractor", r"([\s\S]*)"))
            .with_arg(ArgSpec::string("Register names", ""))
            .with_arg(ArgSpec::boolean("Case insensitive", true))
            .with_arg(ArgSpec::boolean("Multiline matching", false))
            .with_arg(ArgSpec::boolean("Dot matches all", false)),
        }
    }
}

impl Default for Register {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Operation for Register {
    fn descriptor(&self) -> &OperationDescriptor {
        &self.descriptor
    }

    async fn run_flow(&self, step: FlowStep<'_>) -> Result<(), OperationError> {
        let pattern = arg_str(step.args, 0);
        let names: Vec<&str> = arg_str(step.args, 1)
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .collect();
        let re = RegexBuilder::new(pattern)
            .case_insensitive(arg_bool(step.args, 2))
            .multi_line(arg_bool(step.args, 3))
            .dot_matches_new_line(arg_bool(step.args, 4))
            .build()
            .map_err(|err| regex_error(pattern, err))?;

        let text = step.state.text()?;
        let Some(captures) = re.captures(&text) else {
            debug!(pattern, "Register extractor did not match");
            return Ok(());
        };

        let group_names: Vec<Option<&str>> = re.capture_names().skip(1).collect();
        for (idx, group) in captures.iter().skip(1).enumerate() {
            let value = group.map(|m| m.as_str()).unwrap_or_default();
            match names
                .get(idx)
                .copied()
                .or_else(|| group_names.get(idx).copied().flatten())
            {
                Some(name) => step.state.registers.bind(name, value),
                None => {
                    step.state.registers.bind_numbered(value);
                }
            }
        }
        Ok(())
    }
}

pub struct Fork {
    descriptor: OperationDescriptor,
}

impl Fork {
    pub fn new() -> Self {
        Self {
            descriptor: flow_descriptor(
                FORK,
                "Splits the dish and runs the steps up to Merge on each piece separately.",
            )
            .with_arg(ArgSpec::string("Split delimiter", r"\n"))
            .with_arg(ArgSpec::string("Merge delimiter", r"\n"))
            .with_arg(ArgSpec::boolean("Ignore errors", false)),
        }
    }
}

impl Default for Fork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Operation for Fork {
    fn descriptor(&self) -> &OperationDescriptor {
        &self.descriptor
    }

    async fn run_flow(&self, step: FlowStep<'_>) -> Result<(), OperationError> {
        let FlowStep {
            state,
            args,
            ctx,
            chef,
            control,
        } = step;
        let split_delimiter = unescape(arg_str(args, 0)).map_err(OperationError::invalid)?;
        let merge_delimiter = unescape(arg_str(args, 1)).map_err(OperationError::invalid)?;
        let ignore_errors = arg_bool(args, 2);

        let fork_index = state.progress;
        let scope_end = state.scope().end;
        let merge_index = state.find_merge(fork_index);
        let section = fork_index + 1..merge_index.unwrap_or(scope_end);

        let text = state.text()?;
        let pieces = split_pieces(&text, &split_delimiter);
        debug!(
            branches = pieces.len(),
            first = section.start,
            end = section.end,
            "Forking"
        );

        let branch_control = control.for_branch();
        let mut outputs = Vec::with_capacity(pieces.len());
        for (branch_index, piece) in pieces.into_iter().enumerate() {
            ctx.check_cancelled()?;
            let mut branch = state.branch(Dish::from_text(piece), section.clone());
            match chef.bake_section(&mut branch, &branch_control).await {
                Ok(_) => outputs.push(branch_output(branch.dish)?),
                Err(failure) if ignore_errors && failure.kind != FailureKind::Cancelled => {
                    warn!(
                        branch = branch_index,
                        step = failure.step_index,
                        operation = %failure.operation,
                        "Skipping failed fork branch: {}",
                        failure.message
                    );
                }
                Err(failure) => return Err(OperationError::Branch(Box::new(failure))),
            }
        }

        state.dish = Dish::from_text(outputs.join(&merge_delimiter));
        // Resume after the Merge, or finish the scope when there is none.
        state.progress = merge_index.unwrap_or(scope_end.saturating_sub(1).max(fork_index));
        Ok(())
    }
}

/// An empty delimiter splits into characters, so empty text yields no
/// branches at all.
fn split_pieces(text: &str, delimiter: &str) -> Vec<String> {
    if delimiter.is_empty() {
        text.chars().map(String::from).collect()
    } else {
        text.split(delimiter).map(str::to_string).collect()
    }
}

fn branch_output(dish: Dish) -> Result<String, OperationError> {
    match dish.into_value() {
        DishValue::Html(markup) => Ok(markup),
        value => Ok(value.convert(DishType::String)?.into_string()?),
    }
}

pub struct Return {
    descriptor: OperationDescriptor,
}

impl Return {
    pub fn new() -> Self {
        Self {
            descriptor: flow_descriptor(
                RETURN,
                "Ends the bake here, or the current branch inside a Fork.",
            ),
        }
    }
}

impl Default for Return {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Operation for Return {
    fn descriptor(&self) -> &OperationDescriptor {
        &self.descriptor
    }

    async fn run_flow(&self, step: FlowStep<'_>) -> Result<(), OperationError> {
        let end = step.state.scope().end;
        step.state.progress = end.saturating_sub(1).max(step.state.progress);
        Ok(())
    }
}

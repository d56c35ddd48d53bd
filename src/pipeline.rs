use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use tracing::{Instrument, debug, error, info, instrument, warn};

use crate::dish::{Dish, DishType};
use crate::error::{BakeFailure, FailureKind, OperationError};
use crate::highlight::{self, Direction};
use crate::observability::MetricsCollector;
use crate::operation::{
    ArgValue, BoxFuture, HighlightRange, Operation, OperationDescriptor, OperationRegistry,
    ProgressSink, ProgressUpdate, RunContext, default_registry,
};
use crate::operations::flow::LABEL;
use crate::recipe::{BakeOptions, RECIPE_VERSION, Recipe};
use crate::session::CancelFlag;
use crate::state::{BakePhase, ExecutionState, Registers};

/// A recipe step resolved against the registry, arguments bound.
#[derive(Clone)]
pub struct BoundStep {
    pub index: usize,
    pub operation: Arc<dyn Operation>,
    pub args: Vec<ArgValue>,
    pub disabled: bool,
    pub breakpoint: bool,
}

impl fmt::Debug for BoundStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundStep")
            .field("index", &self.index)
            .field("operation", &self.name())
            .field("args", &self.args)
            .field("disabled", &self.disabled)
            .field("breakpoint", &self.breakpoint)
            .finish()
    }
}

impl BoundStep {
    pub fn name(&self) -> &str {
        self.operation.name()
    }

    pub fn descriptor(&self) -> &OperationDescriptor {
        self.operation.descriptor()
    }

    pub fn is_label(&self, name: &str) -> bool {
        !self.disabled
            && self.name() == LABEL
            && self.args.first().and_then(ArgValue::as_str) == Some(name)
    }
}

/// A recipe whose every step resolved and bound. Cheap to clone and safe to
/// bake many times concurrently.
#[derive(Debug, Clone)]
pub struct PreparedRecipe {
    steps: Arc<[BoundStep]>,
    options: BakeOptions,
}

impl PreparedRecipe {
    pub fn steps(&self) -> &[BoundStep] {
        &self.steps
    }

    pub fn options(&self) -> &BakeOptions {
        &self.options
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Host-side knobs for a single bake.
#[derive(Clone)]
pub struct BakeControl {
    cancel: CancelFlag,
    progress: Option<ProgressSink>,
    honour_breakpoints: bool,
    start_from: usize,
}

impl Default for BakeControl {
    fn default() -> Self {
        Self {
            cancel: CancelFlag::new(),
            progress: None,
            honour_breakpoints: true,
            start_from: 0,
        }
    }
}

impl fmt::Debug for BakeControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BakeControl")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("progress_sink", &self.progress.is_some())
            .field("honour_breakpoints", &self.honour_breakpoints)
            .field("start_from", &self.start_from)
            .finish()
    }
}

impl BakeControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress<F>(mut self, sink: F) -> Self
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(sink));
        self
    }

    pub fn ignore_breakpoints(mut self) -> Self {
        self.honour_breakpoints = false;
        self
    }

    /// Index of the first step to run. A breakpoint on this very step does
    /// not pause again.
    pub fn start_from(mut self, index: usize) -> Self {
        self.start_from = index;
        self
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Control handed to fork branches: same cancellation and progress,
    /// breakpoints off.
    pub fn for_branch(&self) -> Self {
        Self {
            cancel: self.cancel.clone(),
            progress: self.progress.clone(),
            honour_breakpoints: false,
            start_from: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum BakeStatus {
    Completed,
    /// Stopped before the breakpoint step `at`; resume to continue.
    Paused { at: usize },
}

#[derive(Debug, Clone)]
pub struct BakeOutcome {
    pub dish: Dish,
    pub status: BakeStatus,
    pub progress: usize,
    pub registers: Registers,
    /// Jumps counted against the current loop's budget; carried into
    /// [`Chef::resume`].
    pub jumps_taken: u32,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

impl BakeOutcome {
    pub fn is_complete(&self) -> bool {
        self.status == BakeStatus::Completed
    }

    pub fn report(&self) -> BakeReport {
        BakeReport {
            started_at: self.started_at,
            duration_ms: self.duration.as_secs_f64() * 1_000.0,
            status: self.status,
            progress: self.progress,
            jumps_taken: self.jumps_taken,
            output_type: self.dish.dish_type(),
            output_size: self.dish.size(),
            registers: self.registers.to_map(),
        }
    }
}

/// Serialisable summary of a finished bake.
#[derive(Debug, Clone, Serialize)]
pub struct BakeReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub status: BakeStatus,
    pub progress: usize,
    pub jumps_taken: u32,
    pub output_type: DishType,
    pub output_size: usize,
    pub registers: BTreeMap<String, String>,
}

/// What a flow-control operation is handed: the whole execution state plus
/// the means to run nested sections.
pub struct FlowStep<'a> {
    pub state: &'a mut ExecutionState,
    pub args: &'a [ArgValue],
    pub ctx: &'a RunContext,
    pub chef: &'a Chef,
    pub control: &'a BakeControl,
}

/// The recipe executor.
#[derive(Debug, Clone)]
pub struct Chef {
    registry: OperationRegistry,
    metrics: MetricsCollector,
}

impl Default for Chef {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl Chef {
    pub fn new(registry: OperationRegistry) -> Self {
        Self {
            registry,
            metrics: MetricsCollector::new(),
        }
    }

    /// Executor over the process-wide built-in registry.
    pub fn with_defaults() -> Self {
        Self::new(default_registry().clone())
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    /// Resolves every operation name and binds every argument list. Nothing
    /// runs unless the whole recipe binds.
    pub fn prepare(&self, recipe: &Recipe) -> Result<PreparedRecipe, BakeFailure> {
        if recipe.version != RECIPE_VERSION {
            return Err(BakeFailure::configuration(
                0,
                "recipe",
                format!("Unsupported recipe version: {}", recipe.version),
            ));
        }
        let mut steps = Vec::with_capacity(recipe.steps.len());
        for (index, spec) in recipe.steps.iter().enumerate() {
            let operation = self
                .registry
                .resolve(&spec.op)
                .map_err(|err| BakeFailure::configuration(index, &spec.op, err.to_string()))?;
            let args = operation
                .descriptor()
                .bind_args(&spec.args)
                .map_err(|message| BakeFailure::configuration(index, &spec.op, message))?;
            steps.push(BoundStep {
                index,
                operation,
                args,
                disabled: spec.disabled,
                breakpoint: spec.breakpoint,
            });
        }
        Ok(PreparedRecipe {
            steps: Arc::from(steps),
            options: recipe.options.clone(),
        })
    }

    pub async fn bake(&self, recipe: &Recipe, input: Dish) -> Result<BakeOutcome, BakeFailure> {
        self.bake_with(recipe, input, BakeControl::default()).await
    }

    pub async fn bake_with(
        &self,
        recipe: &Recipe,
        input: Dish,
        control: BakeControl,
    ) -> Result<BakeOutcome, BakeFailure> {
        let prepared = self.prepare(recipe).inspect_err(|failure| {
            warn!(step = failure.step_index, operation = %failure.operation, "{}", failure.message);
            self.metrics.record_failure(failure);
        })?;
        self.bake_prepared(&prepared, input, control).await
    }

    #[instrument(skip_all, fields(steps = prepared.len()))]
    pub async fn bake_prepared(
        &self,
        prepared: &PreparedRecipe,
        input: Dish,
        control: BakeControl,
    ) -> Result<BakeOutcome, BakeFailure> {
        let mut state = ExecutionState::new(Arc::clone(&prepared.steps), input);
        state.progress = control.start_from.min(prepared.len());
        self.finish(state, prepared.options(), control).await
    }

    /// Continues a bake that stopped at a breakpoint, from the paused step.
    pub async fn resume(
        &self,
        recipe: &Recipe,
        paused: BakeOutcome,
        control: BakeControl,
    ) -> Result<BakeOutcome, BakeFailure> {
        let BakeStatus::Paused { at } = paused.status else {
            return Ok(paused);
        };
        let prepared = self.prepare(recipe)?;
        let mut state = ExecutionState::new(Arc::clone(&prepared.steps), paused.dish);
        state.registers = paused.registers;
        state.jumps_taken = paused.jumps_taken;
        state.progress = at.min(prepared.len());
        debug!(at, jumps_taken = paused.jumps_taken, "Resuming bake");
        self.finish(state, prepared.options(), control.start_from(at))
            .await
    }

    /// Runs the section of `state`'s scope starting at its cursor. Used by
    /// flow-control operations for nested execution such as fork branches.
    pub fn bake_section<'a>(
        &'a self,
        state: &'a mut ExecutionState,
        control: &'a BakeControl,
    ) -> BoxFuture<'a, Result<BakeStatus, BakeFailure>> {
        Box::pin(async move { self.run_steps(state, control).await })
    }

    pub fn highlight(
        &self,
        recipe: &Recipe,
        ranges: &[HighlightRange],
        direction: Direction,
    ) -> Result<Option<Vec<HighlightRange>>, BakeFailure> {
        let prepared = self.prepare(recipe)?;
        Ok(highlight::map_ranges(prepared.steps(), ranges, direction))
    }

    async fn finish(
        &self,
        mut state: ExecutionState,
        options: &BakeOptions,
        control: BakeControl,
    ) -> Result<BakeOutcome, BakeFailure> {
        let started_at = Utc::now();
        let timer = Instant::now();
        let control = if options.ignore_breakpoints {
            control.ignore_breakpoints()
        } else {
            control
        };

        let result = match self.run_steps(&mut state, &control).await {
            Ok(status) => self.serve(&mut state, status, options),
            Err(failure) => Err(failure),
        };
        let duration = timer.elapsed();

        match result {
            Ok(status) => {
                state.set_phase(match status {
                    BakeStatus::Completed => BakePhase::Completed,
                    BakeStatus::Paused { .. } => BakePhase::Paused,
                });
                self.metrics.record_bake(status, duration);
                info!(
                    status = ?status,
                    phase = ?state.phase(),
                    output_type = %state.dish.dish_type(),
                    duration_ms = duration.as_secs_f64() * 1_000.0,
                    "Bake finished"
                );
                Ok(BakeOutcome {
                    dish: state.dish,
                    status,
                    progress: state.progress,
                    registers: state.registers,
                    jumps_taken: state.jumps_taken,
                    started_at,
                    duration,
                })
            }
            Err(failure) => {
                state.set_phase(BakePhase::Failed);
                self.metrics.record_failure(&failure);
                if failure.kind == FailureKind::Cancelled {
                    info!(step = failure.step_index, phase = ?state.phase(), "Bake cancelled");
                    return Err(failure);
                }
                Err(failure.with_dish(state.dish))
            }
        }
    }

    /// Applies the recipe's requested output type to a completed bake.
    fn serve(
        &self,
        state: &mut ExecutionState,
        status: BakeStatus,
        options: &BakeOptions,
    ) -> Result<BakeStatus, BakeFailure> {
        let Some(target) = options.output_type else {
            return Ok(status);
        };
        if status != BakeStatus::Completed || state.dish.dish_type() == target {
            return Ok(status);
        }
        let value = state.dish.get(target).map_err(|err| {
            BakeFailure::new(
                state.progress,
                "output",
                FailureKind::DishConversion,
                err.to_string(),
            )
        })?;
        state.dish = Dish::new(value);
        Ok(status)
    }

    async fn run_steps(
        &self,
        state: &mut ExecutionState,
        control: &BakeControl,
    ) -> Result<BakeStatus, BakeFailure> {
        let steps = state.shared_steps();
        let start_from = state.progress.max(control.start_from);
        let end = state.scope().end;
        state.set_phase(BakePhase::Running);

        while state.progress < end {
            let index = state.progress;
            let step = &steps[index];

            if control.is_cancelled() {
                return Err(BakeFailure::cancelled(index, step.name()));
            }
            if step.disabled {
                state.progress += 1;
                continue;
            }
            if step.breakpoint && control.honour_breakpoints && index > start_from {
                debug!(step = index, "Paused at breakpoint");
                state.set_phase(BakePhase::Paused);
                return Ok(BakeStatus::Paused { at: index });
            }

            let span = tracing::span!(
                tracing::Level::DEBUG,
                "step",
                step = index,
                operation = step.name()
            );
            let args = state.registers.substitute_args(&step.args);
            let ctx = RunContext::new(
                index,
                step.name(),
                control.cancel.clone(),
                control.progress.clone(),
            );
            ctx.report(
                format!("Baking... {} ({}/{})", step.name(), index + 1, steps.len()),
                None,
            );
            let _timer = self.metrics.start_operation(step.name());

            if step.descriptor().flow_control {
                state.set_phase(BakePhase::Branching);
                let flow = FlowStep {
                    state: &mut *state,
                    args: &args,
                    ctx: &ctx,
                    chef: self,
                    control,
                };
                contain_panic(step.operation.run_flow(flow))
                    .instrument(span)
                    .await
                    .map_err(|err| self.step_failure(index, step.name(), err))?;
                state.set_phase(BakePhase::Running);
            } else {
                let descriptor = step.descriptor();
                let input = state.dish.get(descriptor.input_type).map_err(|err| {
                    self.step_failure(index, step.name(), OperationError::Dish(err))
                })?;
                debug!(step = index, operation = step.name(), input_type = %descriptor.input_type, "Dispatching operation");
                let output = contain_panic(step.operation.run(input, &args, &ctx))
                    .instrument(span)
                    .await
                    .map_err(|err| self.step_failure(index, step.name(), err))?;
                let output = output.convert(descriptor.output_type).map_err(|err| {
                    self.step_failure(index, step.name(), OperationError::Dish(err))
                })?;
                state
                    .dish
                    .set(output, descriptor.output_type)
                    .map_err(|err| {
                        self.step_failure(index, step.name(), OperationError::defect(err))
                    })?;
            }
            state.progress += 1;
        }

        Ok(BakeStatus::Completed)
    }

    fn step_failure(&self, index: usize, operation: &str, err: OperationError) -> BakeFailure {
        // Branch failures were already logged where they happened.
        if let OperationError::Branch(failure) = err {
            return *failure;
        }
        let failure = BakeFailure::from_operation(index, operation, err);
        match failure.kind {
            FailureKind::Defect => {
                let detail = failure
                    .source
                    .as_ref()
                    .map(|source| format!("{source:#}"))
                    .unwrap_or_default();
                error!(step = failure.step_index, operation = %failure.operation, error = %detail, "Operation defect");
            }
            FailureKind::Cancelled => {}
            _ => warn!(
                step = failure.step_index,
                operation = %failure.operation,
                kind = ?failure.kind,
                "{}",
                failure.message
            ),
        }
        failure
    }
}

/// Awaits an operation body; a panic inside it becomes a defect of the step.
async fn contain_panic<T>(
    body: impl Future<Output = Result<T, OperationError>>,
) -> Result<T, OperationError> {
    match AssertUnwindSafe(body).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(OperationError::defect(format!(
            "operation panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-text panic payload")
}

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::dish::{DishType, DishValue};
use crate::error::OperationError;
use crate::operations;
use crate::pipeline::FlowStep;
use crate::session::CancelFlag;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type OperationResult = std::result::Result<DishValue, OperationError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArgKind {
    String,
    Number,
    Boolean,
    /// One of a fixed list of choices.
    Option,
    /// Text paired with the encoding it should be read in.
    ToggleString,
    /// Free, possibly multi-line text.
    Text,
}

/// A bound argument value. Recipes list these positionally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Number(f64),
    Text(String),
    Toggle { string: String, option: String },
}

impl ArgValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn toggle(string: impl Into<String>, option: impl Into<String>) -> Self {
        Self::Toggle {
            string: string.into(),
            option: option.into(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Toggle { string, .. } => Some(string),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Number(n) => Some(*n != 0.0),
            Self::Text(text) => parse_bool(text),
            Self::Toggle { .. } => None,
        }
    }

    pub fn toggle_option(&self) -> Option<&str> {
        match self {
            Self::Toggle { option, .. } => Some(option),
            _ => None,
        }
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for ArgValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArgSpec {
    pub name: String,
    pub kind: ArgKind,
    pub default: ArgValue,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl ArgSpec {
    fn plain(name: &str, kind: ArgKind, default: ArgValue) -> Self {
        Self {
            name: name.to_string(),
            kind,
            default,
            options: Vec::new(),
            min: None,
            max: None,
        }
    }

    pub fn string(name: &str, default: &str) -> Self {
        Self::plain(name, ArgKind::String, ArgValue::text(default))
    }

    pub fn text(name: &str, default: &str) -> Self {
        Self::plain(name, ArgKind::Text, ArgValue::text(default))
    }

    pub fn number(name: &str, default: f64) -> Self {
        Self::plain(name, ArgKind::Number, ArgValue::Number(default))
    }

    pub fn boolean(name: &str, default: bool) -> Self {
        Self::plain(name, ArgKind::Boolean, ArgValue::Bool(default))
    }

    /// Enumerated choice; the first option is the default.
    pub fn option(name: &str, options: &[&str]) -> Self {
        let default = options.first().copied().unwrap_or_default();
        Self {
            options: options.iter().map(|o| o.to_string()).collect(),
            ..Self::plain(name, ArgKind::Option, ArgValue::text(default))
        }
    }

    pub fn toggle(name: &str, default: &str, encodings: &[&str]) -> Self {
        let option = encodings.first().copied().unwrap_or_default();
        Self {
            options: encodings.iter().map(|o| o.to_string()).collect(),
            ..Self::plain(
                name,
                ArgKind::ToggleString,
                ArgValue::toggle(default, option),
            )
        }
    }

    pub fn range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Checks `value` against this argument and normalises it; `None` takes
    /// the default.
    pub fn bind(&self, value: Option<&ArgValue>) -> std::result::Result<ArgValue, String> {
        let Some(value) = value else {
            return Ok(self.default.clone());
        };
        match self.kind {
            ArgKind::String | ArgKind::Text => Ok(ArgValue::Text(match value {
                ArgValue::Text(text) => text.clone(),
                ArgValue::Toggle { string, .. } => string.clone(),
                ArgValue::Number(n) => format_number(*n),
                ArgValue::Bool(b) => b.to_string(),
            })),
            ArgKind::Number => {
                let n = value
                    .as_f64()
                    .ok_or_else(|| format!("'{}' expects a number, got {value:?}", self.name))?;
                if let Some(min) = self.min
                    && n < min
                {
                    return Err(format!("'{}' must be at least {min}, got {n}", self.name));
                }
                if let Some(max) = self.max
                    && n > max
                {
                    return Err(format!("'{}' must be at most {max}, got {n}", self.name));
                }
                Ok(ArgValue::Number(n))
            }
            ArgKind::Boolean => value
                .as_bool()
                .map(ArgValue::Bool)
                .ok_or_else(|| format!("'{}' expects a boolean, got {value:?}", self.name)),
            ArgKind::Option => {
                let chosen = value
                    .as_str()
                    .ok_or_else(|| format!("'{}' expects one of its options", self.name))?;
                self.match_option(chosen).map(ArgValue::text)
            }
            ArgKind::ToggleString => match value {
                ArgValue::Toggle { string, option } => Ok(ArgValue::Toggle {
                    string: string.clone(),
                    option: self.match_option(option)?,
                }),
                ArgValue::Text(string) => Ok(ArgValue::Toggle {
                    string: string.clone(),
                    option: self.default.toggle_option().unwrap_or_default().to_string(),
                }),
                other => Err(format!(
                    "'{}' expects text with an encoding, got {other:?}",
                    self.name
                )),
            },
        }
    }

    fn match_option(&self, chosen: &str) -> std::result::Result<String, String> {
        self.options
            .iter()
            .find(|option| option.eq_ignore_ascii_case(chosen.trim()))
            .cloned()
            .ok_or_else(|| {
                format!(
                    "'{}' must be one of [{}], got '{chosen}'",
                    self.name,
                    self.options.join(", ")
                )
            })
    }
}

/// Introspectable metadata of an operation, readable without running it.
#[derive(Debug, Clone, Serialize)]
pub struct OperationDescriptor {
    pub name: String,
    pub description: String,
    pub input_type: DishType,
    pub output_type: DishType,
    pub args: Vec<ArgSpec>,
    pub flow_control: bool,
}

impl OperationDescriptor {
    pub fn new(name: &str, input_type: DishType, output_type: DishType) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            input_type,
            output_type,
            args: Vec::new(),
            flow_control: false,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_arg(mut self, arg: ArgSpec) -> Self {
        self.args.push(arg);
        self
    }

    pub fn flow(mut self) -> Self {
        self.flow_control = true;
        self
    }

    /// Binds positional values against the schema, filling defaults for
    /// missing trailing arguments.
    pub fn bind_args(&self, values: &[ArgValue]) -> std::result::Result<Vec<ArgValue>, String> {
        if values.len() > self.args.len() {
            return Err(format!(
                "'{}' takes {} argument(s) but {} were supplied",
                self.name,
                self.args.len(),
                values.len()
            ));
        }
        self.args
            .iter()
            .enumerate()
            .map(|(idx, spec)| spec.bind(values.get(idx)))
            .collect()
    }
}

/// Half-open byte offset range used for source highlighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighlightRange {
    pub start: usize,
    pub end: usize,
}

impl HighlightRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub step_index: usize,
    pub operation: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
}

/// Out-of-band status channel. Advisory only.
pub type ProgressSink = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

/// What an operation may see of the bake it runs in.
#[derive(Clone)]
pub struct RunContext {
    step_index: usize,
    operation: Arc<str>,
    cancel: CancelFlag,
    progress: Option<ProgressSink>,
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("step_index", &self.step_index)
            .field("operation", &self.operation)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("progress_sink", &self.progress.is_some())
            .finish()
    }
}

impl RunContext {
    pub fn new(
        step_index: usize,
        operation: &str,
        cancel: CancelFlag,
        progress: Option<ProgressSink>,
    ) -> Self {
        Self {
            step_index,
            operation: Arc::from(operation),
            cancel,
            progress,
        }
    }

    /// Context with no host attached: never cancelled, progress discarded.
    pub fn detached(operation: &str) -> Self {
        Self::new(0, operation, CancelFlag::new(), None)
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check_cancelled(&self) -> std::result::Result<(), OperationError> {
        if self.is_cancelled() {
            Err(OperationError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn report(&self, message: impl Into<String>, percent: Option<u8>) {
        if let Some(sink) = &self.progress {
            sink(&ProgressUpdate {
                step_index: self.step_index,
                operation: self.operation.to_string(),
                message: message.into(),
                percent: percent.map(|p| p.min(100)),
            });
        }
    }
}

/// The contract every transformation unit implements.
///
/// Plain operations implement [`Operation::run`] and receive the dish already
/// coerced to their declared input type. Flow-control operations set
/// `flow_control` in their descriptor and implement [`Operation::run_flow`]
/// instead, which hands them the whole execution state.
#[async_trait]
pub trait Operation: Send + Sync {
    fn descriptor(&self) -> &OperationDescriptor;

    fn name(&self) -> &str {
        &self.descriptor().name
    }

    async fn run(&self, input: DishValue, args: &[ArgValue], ctx: &RunContext) -> OperationResult {
        let _ = (input, args, ctx);
        Err(OperationError::defect(format!(
            "'{}' does not transform dishes",
            self.name()
        )))
    }

    async fn run_flow(&self, step: FlowStep<'_>) -> std::result::Result<(), OperationError> {
        let _ = step;
        Err(OperationError::defect(format!(
            "'{}' is not a flow-control operation",
            self.name()
        )))
    }

    /// Maps input offsets to output offsets. `None` means unsupported.
    fn highlight(&self, ranges: &[HighlightRange], args: &[ArgValue]) -> Option<Vec<HighlightRange>> {
        let _ = (ranges, args);
        None
    }

    /// Maps output offsets back to input offsets.
    fn highlight_reverse(
        &self,
        ranges: &[HighlightRange],
        args: &[ArgValue],
    ) -> Option<Vec<HighlightRange>> {
        let _ = (ranges, args);
        None
    }
}

type SyncBody = dyn Fn(DishValue, &[ArgValue], &RunContext) -> OperationResult + Send + Sync;
type AsyncBody =
    dyn Fn(DishValue, Vec<ArgValue>, RunContext) -> BoxFuture<'static, OperationResult> + Send + Sync;
type RangeMap = dyn Fn(&[HighlightRange], &[ArgValue]) -> Vec<HighlightRange> + Send + Sync;

enum Body {
    Sync(Box<SyncBody>),
    Async(Box<AsyncBody>),
}

/// An operation described by data plus a closure body.
pub struct FnOperation {
    descriptor: OperationDescriptor,
    body: Body,
    highlight: Option<Arc<RangeMap>>,
    highlight_reverse: Option<Arc<RangeMap>>,
}

impl FnOperation {
    pub fn sync<F>(descriptor: OperationDescriptor, body: F) -> Self
    where
        F: Fn(DishValue, &[ArgValue], &RunContext) -> OperationResult + Send + Sync + 'static,
    {
        Self {
            descriptor,
            body: Body::Sync(Box::new(body)),
            highlight: None,
            highlight_reverse: None,
        }
    }

    pub fn asynchronous<F, Fut>(descriptor: OperationDescriptor, body: F) -> Self
    where
        F: Fn(DishValue, Vec<ArgValue>, RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = OperationResult> + Send + 'static,
    {
        Self {
            descriptor,
            body: Body::Async(Box::new(move |input, args, ctx| {
                Box::pin(body(input, args, ctx)) as BoxFuture<'static, OperationResult>
            })),
            highlight: None,
            highlight_reverse: None,
        }
    }

    pub fn with_highlight<F, R>(mut self, forward: F, reverse: R) -> Self
    where
        F: Fn(&[HighlightRange], &[ArgValue]) -> Vec<HighlightRange> + Send + Sync + 'static,
        R: Fn(&[HighlightRange], &[ArgValue]) -> Vec<HighlightRange> + Send + Sync + 'static,
    {
        self.highlight = Some(Arc::new(forward));
        self.highlight_reverse = Some(Arc::new(reverse));
        self
    }
}

#[async_trait]
impl Operation for FnOperation {
    fn descriptor(&self) -> &OperationDescriptor {
        &self.descriptor
    }

    async fn run(&self, input: DishValue, args: &[ArgValue], ctx: &RunContext) -> OperationResult {
        match &self.body {
            Body::Sync(body) => body(input, args, ctx),
            Body::Async(body) => body(input, args.to_vec(), ctx.clone()).await,
        }
    }

    fn highlight(&self, ranges: &[HighlightRange], args: &[ArgValue]) -> Option<Vec<HighlightRange>> {
        self.highlight.as_ref().map(|map| map(ranges, args))
    }

    fn highlight_reverse(
        &self,
        ranges: &[HighlightRange],
        args: &[ArgValue],
    ) -> Option<Vec<HighlightRange>> {
        self.highlight_reverse.as_ref().map(|map| map(ranges, args))
    }
}

/// Name to operation lookup. Read-only once a bake starts.
#[derive(Clone)]
pub struct OperationRegistry {
    operations: HashMap<String, Arc<dyn Operation>>,
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("operations", &self.known_operations())
            .finish()
    }
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self {
            operations: HashMap::new(),
        }
    }

    /// Registry pre-loaded with the built-in operations.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        operations::register_defaults(&mut registry);
        registry
    }

    pub fn register(&mut self, operation: impl Operation + 'static) {
        self.register_arc(Arc::new(operation));
    }

    pub fn register_arc(&mut self, operation: Arc<dyn Operation>) {
        self.operations
            .insert(operation.name().to_string(), operation);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Operation>> {
        self.operations.get(name).cloned()
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Operation>> {
        self.get(name).ok_or_else(|| {
            anyhow!(
                "Unknown operation '{}'. Available operations: {}",
                name,
                self.known_operations().join(", ")
            )
        })
    }

    pub fn known_operations(&self) -> Vec<String> {
        let mut names: Vec<_> = self.operations.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn descriptors(&self) -> Vec<&OperationDescriptor> {
        let mut descriptors: Vec<_> = self
            .operations
            .values()
            .map(|operation| operation.descriptor())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Process-wide registry of the built-in operations.
pub fn default_registry() -> &'static OperationRegistry {
    static DEFAULT: Lazy<OperationRegistry> = Lazy::new(OperationRegistry::with_defaults);
    &DEFAULT
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new("Example", DishType::String, DishType::String)
            .with_arg(ArgSpec::string("Text", "x"))
            .with_arg(ArgSpec::number("Count", 3.0).range(Some(0.0), Some(10.0)))
            .with_arg(ArgSpec::boolean("Flag", false))
            .with_arg(ArgSpec::option("Mode", &["Fast", "Slow"]))
            .with_arg(ArgSpec::toggle("Key", "", &["Hex", "UTF8"]))
    }

    #[test]
    fn missing_args_take_defaults() {
        let bound = descriptor().bind_args(&[ArgValue::text("abc")]).unwrap();
        assert_eq!(
            bound,
            vec![
                ArgValue::text("abc"),
                ArgValue::Number(3.0),
                ArgValue::Bool(false),
                ArgValue::text("Fast"),
                ArgValue::toggle("", "Hex"),
            ]
        );
    }

    #[test]
    fn compatible_scalars_are_coerced() {
        let bound = descriptor()
            .bind_args(&[
                ArgValue::Number(7.0),
                ArgValue::text("4"),
                ArgValue::text("yes"),
                ArgValue::text("slow"),
                ArgValue::text("00ff"),
            ])
            .unwrap();
        assert_eq!(bound[0], ArgValue::text("7"));
        assert_eq!(bound[1], ArgValue::Number(4.0));
        assert_eq!(bound[2], ArgValue::Bool(true));
        assert_eq!(bound[3], ArgValue::text("Slow"));
        assert_eq!(bound[4], ArgValue::toggle("00ff", "Hex"));
    }

    #[test]
    fn invalid_args_are_rejected() {
        let desc = descriptor();
        assert!(desc.bind_args(&[ArgValue::text("a"), ArgValue::Number(11.0)]).is_err());
        assert!(desc.bind_args(&[ArgValue::text("a"), ArgValue::text("many")]).is_err());
        assert!(
            desc.bind_args(&[
                ArgValue::text("a"),
                ArgValue::Number(1.0),
                ArgValue::Bool(true),
                ArgValue::text("Medium"),
            ])
            .is_err()
        );
        let too_many = vec![ArgValue::Bool(true); 6];
        assert!(desc.bind_args(&too_many).is_err());
    }

    #[test]
    fn registry_lists_and_resolves() {
        let registry = OperationRegistry::with_defaults();
        assert!(registry.get("Fork").is_some());
        assert!(registry.resolve("Not real").is_err());
        let names = registry.known_operations();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn args_deserialize_untagged() {
        let values: Vec<ArgValue> =
            serde_json::from_str(r#"[true, 3, "x", {"string": "ab", "option": "Hex"}]"#).unwrap();
        assert_eq!(
            values,
            vec![
                ArgValue::Bool(true),
                ArgValue::Number(3.0),
                ArgValue::text("x"),
                ArgValue::toggle("ab", "Hex"),
            ]
        );
    }
}

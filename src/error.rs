use serde::Serialize;
use thiserror::Error;

use crate::dish::{Dish, DishType};

/// Failure raised by the dish container or its conversion matrix.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DishError {
    #[error("value of type {found} cannot be stored as {declared}")]
    TypeMismatch { declared: DishType, found: DishType },

    #[error("no conversion path from {from} to {to}")]
    NoConversionPath { from: DishType, to: DishType },

    #[error("cannot convert {from} to {to}: {reason}")]
    Malformed {
        from: DishType,
        to: DishType,
        reason: String,
    },
}

impl DishError {
    pub(crate) fn malformed(from: DishType, to: DishType, reason: impl ToString) -> Self {
        Self::Malformed {
            from,
            to,
            reason: reason.to_string(),
        }
    }
}

/// Error returned from an operation body.
///
/// `Invalid` is the user-facing kind: its message is shown verbatim. `Defect`
/// wraps anything unexpected and is only reported generically.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Dish(#[from] DishError),

    #[error("bake cancelled")]
    Cancelled,

    #[error("forked branch failed: {0}")]
    Branch(Box<BakeFailure>),

    #[error(transparent)]
    Defect(#[from] anyhow::Error),
}

impl OperationError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    pub fn defect(message: impl std::fmt::Display) -> Self {
        Self::Defect(anyhow::anyhow!("{message}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// The recipe could not be bound against the registry.
    Configuration,
    DishConversion,
    /// Deliberate, user-facing error raised by an operation.
    Operation,
    Defect,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::DishConversion => "dish-conversion",
            Self::Operation => "operation",
            Self::Defect => "defect",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Terminal failure of a bake, attributed to the step that halted it.
#[derive(Debug, Error, Serialize)]
#[error("{operation} (step {step_index}): {message}")]
pub struct BakeFailure {
    pub step_index: usize,
    pub operation: String,
    pub kind: FailureKind,
    pub message: String,
    /// Dish as it stood before the failing step ran.
    #[serde(skip)]
    pub dish: Option<Dish>,
    #[serde(skip)]
    #[source]
    pub source: Option<anyhow::Error>,
}

impl BakeFailure {
    pub fn new(
        step_index: usize,
        operation: impl Into<String>,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            step_index,
            operation: operation.into(),
            kind,
            message: message.into(),
            dish: None,
            source: None,
        }
    }

    pub fn configuration(
        step_index: usize,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(step_index, operation, FailureKind::Configuration, message)
    }

    pub fn cancelled(step_index: usize, operation: impl Into<String>) -> Self {
        Self::new(
            step_index,
            operation,
            FailureKind::Cancelled,
            "Bake cancelled",
        )
    }

    /// Maps an operation error onto the failure taxonomy. Defects keep their
    /// source for the host but expose only a generic message.
    pub fn from_operation(
        step_index: usize,
        operation: impl Into<String>,
        err: OperationError,
    ) -> Self {
        let operation = operation.into();
        match err {
            OperationError::Invalid(message) => {
                Self::new(step_index, operation, FailureKind::Operation, message)
            }
            OperationError::Dish(err) => Self::new(
                step_index,
                operation,
                FailureKind::DishConversion,
                err.to_string(),
            ),
            OperationError::Cancelled => Self::cancelled(step_index, operation),
            OperationError::Branch(failure) => *failure,
            OperationError::Defect(source) => {
                let message = format!("Unexpected error in operation '{operation}'");
                Self {
                    step_index,
                    operation,
                    kind: FailureKind::Defect,
                    message,
                    dish: None,
                    source: Some(source),
                }
            }
        }
    }

    pub fn with_dish(mut self, dish: Dish) -> Self {
        if self.dish.is_none() {
            self.dish = Some(dish);
        }
        self
    }

    pub fn is_user_facing(&self) -> bool {
        !matches!(self.kind, FailureKind::Defect)
    }
}

pub mod dish;
pub mod error;
pub mod highlight;
pub mod observability;
pub mod operation;
pub mod operations;
pub mod pipeline;
pub mod recipe;
pub mod session;
pub mod state;
pub mod validation;

pub use dish::{Dish, DishFile, DishType, DishValue};
pub use error::{BakeFailure, DishError, FailureKind, OperationError};
pub use operation::{
    ArgKind, ArgSpec, ArgValue, FnOperation, Operation, OperationDescriptor, OperationRegistry,
    RunContext,
};
pub use pipeline::{BakeControl, BakeOutcome, BakeStatus, Chef};
pub use recipe::{Recipe, RecipeStep};
pub use session::{BakeSlot, CancelFlag};

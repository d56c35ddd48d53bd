use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use crate::dish::Dish;
use crate::error::{BakeFailure, FailureKind};
use crate::pipeline::{BakeControl, BakeOutcome, Chef};
use crate::recipe::Recipe;

/// Cooperative cancellation shared between a host and a running bake.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One recipe slot in a host, e.g. an editor pane. Starting a bake cancels
/// the one still running in the same slot.
pub struct BakeSlot {
    chef: Arc<Chef>,
    current: Mutex<Option<CancelFlag>>,
}

impl BakeSlot {
    pub fn new(chef: Arc<Chef>) -> Self {
        Self {
            chef,
            current: Mutex::new(None),
        }
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
        let flag = control.cancel_flag().clone();
        self.replace_current(Some(flag.clone()));
        let result = self.chef.bake_with(recipe, input, control).await;
        // Only clear the slot if no newer bake took it over meanwhile.
        if let Ok(mut guard) = self.current.lock()
            && guard
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(&current.0, &flag.0))
        {
            *guard = None;
        }
        result
    }

    /// Cancels whatever bake is in flight in this slot.
    pub fn cancel(&self) {
        self.replace_current(None);
    }

    pub fn is_busy(&self) -> bool {
        self.current
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    fn replace_current(&self, next: Option<CancelFlag>) {
        if let Ok(mut guard) = self.current.lock()
            && let Some(previous) = std::mem::replace(&mut *guard, next)
        {
            debug!("Cancelling in-flight bake");
            previous.cancel();
        }
    }
}

/// Bakes every input independently and concurrently. Results come back in
/// input order.
pub async fn bake_batch(
    chef: Arc<Chef>,
    recipe: Arc<Recipe>,
    inputs: Vec<Dish>,
) -> Vec<Result<BakeOutcome, BakeFailure>> {
    let handles: Vec<_> = inputs
        .into_iter()
        .map(|input| {
            let chef = Arc::clone(&chef);
            let recipe = Arc::clone(&recipe);
            tokio::spawn(async move { chef.bake(&recipe, input).await })
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for (idx, handle) in handles.into_iter().enumerate() {
        match handle.await {
            Ok(result) => results.push(result),
            Err(err) => {
                error!(input = idx, error = %err, "Bake task did not complete");
                results.push(Err(BakeFailure {
                    source: Some(anyhow::Error::new(err)),
                    ..BakeFailure::new(
                        0,
                        "batch",
                        FailureKind::Defect,
                        "Bake task did not complete",
                    )
                }));
            }
        }
    }
    results
}

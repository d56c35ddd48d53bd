use std::sync::Arc;
use std::time::Duration;

use bakehouse::dish::{Dish, DishValue};
use bakehouse::error::FailureKind;
use bakehouse::operation::ArgValue;
use bakehouse::pipeline::Chef;
use bakehouse::recipe::Recipe;
use bakehouse::session::{BakeSlot, bake_batch};

#[tokio::test]
async fn new_bake_cancels_the_one_in_flight() {
    let slot = Arc::new(BakeSlot::new(Arc::new(Chef::with_defaults())));
    let slow = Recipe::default().then("Sleep", [ArgValue::from(10_000.0)]);

    let first = {
        let slot = Arc::clone(&slot);
        tokio::spawn(async move { slot.bake(&slow, Dish::from_text("old")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(slot.is_busy());

    let quick = Recipe::default().then("To Upper case", ["All"]);
    let second = slot.bake(&quick, Dish::from_text("new")).await.unwrap();
    assert_eq!(second.dish.value(), &DishValue::String("NEW".into()));

    let failure = first.await.unwrap().unwrap_err();
    assert_eq!(failure.kind, FailureKind::Cancelled);
    assert!(failure.dish.is_none());
    assert!(!slot.is_busy());
}

#[tokio::test]
async fn explicit_cancel_stops_the_current_bake() {
    let slot = Arc::new(BakeSlot::new(Arc::new(Chef::with_defaults())));
    let slow = Recipe::default().then("Sleep", [ArgValue::from(10_000.0)]);
    let running = {
        let slot = Arc::clone(&slot);
        tokio::spawn(async move { slot.bake(&slow, Dish::from_text("x")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    slot.cancel();
    let failure = running.await.unwrap().unwrap_err();
    assert_eq!(failure.kind, FailureKind::Cancelled);
}

#[tokio::test]
async fn batch_results_keep_input_order() {
    let chef = Arc::new(Chef::with_defaults());
    let recipe = Arc::new(
        Recipe::default()
            .then("Sleep", [ArgValue::from(5.0)])
            .then("To Upper case", ["All"]),
    );
    let inputs = ["one", "two", "three"]
        .into_iter()
        .map(Dish::from_text)
        .collect();
    let results = bake_batch(Arc::clone(&chef), recipe, inputs).await;
    let outputs: Vec<_> = results
        .into_iter()
        .map(|result| result.unwrap().dish.into_value())
        .collect();
    assert_eq!(
        outputs,
        vec![
            DishValue::String("ONE".into()),
            DishValue::String("TWO".into()),
            DishValue::String("THREE".into()),
        ]
    );
    assert_eq!(chef.metrics().snapshot().bakes_completed, 3);
}

#[tokio::test]
async fn batch_failures_stay_with_their_input() {
    let chef = Arc::new(Chef::with_defaults());
    let recipe = Arc::new(Recipe::default().then("From Hex", Vec::<ArgValue>::new()));
    let inputs = vec![Dish::from_text("41"), Dish::from_text("4"), Dish::from_text("42")];
    let results = bake_batch(chef, recipe, inputs).await;
    assert!(results[0].is_ok());
    assert_eq!(
        results[1].as_ref().unwrap_err().kind,
        FailureKind::Operation
    );
    assert!(results[2].is_ok());
}

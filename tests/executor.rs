use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bakehouse::dish::{Bytes, Dish, DishType, DishValue};
use bakehouse::error::{FailureKind, OperationError};
use bakehouse::operation::{ArgValue, FnOperation, OperationDescriptor, OperationRegistry};
use bakehouse::pipeline::{BakeControl, BakeOutcome, BakeStatus, Chef};
use bakehouse::recipe::{Recipe, RecipeStep};
use bakehouse::session::CancelFlag;
use serde_json::json;

fn text(outcome: &BakeOutcome) -> String {
    outcome
        .dish
        .get(DishType::String)
        .unwrap()
        .into_string()
        .unwrap()
}

fn no_args() -> Vec<ArgValue> {
    Vec::new()
}

/// Registry with a "Count" pass-through operation that tallies its calls.
fn counting_chef() -> (Chef, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let mut registry = OperationRegistry::with_defaults();
    registry.register(FnOperation::sync(
        OperationDescriptor::new("Count", DishType::String, DishType::String),
        move |input, _args, _ctx| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(input)
        },
    ));
    (Chef::new(registry), calls)
}

#[tokio::test]
async fn upper_cases_text() {
    let chef = Chef::with_defaults();
    let recipe = Recipe::default().then("To Upper case", ["All"]);
    let outcome = chef.bake(&recipe, Dish::from_text("hello")).await.unwrap();
    assert!(outcome.is_complete());
    assert_eq!(outcome.dish.value(), &DishValue::String("HELLO".into()));
    assert_eq!(outcome.progress, 1);
}

#[tokio::test]
async fn converts_between_declared_types() {
    let chef = Chef::with_defaults();
    let recipe = Recipe::default()
        .then("To Hex", ["None"])
        .then("From Hex", no_args())
        .then("To Base64", ["Standard"]);
    let outcome = chef.bake(&recipe, Dish::from_text("Hi")).await.unwrap();
    assert_eq!(outcome.dish.value(), &DishValue::String("SGk=".into()));
}

#[tokio::test]
async fn empty_recipe_returns_input() {
    let chef = Chef::with_defaults();
    let outcome = chef
        .bake(&Recipe::default(), Dish::from_bytes(vec![1u8, 2, 3]))
        .await
        .unwrap();
    assert_eq!(outcome.dish.value(), &DishValue::ByteArray(vec![1u8, 2, 3].into()));
    assert_eq!(outcome.progress, 0);
}

#[tokio::test]
async fn disabled_steps_are_skipped() {
    let chef = Chef::with_defaults();
    let recipe = Recipe::default()
        .step(RecipeStep::new("To Upper case", ["All"]).disabled())
        .then("Reverse", ["Character"]);
    let outcome = chef.bake(&recipe, Dish::from_text("abc")).await.unwrap();
    assert_eq!(text(&outcome), "cba");
}

#[tokio::test]
async fn backward_jump_is_bounded_by_its_maximum() {
    let (chef, calls) = counting_chef();
    let recipe = Recipe::default()
        .then("Label", ["top"])
        .then("Count", no_args())
        .then("Jump", [ArgValue::from("top"), ArgValue::from(3.0)]);
    let outcome = chef.bake(&recipe, Dish::from_text("x")).await.unwrap();
    assert!(outcome.is_complete());
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn jump_to_missing_label_falls_through() {
    let (chef, calls) = counting_chef();
    let recipe = Recipe::default()
        .then("Jump", ["nowhere"])
        .then("Count", no_args());
    chef.bake(&recipe, Dish::from_text("x")).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn forward_jump_skips_steps() {
    let chef = Chef::with_defaults();
    let recipe = Recipe::default()
        .then("Jump", ["end"])
        .then("To Upper case", ["All"])
        .then("Label", ["end"]);
    let outcome = chef.bake(&recipe, Dish::from_text("quiet")).await.unwrap();
    assert_eq!(text(&outcome), "quiet");
}

#[tokio::test]
async fn conditional_jump_loops_until_the_pattern_stops_matching() {
    let chef = Chef::with_defaults();
    // Strips one leading "a" per pass until none are left.
    let recipe = Recipe::default()
        .then("Label", ["again"])
        .then(
            "Find / Replace",
            [
                ArgValue::toggle("^a", "Regex"),
                ArgValue::from(""),
                ArgValue::from(false),
            ],
        )
        .then(
            "Conditional Jump",
            [
                ArgValue::from("^a"),
                ArgValue::from(false),
                ArgValue::from("again"),
                ArgValue::from(10.0),
            ],
        );
    let outcome = chef.bake(&recipe, Dish::from_text("aaab")).await.unwrap();
    assert_eq!(text(&outcome), "b");
}

#[tokio::test]
async fn empty_conditional_pattern_never_branches() {
    let (chef, calls) = counting_chef();
    let recipe = Recipe::default()
        .then("Label", ["top"])
        .then("Count", no_args())
        .then("Conditional Jump", ["", "false", "top"]);
    chef.bake(&recipe, Dish::from_text("x")).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn return_ends_the_bake() {
    let chef = Chef::with_defaults();
    let recipe = Recipe::default()
        .then("To Upper case", ["All"])
        .then("Return", no_args())
        .then("Reverse", ["Character"]);
    let outcome = chef.bake(&recipe, Dish::from_text("abc")).await.unwrap();
    assert!(outcome.is_complete());
    assert_eq!(text(&outcome), "ABC");
}

#[tokio::test]
async fn input_conversion_failure_keeps_the_dish() {
    let chef = Chef::with_defaults();
    let recipe = Recipe::default()
        .then("To Upper case", ["All"])
        .then("JSON Minify", no_args());
    let failure = chef
        .bake(&recipe, Dish::from_text("not json"))
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::DishConversion);
    assert_eq!(failure.step_index, 1);
    assert_eq!(failure.operation, "JSON Minify");
    assert!(failure.is_user_facing());
    assert_eq!(
        failure.dish.as_ref().map(Dish::value),
        Some(&DishValue::String("NOT JSON".into()))
    );
}

#[tokio::test]
async fn operation_errors_are_user_facing() {
    let chef = Chef::with_defaults();
    let recipe = Recipe::default().then("From Hex", no_args());
    let failure = chef.bake(&recipe, Dish::from_text("abc")).await.unwrap_err();
    assert_eq!(failure.kind, FailureKind::Operation);
    assert_eq!(failure.step_index, 0);
}

#[tokio::test]
async fn defects_hide_their_cause() {
    let mut registry = OperationRegistry::with_defaults();
    registry.register(FnOperation::sync(
        OperationDescriptor::new("Broken", DishType::String, DishType::String),
        |_input, _args, _ctx| Err(OperationError::defect("index 7 out of bounds")),
    ));
    let chef = Chef::new(registry);
    let recipe = Recipe::default().then("Broken", no_args());
    let failure = chef.bake(&recipe, Dish::from_text("x")).await.unwrap_err();
    assert_eq!(failure.kind, FailureKind::Defect);
    assert!(!failure.is_user_facing());
    assert!(!failure.message.contains("index 7"));
    assert!(failure.source.is_some());
    assert_eq!(chef.metrics().snapshot().bakes_failed, 1);
}

#[tokio::test]
async fn unknown_operation_fails_before_any_step_runs() {
    let (chef, calls) = counting_chef();
    let recipe = Recipe::default()
        .then("Count", no_args())
        .then("Frobnicate", no_args());
    let failure = chef.bake(&recipe, Dish::from_text("x")).await.unwrap_err();
    assert_eq!(failure.kind, FailureKind::Configuration);
    assert_eq!(failure.step_index, 1);
    assert!(failure.message.contains("Frobnicate"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn bad_arguments_are_configuration_failures() {
    let chef = Chef::with_defaults();
    let recipe = Recipe::default().then("To Upper case", ["Loudly"]);
    let failure = chef.bake(&recipe, Dish::from_text("x")).await.unwrap_err();
    assert_eq!(failure.kind, FailureKind::Configuration);
}

#[tokio::test]
async fn unsupported_output_type_fails_the_bake() {
    let chef = Chef::with_defaults();
    let recipe = Recipe::default()
        .then("To Upper case", ["All"])
        .with_output_type(DishType::Number);
    let failure = chef.bake(&recipe, Dish::from_text("abc")).await.unwrap_err();
    assert_eq!(failure.kind, FailureKind::DishConversion);
    assert_eq!(failure.operation, "output");

    let numeric = Recipe::default().with_output_type(DishType::Number);
    let outcome = chef.bake(&numeric, Dish::from_text(" 42 ")).await.unwrap();
    assert_eq!(outcome.dish.value(), &DishValue::Number(42));
}

#[tokio::test]
async fn same_input_bakes_identically() {
    let chef = Chef::with_defaults();
    let recipe = Recipe::default()
        .then("SHA2", ["256"])
        .then("To Upper case", ["All"]);
    let first = chef.bake(&recipe, Dish::from_text("abc")).await.unwrap();
    let second = chef.bake(&recipe, Dish::from_text("abc")).await.unwrap();
    assert_eq!(first.dish, second.dish);
    assert_eq!(
        text(&first),
        "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD"
    );
}

#[tokio::test]
async fn pauses_at_breakpoint_and_resumes() {
    let chef = Chef::with_defaults();
    let recipe = Recipe::default()
        .then("To Upper case", ["All"])
        .step(RecipeStep::new("To Hex", ["Space"]).breakpoint());
    let paused = chef.bake(&recipe, Dish::from_text("ab")).await.unwrap();
    assert_eq!(paused.status, BakeStatus::Paused { at: 1 });
    assert!(!paused.is_complete());
    assert_eq!(text(&paused), "AB");

    let resumed = chef
        .resume(&recipe, paused, BakeControl::new())
        .await
        .unwrap();
    assert!(resumed.is_complete());
    assert_eq!(text(&resumed), "41 42");
}

#[tokio::test]
async fn breakpoints_can_be_ignored() {
    let chef = Chef::with_defaults();
    let recipe = Recipe::default()
        .then("To Upper case", ["All"])
        .step(RecipeStep::new("To Hex", ["Space"]).breakpoint());
    let outcome = chef
        .bake_with(
            &recipe,
            Dish::from_text("ab"),
            BakeControl::new().ignore_breakpoints(),
        )
        .await
        .unwrap();
    assert_eq!(text(&outcome), "41 42");
}

#[tokio::test]
async fn cancelled_before_start() {
    let chef = Chef::with_defaults();
    let cancel = CancelFlag::new();
    cancel.cancel();
    let recipe = Recipe::default().then("To Upper case", ["All"]);
    let failure = chef
        .bake_with(
            &recipe,
            Dish::from_text("x"),
            BakeControl::new().with_cancel(cancel),
        )
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::Cancelled);
    assert!(failure.dish.is_none());
}

#[tokio::test]
async fn cancelling_interrupts_an_async_operation() {
    let chef = Chef::with_defaults();
    let cancel = CancelFlag::new();
    let recipe = Recipe::default().then("Sleep", [ArgValue::from(10_000.0)]);

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let failure = chef
        .bake_with(
            &recipe,
            Dish::from_text("x"),
            BakeControl::new().with_cancel(cancel),
        )
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn async_operation_passes_input_through_and_reports_progress() {
    let chef = Chef::with_defaults();
    let updates = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&updates);
    let recipe = Recipe::default()
        .then("Sleep", [ArgValue::from(20.0)])
        .then("To Upper case", ["All"]);
    let outcome = chef
        .bake_with(
            &recipe,
            Dish::from_text("zzz"),
            BakeControl::new().with_progress(move |_update| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();
    assert_eq!(text(&outcome), "ZZZ");
    // One "Baking..." message per step plus at least the final Sleep report.
    assert!(updates.load(Ordering::SeqCst) >= 3);
}

#[tokio::test]
async fn metrics_count_operation_calls() {
    let chef = Chef::with_defaults();
    let recipe = Recipe::default()
        .then("To Upper case", ["All"])
        .then("To Lower case", no_args());
    chef.bake(&recipe, Dish::from_text("x")).await.unwrap();
    chef.bake(&recipe, Dish::from_text("y")).await.unwrap();
    let snapshot = chef.metrics().snapshot();
    assert_eq!(snapshot.bakes_completed, 2);
    assert_eq!(snapshot.operations["To Upper case"].calls, 2);
}

#[tokio::test]
async fn report_summarises_the_outcome() {
    let chef = Chef::with_defaults();
    let recipe = Recipe::default().then("To Upper case", ["All"]);
    let outcome = chef.bake(&recipe, Dish::from_text("abc")).await.unwrap();
    let report = serde_json::to_value(outcome.report()).unwrap();
    assert_eq!(report["output_type"], "string");
    assert_eq!(report["output_size"], 3);
    assert_eq!(report["status"]["state"], "completed");
}

#[tokio::test]
async fn markers_do_nothing() {
    let chef = Chef::with_defaults();
    let recipe = Recipe::default()
        .then("Comment", ["uppercase everything"])
        .then("Label", ["unused"])
        .then("Merge", no_args())
        .then("To Upper case", ["All"]);
    let outcome = chef.bake(&recipe, Dish::from_text("ok")).await.unwrap();
    assert_eq!(text(&outcome), "OK");
    assert_eq!(outcome.progress, 4);
}

#[tokio::test]
async fn binary_input_reaches_the_operation_without_copying() {
    let seen = Arc::new(Mutex::new(None::<Bytes>));
    let record = Arc::clone(&seen);
    let mut registry = OperationRegistry::with_defaults();
    registry.register(FnOperation::sync(
        OperationDescriptor::new("Keep", DishType::ArrayBuffer, DishType::ArrayBuffer),
        move |input, _args, _ctx| {
            let DishValue::ArrayBuffer(bytes) = &input else {
                return Err(OperationError::invalid("expected a buffer"));
            };
            *record.lock().unwrap() = Some(bytes.clone());
            Ok(input)
        },
    ));
    let chef = Chef::new(registry);
    let payload = Bytes::from(vec![7u8; 1 << 20]);
    let recipe = Recipe::default().then("Keep", no_args());
    let outcome = chef
        .bake(&recipe, Dish::from_bytes(payload.clone()))
        .await
        .unwrap();

    let handed = seen.lock().unwrap().take().unwrap();
    assert!(handed.shares_allocation(&payload));
    match outcome.dish.value() {
        DishValue::ArrayBuffer(output) => assert!(output.shares_allocation(&payload)),
        other => panic!("unexpected output {other:?}"),
    }
}

#[tokio::test]
async fn panicking_operation_is_a_defect_of_its_step() {
    let mut registry = OperationRegistry::with_defaults();
    registry.register(FnOperation::sync(
        OperationDescriptor::new("Explode", DishType::String, DishType::String),
        |_input, _args, _ctx| panic!("slice index 9 out of range"),
    ));
    let chef = Chef::new(registry);
    let recipe = Recipe::default()
        .then("To Upper case", ["All"])
        .then("Explode", no_args())
        .then("Reverse", ["Character"]);
    let failure = chef.bake(&recipe, Dish::from_text("ab")).await.unwrap_err();

    assert_eq!(failure.kind, FailureKind::Defect);
    assert_eq!(failure.step_index, 1);
    assert_eq!(failure.operation, "Explode");
    assert_eq!(failure.message, "Unexpected error in operation 'Explode'");
    let cause = format!("{:#}", failure.source.as_ref().unwrap());
    assert!(cause.contains("slice index 9 out of range"));
    assert_eq!(
        failure.dish.as_ref().map(Dish::value),
        Some(&DishValue::String("AB".into()))
    );
    assert_eq!(chef.metrics().snapshot().bakes_failed, 1);
}

#[tokio::test]
async fn panicking_async_operation_is_contained() {
    let mut registry = OperationRegistry::with_defaults();
    registry.register(FnOperation::asynchronous(
        OperationDescriptor::new("Later", DishType::String, DishType::String),
        |input, _args, _ctx| async move {
            tokio::task::yield_now().await;
            if input.dish_type() == DishType::String {
                panic!("gave up");
            }
            Ok(input)
        },
    ));
    let chef = Chef::new(registry);
    let recipe = Recipe::default().then("Later", no_args());
    let failure = chef.bake(&recipe, Dish::from_text("x")).await.unwrap_err();
    assert_eq!(failure.kind, FailureKind::Defect);
    assert_eq!(failure.step_index, 0);
}

#[tokio::test]
async fn duplicate_labels_resolve_to_the_first() {
    let chef = Chef::with_defaults();
    let recipe = Recipe::default()
        .then("Jump", ["twice"])
        .then("Label", ["twice"])
        .then("To Upper case", ["All"])
        .then("Label", ["twice"])
        .then("Reverse", ["Character"]);
    let outcome = chef.bake(&recipe, Dish::from_text("ab")).await.unwrap();
    assert_eq!(text(&outcome), "BA");
}

#[tokio::test]
async fn flow_control_on_markup_is_a_defect() {
    let chef = Chef::with_defaults();
    let markup = DishValue::Html("<b>x</b>".into());
    let recipes = [
        ("Register", Recipe::default().then("Register", [r"(\w+)"])),
        (
            "Fork",
            Recipe::default()
                .step(RecipeStep::new(
                    "Fork",
                    [ArgValue::from(","), ArgValue::from(","), ArgValue::from(false)],
                ))
                .then("Merge", no_args()),
        ),
        (
            "Conditional Jump",
            Recipe::default()
                .then("Label", ["top"])
                .then("Conditional Jump", ["x", "false", "top"]),
        ),
    ];
    for (operation, recipe) in recipes {
        let failure = chef
            .bake(&recipe, Dish::new(markup.clone()))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Defect, "{operation}");
        assert_eq!(failure.operation, operation);
        assert!(!failure.is_user_facing());
        assert_eq!(failure.dish.as_ref().map(Dish::value), Some(&markup));
    }
}

#[tokio::test]
async fn structured_data_into_a_number_operation() {
    let mut registry = OperationRegistry::with_defaults();
    registry.register(FnOperation::sync(
        OperationDescriptor::new("Double", DishType::Number, DishType::Number),
        |input, _args, _ctx| {
            let n = input.as_number().unwrap_or_default();
            Ok(DishValue::Number(n * 2))
        },
    ));
    let chef = Chef::new(registry);
    let recipe = Recipe::default().then("Double", no_args());

    let object = json!({"count": 21});
    let failure = chef
        .bake(&recipe, Dish::new(object.clone()))
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::DishConversion);
    assert_eq!(failure.step_index, 0);
    assert!(failure.is_user_facing());
    assert_eq!(
        failure.dish.as_ref().map(Dish::value),
        Some(&DishValue::Json(object))
    );

    let outcome = chef.bake(&recipe, Dish::new(json!(21))).await.unwrap();
    assert_eq!(outcome.dish.value(), &DishValue::Number(42));
}

#[tokio::test]
async fn resuming_keeps_the_jump_budget() {
    let (chef, calls) = counting_chef();
    let recipe = Recipe::default()
        .then("Label", ["top"])
        .then("Count", no_args())
        .step(RecipeStep::new(
            "Jump",
            [ArgValue::from("pause"), ArgValue::from(10.0)],
        ))
        .then("Label", ["pause"])
        .step(RecipeStep::new("Comment", no_args()).breakpoint())
        .step(RecipeStep::new(
            "Jump",
            [ArgValue::from("top"), ArgValue::from(3.0)],
        ));

    let paused = chef.bake(&recipe, Dish::from_text("x")).await.unwrap();
    assert_eq!(paused.status, BakeStatus::Paused { at: 4 });
    assert_eq!(paused.jumps_taken, 1);
    assert_eq!(paused.report().jumps_taken, 1);

    let resumed = chef
        .resume(&recipe, paused, BakeControl::new())
        .await
        .unwrap();
    assert!(resumed.is_complete());
    // One jump back fits in the budget left over from before the pause.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(resumed.jumps_taken, 0);
}

#[test]
fn default_executors_share_the_builtin_operations() {
    let first = Chef::with_defaults();
    let second = Chef::with_defaults();
    let upper = first.registry().get("To Upper case").unwrap();
    let again = second.registry().get("To Upper case").unwrap();
    assert!(Arc::ptr_eq(&upper, &again));
}

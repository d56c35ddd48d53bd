use std::time::{Duration, Instant};

use super::arg_f64;
use crate::dish::{DishType, DishValue};
use crate::operation::{
    ArgSpec, ArgValue, FnOperation, OperationDescriptor, OperationRegistry, OperationResult,
    RunContext,
};

/// Longest single wait between cancellation checks.
const SLICE: Duration = Duration::from_millis(50);

pub(super) fn register(registry: &mut OperationRegistry) {
    registry.register(FnOperation::asynchronous(
        OperationDescriptor::new("Sleep", DishType::ArrayBuffer, DishType::ArrayBuffer)
            .with_description("Waits for the given number of milliseconds, passing the input through.")
            .with_arg(ArgSpec::number("Time (ms)", 1000.0).range(Some(0.0), None)),
        sleep,
    ));
}

async fn sleep(input: DishValue, args: Vec<ArgValue>, ctx: RunContext) -> OperationResult {
    let total = Duration::from_millis(arg_f64(&args, 0).unwrap_or(0.0).max(0.0) as u64);
    let started = Instant::now();
    loop {
        ctx.check_cancelled()?;
        let elapsed = started.elapsed();
        if elapsed >= total {
            break;
        }
        let percent = (elapsed.as_secs_f64() / total.as_secs_f64() * 100.0) as u8;
        ctx.report(format!("Sleeping ({percent}%)"), Some(percent));
        tokio::time::sleep((total - elapsed).min(SLICE)).await;
    }
    ctx.report("Sleep finished", Some(100));
    Ok(input)
}

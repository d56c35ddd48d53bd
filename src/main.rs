use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use bakehouse::dish::{Dish, DishType, DishValue};
use bakehouse::error::BakeFailure;
use bakehouse::observability::{MetricsSnapshot, log_snapshot};
use bakehouse::pipeline::{BakeControl, BakeStatus, Chef};
use bakehouse::recipe::Recipe;
use bakehouse::session::bake_batch;
use bakehouse::validation::validate_recipe;
use clap::{Parser, Subcommand};
use glob::glob;
use serde_json::to_writer_pretty;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_tracing()?;

    match cli.command {
        Commands::Bake {
            recipe,
            input,
            output,
            output_type,
            ignore_breakpoints,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            report,
        } => {
            bake_command(BakeArgs {
                recipe,
                input,
                output,
                output_type,
                ignore_breakpoints,
                metrics: MetricsArgs {
                    print: print_metrics,
                    json: metrics_json,
                    prometheus: metrics_prometheus,
                },
                report,
            })
            .await
        }
        Commands::Batch {
            recipe,
            patterns,
            output_dir,
            print_metrics,
        } => batch_command(&recipe, &patterns, &output_dir, print_metrics).await,
        Commands::Validate { recipe } => validate_command(&recipe),
        Commands::ListOperations => {
            list_operations();
            Ok(())
        }
        Commands::Describe { name } => describe_operation(&name),
    }
}

fn configure_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}

struct MetricsArgs {
    print: bool,
    json: Option<PathBuf>,
    prometheus: Option<PathBuf>,
}

struct BakeArgs {
    recipe: PathBuf,
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    output_type: Option<DishType>,
    ignore_breakpoints: bool,
    metrics: MetricsArgs,
    report: Option<PathBuf>,
}

async fn bake_command(args: BakeArgs) -> Result<()> {
    let mut recipe = Recipe::load(&args.recipe)?;
    if let Some(output_type) = args.output_type {
        recipe.options.output_type = Some(output_type);
    }
    let input = read_input(args.input.as_deref())?;

    let chef = Chef::with_defaults();
    let mut control = BakeControl::new().with_progress(|update| {
        debug!(
            step = update.step_index,
            operation = %update.operation,
            percent = ?update.percent,
            "{}",
            update.message
        );
    });
    if args.ignore_breakpoints {
        control = control.ignore_breakpoints();
    }

    let result = chef.bake_with(&recipe, input, control).await;
    write_metrics(&chef.metrics().snapshot(), &args.metrics)?;

    match result {
        Ok(outcome) => {
            if let BakeStatus::Paused { at } = outcome.status {
                warn!(
                    step = at,
                    "Paused at breakpoint; writing the dish as it stands. Use --ignore-breakpoints to bake through"
                );
            }
            if let Some(path) = &args.report {
                write_json(path, &outcome.report())?;
            }
            write_output(args.output.as_deref(), outcome.dish)?;
            info!(
                recipe = %args.recipe.display(),
                duration_ms = outcome.duration.as_secs_f64() * 1_000.0,
                "Bake completed"
            );
            Ok(())
        }
        Err(failure) => {
            report_failure(&failure);
            if let Some(path) = &args.report {
                write_json(path, &failure)?;
            }
            bail!(
                "Bake failed at step {} ('{}'): {}",
                failure.step_index,
                failure.operation,
                failure.message
            );
        }
    }
}

fn report_failure(failure: &BakeFailure) {
    error!(
        step = failure.step_index,
        operation = %failure.operation,
        kind = ?failure.kind,
        "{}",
        failure.message
    );
    if let Some(dish) = &failure.dish {
        info!(
            dish_type = %dish.dish_type(),
            size = dish.size(),
            "Dish before the failing step"
        );
    }
}

async fn batch_command(
    recipe_path: &Path,
    patterns: &[String],
    output_dir: &Path,
    print_metrics: bool,
) -> Result<()> {
    let recipe = Arc::new(Recipe::load(recipe_path)?);
    let inputs = expand_inputs(patterns)?;
    fs::create_dir_all(output_dir).with_context(|| {
        format!("Failed to create output directory: {}", output_dir.display())
    })?;

    let dishes = inputs
        .iter()
        .map(|path| {
            fs::read(path)
                .map(Dish::from_bytes)
                .with_context(|| format!("Failed to read input file: {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let chef = Arc::new(Chef::with_defaults());
    let results = bake_batch(Arc::clone(&chef), recipe, dishes).await;

    let mut failures = 0usize;
    for (input, result) in inputs.iter().zip(results) {
        match result {
            Ok(outcome) => {
                let stem = input
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "dish".to_string());
                let destination = output_dir.join(format!("{stem}.out"));
                write_output(Some(&destination), outcome.dish)?;
                info!(
                    input = %input.display(),
                    output = %destination.display(),
                    "Bake completed"
                );
            }
            Err(failure) => {
                failures += 1;
                error!(input = %input.display(), "Bake failed: {failure}");
            }
        }
    }

    if print_metrics {
        log_snapshot(&chef.metrics().snapshot());
    }
    if failures > 0 {
        bail!("{failures} of {} bake(s) failed", inputs.len());
    }
    Ok(())
}

fn expand_inputs(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut resolved = Vec::new();
    for pattern in patterns {
        let matches = glob(pattern).with_context(|| format!("Invalid glob pattern: {pattern}"))?;
        let mut found = false;
        for entry in matches {
            let path = entry?;
            if path.is_file() {
                resolved.push(path);
                found = true;
            }
        }
        if !found {
            bail!("No inputs matched pattern: {pattern}");
        }
    }
    Ok(resolved)
}

fn validate_command(recipe_path: &Path) -> Result<()> {
    let recipe = Recipe::load(recipe_path)?;
    let chef = Chef::with_defaults();
    let report = validate_recipe(&recipe, chef.registry());

    for warning in &report.warnings {
        warn!(file = %recipe_path.display(), "{warning}");
    }
    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(file = %recipe_path.display(), "{error_msg}");
        }
        bail!("Recipe validation failed");
    }

    info!(
        file = %recipe_path.display(),
        steps = recipe.len(),
        "Recipe is valid"
    );
    Ok(())
}

fn list_operations() {
    let chef = Chef::with_defaults();
    for descriptor in chef.registry().descriptors() {
        let kind = if descriptor.flow_control {
            "flow".to_string()
        } else {
            format!("{} -> {}", descriptor.input_type, descriptor.output_type)
        };
        println!("{:<20} {}", descriptor.name, kind);
    }
}

fn describe_operation(name: &str) -> Result<()> {
    let chef = Chef::with_defaults();
    let operation = chef.registry().resolve(name)?;
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    to_writer_pretty(&mut handle, operation.descriptor())
        .context("Failed to write operation descriptor")?;
    writeln!(handle)?;
    Ok(())
}

fn read_input(path: Option<&Path>) -> Result<Dish> {
    let bytes = match path {
        Some(path) => fs::read(path)
            .with_context(|| format!("Failed to read input file: {}", path.display()))?,
        None => {
            let mut buffer = Vec::new();
            io::stdin()
                .read_to_end(&mut buffer)
                .context("Failed to read input from stdin")?;
            buffer
        }
    };
    Ok(Dish::from_bytes(bytes))
}

fn output_bytes(dish: Dish) -> Result<Vec<u8>> {
    let dish_type = dish.dish_type();
    let bytes = if dish_type == DishType::Html {
        dish.into_value().into_string().map(String::into_bytes)
    } else {
        dish.take_as(DishType::ByteArray).and_then(DishValue::into_bytes)
    };
    bytes.with_context(|| format!("Failed to serialise {dish_type} dish for output"))
}

fn write_output(path: Option<&Path>, dish: Dish) -> Result<()> {
    let bytes = output_bytes(dish)?;
    match path {
        Some(path) => {
            ensure_parent(path)?;
            fs::write(path, bytes)
                .with_context(|| format!("Failed to write output file: {}", path.display()))?;
        }
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle.write_all(&bytes).context("Failed to write output")?;
            handle.flush()?;
        }
    }
    Ok(())
}

fn write_metrics(snapshot: &MetricsSnapshot, args: &MetricsArgs) -> Result<()> {
    if args.print {
        log_snapshot(snapshot);
    }
    if let Some(path) = &args.json {
        write_json(path, snapshot)?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = &args.prometheus {
        ensure_parent(path)?;
        fs::write(path, snapshot.to_prometheus()).with_context(|| {
            format!("Failed to write Prometheus metrics: {}", path.display())
        })?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    let file =
        File::create(path).with_context(|| format!("Failed to create file: {}", path.display()))?;
    to_writer_pretty(file, value)
        .with_context(|| format!("Failed to write JSON: {}", path.display()))?;
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "bakehouse",
    version,
    about = "Run recipes of chained data operations over files or stdin"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bake one input through a recipe.
    Bake {
        recipe: PathBuf,
        /// Input file; stdin when omitted.
        #[arg(long)]
        input: Option<PathBuf>,
        /// Output file; stdout when omitted.
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long = "output-type")]
        output_type: Option<DishType>,
        #[arg(long)]
        ignore_breakpoints: bool,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        /// Writes a JSON summary of the bake, or of its failure.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Bake every file matching the patterns concurrently.
    Batch {
        recipe: PathBuf,
        #[arg(required = true)]
        patterns: Vec<String>,
        #[arg(long = "output-dir")]
        output_dir: PathBuf,
        #[arg(long)]
        print_metrics: bool,
    },
    Validate {
        recipe: PathBuf,
    },
    ListOperations,
    /// Prints an operation's descriptor as JSON.
    Describe {
        name: String,
    },
}

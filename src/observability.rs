//! Bake counters and per-operation timings, exported as JSON or in the
//! Prometheus text format.

use std::collections::BTreeMap;
use std::fmt::{Display, Write as _};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{BakeFailure, FailureKind};
use crate::pipeline::BakeStatus;

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub operations: BTreeMap<String, OperationMetrics>,
    pub bakes_completed: u64,
    /// Bakes that stopped at a breakpoint.
    pub bakes_paused: u64,
    pub bakes_failed: u64,
    /// Failed bakes keyed by failure kind.
    pub failures: BTreeMap<String, u64>,
    pub last_bake_duration_ms: f64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct OperationMetrics {
    pub calls: u64,
    /// Calls that halted their bake.
    pub failures: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

impl OperationMetrics {
    fn observe(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1_000.0;
        self.calls += 1;
        self.total_duration_ms += ms;
        self.max_duration_ms = self.max_duration_ms.max(ms);
    }

    pub fn mean_duration_ms(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_duration_ms / self.calls as f64
        }
    }
}

/// Shared sink for one executor's metrics. Clones feed the same counters.
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, apply: impl FnOnce(&mut MetricsSnapshot)) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        apply(&mut guard);
    }

    /// Starts timing one call of `operation`; recorded when the timer drops.
    pub fn start_operation(&self, operation: &str) -> OperationTimer {
        OperationTimer {
            operation: operation.to_string(),
            started_at: Instant::now(),
            collector: self.clone(),
        }
    }

    pub fn record_bake(&self, status: BakeStatus, duration: Duration) {
        self.update(|metrics| {
            match status {
                BakeStatus::Completed => metrics.bakes_completed += 1,
                BakeStatus::Paused { .. } => metrics.bakes_paused += 1,
            }
            metrics.last_bake_duration_ms = duration.as_secs_f64() * 1_000.0;
        });
    }

    /// Counts a failed bake and charges it to the step that halted it.
    /// Configuration failures happen before any step runs.
    pub fn record_failure(&self, failure: &BakeFailure) {
        self.update(|metrics| {
            metrics.bakes_failed += 1;
            *metrics
                .failures
                .entry(failure.kind.as_str().to_string())
                .or_default() += 1;
            if !matches!(
                failure.kind,
                FailureKind::Configuration | FailureKind::Cancelled
            ) {
                metrics
                    .operations
                    .entry(failure.operation.clone())
                    .or_default()
                    .failures += 1;
            }
        });
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reset(&self) {
        self.update(|metrics| *metrics = MetricsSnapshot::default());
    }
}

pub struct OperationTimer {
    operation: String,
    started_at: Instant,
    collector: MetricsCollector,
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        let elapsed = self.started_at.elapsed();
        self.collector.update(|metrics| {
            metrics
                .operations
                .entry(self.operation.clone())
                .or_default()
                .observe(elapsed);
        });
        debug!(
            operation = self.operation.as_str(),
            elapsed_ms = elapsed.as_secs_f64() * 1_000.0,
            "Operation timed"
        );
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        completed = snapshot.bakes_completed,
        paused = snapshot.bakes_paused,
        failed = snapshot.bakes_failed,
        failures = ?snapshot.failures,
        last_bake_ms = snapshot.last_bake_duration_ms,
        "Bake metrics summary"
    );
    for (operation, metrics) in &snapshot.operations {
        info!(
            operation = operation.as_str(),
            calls = metrics.calls,
            failures = metrics.failures,
            mean_ms = metrics.mean_duration_ms(),
            max_ms = metrics.max_duration_ms,
            "Operation metrics"
        );
    }
}

/// Prometheus text exposition, one metric family at a time.
#[derive(Default)]
struct Exposition {
    text: String,
}

impl Exposition {
    fn family(&mut self, name: &str, kind: &str, help: &str) -> &mut Self {
        let _ = writeln!(self.text, "# HELP {name} {help}");
        let _ = writeln!(self.text, "# TYPE {name} {kind}");
        self
    }

    fn sample(&mut self, name: &str, label: Option<(&str, &str)>, value: impl Display) -> &mut Self {
        match label {
            Some((key, raw)) => {
                let escaped = raw.replace('\\', r"\\").replace('"', "\\\"");
                let _ = writeln!(self.text, "{name}{{{key}=\"{escaped}\"}} {value}");
            }
            None => {
                let _ = writeln!(self.text, "{name} {value}");
            }
        }
        self
    }
}

fn seconds(ms: f64) -> String {
    format!("{:.6}", ms / 1_000.0)
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut out = Exposition::default();

        let bakes = "bakehouse_bakes_total";
        out.family(bakes, "counter", "Bakes by how they ended")
            .sample(bakes, Some(("outcome", "completed")), self.bakes_completed)
            .sample(bakes, Some(("outcome", "paused")), self.bakes_paused)
            .sample(bakes, Some(("outcome", "failed")), self.bakes_failed);

        let failures = "bakehouse_bake_failures_total";
        out.family(failures, "counter", "Failed bakes by failure kind");
        for (kind, count) in &self.failures {
            out.sample(failures, Some(("kind", kind.as_str())), count);
        }

        let per_operation: [(&str, &str, &str, fn(&OperationMetrics) -> String); 4] = [
            ("bakehouse_operation_calls_total", "counter", "Operation invocations", |m| {
                m.calls.to_string()
            }),
            (
                "bakehouse_operation_failures_total",
                "counter",
                "Operation invocations that halted a bake",
                |m| m.failures.to_string(),
            ),
            (
                "bakehouse_operation_duration_seconds_total",
                "counter",
                "Accumulated operation time",
                |m| seconds(m.total_duration_ms),
            ),
            (
                "bakehouse_operation_duration_seconds_max",
                "gauge",
                "Slowest single invocation",
                |m| seconds(m.max_duration_ms),
            ),
        ];
        for (name, kind, help, value) in per_operation {
            out.family(name, kind, help);
            for (operation, metrics) in &self.operations {
                out.sample(name, Some(("operation", operation.as_str())), value(metrics));
            }
        }

        let last = "bakehouse_last_bake_duration_seconds";
        out.family(last, "gauge", "Duration of the most recent bake")
            .sample(last, None, seconds(self.last_bake_duration_ms));
        out.text
    }
}

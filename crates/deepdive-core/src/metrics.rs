use anyhow::Result;
use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use tracing::info;

use crate::session::Phase;

struct StepMetrics {
    steps: Counter<u64>,
    duration_ms: Histogram<f64>,
    fetch_fallbacks: Counter<u64>,
    noops: Counter<u64>,
}

static METRICS: OnceCell<StepMetrics> = OnceCell::new();

fn handles() -> &'static StepMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("deepdive.driver");
        StepMetrics {
            steps: meter
                .u64_counter("deepdive_steps_total")
                .with_description("Executed steps by phase and outcome")
                .init(),
            duration_ms: meter
                .f64_histogram("deepdive_step_duration_ms")
                .with_description("Step runtime in milliseconds")
                .init(),
            fetch_fallbacks: meter
                .u64_counter("deepdive_fetch_fallbacks_total")
                .with_description("Citations recorded from the search snippet after a failed fetch")
                .init(),
            noops: meter
                .u64_counter("deepdive_advance_noops_total")
                .with_description("Advance invocations that did not run a step")
                .init(),
        }
    })
}

/// Hint to operators that OTEL metrics export can be configured externally.
pub fn init_metrics_from_env(service_name: &str) -> Result<()> {
    if std::env::var("DEEPDIVE_OTEL_METRICS_ENDPOINT").is_ok() {
        info!(
            target = "telemetry",
            "DEEPDIVE_OTEL_METRICS_ENDPOINT detected for {service_name}. Configure an OTLP meter provider in your deployment to export step metrics."
        );
    }
    Ok(())
}

/// Record one executed step (no-op if no provider installed).
pub fn record_step(phase: Phase, outcome: &str, duration_ms: u64) {
    let metrics = handles();
    let attrs = [
        KeyValue::new("phase", phase.as_str()),
        KeyValue::new("outcome", outcome.to_string()),
    ];
    metrics.steps.add(1, &attrs);
    metrics
        .duration_ms
        .record(duration_ms as f64, &[KeyValue::new("phase", phase.as_str())]);
}

pub fn record_fetch_fallback() {
    handles().fetch_fallbacks.add(1, &[]);
}

pub fn record_noop(reason: &'static str) {
    handles().noops.add(1, &[KeyValue::new("reason", reason)]);
}

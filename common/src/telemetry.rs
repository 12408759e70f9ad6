// Telemetry module for structured logging and metrics

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::models::{Direction, RunStatus};

/// Initialize structured logging with JSON formatting
///
/// This function sets up the tracing subscriber with:
/// - JSON formatting for structured logs
/// - Span context (run_id, task_id, step_id) in all log entries
/// - Log levels from configuration, overridden by `RUST_LOG`
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(json_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;

    tracing::info!(
        log_level = log_level,
        "Structured logging initialized with JSON formatting"
    );

    Ok(())
}

/// Initialize Prometheus metrics exporter
///
/// Registers:
/// - task_runs_total: Counter of finished task runs by terminal status
/// - task_run_duration_seconds: Histogram of task run durations
/// - files_transferred_total / bytes_transferred_total: per direction
/// - file_errors_total: Counter of per-file transfer failures
/// - task_runs_active: Gauge of runs currently executing
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!("task_runs_total", "Total number of finished task runs");
    describe_histogram!(
        "task_run_duration_seconds",
        "Duration of task runs in seconds"
    );
    describe_counter!(
        "files_transferred_total",
        "Total number of files transferred"
    );
    describe_counter!(
        "bytes_transferred_total",
        "Total number of bytes transferred"
    );
    describe_counter!("file_errors_total", "Total number of failed file transfers");
    describe_gauge!("task_runs_active", "Number of task runs currently executing");

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

/// Record a finished task run with its terminal status and duration
#[inline]
pub fn record_task_run(task_name: &str, status: RunStatus, duration_seconds: f64) {
    counter!(
        "task_runs_total",
        "task" => task_name.to_string(),
        "status" => status.as_str()
    )
    .increment(1);
    histogram!("task_run_duration_seconds", "task" => task_name.to_string())
        .record(duration_seconds);
}

/// Record one successfully transferred file
#[inline]
pub fn record_file_transferred(direction: Direction, bytes: u64) {
    counter!("files_transferred_total", "direction" => direction.as_str()).increment(1);
    counter!("bytes_transferred_total", "direction" => direction.as_str()).increment(bytes);
}

/// Record one failed file transfer
#[inline]
pub fn record_file_error(direction: Direction) {
    counter!("file_errors_total", "direction" => direction.as_str()).increment(1);
}

/// Publish the number of runs currently executing
#[inline]
pub fn set_active_runs(count: usize) {
    gauge!("task_runs_active").set(count as f64);
}

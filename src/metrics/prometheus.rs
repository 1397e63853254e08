//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by ingest-pipeline and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all ingest-pipeline metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Tasks submitted to the producer, labeled by outcome
/// (`accepted`, `store_failed`, `publish_failed`, `encode_failed`).
pub static TASKS_SUBMITTED: OnceLock<CounterVec> = OnceLock::new();

/// Messages handed over by the queue transport.
pub static MESSAGES_RECEIVED: OnceLock<Counter> = OnceLock::new();

/// Messages handled by the processing stage, labeled by outcome
/// (`complete`, `failed`, `rejected`, `redelivered`).
pub static MESSAGES_PROCESSED: OnceLock<CounterVec> = OnceLock::new();

/// Time spent handling a message, labeled by outcome.
pub static PROCESSING_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Messages buffered between the receiving and processing stages.
pub static CHANNEL_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Calling it again after a successful initialization is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let tasks_submitted = CounterVec::new(
        Opts::new("ingest_tasks_submitted_total", "Tasks submitted to the producer"),
        &["outcome"],
    )?;

    let messages_received = Counter::new(
        "ingest_messages_received_total",
        "Messages received from the queue",
    )?;

    let messages_processed = CounterVec::new(
        Opts::new(
            "ingest_messages_processed_total",
            "Messages handled by the processing stage",
        ),
        &["outcome"],
    )?;

    let processing_duration = HistogramVec::new(
        HistogramOpts::new(
            "ingest_message_processing_seconds",
            "Time spent handling one message",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        &["outcome"],
    )?;

    let channel_depth = Gauge::new(
        "ingest_channel_depth",
        "Messages buffered between the receiving and processing stages",
    )?;

    registry.register(Box::new(tasks_submitted.clone()))?;
    registry.register(Box::new(messages_received.clone()))?;
    registry.register(Box::new(messages_processed.clone()))?;
    registry.register(Box::new(processing_duration.clone()))?;
    registry.register(Box::new(channel_depth.clone()))?;

    // A concurrent initializer may have won; its metrics stay in place.
    let _ = REGISTRY.set(registry);
    let _ = TASKS_SUBMITTED.set(tasks_submitted);
    let _ = MESSAGES_RECEIVED.set(messages_received);
    let _ = MESSAGES_PROCESSED.set(messages_processed);
    let _ = PROCESSING_DURATION.set(processing_duration);
    let _ = CHANNEL_DEPTH.set(channel_depth);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, the returned
/// text is a single comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

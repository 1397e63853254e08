//! Metrics module for Prometheus-based monitoring.
//!
//! Covers producer submissions and the consumer's receive/process flow.
//!
//! # Example
//!
//! ```ignore
//! use ingest_pipeline::metrics::{init_metrics, export_metrics, MetricsCollector, SubmitOutcome};
//!
//! init_metrics()?;
//! MetricsCollector::new().record_submission(SubmitOutcome::Accepted);
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{MetricsCollector, ProcessOutcome, SubmitOutcome};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    CHANNEL_DEPTH, MESSAGES_PROCESSED, MESSAGES_RECEIVED, PROCESSING_DURATION, REGISTRY,
    TASKS_SUBMITTED,
};

//! High-level recording interface over the Prometheus metrics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library code
//! can record unconditionally.

use super::prometheus::{
    CHANNEL_DEPTH, MESSAGES_PROCESSED, MESSAGES_RECEIVED, PROCESSING_DURATION, TASKS_SUBMITTED,
};

/// Outcome label for a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    EncodeFailed,
    StoreFailed,
    PublishFailed,
}

impl SubmitOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmitOutcome::Accepted => "accepted",
            SubmitOutcome::EncodeFailed => "encode_failed",
            SubmitOutcome::StoreFailed => "store_failed",
            SubmitOutcome::PublishFailed => "publish_failed",
        }
    }
}

/// Outcome label for a processed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Work succeeded and the message was acknowledged.
    Complete,
    /// The task handler failed.
    Failed,
    /// The body was absent, empty or undecodable.
    Rejected,
    /// The task had already finished; acknowledged without running.
    Redelivered,
}

impl ProcessOutcome {
    pub const ALL: [ProcessOutcome; 4] = [
        ProcessOutcome::Complete,
        ProcessOutcome::Failed,
        ProcessOutcome::Rejected,
        ProcessOutcome::Redelivered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessOutcome::Complete => "complete",
            ProcessOutcome::Failed => "failed",
            ProcessOutcome::Rejected => "rejected",
            ProcessOutcome::Redelivered => "redelivered",
        }
    }
}

/// Metrics collector for recording pipeline operational metrics.
///
/// # Example
///
/// ```ignore
/// use ingest_pipeline::metrics::{init_metrics, MetricsCollector, ProcessOutcome};
///
/// init_metrics()?;
/// let collector = MetricsCollector::new();
/// collector.record_received();
/// collector.record_processed(ProcessOutcome::Complete, 0.02);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a producer submission.
    pub fn record_submission(&self, outcome: SubmitOutcome) {
        if let Some(submitted) = TASKS_SUBMITTED.get() {
            submitted.with_label_values(&[outcome.as_str()]).inc();
        }

        tracing::trace!(outcome = outcome.as_str(), "Recorded submission metric");
    }

    /// Record a message handed over by the transport.
    pub fn record_received(&self) {
        if let Some(received) = MESSAGES_RECEIVED.get() {
            received.inc();
        }
    }

    /// Record the outcome of handling one message.
    ///
    /// # Arguments
    ///
    /// * `outcome` - How the message was handled
    /// * `duration_secs` - Time spent handling it in seconds
    pub fn record_processed(&self, outcome: ProcessOutcome, duration_secs: f64) {
        if let Some(processed) = MESSAGES_PROCESSED.get() {
            processed.with_label_values(&[outcome.as_str()]).inc();
        }

        if let Some(duration) = PROCESSING_DURATION.get() {
            duration
                .with_label_values(&[outcome.as_str()])
                .observe(duration_secs);
        }

        tracing::trace!(
            outcome = outcome.as_str(),
            duration_secs = duration_secs,
            "Recorded processing metric"
        );
    }

    /// Messages recorded with `outcome` so far, or 0 before `init_metrics()`.
    pub fn processed_count(&self, outcome: ProcessOutcome) -> u64 {
        MESSAGES_PROCESSED
            .get()
            .map(|processed| processed.with_label_values(&[outcome.as_str()]).get() as u64)
            .unwrap_or(0)
    }

    /// Update the channel depth gauge.
    pub fn update_channel_depth(&self, depth: usize) {
        if let Some(gauge) = CHANNEL_DEPTH.get() {
            gauge.set(depth as f64);
        }
    }
}

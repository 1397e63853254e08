//! Pipeline counters shared by the two stage loops.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Snapshot of pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    /// Messages handed over by the transport.
    pub received: u64,
    /// Failed receive calls.
    pub receive_errors: u64,
    /// Messages whose work completed.
    pub processed: u64,
    /// Messages that failed validation, decoding or work.
    pub failed: u64,
    /// Successful acknowledgments.
    pub acknowledged: u64,
    /// Redeliveries of already finished tasks that were acknowledged
    /// without running the work again.
    pub redeliveries_skipped: u64,
}

impl PipelineStats {
    /// Messages received but never acknowledged.
    pub fn unacknowledged(&self) -> u64 {
        self.received.saturating_sub(self.acknowledged)
    }
}

/// Atomic counters updated by the stage loops.
#[derive(Debug, Default)]
pub struct SharedPipelineStats {
    received: AtomicU64,
    receive_errors: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    acknowledged: AtomicU64,
    redeliveries_skipped: AtomicU64,
}

impl SharedPipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_receive_error(&self) {
        self.receive_errors.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_acknowledged(&self) {
        self.acknowledged.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_redelivery_skipped(&self) {
        self.redeliveries_skipped.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            received: self.received.load(Ordering::SeqCst),
            receive_errors: self.receive_errors.load(Ordering::SeqCst),
            processed: self.processed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            acknowledged: self.acknowledged.load(Ordering::SeqCst),
            redeliveries_skipped: self.redeliveries_skipped.load(Ordering::SeqCst),
        }
    }
}

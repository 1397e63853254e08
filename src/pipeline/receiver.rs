//! Receiving stage: pulls messages from the subscription into the channel.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

use super::channel::{ChannelSender, PushOutcome};
use super::stats::SharedPipelineStats;
use crate::error::PipelineError;
use crate::metrics::MetricsCollector;
use crate::queue::{QueueMessage, Subscription};

/// Feeds the backpressure channel from a subscription.
pub struct ReceivingStage {
    subscription: Arc<dyn Subscription>,
    sender: ChannelSender<QueueMessage>,
    token: CancellationToken,
    stats: Arc<SharedPipelineStats>,
    metrics: MetricsCollector,
}

impl ReceivingStage {
    pub fn new(
        subscription: Arc<dyn Subscription>,
        sender: ChannelSender<QueueMessage>,
        token: CancellationToken,
        stats: Arc<SharedPipelineStats>,
    ) -> Self {
        Self {
            subscription,
            sender,
            token,
            stats,
            metrics: MetricsCollector::new(),
        }
    }

    /// Runs until cancellation.
    ///
    /// Receive errors are logged and retried after yielding once. A message
    /// in hand when cancellation interrupts a push is dropped without
    /// acknowledgment so the transport redelivers it.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::ChannelClosed` if the processing stage went
    /// away.
    pub async fn run(self) -> Result<(), PipelineError> {
        info!(capacity = self.sender.capacity(), "Receiving loop started");

        loop {
            let received = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    info!("Receiving loop cancelled");
                    return Ok(());
                }
                received = self.subscription.receive() => received,
            };

            let message = match received {
                Ok(message) => message,
                Err(e) => {
                    self.stats.record_receive_error();
                    error!(error = %e, "Could not receive message");
                    tokio::task::yield_now().await;
                    continue;
                }
            };

            self.stats.record_received();
            self.metrics.record_received();
            debug!(
                message_id = %message.loggable_id(),
                depth = self.sender.len(),
                "Received message"
            );

            match self.sender.push(message).await? {
                PushOutcome::Delivered => {
                    self.metrics.update_channel_depth(self.sender.len());
                }
                PushOutcome::Cancelled(message) => {
                    info!(
                        message_id = %message.loggable_id(),
                        "Receiving loop cancelled while waiting for channel space, message left unacknowledged"
                    );
                    return Ok(());
                }
            }
        }
    }

    /// The loop future wrapped in its `loop` span, ready to be spawned.
    pub fn into_task(self) -> impl Future<Output = Result<(), PipelineError>> + Send {
        let span = tracing::info_span!("loop", stage = "receiving");
        self.run().instrument(span)
    }
}

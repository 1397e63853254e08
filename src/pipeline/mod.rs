//! Consumer-side ingestion pipeline.
//!
//! # Architecture
//!
//! Two long-lived loops joined by a bounded channel:
//!
//! - **Receiving stage**: pulls messages from the subscription and pushes
//!   them into the channel, blocking when it is full
//! - **Processing stage**: pops messages, decodes them into task records,
//!   runs the task handler and acknowledges on success
//!
//! Both loops share one cancellation token. The [`ShutdownCoordinator`]
//! cancels it on the first termination signal, forces exit on the second
//! and reports the pipeline counters once both loops have returned.
//!
//! # Example
//!
//! ```rust,ignore
//! use ingest_pipeline::pipeline::{os_signals, ConsumerPipeline, LogHandler, ShutdownCoordinator};
//! use tokio_util::sync::CancellationToken;
//!
//! let coordinator = ShutdownCoordinator::new(CancellationToken::new());
//! coordinator.listen(os_signals());
//!
//! let stats = ConsumerPipeline::new(queue, Arc::new(LogHandler))
//!     .with_capacity(30)
//!     .with_store(store)
//!     .run(&coordinator)
//!     .await?;
//! ```

pub mod channel;
pub mod group;
pub mod processor;
pub mod receiver;
pub mod shutdown;
pub mod stats;

use std::sync::Arc;

use crate::error::PipelineError;
use crate::queue::Subscription;
use crate::store::TaskStore;

pub use channel::{
    BackpressureChannel, ChannelReceiver, ChannelSender, PopOutcome, PushOutcome,
    DEFAULT_CAPACITY,
};
pub use group::{StageGroup, STAGE_LIMIT};
pub use processor::{Handled, LogHandler, ProcessingStage, TaskHandler};
pub use receiver::ReceivingStage;
pub use shutdown::{
    os_signals, ForceExit, ShutdownCoordinator, ShutdownSignal, ShutdownState, SignalAction,
    FORCE_EXIT_CODE,
};
pub use stats::{PipelineStats, SharedPipelineStats};

/// Wires the two stages around a subscription.
pub struct ConsumerPipeline {
    subscription: Arc<dyn Subscription>,
    handler: Arc<dyn TaskHandler>,
    store: Option<Arc<dyn TaskStore>>,
    capacity: usize,
}

impl ConsumerPipeline {
    pub fn new(subscription: Arc<dyn Subscription>, handler: Arc<dyn TaskHandler>) -> Self {
        Self {
            subscription,
            handler,
            store: None,
            capacity: DEFAULT_CAPACITY,
        }
    }

    /// Sets the backpressure channel capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Enables state updates and redelivery detection against `store`.
    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Runs both stages until the coordinator's token is cancelled and both
    /// have drained.
    ///
    /// # Errors
    ///
    /// Returns the first pipeline-fatal error from either stage.
    pub async fn run(self, coordinator: &ShutdownCoordinator) -> Result<PipelineStats, PipelineError> {
        let token = coordinator.token();
        let stats = Arc::new(SharedPipelineStats::new());
        let (sender, receiver) = BackpressureChannel::new(self.capacity, token.clone());

        let receiving = ReceivingStage::new(
            self.subscription.clone(),
            sender,
            token.clone(),
            stats.clone(),
        );
        let mut processing =
            ProcessingStage::new(receiver, self.subscription, self.handler, stats.clone());
        if let Some(store) = self.store {
            processing = processing.with_store(store);
        }

        let mut group = StageGroup::new(token);
        group.spawn("receiving", receiving.into_task());
        group.spawn("processing", processing.into_task());

        coordinator.run(group, &stats).await
    }
}

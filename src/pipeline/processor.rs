//! Processing stage: pops messages from the channel, runs the task work and
//! acknowledges only on success.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, error, info, warn, Instrument};

use super::channel::{ChannelReceiver, PopOutcome};
use super::stats::SharedPipelineStats;
use crate::error::{PipelineError, ProcessError, StoreError};
use crate::metrics::{MetricsCollector, ProcessOutcome};
use crate::queue::{QueueMessage, Subscription};
use crate::store::TaskStore;
use crate::task::{TaskRecord, TaskState};

/// Task-specific work run for each decoded record.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Runs the work for `record`. An error marks the task failed and
    /// leaves the message unacknowledged.
    async fn handle(&self, record: &TaskRecord) -> Result<(), ProcessError>;
}

/// Handler that logs the task and succeeds.
#[derive(Debug, Clone, Default)]
pub struct LogHandler;

#[async_trait]
impl TaskHandler for LogHandler {
    async fn handle(&self, record: &TaskRecord) -> Result<(), ProcessError> {
        info!(
            task_id = %record.id,
            task_name = %record.task_name,
            message = record.message.as_deref().unwrap_or(""),
            "Performing work"
        );
        Ok(())
    }
}

/// How one message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Work ran, the record is complete and the message was acknowledged
    /// (or acknowledgment was attempted).
    Completed,
    /// The task had already finished; acknowledged without running again.
    RedeliverySkipped,
}

/// Consumes the backpressure channel.
pub struct ProcessingStage {
    receiver: ChannelReceiver<QueueMessage>,
    subscription: Arc<dyn Subscription>,
    handler: Arc<dyn TaskHandler>,
    store: Option<Arc<dyn TaskStore>>,
    stats: Arc<SharedPipelineStats>,
    metrics: MetricsCollector,
}

impl ProcessingStage {
    pub fn new(
        receiver: ChannelReceiver<QueueMessage>,
        subscription: Arc<dyn Subscription>,
        handler: Arc<dyn TaskHandler>,
        stats: Arc<SharedPipelineStats>,
    ) -> Self {
        Self {
            receiver,
            subscription,
            handler,
            store: None,
            stats,
            metrics: MetricsCollector::new(),
        }
    }

    /// Enables lookups and state updates against `store`.
    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Runs until cancellation.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::ChannelClosed` if the receiving stage went
    /// away. Per-message failures are logged and never end the loop.
    pub async fn run(mut self) -> Result<(), PipelineError> {
        info!("Processing loop started");

        loop {
            let message = match self.receiver.pop().await? {
                PopOutcome::Item(message) => message,
                PopOutcome::Cancelled => {
                    info!("Processing loop cancelled");
                    return Ok(());
                }
            };
            self.metrics.update_channel_depth(self.receiver.len());

            let span = tracing::info_span!("message", message_id = %message.loggable_id());
            async {
                let started = Instant::now();
                let result = self.process(&message).await;
                self.report(result, started.elapsed().as_secs_f64());
            }
            .instrument(span)
            .await;
        }
    }

    fn report(&self, result: Result<Handled, ProcessError>, elapsed: f64) {
        match result {
            Ok(Handled::Completed) => {
                self.stats.record_processed();
                self.metrics
                    .record_processed(ProcessOutcome::Complete, elapsed);
                info!("Message processed");
            }
            Ok(Handled::RedeliverySkipped) => {
                self.stats.record_redelivery_skipped();
                self.metrics
                    .record_processed(ProcessOutcome::Redelivered, elapsed);
                info!("Task already finished, acknowledged redelivery");
            }
            Err(e) => {
                self.stats.record_failed();
                let outcome = match &e {
                    ProcessError::Handler(_) => ProcessOutcome::Failed,
                    _ => ProcessOutcome::Rejected,
                };
                self.metrics.record_processed(outcome, elapsed);
                error!(error = %e, "Could not process message");
            }
        }
    }

    /// Handles one message. Acknowledgment happens in here; an `Err` always
    /// means the message was left unacknowledged.
    async fn process(&self, message: &QueueMessage) -> Result<Handled, ProcessError> {
        let body = message.body().ok_or(ProcessError::MissingBody)?;
        if body.is_empty() {
            return Err(ProcessError::EmptyBody);
        }

        let record = TaskRecord::from_body(body)?;
        debug!(task_id = %record.id, state = %record.state, "Decoded task");

        if let Some(store) = &self.store {
            if let Some(stored) = store.get(record.id).await? {
                if stored.state.is_terminal() {
                    debug!(task_id = %record.id, state = %stored.state, "Skipping finished task");
                    self.acknowledge(message).await;
                    return Ok(Handled::RedeliverySkipped);
                }
            }
        }

        if let Err(e) = self.handler.handle(&record).await {
            if let Err(store_err) = self.record_state(&record, TaskState::Failed).await {
                warn!(task_id = %record.id, error = %store_err, "Could not mark task failed");
            }
            return Err(e);
        }

        self.record_state(&record, TaskState::Complete).await?;
        self.acknowledge(message).await;
        Ok(Handled::Completed)
    }

    async fn record_state(&self, record: &TaskRecord, state: TaskState) -> Result<(), ProcessError> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        match store.update_state(record.id, state).await {
            Ok(()) => Ok(()),
            // Tasks published by other producers may have no stored record.
            Err(StoreError::NotFound(id)) => {
                warn!(task_id = %id, state = %state, "Task not found in store, state not recorded");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn acknowledge(&self, message: &QueueMessage) {
        match self.subscription.acknowledge(message).await {
            Ok(()) => self.stats.record_acknowledged(),
            Err(e) => error!(error = %e, "Could not acknowledge message"),
        }
    }

    /// The loop future wrapped in its `loop` span, ready to be spawned.
    pub fn into_task(self) -> impl Future<Output = Result<(), PipelineError>> + Send {
        let span = tracing::info_span!("loop", stage = "processing");
        self.run().instrument(span)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::pipeline::channel::{BackpressureChannel, ChannelSender};
    use crate::queue::MemoryQueue;
    use crate::store::MemoryTaskStore;
    use crate::task::TaskRequest;

    struct CountingHandler {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingHandler {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl TaskHandler for CountingHandler {
        async fn handle(&self, _record: &TaskRecord) -> Result<(), ProcessError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ProcessError::Handler("boom".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct Harness {
        queue: Arc<MemoryQueue>,
        sender: ChannelSender<QueueMessage>,
        stats: Arc<SharedPipelineStats>,
        token: CancellationToken,
        handle: JoinHandle<Result<(), PipelineError>>,
    }

    fn start(handler: Arc<dyn TaskHandler>, store: Option<Arc<MemoryTaskStore>>) -> Harness {
        let token = CancellationToken::new();
        let queue = Arc::new(MemoryQueue::new());
        let stats = Arc::new(SharedPipelineStats::new());
        let (sender, receiver) = BackpressureChannel::new(4, token.clone());

        let mut stage = ProcessingStage::new(receiver, queue.clone(), handler, stats.clone());
        if let Some(store) = store {
            stage = stage.with_store(store);
        }

        Harness {
            queue,
            sender,
            stats,
            token,
            handle: tokio::spawn(stage.into_task()),
        }
    }

    /// Publishes a body, receives it from the queue and hands it to the stage.
    async fn deliver(harness: &Harness, body: Option<Vec<u8>>) {
        harness.queue.push_raw(body);
        let message = harness.queue.receive().await.unwrap();
        harness.sender.push(message).await.unwrap();
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    async fn stop(harness: Harness) {
        harness.token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), harness.handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_empty_body_is_not_acknowledged() {
        let handler = CountingHandler::new(false);
        let harness = start(handler.clone(), None);

        deliver(&harness, Some(Vec::new())).await;
        deliver(&harness, None).await;
        settle().await;

        assert_eq!(harness.queue.acknowledged_count(), 0);
        assert_eq!(harness.queue.in_flight_len(), 2);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(harness.stats.snapshot().failed, 2);
        stop(harness).await;
    }

    #[tokio::test]
    async fn test_undecodable_body_is_not_acknowledged() {
        let handler = CountingHandler::new(false);
        let harness = start(handler.clone(), None);

        deliver(&harness, Some(b"{not json".to_vec())).await;
        settle().await;

        assert_eq!(harness.queue.acknowledged_count(), 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        stop(harness).await;
    }

    #[tokio::test]
    async fn test_success_marks_complete_and_acknowledges() {
        let store = Arc::new(MemoryTaskStore::new());
        let handler = CountingHandler::new(false);
        let harness = start(handler.clone(), Some(store.clone()));

        let record = TaskRecord::pending(TaskRequest::new("demo"));
        store.create(&record).await.unwrap();
        deliver(&harness, Some(record.to_body().unwrap())).await;
        settle().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(harness.queue.acknowledged_count(), 1);
        assert_eq!(
            store.get(record.id).await.unwrap().unwrap().state,
            TaskState::Complete
        );
        let stats = harness.stats.snapshot();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.acknowledged, 1);
        stop(harness).await;
    }

    #[tokio::test]
    async fn test_handler_failure_marks_failed_without_ack() {
        let store = Arc::new(MemoryTaskStore::new());
        let handler = CountingHandler::new(true);
        let harness = start(handler.clone(), Some(store.clone()));

        let record = TaskRecord::pending(TaskRequest::new("demo"));
        store.create(&record).await.unwrap();
        deliver(&harness, Some(record.to_body().unwrap())).await;
        settle().await;

        assert_eq!(harness.queue.acknowledged_count(), 0);
        assert_eq!(
            store.get(record.id).await.unwrap().unwrap().state,
            TaskState::Failed
        );
        stop(harness).await;
    }

    #[tokio::test]
    async fn test_redelivery_of_finished_task_skips_work() {
        let store = Arc::new(MemoryTaskStore::new());
        let handler = CountingHandler::new(false);
        let harness = start(handler.clone(), Some(store.clone()));

        let record = TaskRecord::pending(TaskRequest::new("demo"));
        store.create(&record).await.unwrap();
        store
            .update_state(record.id, TaskState::Complete)
            .await
            .unwrap();
        deliver(&harness, Some(record.to_body().unwrap())).await;
        settle().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(harness.queue.acknowledged_count(), 1);
        assert_eq!(harness.stats.snapshot().redeliveries_skipped, 1);
        stop(harness).await;
    }

    #[tokio::test]
    async fn test_unknown_task_still_processed_without_store_record() {
        let store = Arc::new(MemoryTaskStore::new());
        let handler = CountingHandler::new(false);
        let harness = start(handler.clone(), Some(store.clone()));

        let record = TaskRecord::pending(TaskRequest::new("demo"));
        deliver(&harness, Some(record.to_body().unwrap())).await;
        settle().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(harness.queue.acknowledged_count(), 1);
        stop(harness).await;
    }

    #[tokio::test]
    async fn test_loop_continues_after_errors() {
        let handler = CountingHandler::new(false);
        let harness = start(handler.clone(), None);

        deliver(&harness, Some(Vec::new())).await;
        let record = TaskRecord::pending(TaskRequest::new("demo"));
        deliver(&harness, Some(record.to_body().unwrap())).await;
        settle().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(harness.queue.acknowledged_count(), 1);
        stop(harness).await;
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_returns_ok() {
        let harness = start(Arc::new(LogHandler), None);
        settle().await;
        assert!(!harness.handle.is_finished());
        stop(harness).await;
    }

    #[tokio::test]
    async fn test_closed_channel_is_fatal() {
        let token = CancellationToken::new();
        let queue = Arc::new(MemoryQueue::new());
        let (sender, receiver) = BackpressureChannel::new::<QueueMessage>(1, token);
        drop(sender);

        let stage = ProcessingStage::new(
            receiver,
            queue,
            Arc::new(LogHandler),
            Arc::new(SharedPipelineStats::new()),
        );
        assert!(matches!(stage.run().await, Err(PipelineError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_log_handler_succeeds() {
        let record = TaskRecord::pending(TaskRequest::new("demo").with_message("hi"));
        assert!(LogHandler.handle(&record).await.is_ok());
    }
}

//! Bounded hand-off buffer between the receiving and processing stages.
//!
//! Both halves race every blocking operation against the shared
//! cancellation token, so a stage parked on a full or empty channel returns
//! as soon as shutdown begins.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;

/// Default channel capacity.
pub const DEFAULT_CAPACITY: usize = 30;

/// Outcome of [`ChannelSender::push`].
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome<T> {
    /// The item is in the channel.
    Delivered,
    /// Cancellation fired first; the item was not enqueued and is handed
    /// back.
    Cancelled(T),
}

/// Outcome of [`ChannelReceiver::pop`].
#[derive(Debug, PartialEq, Eq)]
pub enum PopOutcome<T> {
    Item(T),
    /// Cancellation fired; there is no more work.
    Cancelled,
}

/// Factory for a connected sender/receiver pair.
pub struct BackpressureChannel;

impl BackpressureChannel {
    /// Creates a channel holding at most `capacity` items. A capacity of
    /// zero is raised to one.
    #[allow(clippy::new_ret_no_self)]
    pub fn new<T>(
        capacity: usize,
        token: CancellationToken,
    ) -> (ChannelSender<T>, ChannelReceiver<T>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        (
            ChannelSender {
                tx,
                token: token.clone(),
                capacity,
            },
            ChannelReceiver {
                rx,
                token,
                capacity,
            },
        )
    }
}

/// Sending half, owned by the receiving stage.
pub struct ChannelSender<T> {
    tx: mpsc::Sender<T>,
    token: CancellationToken,
    capacity: usize,
}

impl<T> ChannelSender<T> {
    /// Waits for space and enqueues `item`, or gives it back if cancellation
    /// fires first.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::ChannelClosed` if the receiving half is gone.
    pub async fn push(&self, item: T) -> Result<PushOutcome<T>, PipelineError> {
        if self.token.is_cancelled() {
            return Ok(PushOutcome::Cancelled(item));
        }

        let permit = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Ok(PushOutcome::Cancelled(item)),
            permit = self.tx.reserve() => permit.map_err(|_| PipelineError::ChannelClosed)?,
        };

        permit.send(item);
        Ok(PushOutcome::Delivered)
    }

    /// Items currently buffered.
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Receiving half, owned by the processing stage.
pub struct ChannelReceiver<T> {
    rx: mpsc::Receiver<T>,
    token: CancellationToken,
    capacity: usize,
}

impl<T> ChannelReceiver<T> {
    /// Waits for the next item, or reports cancellation.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::ChannelClosed` if the sending half is gone
    /// and the buffer is empty.
    pub async fn pop(&mut self) -> Result<PopOutcome<T>, PipelineError> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Ok(PopOutcome::Cancelled),
            item = self.rx.recv() => item
                .map(PopOutcome::Item)
                .ok_or(PipelineError::ChannelClosed),
        }
    }

    /// Items currently buffered.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

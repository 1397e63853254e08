//! Aggregator for the stage loops.
//!
//! Runs a bounded number of loops at once, cancels the shared token when any
//! of them fails, and reports the first failure once every loop has
//! returned.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::error::PipelineError;

/// Number of loops the consumer runs.
pub const STAGE_LIMIT: usize = 2;

/// A group of stage loops sharing one cancellation token.
pub struct StageGroup {
    tasks: JoinSet<Result<(), PipelineError>>,
    token: CancellationToken,
    permits: Arc<Semaphore>,
}

impl StageGroup {
    /// Creates a group that runs at most [`STAGE_LIMIT`] loops at once.
    pub fn new(token: CancellationToken) -> Self {
        Self::with_limit(token, STAGE_LIMIT)
    }

    /// Creates a group that runs at most `limit` loops at once. Loops
    /// spawned beyond the limit wait for a running one to return.
    pub fn with_limit(token: CancellationToken, limit: usize) -> Self {
        Self {
            tasks: JoinSet::new(),
            token,
            permits: Arc::new(Semaphore::new(limit.max(1))),
        }
    }

    /// Spawns a loop. An error or panic from it cancels the shared token.
    pub fn spawn<F>(&mut self, stage: &'static str, future: F)
    where
        F: Future<Output = Result<(), PipelineError>> + Send + 'static,
    {
        let permits = self.permits.clone();
        let token = self.token.clone();

        self.tasks.spawn(async move {
            // The semaphore is never closed, so acquire only fails if it is.
            let _permit = permits.acquire_owned().await.ok();

            // The loop runs in its own task so a panic is reported with the
            // stage name. Aborting the wrapper aborts the loop too.
            let handle = tokio::spawn(future);
            let _abort = AbortOnDrop(handle.abort_handle());

            let outcome = match handle.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(source)) => Err(PipelineError::Stage {
                    stage,
                    source: Box::new(source),
                }),
                Err(join_err) if join_err.is_panic() => Err(PipelineError::StagePanicked {
                    stage: stage.to_string(),
                    reason: panic_reason(join_err.into_panic()),
                }),
                Err(join_err) => Err(PipelineError::StagePanicked {
                    stage: stage.to_string(),
                    reason: join_err.to_string(),
                }),
            };

            if let Err(e) = &outcome {
                error!(stage = stage, error = %e, "Stage loop failed, cancelling pipeline");
                token.cancel();
            }
            outcome
        });
    }

    /// Number of loops not yet joined.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Waits for every loop to return.
    ///
    /// # Errors
    ///
    /// Returns the first loop failure. Later failures are logged.
    pub async fn wait(mut self) -> Result<(), PipelineError> {
        let mut first: Option<PipelineError> = None;

        while let Some(joined) = self.tasks.join_next().await {
            let outcome = joined.unwrap_or_else(|join_err| {
                self.token.cancel();
                Err(PipelineError::StagePanicked {
                    stage: "unknown".to_string(),
                    reason: join_err.to_string(),
                })
            });

            if let Err(e) = outcome {
                if first.is_none() {
                    first = Some(e);
                } else {
                    warn!(error = %e, "Additional stage failure");
                }
            }
        }

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_all_ok() {
        let token = CancellationToken::new();
        let mut group = StageGroup::new(token.clone());
        group.spawn("a", async { Ok(()) });
        group.spawn("b", async { Ok(()) });
        assert_eq!(group.len(), 2);

        assert!(group.wait().await.is_ok());
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_error_cancels_sibling_and_is_returned() {
        let token = CancellationToken::new();
        let mut group = StageGroup::new(token.clone());

        let sibling_token = token.clone();
        group.spawn("processing", async move {
            sibling_token.cancelled().await;
            Ok(())
        });
        group.spawn("receiving", async { Err(PipelineError::ChannelClosed) });

        let err = timeout(Duration::from_secs(1), group.wait())
            .await
            .unwrap()
            .unwrap_err();
        assert!(token.is_cancelled());
        match err {
            PipelineError::Stage { stage, source } => {
                assert_eq!(stage, "receiving");
                assert!(matches!(*source, PipelineError::ChannelClosed));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_fatal_error() {
        let token = CancellationToken::new();
        let mut group = StageGroup::new(token.clone());
        group.spawn("processing", async {
            if token_is_live() {
                panic!("stage exploded");
            }
            Ok(())
        });

        let err = group.wait().await.unwrap_err();
        assert!(token.is_cancelled());
        match err {
            PipelineError::StagePanicked { stage, reason } => {
                assert_eq!(stage, "processing");
                assert_eq!(reason, "stage exploded");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_first_error_wins() {
        let token = CancellationToken::new();
        let mut group = StageGroup::new(token.clone());
        group.spawn("receiving", async { Err(PipelineError::ChannelClosed) });

        let later_token = token.clone();
        group.spawn("processing", async move {
            later_token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(PipelineError::ChannelClosed)
        });

        match group.wait().await.unwrap_err() {
            PipelineError::Stage { stage, .. } => assert_eq!(stage, "receiving"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_limit_bounds_concurrency() {
        let token = CancellationToken::new();
        let mut group = StageGroup::with_limit(token, 2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for name in ["a", "b", "c", "d"] {
            let running = running.clone();
            let peak = peak.clone();
            group.spawn(name, async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }

        assert!(group.wait().await.is_ok());
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    struct DropFlag(Arc<AtomicUsize>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_dropping_group_stops_running_loops() {
        let token = CancellationToken::new();
        let mut group = StageGroup::new(token.clone());
        let started = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicUsize::new(0));

        {
            let started = started.clone();
            let flag = DropFlag(dropped.clone());
            group.spawn("receiving", async move {
                let _flag = flag;
                started.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<()>().await;
                Ok(())
            });
        }

        timeout(Duration::from_secs(1), async {
            while started.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        drop(group);

        timeout(Duration::from_secs(1), async {
            while dropped.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("loop kept running after its group was dropped");
        assert!(!token.is_cancelled());
    }

    fn token_is_live() -> bool {
        true
    }

    #[test]
    fn test_panic_reason_payloads() {
        assert_eq!(panic_reason(Box::new("static")), "static");
        assert_eq!(panic_reason(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_reason(Box::new(42u8)), "unknown panic");
    }
}

//! Coordinated shutdown of the consumer pipeline.
//!
//! The first SIGINT or SIGTERM cancels the shared token and the stages
//! drain. A second signal forces the process out through the exit hook,
//! whether the drain was started by a signal or by a failed stage. Once both stages have returned the coordinator reports the
//! pipeline counters.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::group::StageGroup;
use super::stats::{PipelineStats, SharedPipelineStats};
use crate::error::PipelineError;

/// Exit code used when a second signal forces the process out.
pub const FORCE_EXIT_CODE: i32 = 1;

/// Hook invoked on forced exit. Production uses `std::process::exit`.
pub type ForceExit = Arc<dyn Fn(i32) + Send + Sync>;

/// Lifecycle of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    /// Cancellation has been requested; stages are winding down.
    Draining,
    /// Both stages have returned.
    Terminated,
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShutdownState::Running => "running",
            ShutdownState::Draining => "draining",
            ShutdownState::Terminated => "terminated",
        };
        write!(f, "{}", s)
    }
}

/// A termination request from the operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT / Ctrl-C.
    Interrupt,
    /// SIGTERM.
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// What a signal did to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Cancellation was requested.
    Drain,
    /// The exit hook was invoked.
    ForceExit,
    /// The pipeline had already terminated.
    Ignored,
}

/// Drives the Running -> Draining -> Terminated lifecycle.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    state: Arc<Mutex<ShutdownState>>,
    signals_seen: Arc<AtomicUsize>,
    force_exit: ForceExit,
}

impl ShutdownCoordinator {
    /// Creates a coordinator whose forced exit terminates the process.
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            state: Arc::new(Mutex::new(ShutdownState::Running)),
            signals_seen: Arc::new(AtomicUsize::new(0)),
            force_exit: Arc::new(|code| std::process::exit(code)),
        }
    }

    /// Replaces the forced-exit hook.
    pub fn with_force_exit(mut self, hook: ForceExit) -> Self {
        self.force_exit = hook;
        self
    }

    /// The shared cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn state(&self) -> ShutdownState {
        *self.lock()
    }

    /// Moves to `Draining` and cancels the token. Returns `false` if the
    /// pipeline was not running.
    pub fn begin_drain(&self, reason: &str) -> bool {
        let mut state = self.lock();
        if *state != ShutdownState::Running {
            return false;
        }
        *state = ShutdownState::Draining;
        drop(state);

        info!(reason = reason, "Shutting down, waiting for stages to drain");
        self.token.cancel();
        true
    }

    /// Applies one termination signal. Only a repeated signal forces exit;
    /// a drain started by a stage failure does not count as one.
    pub fn on_signal(&self, signal: ShutdownSignal) -> SignalAction {
        if self.state() == ShutdownState::Terminated {
            return SignalAction::Ignored;
        }

        let seen = self.signals_seen.fetch_add(1, Ordering::SeqCst) + 1;
        if seen == 1 {
            info!(signal = %signal, "Received termination signal");
            if !self.begin_drain("signal") {
                info!("Already draining, waiting for stages to return");
            }
            return SignalAction::Drain;
        }

        warn!(signal = %signal, "Second termination signal received, forcing exit");
        (self.force_exit)(FORCE_EXIT_CODE);
        SignalAction::ForceExit
    }

    /// Applies every signal from `signals` until the sender goes away or the
    /// pipeline terminates.
    pub fn listen(&self, mut signals: mpsc::Receiver<ShutdownSignal>) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                if coordinator.on_signal(signal) == SignalAction::Ignored {
                    break;
                }
            }
        })
    }

    /// Waits for the stages in `group` to return, then reports the
    /// counters.
    ///
    /// # Errors
    ///
    /// Returns the first stage failure; it is the process's fatal exit
    /// condition.
    pub async fn run(
        &self,
        group: StageGroup,
        stats: &SharedPipelineStats,
    ) -> Result<PipelineStats, PipelineError> {
        let wait = group.wait();
        tokio::pin!(wait);

        let result = tokio::select! {
            result = &mut wait => result,
            _ = self.token.cancelled() => {
                self.begin_drain("cancelled");
                wait.await
            }
        };

        *self.lock() = ShutdownState::Terminated;

        let summary = stats.snapshot();
        info!(
            received = summary.received,
            receive_errors = summary.receive_errors,
            processed = summary.processed,
            failed = summary.failed,
            acknowledged = summary.acknowledged,
            redeliveries_skipped = summary.redeliveries_skipped,
            "Pipeline terminated"
        );

        match result {
            Ok(()) => Ok(summary),
            Err(e) => {
                error!(error = %e, "Pipeline stopped with an error");
                Err(e)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, ShutdownState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Forwards SIGINT and SIGTERM as [`ShutdownSignal`]s for as long as the
/// receiver is alive. Must be called inside the runtime.
pub fn os_signals() -> mpsc::Receiver<ShutdownSignal> {
    let (tx, rx) = mpsc::channel(4);

    // Installed before returning so a signal right after startup is caught.
    #[cfg(unix)]
    let (mut interrupt, mut terminate) = {
        use tokio::signal::unix::{signal, SignalKind};
        let install = |kind: SignalKind, name: &str| match signal(kind) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(error = %e, signal = name, "failed to install signal handler");
                None
            }
        };
        (
            install(SignalKind::interrupt(), "SIGINT"),
            install(SignalKind::terminate(), "SIGTERM"),
        )
    };

    tokio::spawn(async move {
        loop {
            #[cfg(unix)]
            let signal = tokio::select! {
                _ = recv_or_pending(interrupt.as_mut()) => ShutdownSignal::Interrupt,
                _ = recv_or_pending(terminate.as_mut()) => ShutdownSignal::Terminate,
            };

            #[cfg(not(unix))]
            let signal = {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "failed to install CTRL+C signal handler");
                    break;
                }
                ShutdownSignal::Interrupt
            };

            if tx.send(signal).await.is_err() {
                break;
            }
        }
    });

    rx
}

/// Next delivery from an installed handler. Pends forever when the handler
/// is missing or its stream has ended.
#[cfg(unix)]
async fn recv_or_pending(signal: Option<&mut tokio::signal::unix::Signal>) {
    if let Some(s) = signal {
        if s.recv().await.is_some() {
            return;
        }
    }
    std::future::pending::<()>().await
}

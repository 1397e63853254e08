//! CLI command definitions for ingest-pipeline.
//!
//! Two long-running commands share one binary: `supply` accepts tasks over
//! HTTP and `consume` works them off the queue.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use crate::config::{ConsumerConfig, SupplierConfig, DEFAULT_LISTEN_ADDR, DEFAULT_QUEUE_NAME};
use crate::metrics::{init_metrics, MetricsCollector, ProcessOutcome};
use crate::pipeline::{os_signals, ConsumerPipeline, LogHandler, ShutdownCoordinator};
use crate::producer::{http, AppState, IngestionProducer};
use crate::queue::{open_queue, RedisQueue};
use crate::store::{open_store, SqliteTaskStore, TaskStore};

/// Task ingestion pipeline: HTTP supplier and backpressured queue consumer.
#[derive(Parser)]
#[command(name = "ingest-pipeline")]
#[command(about = "Submit tasks over HTTP and work them off a queue")]
#[command(version)]
#[command(
    long_about = "ingest-pipeline accepts task submissions over HTTP, records them in a document store and queues them for a consumer that processes them with bounded buffering and graceful shutdown.\n\nExample usage:\n  QUEUE_URL=redis://localhost:6379 COLLECTION_URL=sqlite://tasks.db ingest-pipeline supply\n  QUEUE_URL=redis://localhost:6379 ingest-pipeline consume --max-concurrent-count 30"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Consume tasks from the queue until SIGINT or SIGTERM.
    Consume(ConsumeArgs),

    /// Serve the task submission API.
    #[command(alias = "serve")]
    Supply(SupplyArgs),
}

/// Arguments for `ingest-pipeline consume`.
#[derive(Parser, Debug)]
pub struct ConsumeArgs {
    /// Queue connection URL.
    #[arg(long, env = "QUEUE_URL")]
    pub queue_url: String,

    /// Queue name.
    #[arg(long, env = "QUEUE_NAME", default_value = DEFAULT_QUEUE_NAME)]
    pub queue_name: String,

    /// Messages buffered between receiving and processing.
    #[arg(long, env = "MAX_CONCURRENT_COUNT", default_value = "30")]
    pub max_concurrent_count: usize,

    /// Document store URL. When set, processed tasks are marked complete or
    /// failed.
    #[arg(long, env = "COLLECTION_URL")]
    pub collection_url: Option<String>,
}

impl ConsumeArgs {
    fn into_config(self) -> ConsumerConfig {
        let config = ConsumerConfig::new(self.queue_url)
            .with_queue_name(self.queue_name)
            .with_max_concurrent_count(self.max_concurrent_count);
        match self.collection_url {
            Some(url) => config.with_collection_url(url),
            None => config,
        }
    }
}

/// Arguments for `ingest-pipeline supply`.
#[derive(Parser, Debug)]
pub struct SupplyArgs {
    /// Queue connection URL.
    #[arg(long, env = "QUEUE_URL")]
    pub queue_url: String,

    /// Queue name.
    #[arg(long, env = "QUEUE_NAME", default_value = DEFAULT_QUEUE_NAME)]
    pub queue_name: String,

    /// Document store URL.
    #[arg(long, env = "COLLECTION_URL")]
    pub collection_url: String,

    /// Address the HTTP server listens on.
    #[arg(long, env = "LISTEN_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen_addr: String,
}

impl SupplyArgs {
    fn into_config(self) -> SupplierConfig {
        SupplierConfig::new(self.queue_url, self.collection_url)
            .with_queue_name(self.queue_name)
            .with_listen_addr(self.listen_addr)
    }
}

/// Parse CLI arguments without running any command.
///
/// Use this to access CLI options (like log_level) before running.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Consume(args) => run_consume_command(args.into_config()).await,
        Commands::Supply(args) => run_supply_command(args.into_config()).await,
    }
}

// ============================================================================
// Consume
// ============================================================================

async fn run_consume_command(config: ConsumerConfig) -> anyhow::Result<()> {
    config.validate().context("invalid consumer configuration")?;

    let init_span = tracing::info_span!("init", scope = "initialization");
    let (queue, store) = tokio::time::timeout(config.init_timeout, async {
        init_metrics().context("could not initialize metrics")?;
        connect_consumer(&config).await
    })
    .instrument(init_span)
    .await
    .context("timed out connecting to the queue and store")??;

    let coordinator = ShutdownCoordinator::new(CancellationToken::new());
    coordinator.listen(os_signals());

    let mut pipeline = ConsumerPipeline::new(queue.clone(), Arc::new(LogHandler))
        .with_capacity(config.max_concurrent_count);
    if let Some(store) = &store {
        pipeline = pipeline.with_store(store.clone());
    }

    info!(
        queue = %config.queue_name,
        capacity = config.max_concurrent_count,
        store = store.is_some(),
        "Starting consumer"
    );
    log_queue_depth(&queue, "start").await;

    let work_span = tracing::info_span!("work", scope = "working");
    let result = pipeline.run(&coordinator).instrument(work_span).await;

    log_queue_depth(&queue, "exit").await;
    log_processed_outcomes(&MetricsCollector::new());
    if let Some(store) = store {
        log_task_states(&store).await;
        store.close().await;
    }

    let stats = result.context("consumer pipeline stopped with an error")?;
    info!(
        processed = stats.processed,
        unacknowledged = stats.unacknowledged(),
        "Consumer exited"
    );
    Ok(())
}

async fn log_queue_depth(queue: &RedisQueue, at: &str) {
    match queue.stats().await {
        Ok(stats) => info!(
            at = at,
            queue = %stats.queue_name,
            pending = stats.pending_messages,
            processing = stats.processing_messages,
            total = stats.total_messages(),
            "Queue depth"
        ),
        Err(e) => warn!(at = at, error = %e, "Could not read queue depth"),
    }
}

async fn log_task_states(store: &SqliteTaskStore) {
    match store.count_by_state().await {
        Ok(counts) => {
            for (state, count) in counts {
                info!(state = %state, count = count, "Stored tasks");
            }
        }
        Err(e) => warn!(error = %e, "Could not count stored tasks"),
    }
}

fn log_processed_outcomes(metrics: &MetricsCollector) {
    for outcome in ProcessOutcome::ALL {
        info!(
            outcome = outcome.as_str(),
            count = metrics.processed_count(outcome),
            "Processed messages"
        );
    }
}

async fn connect_consumer(
    config: &ConsumerConfig,
) -> anyhow::Result<(Arc<RedisQueue>, Option<Arc<SqliteTaskStore>>)> {
    let queue = open_queue(&config.queue_url, &config.queue_name)
        .await
        .context("could not initialize subscription")?;

    let recovered = queue
        .recover_unacknowledged()
        .await
        .context("could not recover unacknowledged messages")?;
    if recovered > 0 {
        info!(recovered = recovered, "Requeued messages left unacknowledged by a previous run");
    }

    let store = match &config.collection_url {
        Some(url) => Some(Arc::new(
            open_store(url)
                .await
                .context("could not initialize document store")?,
        )),
        None => None,
    };

    Ok((Arc::new(queue), store))
}

// ============================================================================
// Supply
// ============================================================================

async fn run_supply_command(config: SupplierConfig) -> anyhow::Result<()> {
    config.validate().context("invalid supplier configuration")?;
    let addr = config.socket_addr()?;

    let init_span = tracing::info_span!("init", scope = "initialization");
    let (producer, listener) = tokio::time::timeout(config.init_timeout, async {
        let queue = open_queue(&config.queue_url, &config.queue_name)
            .await
            .context("could not initialize topic")?;
        let store = open_store(&config.collection_url)
            .await
            .context("could not initialize document store")?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("could not bind {}", addr))?;
        anyhow::Ok((
            Arc::new(IngestionProducer::new(Arc::new(store), Arc::new(queue))),
            listener,
        ))
    })
    .instrument(init_span)
    .await
    .context("timed out connecting to the queue and store")??;

    init_metrics().context("could not initialize metrics")?;

    let mut signals = os_signals();
    let shutdown = async move {
        if let Some(signal) = signals.recv().await {
            info!(signal = %signal, "shutdown signal received; starting graceful shutdown");
        }
    };

    info!(addr = %addr, "Starting supplier");
    http::serve(listener, AppState::new(producer.clone()), shutdown)
        .instrument(tracing::info_span!("serve", scope = "working"))
        .await
        .context("HTTP server stopped with an error")?;

    producer.close().await;
    info!("Gracefully shut down");
    Ok(())
}

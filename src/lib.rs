//! ingest-pipeline: durable task submission and backpressured consumption.
//!
//! Tasks are accepted by the [`producer`], recorded in a [`store`] and
//! published to a [`queue`]. The consumer [`pipeline`] receives them into a
//! bounded channel, processes them and acknowledges on success, shutting
//! down gracefully on SIGINT or SIGTERM.

pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod producer;
pub mod queue;
pub mod store;
pub mod task;

pub use error::{
    ConfigError, PipelineError, ProcessError, ProducerError, QueueError, StoreError,
    TransitionError,
};
pub use pipeline::{ConsumerPipeline, PipelineStats, ShutdownCoordinator, TaskHandler};
pub use producer::IngestionProducer;
pub use task::{TaskRecord, TaskRequest, TaskState};

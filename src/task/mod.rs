//! Task records and their lifecycle.
//!
//! - `TaskRecord`: the durable unit of work, also the queue message body
//! - `TaskRequest`: what a caller submits to the producer
//! - `TaskState`: forward-only lifecycle state

pub mod record;
pub mod state;

pub use record::{TaskRecord, TaskRequest};
pub use state::TaskState;

//! `batchwork-core`: batching building blocks.
//!
//! This crate contains **pure** types (no IO, no IPC): jobs, the job registry,
//! the trigger policy, the function table, and the error taxonomy.

pub mod batch;
pub mod error;
pub mod function;
pub mod id;
pub mod job;
pub mod registry;

pub use batch::{BatchBuffer, BatchPolicy, FlushOutcome, Item};
pub use error::{BatchError, BatchResult};
pub use function::{Callable, FlushFn, FunctionTable, TaskFn};
pub use id::JobNumId;
pub use job::{Job, JobKind, JobOptions};
pub use registry::JobConfig;

//! Item delivery from producers to job buffers.
//!
//! ## Design
//!
//! - `submit` is fire-and-forget: once it returns, the item belongs to the
//!   batching side and the producer never hears about its flush
//! - Two backends: SysV message queues feeding daemon workers, and an
//!   in-process buffer that flushes inline in the producer
//! - Synchronous `flush` only exists where the buffer is in this process

mod in_process;
mod message_queue;

pub use in_process::InProcessItem;
pub use message_queue::{MessageQueueProcessItem, MessageQueueSource};

use std::sync::Arc;

use batchwork_core::{BatchError, Item, JobNumId};

use crate::ipc::IpcError;

/// Item delivery abstraction.
pub trait ProcessItem: Send + Sync {
    /// Hand `item` to the job with numeric id `job_id`.
    fn submit(&self, item: Item, job_id: JobNumId) -> Result<(), DeliveryError>;

    /// Flush whatever is buffered for `job_id` now. Returns whether a flush
    /// happened and succeeded (an empty buffer counts as success).
    fn flush(&self, job_id: JobNumId) -> bool;

    /// Flush every buffer whose call period has elapsed. Returns the number of
    /// batches handed to flush functions. Backends without a local buffer
    /// have nothing to do.
    fn flush_due(&self) -> usize {
        0
    }
}

/// Item delivery error.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("ipc error: {0}")]
    Ipc(#[from] IpcError),
    #[error("item serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("item spill file error: {0}")]
    SpillFile(#[source] std::io::Error),
    #[error("no job with id {0}")]
    UnknownJob(JobNumId),
    #[error("job {0} does not accept items")]
    NotBatching(JobNumId),
    #[error("flush function {0:?} is not in the function table")]
    UnknownFunction(String),
    #[error("configuration unavailable: {0}")]
    Config(String),
    #[error("item buffer lock poisoned")]
    Poisoned,
}

impl From<DeliveryError> for BatchError {
    fn from(value: DeliveryError) -> Self {
        match value {
            DeliveryError::UnknownJob(id) => BatchError::unknown_job(format!("job id {id}")),
            other => BatchError::delivery(other.to_string()),
        }
    }
}

impl<P> ProcessItem for Arc<P>
where
    P: ProcessItem + ?Sized,
{
    fn submit(&self, item: Item, job_id: JobNumId) -> Result<(), DeliveryError> {
        (**self).submit(item, job_id)
    }

    fn flush(&self, job_id: JobNumId) -> bool {
        (**self).flush(job_id)
    }

    fn flush_due(&self) -> usize {
        (**self).flush_due()
    }
}

//! In-process delivery (embedded mode).

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use batchwork_core::{BatchBuffer, FlushFn, FlushOutcome, FunctionTable, Item, JobNumId};

use super::{DeliveryError, ProcessItem};
use crate::config_storage::ConfigStorage;
use crate::failure_log::FailureLog;

/// Buffer of one job plus what is needed to flush it.
#[derive(Debug)]
struct PendingJob {
    identifier: String,
    function: FlushFn,
    buffer: BatchBuffer,
}

/// Buffers items in the producer and flushes them inline, in the calling
/// thread, with the same size/time policy the daemon workers apply.
///
/// The time trigger is evaluated on `submit` and [`ProcessItem::flush_due`];
/// there is no background timer. Buffers are flushed when the value is dropped.
pub struct InProcessItem {
    storage: Arc<dyn ConfigStorage>,
    functions: Arc<FunctionTable>,
    failures: FailureLog,
    pending: Mutex<HashMap<JobNumId, PendingJob>>,
}

impl InProcessItem {
    pub fn new(
        storage: Arc<dyn ConfigStorage>,
        functions: Arc<FunctionTable>,
        failures: FailureLog,
    ) -> Self {
        Self {
            storage,
            functions,
            failures,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Number of items buffered for `job_id`.
    pub fn pending_len(&self, job_id: JobNumId) -> usize {
        self.pending
            .lock()
            .map(|pending| pending.get(&job_id).map_or(0, |p| p.buffer.len()))
            .unwrap_or(0)
    }

    /// Flush every non-empty buffer. Returns whether all flushes succeeded.
    pub fn flush_all(&self) -> bool {
        let ids: Vec<JobNumId> = match self.pending.lock() {
            Ok(pending) => pending.keys().copied().collect(),
            Err(_) => return false,
        };
        ids.into_iter()
            .fold(true, |all_ok, job_id| self.flush(job_id) && all_ok)
    }

    fn load_job(&self, job_id: JobNumId) -> Result<PendingJob, DeliveryError> {
        let config = self
            .storage
            .load()
            .map_err(|e| DeliveryError::Config(e.to_string()))?;
        let job = config
            .get_job_from_id_num(job_id)
            .ok_or(DeliveryError::UnknownJob(job_id))?;
        let policy = job
            .batch_policy()
            .ok_or(DeliveryError::NotBatching(job_id))?;
        let function = self
            .functions
            .flush_fn(job.function_name())
            .ok_or_else(|| DeliveryError::UnknownFunction(job.function_name().to_string()))?;

        debug!(job = %job.identifier, job_id = %job_id, "opened in-process buffer");
        Ok(PendingJob {
            identifier: job.identifier.clone(),
            function,
            buffer: BatchBuffer::new(policy),
        })
    }

    fn deliver(&self, job_id: JobNumId, function: FlushFn, items: &[Item]) -> FlushOutcome {
        let outcome = FlushOutcome::from_callback(function(items), items.len());
        if let FlushOutcome::Failed { items: count } = outcome {
            warn!(job_id = %job_id, items = count, "flush function reported failure");
            if let Err(e) = self.failures.append(job_id, items) {
                warn!(job_id = %job_id, error = %e, "failed to persist rejected batch");
            }
        }
        outcome
    }
}

impl ProcessItem for InProcessItem {
    fn submit(&self, item: Item, job_id: JobNumId) -> Result<(), DeliveryError> {
        let due = {
            let mut pending = self.pending.lock().map_err(|_| DeliveryError::Poisoned)?;
            let job = match pending.entry(job_id) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(self.load_job(job_id)?),
            };
            job.buffer.push(item);
            if job.buffer.is_due(false) {
                let items = job.buffer.take();
                job.buffer.reclaim();
                Some((job.function, items))
            } else {
                None
            }
        };

        // The flush function runs without the buffer lock held.
        if let Some((function, items)) = due {
            self.deliver(job_id, function, &items);
        }
        Ok(())
    }

    fn flush(&self, job_id: JobNumId) -> bool {
        let taken = match self.pending.lock() {
            Ok(mut pending) => pending
                .get_mut(&job_id)
                .filter(|p| !p.buffer.is_empty())
                .map(|p| (p.function, p.buffer.take())),
            Err(_) => return false,
        };
        match taken {
            Some((function, items)) => self.deliver(job_id, function, &items).is_success(),
            None => true,
        }
    }

    fn flush_due(&self) -> usize {
        let due: Vec<(JobNumId, FlushFn, Vec<Item>)> = match self.pending.lock() {
            Ok(mut pending) => pending
                .iter_mut()
                .filter(|(_, p)| p.buffer.is_due(false))
                .map(|(id, p)| (*id, p.function, p.buffer.take()))
                .collect(),
            Err(_) => return 0,
        };
        let count = due.len();
        for (job_id, function, items) in due {
            self.deliver(job_id, function, &items);
        }
        count
    }
}

impl Drop for InProcessItem {
    fn drop(&mut self) {
        let stragglers: usize = match self.pending.lock() {
            Ok(pending) => pending.values().map(|p| p.buffer.len()).sum(),
            Err(_) => 0,
        };
        if stragglers > 0 {
            info!(items = stragglers, "flushing buffered items at exit");
            self.flush_all();
        }
    }
}

impl core::fmt::Debug for InProcessItem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let jobs: Vec<String> = self
            .pending
            .lock()
            .map(|pending| pending.values().map(|p| p.identifier.clone()).collect())
            .unwrap_or_default();
        f.debug_struct("InProcessItem")
            .field("functions", &self.functions)
            .field("failures", &self.failures)
            .field("jobs", &jobs)
            .finish()
    }
}

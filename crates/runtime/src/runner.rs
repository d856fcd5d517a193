//! Producer-side facade.
//!
//! ## Design
//!
//! - The backend pair (configuration storage, item delivery) is chosen once,
//!   at construction: SysV IPC when a daemon is advertised and the kernel
//!   supports it, in-process otherwise
//! - Registration is load → register → save under the storage lock; the
//!   result also refreshes the local cache
//! - `submit_item` resolves identifiers through the cache and reloads once on
//!   a miss, so jobs registered by other processes become visible
//! - Every storage read holds the lock
//! - Embedded mode has no timer thread: a job's time trigger fires on the
//!   next `submit_item` to it or on [`Runner::flush_due`]

use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::{debug, info};

use batchwork_core::{BatchError, BatchResult, Callable, FunctionTable, Job, JobConfig, JobNumId, JobOptions};
use batchwork_infra::config_storage::{ConfigStorage, SharedMemoryConfigStorage, with_lock};
use batchwork_infra::process_item::{MessageQueueProcessItem, ProcessItem};
use batchwork_infra::{Settings, ipc};

use crate::context::EmbeddedContext;

/// Which backend pair a runner talks to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    /// In-memory storage, inline flushing in the caller's process.
    Embedded,
    /// Shared-memory storage and message queues served by daemon workers.
    Daemon,
}

/// Registers jobs and submits items.
pub struct Runner {
    storage: Arc<dyn ConfigStorage>,
    processor: Arc<dyn ProcessItem>,
    functions: Arc<FunctionTable>,
    mode: Mode,
    cache: RwLock<JobConfig>,
}

impl Runner {
    /// Probe the environment and pick a backend pair.
    pub fn new(settings: &Settings, functions: FunctionTable) -> BatchResult<Self> {
        if settings.daemon_running && ipc::is_available() {
            return Self::daemon(settings, functions);
        }
        if settings.daemon_running {
            info!("daemon advertised but SysV IPC is unavailable; batching in-process");
        } else {
            debug!("no daemon advertised; batching in-process");
        }
        Self::embedded(&EmbeddedContext::from_settings(settings, functions))
    }

    pub fn embedded(context: &EmbeddedContext) -> BatchResult<Self> {
        Self::with_backends(
            context.storage(),
            context.processor(),
            context.functions(),
            Mode::Embedded,
        )
    }

    pub fn daemon(settings: &Settings, functions: FunctionTable) -> BatchResult<Self> {
        let storage = SharedMemoryConfigStorage::open(&settings.ipc)?;
        let processor = MessageQueueProcessItem::new(settings.ipc.clone());
        Self::with_backends(
            Arc::new(storage),
            Arc::new(processor),
            Arc::new(functions),
            Mode::Daemon,
        )
    }

    pub fn with_backends(
        storage: Arc<dyn ConfigStorage>,
        processor: Arc<dyn ProcessItem>,
        functions: Arc<FunctionTable>,
        mode: Mode,
    ) -> BatchResult<Self> {
        let cache = RwLock::new(with_lock(&*storage, |s| Ok(s.load()?))?);
        Ok(Self {
            storage,
            processor,
            functions,
            mode,
            cache,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn functions(&self) -> &FunctionTable {
        &self.functions
    }

    /// Register (or refresh) a batching job. Returns its stable numeric id.
    pub fn register_job(
        &self,
        identifier: &str,
        callable: impl Into<Callable>,
        options: JobOptions,
    ) -> BatchResult<JobNumId> {
        options.validate()?;
        let function = self.functions.resolve_flush(&callable.into())?;
        self.check_bootstrap(&options)?;
        self.register(identifier, |id| {
            Job::batching(id, identifier, function, &options)
        })
    }

    /// Register (or refresh) a job whose workers run `task` instead of
    /// consuming items.
    pub fn register_simple_job(
        &self,
        identifier: &str,
        task: &str,
        options: JobOptions,
    ) -> BatchResult<JobNumId> {
        options.validate()?;
        self.functions.resolve_task(task)?;
        self.check_bootstrap(&options)?;
        self.register(identifier, |id| Job::simple(id, identifier, task, &options))
    }

    /// Hand `item` to the job registered as `identifier`.
    pub fn submit_item<T: Serialize>(&self, identifier: &str, item: T) -> BatchResult<()> {
        let job = self.lookup(identifier)?;
        if !job.is_batching() {
            return Err(BatchError::delivery(format!(
                "job {identifier:?} is a simple job and does not accept items"
            )));
        }
        let item = serde_json::to_value(item)
            .map_err(|e| BatchError::delivery(format!("item is not serializable: {e}")))?;
        self.processor.submit(item, job.id)?;
        Ok(())
    }

    /// Refresh the local cache from storage, under the storage lock.
    pub fn load_config(&self) -> BatchResult<()> {
        let config = with_lock(&*self.storage, |s| Ok(s.load()?))?;
        *self.cache_mut()? = config;
        Ok(())
    }

    /// Jobs in the local cache, in id order.
    pub fn get_jobs(&self) -> BatchResult<Vec<Job>> {
        Ok(self.cache()?.get_jobs().cloned().collect())
    }

    pub fn job(&self, identifier: &str) -> BatchResult<Option<Job>> {
        Ok(self.cache()?.get_job_from_id(identifier).cloned())
    }

    /// Flush every batching job's buffer now. Returns whether every flush
    /// succeeded; always `false` in daemon mode.
    pub fn flush(&self) -> BatchResult<bool> {
        if self.mode == Mode::Daemon {
            debug!("synchronous flush is not supported in daemon mode");
            return Ok(false);
        }
        let jobs = self.get_jobs()?;
        Ok(jobs
            .iter()
            .filter(|job| job.is_batching())
            .fold(true, |all_ok, job| self.processor.flush(job.id) && all_ok))
    }

    /// Flush every buffer whose call period has elapsed. Returns how many
    /// batches were handed to their callbacks; always 0 in daemon mode.
    pub fn flush_due(&self) -> usize {
        self.processor.flush_due()
    }

    pub fn flush_job(&self, identifier: &str) -> BatchResult<bool> {
        let job = self.lookup(identifier)?;
        Ok(self.processor.flush(job.id))
    }

    fn register<F>(&self, identifier: &str, factory: F) -> BatchResult<JobNumId>
    where
        F: FnOnce(JobNumId) -> Job,
    {
        let (id, config) = with_lock(&*self.storage, |storage| {
            let mut config = storage.load()?;
            let id = config.register_job(identifier, factory)?;
            storage.save(&config)?;
            Ok((id, config))
        })?;
        *self.cache_mut()? = config;
        info!(job = %identifier, job_id = %id, "registered job");
        Ok(id)
    }

    fn check_bootstrap(&self, options: &JobOptions) -> BatchResult<()> {
        match &options.bootstrap {
            Some(task) => self.functions.resolve_task(task),
            None => Ok(()),
        }
    }

    fn lookup(&self, identifier: &str) -> BatchResult<Job> {
        if let Some(job) = self.job(identifier)? {
            return Ok(job);
        }
        self.load_config()?;
        self.job(identifier)?
            .ok_or_else(|| BatchError::unknown_job(identifier))
    }

    fn cache(&self) -> BatchResult<std::sync::RwLockReadGuard<'_, JobConfig>> {
        self.cache
            .read()
            .map_err(|_| BatchError::storage("job cache lock poisoned"))
    }

    fn cache_mut(&self) -> BatchResult<std::sync::RwLockWriteGuard<'_, JobConfig>> {
        self.cache
            .write()
            .map_err(|_| BatchError::storage("job cache lock poisoned"))
    }
}

impl core::fmt::Debug for Runner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Runner")
            .field("mode", &self.mode)
            .field("functions", &self.functions)
            .finish_non_exhaustive()
    }
}

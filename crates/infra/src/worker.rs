//! Worker run loops.
//!
//! ## Design
//!
//! - One worker process runs one job; several workers of the same job compete
//!   for items on the job's queue
//! - Each iteration: receive with a deadline, buffer, evaluate the trigger,
//!   flush when due
//! - A rejected batch goes to the failure log and the loop keeps going
//! - A receive error costs one full receive deadline, so a broken queue does
//!   not turn the loop into a busy spin
//! - Shutdown is observed between iterations; the iteration in progress
//!   completes (including a final flush of a partial buffer)

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use batchwork_core::{BatchBuffer, FlushFn, FlushOutcome, FunctionTable, Item, Job, JobKind, JobNumId};

use crate::failure_log::FailureLog;
use crate::process_item::DeliveryError;
use crate::shutdown::ShutdownSignal;

/// Receive deadline of one loop iteration.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Iterations between two buffer memory reclaims.
const RECLAIM_EVERY: u64 = 1_000;

/// Where a worker pulls items from.
pub trait ItemSource {
    /// Next item, or `None` when nothing arrived before `timeout`.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Item>, DeliveryError>;
}

impl ItemSource for mpsc::Receiver<Item> {
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Item>, DeliveryError> {
        match mpsc::Receiver::recv_timeout(self, timeout) {
            Ok(item) => Ok(Some(item)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            // No producer left; keep the deadline so the loop does not spin.
            Err(RecvTimeoutError::Disconnected) => {
                thread::sleep(timeout);
                Ok(None)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("job {0} is not a batching job")]
    NotBatching(JobNumId),
    #[error("job {0} is not a simple job")]
    NotSimple(JobNumId),
    #[error("flush function {0:?} is not in the function table")]
    UnknownFunction(String),
    #[error("task {0:?} is not in the function table")]
    UnknownTask(String),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub items_received: u64,
    pub batches_flushed: u64,
    pub batches_failed: u64,
    pub receive_errors: u64,
}

/// Run loop of one batching job.
#[derive(Debug)]
pub struct BatchingWorker {
    job_id: JobNumId,
    identifier: String,
    function: FlushFn,
    buffer: BatchBuffer,
    failures: FailureLog,
    receive_timeout: Duration,
    iterations: u64,
    stats: WorkerStats,
}

impl BatchingWorker {
    pub fn new(job: &Job, functions: &FunctionTable, failures: FailureLog) -> Result<Self, WorkerError> {
        let policy = job.batch_policy().ok_or(WorkerError::NotBatching(job.id))?;
        let function = functions
            .flush_fn(job.function_name())
            .ok_or_else(|| WorkerError::UnknownFunction(job.function_name().to_string()))?;

        Ok(Self {
            job_id: job.id,
            identifier: job.identifier.clone(),
            function,
            buffer: BatchBuffer::new(policy),
            failures,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            iterations: 0,
            stats: WorkerStats::default(),
        })
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// One loop iteration. Returns the flush outcome when the trigger fired.
    pub fn step<S>(&mut self, source: &mut S, shutdown: bool) -> Option<FlushOutcome>
    where
        S: ItemSource + ?Sized,
    {
        self.iterations += 1;

        match source.recv_timeout(self.receive_timeout) {
            Ok(Some(item)) => {
                self.buffer.push(item);
                self.stats.items_received += 1;
            }
            Ok(None) => {}
            Err(e) => {
                self.stats.receive_errors += 1;
                warn!(job = %self.identifier, job_id = %self.job_id, error = %e, "failed to receive item");
                // A failing source returns at once; keep the iteration at the
                // receive deadline.
                if !shutdown {
                    thread::sleep(self.receive_timeout);
                }
            }
        }

        let outcome = self.buffer.is_due(shutdown).then(|| self.flush_buffer());

        if self.iterations % RECLAIM_EVERY == 0 {
            self.buffer.reclaim();
        }
        outcome
    }

    /// Loop until `shutdown` is requested, then return the final statistics.
    pub fn run<S>(mut self, source: &mut S, shutdown: &ShutdownSignal) -> WorkerStats
    where
        S: ItemSource + ?Sized,
    {
        info!(job = %self.identifier, job_id = %self.job_id, pid = std::process::id(), "worker started");
        loop {
            let stopping = shutdown.is_requested();
            self.step(source, stopping);
            if stopping {
                break;
            }
        }
        info!(
            job = %self.identifier,
            job_id = %self.job_id,
            items = self.stats.items_received,
            flushed = self.stats.batches_flushed,
            failed = self.stats.batches_failed,
            "worker stopped"
        );
        self.stats
    }

    fn flush_buffer(&mut self) -> FlushOutcome {
        let items = self.buffer.take();
        let outcome = FlushOutcome::from_callback((self.function)(&items), items.len());
        match outcome {
            FlushOutcome::Flushed { items: count } => {
                self.stats.batches_flushed += 1;
                debug!(job_id = %self.job_id, items = count, "flushed batch");
            }
            FlushOutcome::Failed { items: count } => {
                self.stats.batches_failed += 1;
                warn!(job = %self.identifier, job_id = %self.job_id, items = count, "flush function reported failure");
                if let Err(e) = self.failures.append(self.job_id, &items) {
                    warn!(job_id = %self.job_id, error = %e, "failed to persist rejected batch");
                }
            }
        }
        outcome
    }
}

/// Run the job's bootstrap task, if it has one.
pub fn run_bootstrap(job: &Job, functions: &FunctionTable) -> Result<(), WorkerError> {
    let Some(name) = &job.bootstrap else {
        return Ok(());
    };
    let task = functions
        .task(name)
        .ok_or_else(|| WorkerError::UnknownTask(name.clone()))?;
    debug!(job = %job.identifier, bootstrap = %name, "running bootstrap");
    task();
    Ok(())
}

/// Run a simple job's task. The task owns its loop; this returns when it does.
pub fn run_simple_job(job: &Job, functions: &FunctionTable) -> Result<(), WorkerError> {
    let JobKind::Simple { task: name } = &job.kind else {
        return Err(WorkerError::NotSimple(job.id));
    };
    let task = functions
        .task(name)
        .ok_or_else(|| WorkerError::UnknownTask(name.clone()))?;
    info!(job = %job.identifier, job_id = %job.id, pid = std::process::id(), "simple job started");
    task();
    info!(job = %job.identifier, job_id = %job.id, "simple job finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchwork_core::JobOptions;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tempfile::TempDir;

    static SIZE_CALLS: Mutex<Vec<Vec<Item>>> = Mutex::new(Vec::new());
    static PERIOD_CALLS: Mutex<Vec<(Instant, Vec<Item>)>> = Mutex::new(Vec::new());
    static SHUTDOWN_CALLS: Mutex<Vec<Vec<Item>>> = Mutex::new(Vec::new());
    static BOOTSTRAPS: AtomicUsize = AtomicUsize::new(0);
    static SIMPLE_RUNS: AtomicUsize = AtomicUsize::new(0);

    fn record_size(items: &[Item]) -> bool {
        SIZE_CALLS.lock().unwrap().push(items.to_vec());
        true
    }

    fn record_period(items: &[Item]) -> bool {
        PERIOD_CALLS
            .lock()
            .unwrap()
            .push((Instant::now(), items.to_vec()));
        true
    }

    fn record_shutdown(items: &[Item]) -> bool {
        SHUTDOWN_CALLS.lock().unwrap().push(items.to_vec());
        true
    }

    fn reject(_items: &[Item]) -> bool {
        false
    }

    fn accept(_items: &[Item]) -> bool {
        true
    }

    fn bootstrap() {
        BOOTSTRAPS.fetch_add(1, Ordering::SeqCst);
    }

    fn simple_body() {
        SIMPLE_RUNS.fetch_add(1, Ordering::SeqCst);
    }

    fn functions() -> FunctionTable {
        FunctionTable::new()
            .with_flush("record_size", record_size)
            .with_flush("record_period", record_period)
            .with_flush("record_shutdown", record_shutdown)
            .with_flush("reject", reject)
            .with_flush("accept", accept)
            .with_task("bootstrap", bootstrap)
            .with_task("simple_body", simple_body)
    }

    fn worker(function: &str, options: JobOptions, dir: &TempDir) -> BatchingWorker {
        let job = Job::batching(JobNumId::new(7), "emails", function, &options);
        BatchingWorker::new(&job, &functions(), FailureLog::for_current_process(dir.path()))
            .unwrap()
            .with_receive_timeout(Duration::from_millis(20))
    }

    #[test]
    fn full_batch_flushes_once_in_receipt_order() {
        let dir = TempDir::new().unwrap();
        let options = JobOptions::default()
            .with_batch_size(3)
            .with_call_period(Duration::from_secs(2));
        let mut worker = worker("record_size", options, &dir);
        let (tx, mut rx) = mpsc::channel();
        for n in 0..3 {
            tx.send(json!({"n": n})).unwrap();
        }

        assert_eq!(worker.step(&mut rx, false), None);
        assert_eq!(worker.step(&mut rx, false), None);
        assert_eq!(
            worker.step(&mut rx, false),
            Some(FlushOutcome::Flushed { items: 3 })
        );
        assert_eq!(worker.pending(), 0);
        assert_eq!(
            SIZE_CALLS.lock().unwrap().clone(),
            vec![vec![json!({"n": 0}), json!({"n": 1}), json!({"n": 2})]]
        );
    }

    #[test]
    fn partial_batch_flushes_after_call_period_not_sooner() {
        let dir = TempDir::new().unwrap();
        let period = Duration::from_millis(300);
        let options = JobOptions::default()
            .with_batch_size(10)
            .with_call_period(period);
        let started = Instant::now();
        let mut worker = worker("record_period", options, &dir);
        let (tx, mut rx) = mpsc::channel();
        tx.send(json!("a")).unwrap();
        tx.send(json!("b")).unwrap();

        let deadline = started + Duration::from_millis(800);
        let mut flushes = 0;
        while Instant::now() < deadline {
            if worker.step(&mut rx, false).is_some() {
                flushes += 1;
            }
        }

        assert_eq!(flushes, 1);
        let calls = PERIOD_CALLS.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.duration_since(started) >= period);
        assert_eq!(calls[0].1, vec![json!("a"), json!("b")]);
    }

    #[test]
    fn rejected_batch_is_logged_and_worker_continues() {
        let dir = TempDir::new().unwrap();
        let options = JobOptions::default().with_batch_size(2);
        let mut worker = worker("reject", options, &dir);
        let (tx, mut rx) = mpsc::channel();
        for n in 0..4 {
            tx.send(json!(n)).unwrap();
        }

        let outcomes: Vec<_> = (0..4).filter_map(|_| worker.step(&mut rx, false)).collect();
        assert_eq!(
            outcomes,
            vec![
                FlushOutcome::Failed { items: 2 },
                FlushOutcome::Failed { items: 2 }
            ]
        );

        let path = FailureLog::for_current_process(dir.path()).path().to_path_buf();
        let records = FailureLog::read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].job_id, JobNumId::new(7));
        assert_eq!(records[0].items, vec![json!(0), json!(1)]);
        assert_eq!(records[1].items, vec![json!(2), json!(3)]);
        assert_eq!(worker.stats().batches_failed, 2);
        assert_eq!(worker.stats().items_received, 4);
    }

    #[test]
    fn shutdown_flushes_partial_buffer_and_stops() {
        let dir = TempDir::new().unwrap();
        let options = JobOptions::default()
            .with_batch_size(100)
            .with_call_period(Duration::from_secs(60));
        let worker = worker("record_shutdown", options, &dir);
        let (tx, mut rx) = mpsc::channel();
        tx.send(json!("x")).unwrap();

        let signal = ShutdownSignal::new();
        signal.request();
        let stats = worker.run(&mut rx, &signal);

        assert_eq!(stats.items_received, 1);
        assert_eq!(stats.batches_flushed, 1);
        assert_eq!(SHUTDOWN_CALLS.lock().unwrap().clone(), vec![vec![json!("x")]]);
    }

    #[test]
    fn batching_worker_rejects_unknown_function_and_simple_job() {
        let dir = TempDir::new().unwrap();
        let failures = FailureLog::for_current_process(dir.path());
        let options = JobOptions::default();

        let unknown = Job::batching(JobNumId::FIRST, "a", "missing", &options);
        assert!(matches!(
            BatchingWorker::new(&unknown, &functions(), failures.clone()),
            Err(WorkerError::UnknownFunction(_))
        ));

        let simple = Job::simple(JobNumId::FIRST, "a", "simple_body", &options);
        assert!(matches!(
            BatchingWorker::new(&simple, &functions(), failures),
            Err(WorkerError::NotBatching(_))
        ));
    }

    #[test]
    fn bootstrap_and_simple_job_run_named_tasks() {
        let options = JobOptions::default().with_bootstrap("bootstrap");
        let job = Job::simple(JobNumId::FIRST, "tail", "simple_body", &options);

        run_bootstrap(&job, &functions()).unwrap();
        run_simple_job(&job, &functions()).unwrap();
        assert_eq!(BOOTSTRAPS.load(Ordering::SeqCst), 1);
        assert_eq!(SIMPLE_RUNS.load(Ordering::SeqCst), 1);

        let batching = Job::batching(JobNumId::FIRST, "b", "record_size", &JobOptions::default());
        assert!(run_bootstrap(&batching, &functions()).is_ok());
        assert!(matches!(
            run_simple_job(&batching, &functions()),
            Err(WorkerError::NotSimple(_))
        ));
    }

    /// Fails `failures` times, then yields `item` once.
    struct FlakySource {
        failures: usize,
        item: Option<Item>,
    }

    impl ItemSource for FlakySource {
        fn recv_timeout(&mut self, _timeout: Duration) -> Result<Option<Item>, DeliveryError> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(DeliveryError::Config("queue removed".into()));
            }
            Ok(self.item.take())
        }
    }

    #[test]
    fn receive_errors_wait_out_the_deadline() {
        let dir = TempDir::new().unwrap();
        let options = JobOptions::default().with_batch_size(1);
        let mut worker = worker("accept", options, &dir)
            .with_receive_timeout(Duration::from_millis(50));
        let mut source = FlakySource {
            failures: 3,
            item: Some(json!("after")),
        };

        let started = Instant::now();
        for _ in 0..3 {
            assert_eq!(worker.step(&mut source, false), None);
        }
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(worker.stats().receive_errors, 3);

        assert_eq!(
            worker.step(&mut source, false),
            Some(FlushOutcome::Flushed { items: 1 })
        );
        assert_eq!(worker.stats().items_received, 1);
    }
}

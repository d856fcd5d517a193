//! Worker pool supervisor.
//!
//! ## Design
//!
//! - One pool of child processes per job identifier, sized to the job's
//!   `num_workers`
//! - Each poll: reload jobs, retire pools of jobs that disappeared, reap
//!   workers that died, stop the excess, spawn the missing
//! - Stopping a worker means SIGTERM, resent until the child is reaped
//! - The shutdown flag is checked between polls; on shutdown every worker is
//!   stopped before `run` returns

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use batchwork_core::{BatchResult, Job};
use batchwork_infra::config::ENV_DAEMON_RUNNING;
use batchwork_infra::shutdown::ShutdownSignal;

use crate::runner::Runner;

/// Where the daemon reads the current job set from.
pub trait JobSource {
    /// Current jobs, freshly loaded.
    fn jobs(&self) -> BatchResult<Vec<Job>>;
}

impl JobSource for Runner {
    fn jobs(&self) -> BatchResult<Vec<Job>> {
        self.load_config()?;
        self.get_jobs()
    }
}

/// Starts one worker process for a job.
pub trait WorkerLauncher {
    fn launch(&self, job: &Job) -> io::Result<Child>;
}

/// Re-executes a program as `<program> daemon <job id>`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Launch workers from the running executable.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, job: &Job) -> io::Result<Child> {
        Command::new(&self.program)
            .arg("daemon")
            .arg(job.id.to_string())
            .env(ENV_DAEMON_RUNNING, "1")
            .spawn()
    }
}

/// Daemon timing.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Pause between two reconcile passes.
    pub poll_interval: Duration,
    /// Interval between two SIGTERMs to a worker that is still running.
    pub term_resend: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            term_resend: Duration::from_millis(50),
        }
    }
}

/// Keeps `num_workers` live processes per registered job.
pub struct Daemon<J, L> {
    jobs: J,
    launcher: L,
    config: DaemonConfig,
    pools: HashMap<String, Vec<Child>>,
}

impl<J, L> Daemon<J, L>
where
    J: JobSource,
    L: WorkerLauncher,
{
    pub fn new(jobs: J, launcher: L) -> Self {
        Self {
            jobs,
            launcher,
            config: DaemonConfig::default(),
            pools: HashMap::new(),
        }
    }

    pub fn with_config(mut self, config: DaemonConfig) -> Self {
        self.config = config;
        self
    }

    /// Supervise until `shutdown` is requested, then stop every worker.
    pub fn run(&mut self, shutdown: &ShutdownSignal) {
        info!(pid = std::process::id(), "daemon started");
        while !shutdown.is_requested() {
            if let Err(e) = self.poll_once() {
                error!(error = %e, "failed to load job configuration");
            }
            self.pause(shutdown);
        }
        info!("shutdown requested; stopping workers");
        self.shutdown_all();
        info!("daemon stopped");
    }

    /// One reconcile pass over freshly loaded jobs.
    pub fn poll_once(&mut self) -> BatchResult<()> {
        let jobs = self.jobs.jobs()?;

        let live: HashSet<&str> = jobs.iter().map(|job| job.identifier.as_str()).collect();
        let retired: Vec<String> = self
            .pools
            .keys()
            .filter(|identifier| !live.contains(identifier.as_str()))
            .cloned()
            .collect();
        for identifier in retired {
            if let Some(pool) = self.pools.remove(&identifier) {
                info!(job = %identifier, workers = pool.len(), "job removed; stopping its workers");
                stop_pool(&identifier, pool, self.config.term_resend);
            }
        }

        for job in &jobs {
            self.reconcile(job);
        }
        Ok(())
    }

    /// Stop every tracked worker and wait for each to exit.
    pub fn shutdown_all(&mut self) {
        for (identifier, pool) in self.pools.drain() {
            stop_pool(&identifier, pool, self.config.term_resend);
        }
    }

    /// Number of tracked workers still running. Reaps the ones that exited.
    pub fn live_workers(&mut self) -> usize {
        self.pools
            .iter_mut()
            .map(|(identifier, pool)| {
                reap_exited(identifier, pool);
                pool.len()
            })
            .sum()
    }

    /// Pids of the workers tracked for `identifier`.
    pub fn worker_pids(&self, identifier: &str) -> Vec<u32> {
        self.pools
            .get(identifier)
            .map(|pool| pool.iter().map(Child::id).collect())
            .unwrap_or_default()
    }

    fn reconcile(&mut self, job: &Job) {
        let pool = self.pools.entry(job.identifier.clone()).or_default();
        reap_exited(&job.identifier, pool);

        let target = job.num_workers as usize;
        while pool.len() > target {
            let Some(child) = pool.pop() else { break };
            stop_worker(&job.identifier, child, self.config.term_resend);
        }

        while pool.len() < target {
            match self.launcher.launch(job) {
                Ok(child) => {
                    info!(job = %job.identifier, job_id = %job.id, pid = child.id(), "started worker");
                    pool.push(child);
                }
                Err(e) => {
                    error!(job = %job.identifier, job_id = %job.id, error = %e, "failed to start worker");
                    break;
                }
            }
        }
    }

    fn pause(&self, shutdown: &ShutdownSignal) {
        let deadline = Instant::now() + self.config.poll_interval;
        let slice = Duration::from_millis(50).min(self.config.poll_interval);
        while !shutdown.is_requested() && Instant::now() < deadline {
            thread::sleep(slice);
        }
    }
}

impl<J, L> Drop for Daemon<J, L> {
    fn drop(&mut self) {
        for (identifier, pool) in self.pools.drain() {
            stop_pool(&identifier, pool, self.config.term_resend);
        }
    }
}

impl<J, L> core::fmt::Debug for Daemon<J, L> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let pools: HashMap<&str, usize> = self
            .pools
            .iter()
            .map(|(identifier, pool)| (identifier.as_str(), pool.len()))
            .collect();
        f.debug_struct("Daemon")
            .field("config", &self.config)
            .field("pools", &pools)
            .finish_non_exhaustive()
    }
}

/// Drop workers that exited on their own, logging how they ended.
fn reap_exited(identifier: &str, pool: &mut Vec<Child>) {
    pool.retain_mut(|child| match child.try_wait() {
        Ok(None) => true,
        Ok(Some(status)) => {
            warn!(job = %identifier, pid = child.id(), status = %status, "worker exited");
            false
        }
        Err(e) => {
            error!(job = %identifier, pid = child.id(), error = %e, "failed to poll worker; forgetting it");
            false
        }
    });
}

fn stop_pool(identifier: &str, mut pool: Vec<Child>, resend: Duration) {
    // Signal everyone first so workers wind down in parallel.
    for child in &pool {
        send_term(child);
    }
    while let Some(child) = pool.pop() {
        stop_worker(identifier, child, resend);
    }
}

fn stop_worker(identifier: &str, mut child: Child, resend: Duration) {
    let pid = child.id();
    match terminate(&mut child, resend) {
        Ok(status) => info!(job = %identifier, pid, status = %status, "stopped worker"),
        Err(e) => error!(job = %identifier, pid, error = %e, "failed to stop worker"),
    }
}

/// SIGTERM `child` every `resend` until it has exited, then reap it.
fn terminate(child: &mut Child, resend: Duration) -> io::Result<ExitStatus> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        send_term(child);
        thread::sleep(resend);
    }
}

fn send_term(child: &Child) {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: `pid` is a child of this process that has not been reaped, so it
    // cannot have been recycled for an unrelated process.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pid, error = %err, "failed to signal worker");
        }
    }
}

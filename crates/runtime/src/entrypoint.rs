//! Command line of the `batchwork` binary.
//!
//! Applications build their [`FunctionTable`] and hand it to [`run`]; the same
//! binary then acts as supervisor (`supervise`), as a worker
//! (`daemon <id>`, spawned by the supervisor), or as an operations tool.

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use batchwork_core::{FunctionTable, JobKind, JobNumId};
use batchwork_infra::Settings;
use batchwork_infra::config_storage::{ConfigStorage, SharedMemoryConfigStorage, with_lock};
use batchwork_infra::failure_log::FailureLog;
use batchwork_infra::process_item::MessageQueueSource;
use batchwork_infra::shutdown::ShutdownSignal;
use batchwork_infra::worker::{self, BatchingWorker};

use crate::daemon::{Daemon, ProcessLauncher};
use crate::runner::Runner;

#[derive(Debug, Parser)]
#[command(name = "batchwork", version, about = "Batch work supervisor and worker runner")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Keep worker pools alive for every registered job.
    Supervise,
    /// Run one worker for the job with this numeric id.
    Daemon { id: JobNumId },
    /// Print the registered jobs.
    Jobs,
    /// Drop the shared job registry.
    Clear,
}

/// Parse the process arguments and run the selected command.
pub fn run(functions: FunctionTable) -> anyhow::Result<()> {
    run_with(Cli::parse(), functions)
}

pub fn run_with(cli: Cli, functions: FunctionTable) -> anyhow::Result<()> {
    let settings = Settings::from_env();
    match cli.command {
        Command::Supervise => supervise(&settings, functions),
        Command::Daemon { id } => run_worker(&settings, &functions, id),
        Command::Jobs => print_jobs(&settings),
        Command::Clear => clear(&settings),
    }
}

fn supervise(settings: &Settings, functions: FunctionTable) -> anyhow::Result<()> {
    let runner = Runner::daemon(settings, functions).context("attach job registry")?;
    let shutdown = ShutdownSignal::new();
    shutdown.install_handler()?;
    let launcher = ProcessLauncher::current_exe().context("locate worker executable")?;

    Daemon::new(runner, launcher).run(&shutdown);
    Ok(())
}

fn run_worker(settings: &Settings, functions: &FunctionTable, id: JobNumId) -> anyhow::Result<()> {
    let storage = SharedMemoryConfigStorage::open(&settings.ipc).context("attach job registry")?;
    let config = with_lock(&storage, |s| Ok(s.load()?))?;
    let job = config
        .get_job_from_id_num(id)
        .cloned()
        .with_context(|| format!("no job with id {id}"))?;

    worker::run_bootstrap(&job, functions)?;

    match job.kind {
        JobKind::Batching { .. } => {
            // Only the batching loop observes the flag; simple jobs keep the
            // default SIGTERM disposition.
            let shutdown = ShutdownSignal::new();
            shutdown.install_handler()?;
            let failures = FailureLog::for_current_process(&settings.failure_dir);
            let mut source = MessageQueueSource::open(&settings.ipc, id)?;
            BatchingWorker::new(&job, functions, failures)?.run(&mut source, &shutdown);
        }
        JobKind::Simple { .. } => worker::run_simple_job(&job, functions)?,
    }
    Ok(())
}

fn print_jobs(settings: &Settings) -> anyhow::Result<()> {
    let storage = SharedMemoryConfigStorage::open(&settings.ipc).context("attach job registry")?;
    let config = with_lock(&storage, |s| Ok(s.load()?))?;
    if config.is_empty() {
        println!("no jobs registered");
        return Ok(());
    }
    for job in config.get_jobs() {
        let detail = match &job.kind {
            JobKind::Batching {
                function,
                batch_size,
                call_period,
            } => format!(
                "batching function={function} batch_size={batch_size} call_period={call_period:?}"
            ),
            JobKind::Simple { task } => format!("simple task={task}"),
        };
        println!(
            "{:>4}  {:<24} workers={} {}",
            job.id, job.identifier, job.num_workers, detail
        );
    }
    Ok(())
}

fn clear(settings: &Settings) -> anyhow::Result<()> {
    let storage = SharedMemoryConfigStorage::open(&settings.ipc).context("attach job registry")?;
    with_lock(&storage, |s| Ok(s.clear()?))?;
    info!("job registry cleared");
    Ok(())
}

//! Producer facade, embedded context, daemon supervisor and the CLI entry
//! point of the `batchwork` binary.

pub mod context;
pub mod daemon;
pub mod entrypoint;
pub mod runner;

pub use context::EmbeddedContext;
pub use daemon::{Daemon, DaemonConfig, JobSource, ProcessLauncher, WorkerLauncher};
pub use runner::{Mode, Runner};

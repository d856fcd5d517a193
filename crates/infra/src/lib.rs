//! Infrastructure layer: SysV IPC, configuration storage, item delivery,
//! worker loops, environment settings.
//!
//! Unix only.

pub mod config;
pub mod config_storage;
pub mod failure_log;
pub mod ipc;
pub mod process_item;
pub mod shutdown;
pub mod worker;

pub use config::{IpcSettings, Settings};
pub use config_storage::{ConfigStorage, ConfigStorageError, InMemoryConfigStorage, SharedMemoryConfigStorage, with_lock};
pub use failure_log::{FailureLog, FailureLogError, FailureRecord};
pub use process_item::{DeliveryError, InProcessItem, MessageQueueProcessItem, MessageQueueSource, ProcessItem};
pub use shutdown::{ShutdownError, ShutdownSignal};
pub use worker::{BatchingWorker, ItemSource, WorkerError, WorkerStats};

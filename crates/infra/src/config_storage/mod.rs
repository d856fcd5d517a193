//! Job configuration storage.
//!
//! ## Design
//!
//! - The registry (`JobConfig`) is a snapshot, not a shared object: every
//!   mutation is load → mutate → save, all while holding the storage lock
//! - Two backends: SysV shared memory guarded by a semaphore (daemon mode), and
//!   a process-local value with a no-op lock (embedded mode)
//! - Reads take the lock too: a shared-memory `save` is not atomic, so an
//!   unlocked `load()` can observe a torn snapshot

mod in_memory;
mod shared_memory;

pub use in_memory::InMemoryConfigStorage;
pub use shared_memory::SharedMemoryConfigStorage;

use std::sync::Arc;

use tracing::error;

use batchwork_core::{BatchError, JobConfig};

use crate::ipc::IpcError;

/// Configuration storage abstraction.
pub trait ConfigStorage: Send + Sync {
    /// Block until exclusive access is held.
    fn lock(&self) -> Result<(), ConfigStorageError>;

    fn unlock(&self) -> Result<(), ConfigStorageError>;

    /// Replace the stored snapshot.
    fn save(&self, config: &JobConfig) -> Result<(), ConfigStorageError>;

    /// Read the stored snapshot; an empty registry when nothing was saved yet.
    fn load(&self) -> Result<JobConfig, ConfigStorageError>;

    /// Drop the stored snapshot.
    fn clear(&self) -> Result<(), ConfigStorageError>;
}

/// Configuration storage error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigStorageError {
    #[error("ipc error: {0}")]
    Ipc(#[from] IpcError),
    #[error("snapshot of {size} bytes does not fit into {capacity} bytes of storage")]
    TooLarge { size: usize, capacity: usize },
    #[error("snapshot serialization failed: {0}")]
    Serialization(String),
    #[error("storage lock poisoned")]
    Poisoned,
}

impl From<ConfigStorageError> for BatchError {
    fn from(value: ConfigStorageError) -> Self {
        BatchError::storage(value.to_string())
    }
}

/// Run `f` while holding the storage lock; the lock is released whatever `f`
/// returns.
pub fn with_lock<S, T, F>(storage: &S, f: F) -> Result<T, BatchError>
where
    S: ConfigStorage + ?Sized,
    F: FnOnce(&S) -> Result<T, BatchError>,
{
    storage.lock()?;
    let result = f(storage);
    if let Err(e) = storage.unlock() {
        error!(error = %e, "failed to release configuration lock");
        if result.is_ok() {
            return Err(e.into());
        }
    }
    result
}

impl<S> ConfigStorage for Arc<S>
where
    S: ConfigStorage + ?Sized,
{
    fn lock(&self) -> Result<(), ConfigStorageError> {
        (**self).lock()
    }

    fn unlock(&self) -> Result<(), ConfigStorageError> {
        (**self).unlock()
    }

    fn save(&self, config: &JobConfig) -> Result<(), ConfigStorageError> {
        (**self).save(config)
    }

    fn load(&self) -> Result<JobConfig, ConfigStorageError> {
        (**self).load()
    }

    fn clear(&self) -> Result<(), ConfigStorageError> {
        (**self).clear()
    }
}

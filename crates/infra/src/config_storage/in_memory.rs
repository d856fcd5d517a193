//! Single-process configuration storage.

use std::sync::RwLock;

use batchwork_core::JobConfig;

use super::{ConfigStorage, ConfigStorageError};

/// Process-local configuration storage for embedded mode.
///
/// There is no cross-process contention to guard against, so `lock` and
/// `unlock` succeed immediately. One instance belongs to one embedded context;
/// there is no process-wide singleton.
#[derive(Debug, Default)]
pub struct InMemoryConfigStorage {
    snapshot: RwLock<JobConfig>,
}

impl InMemoryConfigStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStorage for InMemoryConfigStorage {
    fn lock(&self) -> Result<(), ConfigStorageError> {
        Ok(())
    }

    fn unlock(&self) -> Result<(), ConfigStorageError> {
        Ok(())
    }

    fn save(&self, config: &JobConfig) -> Result<(), ConfigStorageError> {
        let mut snapshot = self
            .snapshot
            .write()
            .map_err(|_| ConfigStorageError::Poisoned)?;
        *snapshot = config.clone();
        Ok(())
    }

    fn load(&self) -> Result<JobConfig, ConfigStorageError> {
        let snapshot = self
            .snapshot
            .read()
            .map_err(|_| ConfigStorageError::Poisoned)?;
        Ok(snapshot.clone())
    }

    fn clear(&self) -> Result<(), ConfigStorageError> {
        self.save(&JobConfig::new())
    }
}

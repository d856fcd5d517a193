//! SysV shared-memory configuration storage.
//!
//! Segment layout: `magic: u32 | len: u32 | len bytes of JSON`, little endian.
//! A zero length (or a foreign magic) means "no snapshot yet".

use tracing::{debug, warn};

use batchwork_core::JobConfig;

use super::{ConfigStorage, ConfigStorageError};
use crate::config::IpcSettings;
use crate::ipc::{BinarySemaphore, IpcError, SharedSegment};

const MAGIC: u32 = 0x4257_4b31; // "BWK1"
const HEADER_LEN: usize = 8;

/// Snapshot in a fixed-size shared memory segment, guarded by a binary
/// semaphore under the same key.
#[derive(Debug)]
pub struct SharedMemoryConfigStorage {
    segment: SharedSegment,
    semaphore: BinarySemaphore,
}

impl SharedMemoryConfigStorage {
    /// Attach to (creating if needed) the segment and semaphore for `settings`.
    pub fn open(settings: &IpcSettings) -> Result<Self, ConfigStorageError> {
        let key = settings.config_key();
        let segment = SharedSegment::attach(key, settings.shm_size, settings.perms)?;
        let semaphore = BinarySemaphore::open(key, settings.perms)?;
        debug!(key, size = segment.size(), "attached configuration segment");
        Ok(Self { segment, semaphore })
    }

    /// Payload capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.segment.size().saturating_sub(HEADER_LEN)
    }

    /// Remove the segment and semaphore from the system.
    pub fn destroy(self) -> Result<(), ConfigStorageError> {
        self.semaphore.remove()?;
        self.segment.remove()?;
        Ok(())
    }

    fn write_header(&self, len: u32) -> Result<(), IpcError> {
        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(&MAGIC.to_le_bytes());
        header[4..].copy_from_slice(&len.to_le_bytes());
        self.segment.write_at(0, &header)
    }

    fn read_payload(&self) -> Result<Option<Vec<u8>>, IpcError> {
        let header = self.segment.read_at(0, HEADER_LEN)?;
        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if magic != MAGIC || len == 0 {
            return Ok(None);
        }
        if len > self.capacity() {
            warn!(len, capacity = self.capacity(), "snapshot header is corrupt");
            return Ok(None);
        }
        self.segment.read_at(HEADER_LEN, len).map(Some)
    }

    /// Clear after a failed write so no half-written snapshot survives.
    fn fail<T>(&self, err: ConfigStorageError) -> Result<T, ConfigStorageError> {
        if let Err(clear_err) = self.clear() {
            warn!(error = %clear_err, "failed to clear configuration segment");
        }
        Err(err)
    }
}

impl ConfigStorage for SharedMemoryConfigStorage {
    fn lock(&self) -> Result<(), ConfigStorageError> {
        Ok(self.semaphore.acquire()?)
    }

    fn unlock(&self) -> Result<(), ConfigStorageError> {
        Ok(self.semaphore.release()?)
    }

    fn save(&self, config: &JobConfig) -> Result<(), ConfigStorageError> {
        let payload = match serde_json::to_vec(config) {
            Ok(payload) => payload,
            Err(e) => return self.fail(ConfigStorageError::Serialization(e.to_string())),
        };

        let capacity = self.capacity();
        if payload.len() > capacity || payload.len() > u32::MAX as usize {
            return self.fail(ConfigStorageError::TooLarge {
                size: payload.len(),
                capacity,
            });
        }

        if let Err(e) = self
            .segment
            .write_at(HEADER_LEN, &payload)
            .and_then(|()| self.write_header(payload.len() as u32))
        {
            return self.fail(e.into());
        }
        Ok(())
    }

    fn load(&self) -> Result<JobConfig, ConfigStorageError> {
        match self.read_payload()? {
            None => Ok(JobConfig::new()),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| ConfigStorageError::Serialization(e.to_string())),
        }
    }

    fn clear(&self) -> Result<(), ConfigStorageError> {
        Ok(self.write_header(0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_storage::with_lock;
    use crate::ipc;
    use batchwork_core::{Job, JobOptions};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn test_settings(tag: &str, shm_size: usize) -> IpcSettings {
        IpcSettings {
            identity: format!("batchwork-test-{tag}-{}", std::process::id()),
            namespace: 't',
            shm_size,
            perms: 0o600,
            ..IpcSettings::default()
        }
    }

    fn open(tag: &str, shm_size: usize) -> Option<SharedMemoryConfigStorage> {
        if !ipc::is_available() {
            return None;
        }
        SharedMemoryConfigStorage::open(&test_settings(tag, shm_size)).ok()
    }

    #[test]
    fn empty_segment_loads_empty_config() {
        let Some(storage) = open("empty", 4096) else {
            return;
        };
        storage.clear().unwrap();
        assert!(storage.load().unwrap().is_empty());
        storage.destroy().unwrap();
    }

    #[test]
    fn snapshot_round_trip_under_lock() {
        let Some(storage) = open("roundtrip", 64 * 1024) else {
            return;
        };
        storage.clear().unwrap();

        let options = JobOptions::default()
            .with_batch_size(3)
            .with_call_period(Duration::from_secs(2))
            .with_num_workers(2);

        let saved = with_lock(&storage, |s| {
            let mut config = s.load()?;
            config.register_job("emails", |id| Job::batching(id, "", "send", &options))?;
            config.register_job("audit", |id| Job::simple(id, "", "tail", &options))?;
            s.save(&config)?;
            Ok(config)
        })
        .unwrap();

        // A second attachment under the same key sees the same snapshot.
        let other = SharedMemoryConfigStorage::open(&test_settings("roundtrip", 64 * 1024)).unwrap();
        assert_eq!(other.load().unwrap(), saved);
        drop(other);

        storage.destroy().unwrap();
    }

    #[test]
    fn oversized_snapshot_clears_segment_and_errors() {
        let Some(storage) = open("oversized", 512) else {
            return;
        };
        let options = JobOptions::default();

        let mut small = JobConfig::new();
        small
            .register_job("a", |id| Job::batching(id, "", "f", &options))
            .unwrap();
        storage.save(&small).unwrap();

        let mut big = JobConfig::new();
        for i in 0..50 {
            big.register_job(&format!("job-with-a-long-identifier-{i}"), |id| {
                Job::batching(id, "", "f", &options)
            })
            .unwrap();
        }
        let err = storage.save(&big).unwrap_err();
        assert!(matches!(err, ConfigStorageError::TooLarge { .. }));
        assert!(storage.load().unwrap().is_empty());

        storage.destroy().unwrap();
    }

    fn config_with(count: usize) -> JobConfig {
        let options = JobOptions::default();
        let mut config = JobConfig::new();
        for i in 0..count {
            config
                .register_job(&format!("job-with-a-long-identifier-{i}"), |id| {
                    Job::batching(id, "", "f", &options)
                })
                .unwrap();
        }
        config
    }

    #[test]
    fn locked_loads_never_see_a_partial_save() {
        let Some(storage) = open("torn", 64 * 1024) else {
            return;
        };
        let small = config_with(1);
        let big = config_with(60);
        storage.save(&small).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let writer = {
            let done = done.clone();
            let writer_storage =
                SharedMemoryConfigStorage::open(&test_settings("torn", 64 * 1024)).unwrap();
            thread::spawn(move || {
                for round in 0..400 {
                    let next = if round % 2 == 0 { &big } else { &small };
                    with_lock(&writer_storage, |s| Ok(s.save(next)?)).unwrap();
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        let mut loads = 0;
        while !done.load(Ordering::SeqCst) || loads < 100 {
            let config = with_lock(&storage, |s| Ok(s.load()?)).unwrap();
            assert!(config.len() == 1 || config.len() == 60, "got {} jobs", config.len());
            loads += 1;
        }
        writer.join().unwrap();

        storage.destroy().unwrap();
    }

    #[test]
    fn lock_excludes_other_attachments_until_unlocked() {
        let Some(storage) = open("exclusive", 4096) else {
            return;
        };
        let released = Arc::new(AtomicBool::new(false));
        let (locked_tx, locked_rx) = mpsc::channel();

        let holder = {
            let released = released.clone();
            let holder_storage =
                SharedMemoryConfigStorage::open(&test_settings("exclusive", 4096)).unwrap();
            thread::spawn(move || {
                holder_storage.lock().unwrap();
                locked_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(200));
                released.store(true, Ordering::SeqCst);
                holder_storage.unlock().unwrap();
            })
        };

        locked_rx.recv().unwrap();
        storage.lock().unwrap();
        assert!(released.load(Ordering::SeqCst));
        storage.unlock().unwrap();
        holder.join().unwrap();

        storage.destroy().unwrap();
    }

    #[test]
    fn concurrent_registrations_are_all_kept() {
        let Some(storage) = open("concurrent", 64 * 1024) else {
            return;
        };
        storage.clear().unwrap();
        let options = JobOptions::default();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let attachment =
                    SharedMemoryConfigStorage::open(&test_settings("concurrent", 64 * 1024))
                        .unwrap();
                let options = options.clone();
                thread::spawn(move || {
                    for i in 0..10 {
                        with_lock(&attachment, |s| {
                            let mut config = s.load()?;
                            config.register_job(&format!("job-{t}-{i}"), |id| {
                                Job::batching(id, "", "f", &options)
                            })?;
                            s.save(&config)?;
                            Ok(())
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let config = storage.load().unwrap();
        assert_eq!(config.len(), 40);
        let ids: Vec<u32> = config.get_jobs().map(|job| job.id.get()).collect();
        assert_eq!(ids, (1..=40).collect::<Vec<_>>());

        storage.destroy().unwrap();
    }
}

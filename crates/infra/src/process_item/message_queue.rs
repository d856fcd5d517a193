//! SysV message-queue delivery (daemon mode).

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use batchwork_core::{Item, JobNumId};

use super::{DeliveryError, ProcessItem};
use crate::config::IpcSettings;
use crate::ipc::{MessageKind, MessageQueue};
use crate::worker::ItemSource;

/// Producer side: one queue per job, keyed by the job's numeric id.
#[derive(Debug)]
pub struct MessageQueueProcessItem {
    settings: IpcSettings,
    spill_dir: PathBuf,
    queues: Mutex<HashMap<JobNumId, Arc<MessageQueue>>>,
}

impl MessageQueueProcessItem {
    pub fn new(settings: IpcSettings) -> Self {
        Self {
            settings,
            spill_dir: std::env::temp_dir(),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Directory receiving items too large to send inline.
    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = dir.into();
        self
    }

    fn queue(&self, job_id: JobNumId) -> Result<Arc<MessageQueue>, DeliveryError> {
        let mut queues = self.queues.lock().map_err(|_| DeliveryError::Poisoned)?;
        if let Some(queue) = queues.get(&job_id) {
            return Ok(queue.clone());
        }
        let queue = Arc::new(MessageQueue::open(
            self.settings.channel_key(job_id),
            self.settings.perms,
            self.settings.max_message_bytes,
        )?);
        queues.insert(job_id, queue.clone());
        Ok(queue)
    }

    fn spill(&self, payload: &[u8]) -> Result<PathBuf, DeliveryError> {
        fs::create_dir_all(&self.spill_dir).map_err(DeliveryError::SpillFile)?;
        let mut file = tempfile::Builder::new()
            .prefix("batchwork-item-")
            .suffix(".json")
            .tempfile_in(&self.spill_dir)
            .map_err(DeliveryError::SpillFile)?;
        file.write_all(payload).map_err(DeliveryError::SpillFile)?;
        let (_, path) = file.keep().map_err(|e| DeliveryError::SpillFile(e.error))?;
        Ok(path)
    }
}

impl ProcessItem for MessageQueueProcessItem {
    fn submit(&self, item: Item, job_id: JobNumId) -> Result<(), DeliveryError> {
        let payload = serde_json::to_vec(&item)?;
        let queue = self.queue(job_id)?;

        let Err(inline_err) = queue.send(MessageKind::Inline, &payload) else {
            return Ok(());
        };
        debug!(job_id = %job_id, error = %inline_err, size = payload.len(), "inline send failed; spilling item to file");

        let path = self.spill(&payload)?;
        if let Err(e) = queue.send(MessageKind::FileRef, path.as_os_str().as_bytes()) {
            let _ = fs::remove_file(&path);
            return Err(e.into());
        }
        Ok(())
    }

    /// Workers live in other processes; there is no synchronous flush here.
    fn flush(&self, job_id: JobNumId) -> bool {
        debug!(job_id = %job_id, "synchronous flush is not supported in daemon mode");
        false
    }
}

/// Worker side: competing consumer of one job's queue.
#[derive(Debug)]
pub struct MessageQueueSource {
    queue: MessageQueue,
}

impl MessageQueueSource {
    pub fn open(settings: &IpcSettings, job_id: JobNumId) -> Result<Self, DeliveryError> {
        let queue = MessageQueue::open(
            settings.channel_key(job_id),
            settings.perms,
            settings.max_message_bytes,
        )?;
        Ok(Self { queue })
    }

    /// Remove the underlying queue from the system.
    pub fn remove(&self) -> Result<(), DeliveryError> {
        Ok(self.queue.remove()?)
    }
}

impl ItemSource for MessageQueueSource {
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Item>, DeliveryError> {
        match self.queue.recv_timeout(timeout)? {
            None => Ok(None),
            Some((kind, payload)) => decode_message(kind, &payload).map(Some),
        }
    }
}

/// Turn a queue message back into an item, consuming spill files.
pub(crate) fn decode_message(kind: MessageKind, payload: &[u8]) -> Result<Item, DeliveryError> {
    match kind {
        MessageKind::Inline => Ok(serde_json::from_slice(payload)?),
        MessageKind::FileRef => {
            let path = Path::new(OsStr::from_bytes(payload));
            let bytes = fs::read(path).map_err(DeliveryError::SpillFile)?;
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to remove item spill file");
            }
            Ok(serde_json::from_slice(&bytes)?)
        }
    }
}

//! Thin safe wrappers over System V IPC (shared memory, semaphores, message
//! queues).
//!
//! All objects are addressed by keys derived deterministically from a stable
//! identity string plus a one-character namespace, so unrelated processes that
//! agree on those two values meet on the same kernel objects.

mod msg;
mod sem;
mod shm;

pub use msg::{MessageKind, MessageQueue};
pub use sem::BinarySemaphore;
pub use shm::SharedSegment;

use std::io;

/// Key of a SysV IPC object.
pub type IpcKey = libc::key_t;

/// IPC failure.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("{call} failed: {source}")]
    Os {
        call: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("dropped a queued message longer than the {limit} byte receive limit")]
    Discarded { limit: usize },
    #[error("access of {len} bytes at offset {offset} is outside the {size} byte segment")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
}

impl IpcError {
    /// Capture `errno` for a failed libc call.
    pub(crate) fn last(call: &'static str) -> Self {
        Self::Os {
            call,
            source: io::Error::last_os_error(),
        }
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Os { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Derive an IPC key the way `ftok` lays one out: namespace in the high byte,
/// a hash of the identity in the low 24 bits.
pub fn derive_key(identity: &str, namespace: char) -> IpcKey {
    let hash = fnv1a(identity.as_bytes()) & 0x00ff_ffff;
    let ns = (namespace as u32) & 0x7f;
    let key = (ns << 24) | hash;
    // 0 is IPC_PRIVATE.
    if key == 0 { 1 } else { key as IpcKey }
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in bytes {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Probe whether the kernel offers SysV semaphores, shared memory and
/// message queues to this process.
pub fn is_available() -> bool {
    // SAFETY: plain syscalls on private (unnamed) objects that are removed
    // immediately; no memory is shared with the kernel.
    unsafe {
        let sem = libc::semget(libc::IPC_PRIVATE, 1, libc::IPC_CREAT | 0o600);
        if sem < 0 {
            return false;
        }
        libc::semctl(sem, 0, libc::IPC_RMID);

        let shm = libc::shmget(libc::IPC_PRIVATE, 64, libc::IPC_CREAT | 0o600);
        if shm < 0 {
            return false;
        }
        libc::shmctl(shm, libc::IPC_RMID, std::ptr::null_mut());

        let msq = libc::msgget(libc::IPC_PRIVATE, libc::IPC_CREAT | 0o600);
        if msq < 0 {
            return false;
        }
        libc::msgctl(msq, libc::IPC_RMID, std::ptr::null_mut());
    }
    true
}

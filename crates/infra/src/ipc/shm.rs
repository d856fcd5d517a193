use std::ptr;

use super::{IpcError, IpcKey};

/// An attached SysV shared memory segment of fixed size.
///
/// Reads and writes copy bytes in and out; callers serialize access through a
/// [`super::BinarySemaphore`].
#[derive(Debug)]
pub struct SharedSegment {
    id: libc::c_int,
    addr: *mut u8,
    size: usize,
}

// SAFETY: the mapping stays valid for the lifetime of the value and every
// access copies through raw pointers; cross-process exclusion is the caller's
// semaphore, cross-thread exclusion is the owner's `&self` discipline plus that
// same semaphore.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create (or open) the segment under `key` and attach it.
    pub fn attach(key: IpcKey, size: usize, perms: u32) -> Result<Self, IpcError> {
        // SAFETY: shmget/shmat are called with validated arguments; the
        // returned address is checked against the (void*)-1 sentinel.
        unsafe {
            let id = libc::shmget(key, size, libc::IPC_CREAT | perms as libc::c_int);
            if id < 0 {
                return Err(IpcError::last("shmget"));
            }
            let addr = libc::shmat(id, ptr::null(), 0);
            if addr as isize == -1 {
                return Err(IpcError::last("shmat"));
            }

            // An existing segment may be larger than requested; never use more
            // than we asked for, never more than exists.
            let mut stat: libc::shmid_ds = std::mem::zeroed();
            let actual = if libc::shmctl(id, libc::IPC_STAT, &mut stat) == 0 {
                (stat.shm_segsz as usize).min(size)
            } else {
                size
            };

            Ok(Self {
                id,
                addr: addr.cast::<u8>(),
                size: actual,
            })
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn read_at(&self, offset: usize, len: usize) -> Result<Vec<u8>, IpcError> {
        self.check(offset, len)?;
        let mut out = vec![0u8; len];
        // SAFETY: bounds checked above; source and destination do not overlap.
        unsafe {
            ptr::copy_nonoverlapping(self.addr.add(offset), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), IpcError> {
        self.check(offset, data.len())?;
        // SAFETY: bounds checked above; source and destination do not overlap.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.addr.add(offset), data.len());
        }
        Ok(())
    }

    /// Mark the segment for removal once every process detached.
    pub fn remove(&self) -> Result<(), IpcError> {
        // SAFETY: IPC_RMID takes no buffer.
        let rc = unsafe { libc::shmctl(self.id, libc::IPC_RMID, ptr::null_mut()) };
        if rc < 0 {
            return Err(IpcError::last("shmctl(IPC_RMID)"));
        }
        Ok(())
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), IpcError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(IpcError::OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        // SAFETY: addr came from a successful shmat and is detached once.
        unsafe {
            libc::shmdt(self.addr.cast::<libc::c_void>());
        }
    }
}

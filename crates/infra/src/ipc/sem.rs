use std::io;

use super::{IpcError, IpcKey};

/// A SysV semaphore used as a cross-process mutex, initialized to 1.
///
/// Operations use `SEM_UNDO`, so a process that dies while holding the lock
/// releases it.
#[derive(Debug)]
pub struct BinarySemaphore {
    id: libc::c_int,
}

impl BinarySemaphore {
    pub fn open(key: IpcKey, perms: u32) -> Result<Self, IpcError> {
        let perms = perms as libc::c_int;
        // SAFETY: semget/semctl on a single-semaphore set with integer args.
        unsafe {
            let id = libc::semget(key, 1, libc::IPC_CREAT | libc::IPC_EXCL | perms);
            if id >= 0 {
                // We created it: open the gate. Racing openers block on the
                // zero value until this lands.
                if libc::semctl(id, 0, libc::SETVAL, 1 as libc::c_int) < 0 {
                    return Err(IpcError::last("semctl(SETVAL)"));
                }
                return Ok(Self { id });
            }
            if io::Error::last_os_error().raw_os_error() != Some(libc::EEXIST) {
                return Err(IpcError::last("semget"));
            }
            let id = libc::semget(key, 1, perms);
            if id < 0 {
                return Err(IpcError::last("semget"));
            }
            Ok(Self { id })
        }
    }

    /// Block until the semaphore is acquired.
    pub fn acquire(&self) -> Result<(), IpcError> {
        self.op(-1)
    }

    pub fn release(&self) -> Result<(), IpcError> {
        self.op(1)
    }

    pub fn remove(&self) -> Result<(), IpcError> {
        // SAFETY: IPC_RMID takes no extra argument.
        let rc = unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) };
        if rc < 0 {
            return Err(IpcError::last("semctl(IPC_RMID)"));
        }
        Ok(())
    }

    fn op(&self, delta: libc::c_short) -> Result<(), IpcError> {
        let mut op = libc::sembuf {
            sem_num: 0,
            sem_op: delta,
            sem_flg: libc::SEM_UNDO as libc::c_short,
        };
        loop {
            // SAFETY: `op` is a valid single-element sembuf array.
            let rc = unsafe { libc::semop(self.id, &mut op, 1) };
            if rc == 0 {
                return Ok(());
            }
            let err = IpcError::last("semop");
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }
}

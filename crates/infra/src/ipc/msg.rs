use std::mem::size_of;
use std::ptr;
use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

use super::{IpcError, IpcKey};

const POLL_STEP: Duration = Duration::from_millis(10);

/// Payload classification carried in the SysV message type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// The payload is the serialized item.
    Inline,
    /// The payload is the UTF-8 path of a file holding the serialized item.
    FileRef,
}

impl MessageKind {
    fn mtype(self) -> libc::c_long {
        match self {
            MessageKind::Inline => 1,
            MessageKind::FileRef => 2,
        }
    }

    fn from_mtype(mtype: libc::c_long) -> Option<Self> {
        match mtype {
            1 => Some(MessageKind::Inline),
            2 => Some(MessageKind::FileRef),
            _ => None,
        }
    }
}

/// A SysV message queue. Shared by reference through the kernel: any number of
/// producers and competing consumers may open the same key.
#[derive(Debug)]
pub struct MessageQueue {
    id: libc::c_int,
    max_bytes: usize,
}

impl MessageQueue {
    pub fn open(key: IpcKey, perms: u32, max_bytes: usize) -> Result<Self, IpcError> {
        // SAFETY: msgget takes only integers.
        let id = unsafe { libc::msgget(key, libc::IPC_CREAT | perms as libc::c_int) };
        if id < 0 {
            return Err(IpcError::last("msgget"));
        }
        Ok(Self { id, max_bytes })
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Enqueue a message, blocking while the queue is full.
    pub fn send(&self, kind: MessageKind, payload: &[u8]) -> Result<(), IpcError> {
        if payload.len() > self.max_bytes {
            return Err(IpcError::TooLarge {
                size: payload.len(),
                limit: self.max_bytes,
            });
        }

        let mut buf = message_buffer(payload.len());
        buf[0] = kind.mtype();
        // SAFETY: `buf` holds one c_long header plus at least payload.len()
        // bytes of text; the copy stays within it.
        unsafe {
            ptr::copy_nonoverlapping(
                payload.as_ptr(),
                buf.as_mut_ptr().add(1).cast::<u8>(),
                payload.len(),
            );
        }

        loop {
            // SAFETY: msgp points at a `struct msgbuf` layout of the right size.
            let rc = unsafe {
                libc::msgsnd(
                    self.id,
                    buf.as_ptr().cast::<libc::c_void>(),
                    payload.len(),
                    0,
                )
            };
            if rc == 0 {
                return Ok(());
            }
            let err = IpcError::last("msgsnd");
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }

    /// Dequeue the next message without blocking.
    pub fn try_recv(&self) -> Result<Option<(MessageKind, Vec<u8>)>, IpcError> {
        let mut buf = message_buffer(self.max_bytes);
        // SAFETY: the buffer has room for the header plus max_bytes of text.
        let n = unsafe {
            libc::msgrcv(
                self.id,
                buf.as_mut_ptr().cast::<libc::c_void>(),
                self.max_bytes,
                0,
                libc::IPC_NOWAIT,
            )
        };
        if n < 0 {
            let err = IpcError::last("msgrcv");
            return match err.raw_os_error() {
                Some(libc::ENOMSG) | Some(libc::EINTR) => Ok(None),
                Some(libc::E2BIG) => {
                    self.discard_head(&mut buf)?;
                    Err(IpcError::Discarded {
                        limit: self.max_bytes,
                    })
                }
                _ => Err(err),
            };
        }

        let len = n as usize;
        let mut payload = vec![0u8; len];
        // SAFETY: the kernel wrote `len` bytes of text after the header.
        unsafe {
            ptr::copy_nonoverlapping(buf.as_ptr().add(1).cast::<u8>(), payload.as_mut_ptr(), len);
        }
        // Unknown types are treated as inline payloads.
        let kind = MessageKind::from_mtype(buf[0]).unwrap_or(MessageKind::Inline);
        Ok(Some((kind, payload)))
    }

    /// Drop the message at the head of the queue, truncating it into `buf`.
    /// Without this an over-long message blocks every later one.
    fn discard_head(&self, buf: &mut [libc::c_long]) -> Result<(), IpcError> {
        // SAFETY: `buf` was sized by `message_buffer(self.max_bytes)`.
        let n = unsafe {
            libc::msgrcv(
                self.id,
                buf.as_mut_ptr().cast::<libc::c_void>(),
                self.max_bytes,
                0,
                libc::IPC_NOWAIT | libc::MSG_NOERROR,
            )
        };
        if n < 0 {
            let err = IpcError::last("msgrcv(MSG_NOERROR)");
            // Another consumer may have taken it first.
            return match err.raw_os_error() {
                Some(libc::ENOMSG) | Some(libc::EINTR) => Ok(()),
                _ => Err(err),
            };
        }
        warn!(limit = self.max_bytes, "dropped over-long queue message");
        Ok(())
    }

    /// Wait up to `timeout` for the next message.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<(MessageKind, Vec<u8>)>, IpcError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.try_recv()? {
                return Ok(Some(message));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL_STEP.min(deadline - now));
        }
    }

    pub fn remove(&self) -> Result<(), IpcError> {
        // SAFETY: IPC_RMID takes no buffer.
        let rc = unsafe { libc::msgctl(self.id, libc::IPC_RMID, ptr::null_mut()) };
        if rc < 0 {
            return Err(IpcError::last("msgctl(IPC_RMID)"));
        }
        Ok(())
    }
}

/// c_long-aligned buffer: one header word for `mtype`, then the text.
fn message_buffer(text_len: usize) -> Vec<libc::c_long> {
    let word = size_of::<libc::c_long>();
    vec![0; 1 + text_len.div_ceil(word)]
}

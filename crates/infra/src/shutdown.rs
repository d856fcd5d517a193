//! Cooperative shutdown flag.
//!
//! The OS handler only flips an atomic; loops read it at iteration boundaries.
//! An in-flight flush is never interrupted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, thiserror::Error)]
#[error("failed to install signal handler: {0}")]
pub struct ShutdownError(#[from] ctrlc::Error);

/// Shared "please stop" flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    requested: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route SIGINT, SIGTERM and SIGHUP to this flag. Once per process.
    pub fn install_handler(&self) -> Result<(), ShutdownError> {
        let requested = self.requested.clone();
        ctrlc::set_handler(move || requested.store(true, Ordering::SeqCst))?;
        Ok(())
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

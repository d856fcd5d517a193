//! Numeric job identifiers.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::BatchError;

/// Sequential numeric id of a registered job.
///
/// Assigned once at first registration and stable afterwards. Every process
/// that loads the same snapshot sees the same id for the same identifier, so
/// the id is what crosses process boundaries (worker argv, queue keys,
/// failure records).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobNumId(u32);

impl JobNumId {
    /// The id handed out to the first job of an empty registry.
    pub const FIRST: JobNumId = JobNumId(1);

    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// The id following this one, or `None` at the end of the id space.
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl core::fmt::Display for JobNumId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<u32> for JobNumId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<JobNumId> for u32 {
    fn from(value: JobNumId) -> Self {
        value.0
    }
}

impl FromStr for JobNumId {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s
            .trim()
            .parse::<u32>()
            .map_err(|e| BatchError::unknown_job(format!("invalid job id {s:?}: {e}")))?;
        Ok(Self(value))
    }
}

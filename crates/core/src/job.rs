//! Registered jobs and their options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::BatchPolicy;
use crate::error::{BatchError, BatchResult};
use crate::id::JobNumId;

/// Caller-facing registration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Flush as soon as this many items are buffered.
    pub batch_size: usize,
    /// Flush a non-empty buffer once this much time passed since the last flush.
    pub call_period: Duration,
    /// Number of worker processes the daemon keeps alive for the job.
    pub num_workers: u32,
    /// Named task run once in the worker before the job body starts.
    pub bootstrap: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            call_period: Duration::from_secs(5),
            num_workers: 1,
            bootstrap: None,
        }
    }
}

impl JobOptions {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_call_period(mut self, call_period: Duration) -> Self {
        self.call_period = call_period;
        self
    }

    pub fn with_num_workers(mut self, num_workers: u32) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_bootstrap(mut self, task: impl Into<String>) -> Self {
        self.bootstrap = Some(task.into());
        self
    }

    /// Reject options no worker could honour.
    pub fn validate(&self) -> BatchResult<()> {
        if self.batch_size == 0 {
            return Err(BatchError::registration("batch_size must be at least 1"));
        }
        if self.num_workers == 0 {
            return Err(BatchError::registration("num_workers must be at least 1"));
        }
        if self.call_period.is_zero() {
            return Err(BatchError::registration("call_period must be positive"));
        }
        Ok(())
    }
}

/// What a job does once its worker is running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    /// Buffers submitted items and hands them to a named flush function.
    Batching {
        function: String,
        batch_size: usize,
        call_period: Duration,
    },
    /// Runs a named task once; the task is expected to loop on its own.
    Simple { task: String },
}

/// A registered unit of batched work.
///
/// This is the serializable form stored in the snapshot. Each process that
/// loads the snapshot gets its own copy; the function names are resolved
/// against that process' [`crate::FunctionTable`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub identifier: String,
    pub id: JobNumId,
    pub num_workers: u32,
    pub bootstrap: Option<String>,
    pub kind: JobKind,
}

impl Job {
    pub fn batching(
        id: JobNumId,
        identifier: impl Into<String>,
        function: impl Into<String>,
        options: &JobOptions,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            id,
            num_workers: options.num_workers,
            bootstrap: options.bootstrap.clone(),
            kind: JobKind::Batching {
                function: function.into(),
                batch_size: options.batch_size,
                call_period: options.call_period,
            },
        }
    }

    pub fn simple(
        id: JobNumId,
        identifier: impl Into<String>,
        task: impl Into<String>,
        options: &JobOptions,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            id,
            num_workers: options.num_workers,
            bootstrap: options.bootstrap.clone(),
            kind: JobKind::Simple { task: task.into() },
        }
    }

    pub fn is_batching(&self) -> bool {
        matches!(self.kind, JobKind::Batching { .. })
    }

    /// Trigger policy for batching jobs; `None` for simple jobs.
    pub fn batch_policy(&self) -> Option<BatchPolicy> {
        match &self.kind {
            JobKind::Batching {
                batch_size,
                call_period,
                ..
            } => Some(BatchPolicy::new(*batch_size, *call_period)),
            JobKind::Simple { .. } => None,
        }
    }

    /// Name of the function (or task) the job runs.
    pub fn function_name(&self) -> &str {
        match &self.kind {
            JobKind::Batching { function, .. } => function,
            JobKind::Simple { task } => task,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_validation() {
        assert!(JobOptions::default().validate().is_ok());
        assert!(JobOptions::default().with_batch_size(0).validate().is_err());
        assert!(JobOptions::default().with_num_workers(0).validate().is_err());
        assert!(
            JobOptions::default()
                .with_call_period(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn batching_job_exposes_policy() {
        let options = JobOptions::default()
            .with_batch_size(3)
            .with_call_period(Duration::from_secs(2));
        let job = Job::batching(JobNumId::FIRST, "emails", "send_emails", &options);

        assert!(job.is_batching());
        assert_eq!(job.function_name(), "send_emails");
        let policy = job.batch_policy().unwrap();
        assert_eq!(policy.batch_size(), 3);
        assert_eq!(policy.call_period(), Duration::from_secs(2));
    }

    #[test]
    fn simple_job_has_no_policy() {
        let job = Job::simple(
            JobNumId::FIRST,
            "consumer",
            "poll_queue",
            &JobOptions::default().with_num_workers(3),
        );
        assert!(!job.is_batching());
        assert!(job.batch_policy().is_none());
        assert_eq!(job.num_workers, 3);
    }
}

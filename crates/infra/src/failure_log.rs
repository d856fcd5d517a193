//! Persistence of batches the flush callback rejected.
//!
//! Each process appends to its own file (`failures-<pid>.jsonl`) so that
//! concurrent workers never interleave writes. Records are never read back by
//! the batching system; they exist for offline recovery tooling.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use batchwork_core::{Item, JobNumId};

/// One rejected batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub record_id: Uuid,
    pub job_id: JobNumId,
    pub failed_at: DateTime<Utc>,
    pub items: Vec<Item>,
}

#[derive(Debug, thiserror::Error)]
pub enum FailureLogError {
    #[error("failure log io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failure record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Append-only failure file of one process.
#[derive(Debug, Clone)]
pub struct FailureLog {
    path: PathBuf,
}

impl FailureLog {
    /// The file of the calling process under `dir`.
    pub fn for_current_process(dir: &Path) -> Self {
        Self::at(dir.join(format!("failures-{}.jsonl", std::process::id())))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one `(job_id, items)` record.
    pub fn append(&self, job_id: JobNumId, items: &[Item]) -> Result<FailureRecord, FailureLogError> {
        let record = FailureRecord {
            record_id: Uuid::now_v7(),
            job_id,
            failed_at: Utc::now(),
            items: items.to_vec(),
        };

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|source| self.io_error(source))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| self.io_error(source))?;
        // Single write so a record is never split across appends.
        file.write_all(&line).map_err(|source| self.io_error(source))?;

        Ok(record)
    }

    /// Read every record of a failure file (recovery tooling, tests).
    pub fn read_records(path: &Path) -> Result<Vec<FailureRecord>, FailureLogError> {
        let file = fs::File::open(path).map_err(|source| FailureLogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|source| FailureLogError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    fn io_error(&self, source: std::io::Error) -> FailureLogError {
        FailureLogError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

//! Size/time trigger policy and the pending buffer it guards.
//!
//! The same policy drives both the daemon workers and the in-process backend:
//! flush when `count >= batch_size`, or when the buffer is non-empty and either
//! the call period elapsed since the last flush or shutdown was requested.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// A submitted item. Items are opaque JSON values to the batching layer.
pub type Item = serde_json::Value;

/// Trigger thresholds of a batching job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPolicy {
    batch_size: usize,
    call_period: Duration,
}

impl BatchPolicy {
    pub fn new(batch_size: usize, call_period: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            call_period,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn call_period(&self) -> Duration {
        self.call_period
    }

    pub fn should_flush(&self, pending: usize, since_last_flush: Duration, shutdown: bool) -> bool {
        pending >= self.batch_size
            || (pending > 0 && (since_last_flush > self.call_period || shutdown))
    }
}

/// Result of handing a batch to the flush function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The callback accepted the batch.
    Flushed { items: usize },
    /// The callback reported failure; the batch must be persisted.
    Failed { items: usize },
}

impl FlushOutcome {
    pub fn from_callback(accepted: bool, items: usize) -> Self {
        if accepted {
            Self::Flushed { items }
        } else {
            Self::Failed { items }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Flushed { .. })
    }
}

/// Process-local list of not-yet-flushed items.
///
/// Never shared across processes and never persisted: items still in here when
/// a process crashes are lost.
#[derive(Debug, Clone)]
pub struct BatchBuffer {
    policy: BatchPolicy,
    items: Vec<Item>,
    last_flush: Instant,
}

impl BatchBuffer {
    pub fn new(policy: BatchPolicy) -> Self {
        Self::starting_at(policy, Instant::now())
    }

    /// Buffer whose period timer starts at `now` (tests drive the clock).
    pub fn starting_at(policy: BatchPolicy, now: Instant) -> Self {
        Self {
            policy,
            items: Vec::new(),
            last_flush: now,
        }
    }

    pub fn policy(&self) -> BatchPolicy {
        self.policy
    }

    /// Replace thresholds without dropping buffered items.
    pub fn set_policy(&mut self, policy: BatchPolicy) {
        self.policy = policy;
    }

    pub fn push(&mut self, item: Item) {
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn is_due(&self, shutdown: bool) -> bool {
        self.is_due_at(Instant::now(), shutdown)
    }

    pub fn is_due_at(&self, now: Instant, shutdown: bool) -> bool {
        let elapsed = now.saturating_duration_since(self.last_flush);
        self.policy.should_flush(self.items.len(), elapsed, shutdown)
    }

    /// Drain the buffer in receipt order and restart the period timer.
    pub fn take(&mut self) -> Vec<Item> {
        self.take_at(Instant::now())
    }

    pub fn take_at(&mut self, now: Instant) -> Vec<Item> {
        self.last_flush = now;
        std::mem::take(&mut self.items)
    }

    /// Give back memory held by an empty buffer after a large batch.
    pub fn reclaim(&mut self) {
        if self.items.is_empty() {
            self.items.shrink_to_fit();
        }
    }
}

//! Reconstructible job functions.
//!
//! A worker process cannot receive a closure from the process that registered
//! the job, so job functions are referenced by name. Every process that runs
//! jobs builds the same [`FunctionTable`] at startup, and the snapshot only
//! stores names.

use std::collections::HashMap;

use crate::batch::Item;
use crate::error::{BatchError, BatchResult};

/// Flush callback: receives a batch in receipt order, reports success.
pub type FlushFn = fn(&[Item]) -> bool;

/// Task callback: simple-job bodies and bootstrap units.
pub type TaskFn = fn();

/// What a caller hands to `register_job`.
pub enum Callable {
    /// A function registered under this name in the [`FunctionTable`].
    Named(String),
    /// An anonymous closure. Always rejected: it cannot be rebuilt in a worker.
    Closure(Box<dyn Fn(&[Item]) -> bool + Send + Sync>),
}

impl Callable {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    pub fn closure<F>(f: F) -> Self
    where
        F: Fn(&[Item]) -> bool + Send + Sync + 'static,
    {
        Self::Closure(Box::new(f))
    }
}

impl core::fmt::Debug for Callable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Callable::Named(name) => f.debug_tuple("Named").field(name).finish(),
            Callable::Closure(_) => f.write_str("Closure(..)"),
        }
    }
}

impl From<&str> for Callable {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

/// Name → function lookup shared by producers, the daemon, and workers.
#[derive(Clone, Default)]
pub struct FunctionTable {
    flush: HashMap<String, FlushFn>,
    tasks: HashMap<String, TaskFn>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flush(mut self, name: impl Into<String>, f: FlushFn) -> Self {
        self.register_flush(name, f);
        self
    }

    pub fn with_task(mut self, name: impl Into<String>, f: TaskFn) -> Self {
        self.register_task(name, f);
        self
    }

    pub fn register_flush(&mut self, name: impl Into<String>, f: FlushFn) {
        self.flush.insert(name.into(), f);
    }

    pub fn register_task(&mut self, name: impl Into<String>, f: TaskFn) {
        self.tasks.insert(name.into(), f);
    }

    pub fn flush_fn(&self, name: &str) -> Option<FlushFn> {
        self.flush.get(name).copied()
    }

    pub fn task(&self, name: &str) -> Option<TaskFn> {
        self.tasks.get(name).copied()
    }

    /// Turn a callable into the stable name stored in the snapshot.
    pub fn resolve_flush(&self, callable: &Callable) -> BatchResult<String> {
        match callable {
            Callable::Closure(_) => Err(BatchError::registration(
                "closures cannot be reconstructed in a worker process; register a named function",
            )),
            Callable::Named(name) if self.flush.contains_key(name) => Ok(name.clone()),
            Callable::Named(name) => Err(BatchError::registration(format!(
                "flush function {name:?} is not in the function table"
            ))),
        }
    }

    pub fn resolve_task(&self, name: &str) -> BatchResult<()> {
        if self.tasks.contains_key(name) {
            Ok(())
        } else {
            Err(BatchError::registration(format!(
                "task {name:?} is not in the function table"
            )))
        }
    }

    /// Invoke a named flush function; `None` when the name is unknown here.
    pub fn call_flush(&self, name: &str, items: &[Item]) -> Option<bool> {
        self.flush_fn(name).map(|f| f(items))
    }
}

impl core::fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut flush: Vec<_> = self.flush.keys().collect();
        let mut tasks: Vec<_> = self.tasks.keys().collect();
        flush.sort();
        tasks.sort();
        f.debug_struct("FunctionTable")
            .field("flush", &flush)
            .field("tasks", &tasks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept_all(_items: &[Item]) -> bool {
        true
    }

    fn noop() {}

    #[test]
    fn named_functions_resolve() {
        let table = FunctionTable::new()
            .with_flush("accept_all", accept_all)
            .with_task("noop", noop);

        assert_eq!(
            table.resolve_flush(&Callable::named("accept_all")).unwrap(),
            "accept_all"
        );
        assert!(table.resolve_task("noop").is_ok());
        assert_eq!(table.call_flush("accept_all", &[]), Some(true));
        assert_eq!(table.call_flush("missing", &[]), None);
    }

    #[test]
    fn closures_are_rejected() {
        let captured = vec![1, 2, 3];
        let table = FunctionTable::new().with_flush("accept_all", accept_all);
        let callable = Callable::closure(move |items| items.len() < captured.len());

        assert!(matches!(
            table.resolve_flush(&callable),
            Err(BatchError::Registration(_))
        ));
    }

    #[test]
    fn unknown_names_are_rejected() {
        let table = FunctionTable::new();
        assert!(matches!(
            table.resolve_flush(&Callable::named("nope")),
            Err(BatchError::Registration(_))
        ));
        assert!(table.resolve_task("nope").is_err());
    }
}

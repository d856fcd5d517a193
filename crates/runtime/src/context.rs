//! Embedded-mode backends.

use std::path::Path;
use std::sync::Arc;

use batchwork_core::FunctionTable;
use batchwork_infra::Settings;
use batchwork_infra::config_storage::InMemoryConfigStorage;
use batchwork_infra::failure_log::FailureLog;
use batchwork_infra::process_item::InProcessItem;

/// The storage and buffers of one embedded deployment.
///
/// Every [`crate::Runner`] built from the same context sees the same jobs and
/// feeds the same buffers. Buffered items are flushed when the last runner and
/// the context itself are dropped.
#[derive(Debug, Clone)]
pub struct EmbeddedContext {
    storage: Arc<InMemoryConfigStorage>,
    processor: Arc<InProcessItem>,
    functions: Arc<FunctionTable>,
}

impl EmbeddedContext {
    pub fn new(functions: FunctionTable, failure_dir: &Path) -> Self {
        let storage = Arc::new(InMemoryConfigStorage::new());
        let functions = Arc::new(functions);
        let processor = Arc::new(InProcessItem::new(
            storage.clone(),
            functions.clone(),
            FailureLog::for_current_process(failure_dir),
        ));
        Self {
            storage,
            processor,
            functions,
        }
    }

    pub fn from_settings(settings: &Settings, functions: FunctionTable) -> Self {
        Self::new(functions, &settings.failure_dir)
    }

    pub fn storage(&self) -> Arc<InMemoryConfigStorage> {
        self.storage.clone()
    }

    pub fn processor(&self) -> Arc<InProcessItem> {
        self.processor.clone()
    }

    pub fn functions(&self) -> Arc<FunctionTable> {
        self.functions.clone()
    }
}

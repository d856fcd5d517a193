use std::thread;
use std::time::Duration;

use batchwork_core::{FunctionTable, Item};

/// Demo flush function: logs the batch and accepts it.
fn log_batch(items: &[Item]) -> bool {
    tracing::info!(items = items.len(), "received batch");
    true
}

/// Demo simple job body.
fn heartbeat() {
    loop {
        tracing::info!(pid = std::process::id(), "heartbeat");
        thread::sleep(Duration::from_secs(30));
    }
}

fn main() -> anyhow::Result<()> {
    batchwork_observability::init();

    let functions = FunctionTable::new()
        .with_flush("log_batch", log_batch)
        .with_task("heartbeat", heartbeat);

    batchwork_runtime::entrypoint::run(functions)
}

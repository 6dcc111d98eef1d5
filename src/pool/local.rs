//! In-process execution: every worker is a slot on the tokio runtime running
//! the pool's adapter.

use crate::adapter::{AdapterHealth, SharedAdapter};
use crate::error::AdapterError;
use crate::task::Task;

pub struct LocalBackend {
    adapter: SharedAdapter,
}

impl LocalBackend {
    pub fn new(adapter: SharedAdapter) -> Self {
        Self { adapter }
    }

    pub(crate) async fn run(&self, task: &Task) -> Result<serde_json::Value, AdapterError> {
        self.adapter.execute(task).await
    }

    pub(crate) async fn health(&self) -> AdapterHealth {
        self.adapter.health().await
    }
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend")
            .field("adapter", &self.adapter.name())
            .finish()
    }
}

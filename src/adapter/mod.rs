//! Task adapters.
//!
//! An adapter gives meaning to a task's payload. Pools are agnostic of what a
//! task does; local workers hand every task to a [`TaskAdapter`].

mod shell;

pub use shell::ShellAdapter;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AdapterError;
use crate::task::Task;

/// Health reported by an adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterHealth {
    pub healthy: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl AdapterHealth {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            message: None,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: Some(message.into()),
        }
    }
}

/// Executes task payloads.
#[async_trait]
pub trait TaskAdapter: Send + Sync {
    /// Adapter name, used in logs.
    fn name(&self) -> &str;

    /// Executes a task and returns its output.
    async fn execute(&self, task: &Task) -> Result<serde_json::Value, AdapterError>;

    /// Reports whether the adapter can currently execute tasks.
    async fn health(&self) -> AdapterHealth {
        AdapterHealth::healthy()
    }
}

/// Shared adapter handle.
pub type SharedAdapter = Arc<dyn TaskAdapter>;

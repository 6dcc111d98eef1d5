//! Task definitions for the orchestration core.
//!
//! This module defines the units of work that flow through pools:
//!
//! - `Task`: an immutable unit of work routed to a pool
//! - `TaskOutput`: the result of a successful execution
//! - `MemoryItem`: a collected result record consumed by the aggregator

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a task. Retries reuse the id of the original task.
pub type TaskId = Uuid;

/// An opaque unit of work.
///
/// The payload is interpreted only by the adapter executing the task. A task is
/// never mutated once submitted; retries create attempt records that reference
/// the same id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Unique identifier for the task.
    pub id: TaskId,
    /// Framework-agnostic payload handed to the adapter.
    pub payload: serde_json::Value,
    /// Preferred pool ids; routing favours these while any of them is healthy.
    #[serde(default)]
    pub targets: Vec<String>,
    /// Per-task timeout in milliseconds. Falls back to the pool default.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Capability tags a pool must carry to be preferred for this task.
    #[serde(default)]
    pub affinity: BTreeSet<String>,
    /// When the task was submitted.
    #[serde(default = "Utc::now")]
    pub submitted_at: DateTime<Utc>,
}

impl Task {
    /// Creates a new task with a fresh id.
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            targets: Vec::new(),
            timeout_ms: None,
            affinity: BTreeSet::new(),
            submitted_at: Utc::now(),
        }
    }

    /// Adds a target.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.targets.push(target.into());
        self
    }

    /// Sets the task timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Adds an affinity tag.
    pub fn with_affinity(mut self, tag: impl Into<String>) -> Self {
        self.affinity.insert(tag.into());
        self
    }

    /// Returns the task timeout, if one was set.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Returns how long ago the task was submitted.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.submitted_at
    }
}

/// Result of a successful task execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskOutput {
    /// ID of the task that was executed.
    pub task_id: TaskId,
    /// Pool that executed the task.
    pub pool_id: String,
    /// Worker that executed the task.
    pub worker_id: String,
    /// Output produced by the adapter.
    pub output: serde_json::Value,
    /// Duration of the execution in milliseconds.
    pub duration_ms: u64,
    /// When the task completed.
    pub completed_at: DateTime<Utc>,
}

/// A result or telemetry record collected from a pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryItem {
    pub id: Uuid,
    pub pool_id: String,
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub worker_id: Option<String>,
    pub content: serde_json::Value,
    #[serde(default)]
    pub tags: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

impl MemoryItem {
    /// Builds the record a pool keeps for a completed task.
    pub fn from_output(output: &TaskOutput, tags: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pool_id: output.pool_id.clone(),
            task_id: Some(output.task_id),
            worker_id: Some(output.worker_id.clone()),
            content: output.output.clone(),
            tags,
            recorded_at: output.completed_at,
        }
    }

    /// Returns the searchable text of this item.
    pub fn searchable_text(&self) -> String {
        match &self.content {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_new() {
        let task = Task::new(json!({"command": "echo hi"}));

        assert!(!task.id.is_nil());
        assert!(task.targets.is_empty());
        assert!(task.affinity.is_empty());
        assert!(task.timeout().is_none());
    }

    #[test]
    fn test_task_builder() {
        let task = Task::new(json!({}))
            .with_target("gpu-pool")
            .with_timeout(Duration::from_secs(10))
            .with_affinity("gpu")
            .with_affinity("gpu");

        assert_eq!(task.targets, vec!["gpu-pool".to_string()]);
        assert_eq!(task.timeout(), Some(Duration::from_secs(10)));
        assert_eq!(task.affinity.len(), 1);
        assert!(task.affinity.contains("gpu"));
    }

    #[test]
    fn test_task_deserialize_minimal() {
        let task: Task = serde_json::from_str(
            r#"{"id":"6f1c1b8e-2a6e-4b7a-9d1e-3f4c5b6a7d8e","payload":{"command":"true"}}"#,
        )
        .expect("should deserialize");

        assert_eq!(task.payload["command"], "true");
        assert!(task.timeout_ms.is_none());
    }

    #[test]
    fn test_memory_item_from_output() {
        let output = TaskOutput {
            task_id: Uuid::new_v4(),
            pool_id: "local-a".to_string(),
            worker_id: "local-a-w1".to_string(),
            output: json!("hello world"),
            duration_ms: 12,
            completed_at: Utc::now(),
        };
        let item = MemoryItem::from_output(&output, vec!["cpu".to_string()]);

        assert_eq!(item.pool_id, "local-a");
        assert_eq!(item.task_id, Some(output.task_id));
        assert_eq!(item.searchable_text(), "hello world");

        let structured = MemoryItem {
            content: json!({"k": "v"}),
            ..item
        };
        assert!(structured.searchable_text().contains("\"k\""));
    }
}

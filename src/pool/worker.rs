//! Worker slots and their lifecycle.
//!
//! ```text
//! spawning -> idle <-> busy -> idle | failed
//! idle | busy -> terminating -> (removed)
//! ```
//!
//! A failed worker is never reused: the pool removes it and, when needed,
//! provisions a replacement with a fresh id.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

use super::PoolKind;
use crate::task::TaskId;

/// Identifier of a worker, unique within the process (`{pool}-w{seq}`).
pub type WorkerId = String;

/// Lifecycle status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Spawning,
    Idle,
    Busy,
    Failed,
    Terminating,
}

impl WorkerStatus {
    /// Check if a transition to `to` is allowed.
    pub fn can_transition(self, to: WorkerStatus) -> bool {
        use WorkerStatus::*;
        matches!(
            (self, to),
            (Spawning, Idle)
                | (Spawning, Failed)
                | (Idle, Busy)
                | (Busy, Idle)
                | (Idle, Failed)
                | (Busy, Failed)
                | (Idle, Terminating)
                | (Busy, Terminating)
                | (Spawning, Terminating)
        )
    }

    /// Live workers count towards the pool's active size.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            WorkerStatus::Spawning | WorkerStatus::Idle | WorkerStatus::Busy
        )
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerStatus::Spawning => "spawning",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Failed => "failed",
            WorkerStatus::Terminating => "terminating",
        };
        write!(f, "{}", s)
    }
}

/// A single execution slot inside a pool.
#[derive(Debug, Clone)]
pub struct Worker {
    pub id: WorkerId,
    pub pool_id: String,
    pub kind: PoolKind,
    status: WorkerStatus,
    current_task: Option<TaskId>,
    last_heartbeat: Instant,
    /// Delegate endpoint or cluster handle backing this worker.
    pub external_ref: Option<String>,
}

impl Worker {
    pub(crate) fn new(id: WorkerId, pool_id: impl Into<String>, kind: PoolKind) -> Self {
        Self {
            id,
            pool_id: pool_id.into(),
            kind,
            status: WorkerStatus::Spawning,
            current_task: None,
            last_heartbeat: Instant::now(),
            external_ref: None,
        }
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.current_task
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.last_heartbeat
    }

    pub fn is_busy(&self) -> bool {
        self.current_task.is_some()
    }

    /// Returns whether the heartbeat is older than `timeout` at `now`.
    pub fn heartbeat_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat) > timeout
    }

    pub(crate) fn heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    /// Moves the worker to `to`, returning the previous status.
    ///
    /// Leaving `busy` clears the current task. Returns `None` and leaves the
    /// worker untouched if the transition is not allowed.
    pub(crate) fn transition(&mut self, to: WorkerStatus) -> Option<WorkerStatus> {
        let from = self.status;
        if !from.can_transition(to) {
            return None;
        }
        self.status = to;
        if to != WorkerStatus::Busy {
            self.current_task = None;
        }
        Some(from)
    }

    /// Hands a task to an idle worker.
    pub(crate) fn assign(&mut self, task_id: TaskId) -> bool {
        if self.status != WorkerStatus::Idle {
            return false;
        }
        self.status = WorkerStatus::Busy;
        self.current_task = Some(task_id);
        self.heartbeat();
        true
    }

    /// Returns whether the worker is still executing `task_id`.
    pub(crate) fn holds(&self, task_id: TaskId) -> bool {
        self.current_task == Some(task_id)
    }

    /// Marks a worker selected for scale-down; a busy worker keeps its task
    /// until it finishes.
    pub(crate) fn mark_terminating(&mut self) -> Option<WorkerStatus> {
        let from = self.status;
        if !from.can_transition(WorkerStatus::Terminating) {
            return None;
        }
        self.status = WorkerStatus::Terminating;
        Some(from)
    }
}

//! Execution pools.
//!
//! A [`Pool`] owns a set of workers and executes tasks on them. Three variants
//! share the same contract and differ only in where execution happens, chosen
//! at construction through [`PoolBackend`]:
//!
//! - `local`: in-process workers running a [`TaskAdapter`](crate::adapter::TaskAdapter)
//! - `delegated`: slots on a remote agent reached through a [`DelegateClient`]
//! - `cluster`: workers provisioned by an external [`ClusterScheduler`]
//!
//! # Features
//!
//! - Callers block only until a worker is assigned
//! - Task timeouts enforced where the result is awaited
//! - Heartbeat reaping with a single replacement attempt
//! - Graceful close with a drain grace period

mod backend;
pub mod cluster;
pub mod delegated;
pub mod local;
pub mod worker;

pub use backend::PoolBackend;
pub use cluster::{ClusterBackend, ClusterScheduler, ClusterWorkerStatus, HttpClusterScheduler};
pub use delegated::{DelegateClient, DelegatedBackend, HttpDelegateClient};
pub use local::LocalBackend;
pub use worker::{Worker, WorkerId, WorkerStatus};

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::adapter::AdapterHealth;
use crate::error::{AdapterError, Categorize, ErrorCategory};
use crate::events::{EventType, OrchestratorEvent, SharedEventSink};
use crate::metrics::MetricsCollector;
use crate::task::{MemoryItem, Task, TaskId, TaskOutput};

/// Default per-task timeout when neither the task nor the config sets one.
const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(1800);

/// Default time after which a silent worker is considered failed.
const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time `close` waits for in-flight tasks.
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

/// Default number of collected results kept between aggregator syncs.
const DEFAULT_RESULT_BUFFER_LIMIT: usize = 10_000;

/// Errors that can occur in a pool.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// The pool configuration is invalid.
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// A scale target outside the configured bounds.
    #[error("Scale target {target} outside bounds [{min}, {max}]")]
    InvalidScaleTarget {
        target: usize,
        min: usize,
        max: usize,
    },

    /// The pool no longer accepts tasks.
    #[error("Pool {0} is closed")]
    Closed(String),

    /// The operation requires a running pool.
    #[error("Pool {pool} is {status}, expected running")]
    NotRunning { pool: String, status: PoolStatus },

    /// No live worker with this id.
    #[error("Worker {0} not found")]
    WorkerNotFound(String),

    /// The backend could not provision workers.
    #[error("Provisioning failed: {0}")]
    Provisioning(AdapterError),

    /// The task failed on its worker.
    #[error(transparent)]
    Execution(#[from] AdapterError),
}

impl Categorize for PoolError {
    fn category(&self) -> ErrorCategory {
        match self {
            PoolError::InvalidConfig(_)
            | PoolError::InvalidScaleTarget { .. }
            | PoolError::WorkerNotFound(_) => ErrorCategory::Configuration,
            PoolError::Closed(_) | PoolError::NotRunning { .. } => {
                ErrorCategory::ResourceExhaustion
            }
            PoolError::Provisioning(_) => ErrorCategory::Transient,
            PoolError::Execution(e) => e.category(),
        }
    }
}

/// Execution locality of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    Local,
    Delegated,
    Cluster,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::Local => write!(f, "local"),
            PoolKind::Delegated => write!(f, "delegated"),
            PoolKind::Cluster => write!(f, "cluster"),
        }
    }
}

impl FromStr for PoolKind {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(PoolKind::Local),
            "delegated" => Ok(PoolKind::Delegated),
            "cluster" => Ok(PoolKind::Cluster),
            other => Err(PoolError::InvalidConfig(format!("unknown pool kind '{}'", other))),
        }
    }
}

/// Lifecycle status of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Configuring,
    Running,
    Scaling,
    Stopping,
    Stopped,
}

impl PoolStatus {
    /// Returns whether new tasks may be submitted.
    pub fn accepts_tasks(self) -> bool {
        matches!(self, PoolStatus::Running | PoolStatus::Scaling)
    }
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PoolStatus::Configuring => "configuring",
            PoolStatus::Running => "running",
            PoolStatus::Scaling => "scaling",
            PoolStatus::Stopping => "stopping",
            PoolStatus::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Health classification of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Point-in-time health report of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolHealth {
    pub pool_id: String,
    pub status: HealthStatus,
    pub pool_status: PoolStatus,
    /// Spawning, idle and busy workers.
    pub active_workers: usize,
    /// Workers holding a task.
    pub busy_workers: usize,
    /// Callers waiting for a worker.
    pub queued_tasks: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    #[serde(default)]
    pub message: Option<String>,
}

impl PoolHealth {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Execution statistics of a pool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub average_task_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of tasks processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_completed as f64 / total as f64) * 100.0
    }
}

/// Shared counters behind [`PoolStats`].
struct SharedPoolStats {
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
        }
    }

    fn record(&self, success: bool, duration: Duration) {
        if success {
            self.tasks_completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.tasks_failed.fetch_add(1, Ordering::SeqCst);
        }
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn to_pool_stats(&self) -> PoolStats {
        let completed = self.tasks_completed.load(Ordering::SeqCst);
        let failed = self.tasks_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total = completed + failed;
        let average_task_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            tasks_completed: completed,
            tasks_failed: failed,
            average_task_duration,
        }
    }
}

/// Configuration for a pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool name, unique within a manager.
    pub name: String,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Capability tags matched against task affinity.
    pub tags: BTreeSet<String>,
    /// Timeout for tasks that carry none.
    pub task_timeout: Duration,
    pub heartbeat_timeout: Duration,
    /// How long `close` waits for in-flight tasks.
    pub shutdown_grace: Duration,
    /// Maximum collected results kept between syncs; the oldest are dropped.
    pub result_buffer_limit: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            min_workers: 1,
            max_workers: 4,
            tags: BTreeSet::new(),
            task_timeout: DEFAULT_TASK_TIMEOUT,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            result_buffer_limit: DEFAULT_RESULT_BUFFER_LIMIT,
        }
    }
}

impl PoolConfig {
    /// Creates a configuration with the given name and worker bounds.
    pub fn new(name: impl Into<String>, min_workers: usize, max_workers: usize) -> Self {
        Self {
            name: name.into(),
            min_workers,
            max_workers,
            ..Default::default()
        }
    }

    /// Adds a capability tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Sets the default task timeout.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Sets the heartbeat timeout.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Sets the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Sets the result buffer limit.
    pub fn with_result_buffer_limit(mut self, limit: usize) -> Self {
        self.result_buffer_limit = limit;
        self
    }

    /// Validates name and bounds (`1 <= min <= max`).
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.name.trim().is_empty() {
            return Err(PoolError::InvalidConfig("pool name must not be empty".to_string()));
        }
        if self.min_workers == 0 {
            return Err(PoolError::InvalidConfig(format!(
                "pool {}: min_workers must be at least 1",
                self.name
            )));
        }
        if self.min_workers > self.max_workers {
            return Err(PoolError::InvalidConfig(format!(
                "pool {}: min_workers ({}) exceeds max_workers ({})",
                self.name, self.min_workers, self.max_workers
            )));
        }
        if self.heartbeat_timeout.is_zero() || self.task_timeout.is_zero() {
            return Err(PoolError::InvalidConfig(format!(
                "pool {}: timeouts must be non-zero",
                self.name
            )));
        }
        Ok(())
    }
}

struct PoolState {
    status: PoolStatus,
    workers: Vec<Worker>,
    queued: usize,
    results: Vec<MemoryItem>,
    running: HashMap<TaskId, AbortHandle>,
    backend_health: AdapterHealth,
}

impl PoolState {
    fn live_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.status().is_live()).count()
    }

    fn busy_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.is_busy()).count()
    }
}

struct Monitor {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

struct PoolInner {
    config: PoolConfig,
    kind: PoolKind,
    backend: PoolBackend,
    events: SharedEventSink,
    metrics: MetricsCollector,
    state: Mutex<PoolState>,
    /// Signalled whenever a worker may have become idle or the pool stops.
    worker_available: Notify,
    /// Signalled whenever a task leaves its worker.
    task_finished: Notify,
    next_worker_seq: AtomicU64,
    /// Serializes scaling, replacement and close.
    scale_lock: tokio::sync::Mutex<()>,
    stats: SharedPoolStats,
    monitor: Mutex<Option<Monitor>>,
}

/// A named collection of workers.
///
/// Cloning a `Pool` yields another handle to the same pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.config.name)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn next_worker_id(&self) -> WorkerId {
        let seq = self.next_worker_seq.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-w{}", self.config.name, seq)
    }

    fn emit_worker(&self, worker: &Worker, from: Option<WorkerStatus>) {
        debug!(
            pool_id = %self.config.name,
            worker_id = %worker.id,
            from = ?from,
            to = %worker.status(),
            "Worker state changed"
        );
        self.events.emit(OrchestratorEvent::new(
            EventType::WorkerStateChanged,
            worker.id.clone(),
            json!({
                "pool_id": self.config.name,
                "from": from,
                "to": worker.status(),
                "task_id": worker.current_task(),
            }),
        ));
    }

    fn set_status(&self, state: &mut PoolState, to: PoolStatus) {
        let from = state.status;
        if from == to {
            return;
        }
        state.status = to;
        info!(pool_id = %self.config.name, from = %from, to = %to, "Pool status changed");
        self.events.emit(OrchestratorEvent::new(
            EventType::PoolStatusChanged,
            self.config.name.clone(),
            json!({ "from": from, "to": to }),
        ));
    }

    fn health_from(&self, state: &PoolState) -> PoolHealth {
        let active = state.live_workers();
        let running = matches!(state.status, PoolStatus::Running | PoolStatus::Scaling);
        let status = if !running || !state.backend_health.healthy || active == 0 {
            HealthStatus::Unhealthy
        } else if active < self.config.min_workers {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        PoolHealth {
            pool_id: self.config.name.clone(),
            status,
            pool_status: state.status,
            active_workers: active,
            busy_workers: state.busy_workers(),
            queued_tasks: state.queued,
            min_workers: self.config.min_workers,
            max_workers: self.config.max_workers,
            message: state.backend_health.message.clone(),
        }
    }

    fn publish_gauges(&self) {
        let (active, busy, queued) = {
            let state = self.state();
            (state.live_workers(), state.busy_workers(), state.queued)
        };
        self.metrics.update_pool(self.name(), active, busy, queued);
    }

    /// Adds `count` workers: registered as spawning, then provisioned.
    async fn add_workers(&self, count: usize) -> Result<Vec<WorkerId>, PoolError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let ids: Vec<WorkerId> = (0..count).map(|_| self.next_worker_id()).collect();
        {
            let mut state = self.state();
            for id in &ids {
                let worker = Worker::new(id.clone(), self.name(), self.kind);
                self.emit_worker(&worker, None);
                state.workers.push(worker);
            }
        }

        match self.backend.provision(self.name(), count).await {
            Ok(refs) => {
                let mut orphaned = Vec::new();
                {
                    let mut state = self.state();
                    for (id, external_ref) in ids.iter().zip(refs) {
                        match state.workers.iter_mut().find(|w| &w.id == id) {
                            Some(worker) => {
                                worker.external_ref = external_ref;
                                worker.heartbeat();
                                if let Some(from) = worker.transition(WorkerStatus::Idle) {
                                    self.emit_worker(worker, Some(from));
                                }
                            }
                            None => orphaned.push(external_ref),
                        }
                    }
                }
                for external_ref in orphaned {
                    self.backend.release(external_ref.as_deref()).await;
                }
                self.worker_available.notify_waiters();
                self.publish_gauges();
                Ok(ids)
            }
            Err(e) => {
                {
                    let mut state = self.state();
                    for worker in state.workers.iter_mut().filter(|w| ids.contains(&w.id)) {
                        if let Some(from) = worker.transition(WorkerStatus::Failed) {
                            self.emit_worker(worker, Some(from));
                        }
                    }
                    state.workers.retain(|w| !ids.contains(&w.id));
                }
                self.publish_gauges();
                Err(PoolError::Provisioning(e))
            }
        }
    }

    /// Removes up to `count` workers, idle ones first.
    ///
    /// Busy workers selected for removal become terminating and leave the pool
    /// when their task finishes.
    async fn remove_workers(&self, count: usize) {
        let released = {
            let mut state = self.state();
            let mut released = Vec::new();

            let idle: Vec<WorkerId> = state
                .workers
                .iter()
                .filter(|w| w.status() == WorkerStatus::Idle)
                .map(|w| w.id.clone())
                .take(count)
                .collect();
            for id in &idle {
                if let Some(idx) = state.workers.iter().position(|w| &w.id == id) {
                    let mut worker = state.workers.remove(idx);
                    if let Some(from) = worker.mark_terminating() {
                        self.emit_worker(&worker, Some(from));
                    }
                    released.push(worker.external_ref.take());
                }
            }

            let remaining = count - idle.len();
            for worker in state
                .workers
                .iter_mut()
                .filter(|w| w.status() == WorkerStatus::Busy)
                .take(remaining)
            {
                if let Some(from) = worker.mark_terminating() {
                    self.emit_worker(worker, Some(from));
                }
            }
            released
        };

        for external_ref in released {
            self.backend.release(external_ref.as_deref()).await;
        }
        self.publish_gauges();
    }

    /// Attempts one replacement spawn if the pool fell below its minimum.
    async fn replace_lost_workers(&self, lost: usize, reason: &str) {
        let _guard = self.scale_lock.lock().await;

        let (status, active) = {
            let state = self.state();
            (state.status, state.live_workers())
        };
        if !status.accepts_tasks() {
            debug!(pool_id = %self.name(), status = %status, "Pool not running, skipping replacement");
            return;
        }
        if active >= self.config.min_workers {
            info!(
                pool_id = %self.name(),
                lost = lost,
                active_workers = active,
                min_workers = self.config.min_workers,
                reason = reason,
                "Active workers within bounds, no replacement needed"
            );
            return;
        }

        let deficit = self.config.min_workers - active;
        warn!(
            pool_id = %self.name(),
            lost = lost,
            active_workers = active,
            min_workers = self.config.min_workers,
            replacements = deficit,
            reason = reason,
            "Active workers below minimum, attempting replacement"
        );

        match self.add_workers(deficit).await {
            Ok(ids) => info!(pool_id = %self.name(), workers = ?ids, "Replacement workers spawned"),
            Err(e) => error!(
                pool_id = %self.name(),
                error = %e,
                "Replacement spawn failed, pool is degraded"
            ),
        }
    }

    /// Marks the worker running `task_id` failed and removes it.
    async fn fail_worker(&self, worker_id: &str, task_id: TaskId, reason: &str) {
        let released = {
            let mut state = self.state();
            if let Some(abort) = state.running.remove(&task_id) {
                abort.abort();
            }
            match state
                .workers
                .iter()
                .position(|w| w.id == worker_id && w.holds(task_id))
            {
                Some(idx) => {
                    let mut worker = state.workers.remove(idx);
                    if let Some(from) = worker.transition(WorkerStatus::Failed) {
                        self.emit_worker(&worker, Some(from));
                    }
                    Some(worker.external_ref)
                }
                None => None,
            }
        };

        let Some(external_ref) = released else {
            return;
        };

        warn!(
            pool_id = %self.name(),
            worker_id = %worker_id,
            task_id = %task_id,
            reason = reason,
            "Worker failed, late result will be discarded"
        );
        self.worker_available.notify_waiters();
        self.task_finished.notify_waiters();
        self.backend.release(external_ref.as_deref()).await;
        self.publish_gauges();
        self.replace_lost_workers(1, reason).await;
    }

    /// Runs a task on its assigned worker and returns the worker to the pool.
    async fn run_on_worker(
        self: Arc<Self>,
        worker_id: WorkerId,
        external_ref: Option<String>,
        task: Task,
    ) -> Result<TaskOutput, PoolError> {
        let started = Instant::now();
        debug!(pool_id = %self.name(), worker_id = %worker_id, task_id = %task.id, "Executing task");

        let result = self.backend.run(external_ref.as_deref(), &task).await;
        let duration = started.elapsed();

        let crashed = matches!(result, Err(AdapterError::WorkerCrashed(_)));
        let mut released = None;
        let output = {
            let mut state = self.state();
            state.running.remove(&task.id);

            let Some(idx) = state
                .workers
                .iter()
                .position(|w| w.id == worker_id && w.holds(task.id))
            else {
                debug!(
                    pool_id = %self.name(),
                    worker_id = %worker_id,
                    task_id = %task.id,
                    "Discarding late result"
                );
                return Err(PoolError::Execution(AdapterError::WorkerCrashed(format!(
                    "worker {} was lost",
                    worker_id
                ))));
            };

            let output = result.map(|output| TaskOutput {
                task_id: task.id,
                pool_id: self.config.name.clone(),
                worker_id: worker_id.clone(),
                output,
                duration_ms: duration.as_millis() as u64,
                completed_at: Utc::now(),
            });

            if let Ok(ref output) = output {
                if state.results.len() >= self.config.result_buffer_limit {
                    state.results.remove(0);
                    warn!(pool_id = %self.name(), "Result buffer full, dropping oldest result");
                }
                let tags = self.config.tags.iter().cloned().collect();
                state.results.push(MemoryItem::from_output(output, tags));
            }

            let worker = &mut state.workers[idx];
            if worker.status() == WorkerStatus::Terminating {
                let worker = state.workers.remove(idx);
                self.emit_worker(&worker, Some(WorkerStatus::Terminating));
                released = Some(worker.external_ref);
            } else if crashed {
                let mut worker = state.workers.remove(idx);
                if let Some(from) = worker.transition(WorkerStatus::Failed) {
                    self.emit_worker(&worker, Some(from));
                }
                released = Some(worker.external_ref);
            } else {
                worker.heartbeat();
                if let Some(from) = worker.transition(WorkerStatus::Idle) {
                    self.emit_worker(worker, Some(from));
                }
            }
            output
        };

        self.worker_available.notify_waiters();
        self.task_finished.notify_waiters();

        let status = match &output {
            Ok(_) => "success",
            Err(AdapterError::Timeout(_)) => "timeout",
            Err(_) => "failure",
        };
        self.stats.record(output.is_ok(), duration);
        self.metrics
            .record_task(self.name(), status, duration.as_secs_f64());

        match &output {
            Ok(_) => debug!(
                pool_id = %self.name(),
                worker_id = %worker_id,
                task_id = %task.id,
                duration_ms = duration.as_millis() as u64,
                "Task completed"
            ),
            Err(e) => warn!(
                pool_id = %self.name(),
                worker_id = %worker_id,
                task_id = %task.id,
                error = %e,
                "Task failed"
            ),
        }

        if let Some(external_ref) = released {
            self.backend.release(external_ref.as_deref()).await;
        }
        self.publish_gauges();
        if crashed {
            self.replace_lost_workers(1, "worker crashed").await;
        }

        output.map_err(PoolError::Execution)
    }

    /// Fails and removes live workers whose heartbeat expired.
    async fn reap_stale_workers(&self) -> usize {
        let now = Instant::now();
        let timeout = self.config.heartbeat_timeout;

        let removed = {
            let mut state = self.state();
            let mut aborted = Vec::new();
            for worker in state.workers.iter_mut() {
                let heartbeating = matches!(worker.status(), WorkerStatus::Idle | WorkerStatus::Busy);
                if !heartbeating || !worker.heartbeat_expired(now, timeout) {
                    continue;
                }
                let task = worker.current_task();
                if let Some(from) = worker.transition(WorkerStatus::Failed) {
                    warn!(
                        pool_id = %self.config.name,
                        worker_id = %worker.id,
                        task_id = ?task,
                        "Worker missed heartbeat"
                    );
                    self.emit_worker(worker, Some(from));
                }
                if let Some(task_id) = task {
                    aborted.push(task_id);
                }
            }
            for task_id in aborted {
                if let Some(abort) = state.running.remove(&task_id) {
                    abort.abort();
                }
            }

            let mut removed = Vec::new();
            state.workers.retain(|w| {
                if w.status() == WorkerStatus::Failed {
                    removed.push(w.external_ref.clone());
                    false
                } else {
                    true
                }
            });
            removed
        };

        if removed.is_empty() {
            return 0;
        }

        let lost = removed.len();
        for external_ref in removed {
            self.backend.release(external_ref.as_deref()).await;
        }
        self.worker_available.notify_waiters();
        self.task_finished.notify_waiters();
        self.publish_gauges();
        self.replace_lost_workers(lost, "heartbeat timeout").await;
        lost
    }
}

/// Decrements the queued-task count if a waiting caller goes away.
struct QueueSlot<'a> {
    inner: &'a PoolInner,
    entered: bool,
}

impl<'a> QueueSlot<'a> {
    fn new(inner: &'a PoolInner) -> Self {
        Self {
            inner,
            entered: false,
        }
    }

    fn enter(&mut self, state: &mut PoolState) {
        if !self.entered {
            state.queued += 1;
            self.entered = true;
        }
    }

    fn leave(&mut self, state: &mut PoolState) {
        if self.entered {
            state.queued = state.queued.saturating_sub(1);
            self.entered = false;
        }
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        if self.entered {
            let mut state = self.inner.state();
            state.queued = state.queued.saturating_sub(1);
        }
    }
}

/// Handle to a task assigned to a worker.
pub struct TaskHandle {
    task_id: TaskId,
    worker_id: WorkerId,
    timeout: Duration,
    join: JoinHandle<Result<TaskOutput, PoolError>>,
    inner: Arc<PoolInner>,
}

impl TaskHandle {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Waits for the result, enforcing the task timeout.
    ///
    /// On timeout the worker is marked failed, its late result is discarded and
    /// a replacement is attempted if the pool fell below its minimum.
    pub async fn wait(self) -> Result<TaskOutput, PoolError> {
        let TaskHandle {
            task_id,
            worker_id,
            timeout,
            mut join,
            inner,
        } = self;

        match tokio::time::timeout(timeout, &mut join).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => {
                error!(pool_id = %inner.name(), worker_id = %worker_id, task_id = %task_id, "Task panicked");
                inner.fail_worker(&worker_id, task_id, "task panicked").await;
                Err(PoolError::Execution(AdapterError::WorkerCrashed(
                    "task panicked".to_string(),
                )))
            }
            Ok(Err(_)) => Err(PoolError::Execution(AdapterError::WorkerCrashed(format!(
                "task on worker {} was terminated",
                worker_id
            )))),
            Err(_) => {
                join.abort();
                inner.fail_worker(&worker_id, task_id, "task timed out").await;
                Err(PoolError::Execution(AdapterError::Timeout(timeout)))
            }
        }
    }
}

impl Pool {
    /// Validates the configuration and provisions `min_workers` workers.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid bounds and a provisioning
    /// error if the backend cannot supply the initial workers.
    pub async fn spawn(
        config: PoolConfig,
        backend: impl Into<PoolBackend>,
        events: SharedEventSink,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        let backend = backend.into();
        let kind = backend.kind();
        let min_workers = config.min_workers;

        let inner = Arc::new(PoolInner {
            kind,
            backend,
            events,
            metrics: MetricsCollector::new(),
            state: Mutex::new(PoolState {
                status: PoolStatus::Configuring,
                workers: Vec::new(),
                queued: 0,
                results: Vec::new(),
                running: HashMap::new(),
                backend_health: AdapterHealth::healthy(),
            }),
            worker_available: Notify::new(),
            task_finished: Notify::new(),
            next_worker_seq: AtomicU64::new(0),
            scale_lock: tokio::sync::Mutex::new(()),
            stats: SharedPoolStats::new(),
            monitor: Mutex::new(None),
            config,
        });

        if let Err(e) = inner.add_workers(min_workers).await {
            let mut state = inner.state();
            inner.set_status(&mut state, PoolStatus::Stopped);
            return Err(e);
        }

        let backend_health = inner.backend.health().await;
        {
            let mut state = inner.state();
            state.backend_health = backend_health;
            inner.set_status(&mut state, PoolStatus::Running);
        }

        info!(
            pool_id = %inner.name(),
            kind = %kind,
            min_workers = inner.config.min_workers,
            max_workers = inner.config.max_workers,
            "Pool spawned"
        );
        Ok(Self { inner })
    }

    pub fn id(&self) -> &str {
        &self.inner.config.name
    }

    pub fn kind(&self) -> PoolKind {
        self.inner.kind
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.inner.config.tags
    }

    pub fn status(&self) -> PoolStatus {
        self.inner.state().status
    }

    /// Snapshot of the pool's workers.
    pub fn workers(&self) -> Vec<Worker> {
        self.inner.state().workers.clone()
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats.to_pool_stats()
    }

    /// Assigns the task to a worker, waiting until one is idle.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Closed` if the pool stops accepting tasks before a
    /// worker is assigned.
    pub async fn submit(&self, task: Task) -> Result<TaskHandle, PoolError> {
        let inner = &self.inner;
        let mut slot = QueueSlot::new(inner);

        let (worker_id, external_ref) = loop {
            let notified = inner.worker_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = inner.state();
                if !state.status.accepts_tasks() {
                    slot.leave(&mut state);
                    return Err(PoolError::Closed(inner.config.name.clone()));
                }
                let assigned = state
                    .workers
                    .iter_mut()
                    .find(|w| w.status() == WorkerStatus::Idle)
                    .map(|worker| {
                        worker.assign(task.id);
                        inner.emit_worker(worker, Some(WorkerStatus::Idle));
                        (worker.id.clone(), worker.external_ref.clone())
                    });
                if let Some(assigned) = assigned {
                    slot.leave(&mut state);
                    break assigned;
                }
                slot.enter(&mut state);
            }

            inner.publish_gauges();
            debug!(pool_id = %inner.name(), task_id = %task.id, "Waiting for an idle worker");
            notified.await;
        };
        drop(slot);

        let task_id = task.id;
        let timeout = task.timeout().unwrap_or(inner.config.task_timeout);
        let join = tokio::spawn(Arc::clone(inner).run_on_worker(
            worker_id.clone(),
            external_ref,
            task,
        ));

        {
            let mut state = inner.state();
            let still_running = state.workers.iter().any(|w| w.holds(task_id));
            if still_running {
                state.running.insert(task_id, join.abort_handle());
            }
        }
        inner.publish_gauges();

        Ok(TaskHandle {
            task_id,
            worker_id,
            timeout,
            join,
            inner: Arc::clone(inner),
        })
    }

    /// Submits the task and waits for its result.
    pub async fn execute(&self, task: Task) -> Result<TaskOutput, PoolError> {
        self.submit(task).await?.wait().await
    }

    /// Adds or removes workers to reach `target`.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidScaleTarget` for targets outside
    /// `[min_workers, max_workers]` and `PoolError::NotRunning` unless running.
    pub async fn scale(&self, target: usize) -> Result<(), PoolError> {
        let inner = &self.inner;
        let (min, max) = (inner.config.min_workers, inner.config.max_workers);
        if target < min || target > max {
            return Err(PoolError::InvalidScaleTarget { target, min, max });
        }

        let _guard = inner.scale_lock.lock().await;

        let current = {
            let mut state = inner.state();
            if state.status != PoolStatus::Running {
                return Err(PoolError::NotRunning {
                    pool: inner.config.name.clone(),
                    status: state.status,
                });
            }
            inner.set_status(&mut state, PoolStatus::Scaling);
            state.live_workers()
        };

        let result = if target > current {
            inner.add_workers(target - current).await.map(|_| ())
        } else {
            if target < current {
                inner.remove_workers(current - target).await;
            }
            Ok(())
        };

        {
            let mut state = inner.state();
            if state.status == PoolStatus::Scaling {
                inner.set_status(&mut state, PoolStatus::Running);
            }
        }

        match result {
            Ok(()) => {
                info!(pool_id = %inner.name(), from = current, to = target, "Pool scaled");
                inner.events.emit(OrchestratorEvent::new(
                    EventType::PoolScaled,
                    inner.config.name.clone(),
                    json!({ "from": current, "to": target }),
                ));
                Ok(())
            }
            Err(e) => {
                warn!(pool_id = %inner.name(), from = current, to = target, error = %e, "Scaling failed");
                Err(e)
            }
        }
    }

    /// Records liveness for a worker.
    pub fn heartbeat(&self, worker_id: &str) -> Result<(), PoolError> {
        let mut state = self.inner.state();
        match state
            .workers
            .iter_mut()
            .find(|w| w.id == worker_id && w.status().is_live())
        {
            Some(worker) => {
                worker.heartbeat();
                Ok(())
            }
            None => Err(PoolError::WorkerNotFound(worker_id.to_string())),
        }
    }

    /// Fails and removes workers whose heartbeat expired; returns how many.
    pub async fn reap_stale_workers(&self) -> usize {
        self.inner.reap_stale_workers().await
    }

    /// Probes the backend, refreshes heartbeats of the workers it reports
    /// alive, then reaps the ones whose heartbeat expired; returns how many.
    pub async fn probe_workers(&self) -> usize {
        let backend_health = self.inner.backend.health().await;
        if !backend_health.healthy {
            warn!(
                pool_id = %self.id(),
                message = ?backend_health.message,
                "Backend health probe failed"
            );
        }
        let healthy = backend_health.healthy;

        let workers: Vec<(String, Option<String>)> = {
            let mut state = self.inner.state();
            state.backend_health = backend_health;
            state
                .workers
                .iter()
                .filter(|w| matches!(w.status(), WorkerStatus::Idle | WorkerStatus::Busy))
                .map(|w| (w.id.clone(), w.external_ref.clone()))
                .collect()
        };

        let live = self.inner.backend.live_workers(&workers, healthy).await;
        {
            let mut state = self.inner.state();
            for worker in state.workers.iter_mut().filter(|w| live.contains(&w.id)) {
                worker.heartbeat();
            }
        }
        self.inner.reap_stale_workers().await
    }

    /// Probes the backend and its workers, reaps stale workers and reports
    /// health.
    pub async fn health(&self) -> PoolHealth {
        self.probe_workers().await;
        self.inner.publish_gauges();
        self.health_snapshot()
    }

    /// Health from the last probe without touching the backend.
    pub fn health_snapshot(&self) -> PoolHealth {
        let state = self.inner.state();
        self.inner.health_from(&state)
    }

    /// Drains collected results (and, for delegated pools, the delegate's).
    pub async fn collect(&self) -> Vec<MemoryItem> {
        // remote first: a caller timing out must not lose the local buffer
        let remote = self.inner.backend.collect().await;
        let mut items = std::mem::take(&mut self.inner.state().results);
        items.extend(remote);
        debug!(pool_id = %self.id(), items = items.len(), "Collected results");
        items
    }

    /// Starts a background loop that probes workers every `interval`.
    ///
    /// Returns `false` if a monitor is already running.
    pub fn start_monitor(&self, interval: Duration) -> bool {
        let mut monitor = self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if monitor.is_some() {
            return false;
        }

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let pool_id = self.id().to_string();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(pool_id = %pool_id, interval_ms = interval.as_millis() as u64, "Heartbeat monitor started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let reaped = Pool { inner }.probe_workers().await;
                        if reaped > 0 {
                            debug!(pool_id = %pool_id, reaped = reaped, "Monitor reaped workers");
                        }
                    }
                }
            }

            info!(pool_id = %pool_id, "Heartbeat monitor stopped");
        });

        *monitor = Some(Monitor {
            shutdown_tx,
            handle,
        });
        true
    }

    /// Stops the heartbeat monitor, waiting for the in-flight probe.
    pub async fn stop_monitor(&self) {
        let monitor = self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(monitor) = monitor {
            let _ = monitor.shutdown_tx.send(());
            if let Err(e) = monitor.handle.await {
                error!(pool_id = %self.id(), error = %e, "Heartbeat monitor panicked");
            }
        }
    }

    /// Stops accepting tasks, drains in-flight tasks up to the grace period,
    /// then terminates and releases every worker.
    ///
    /// Closing an already closed pool is a no-op.
    pub async fn close(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.state();
            if matches!(state.status, PoolStatus::Stopping | PoolStatus::Stopped) {
                return;
            }
            inner.set_status(&mut state, PoolStatus::Stopping);
        }
        inner.worker_available.notify_waiters();
        self.stop_monitor().await;

        let _guard = inner.scale_lock.lock().await;

        let deadline = Instant::now() + inner.config.shutdown_grace;
        loop {
            let notified = inner.task_finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let busy = inner.state().busy_workers();
            if busy == 0 {
                break;
            }
            info!(pool_id = %inner.name(), busy_workers = busy, "Waiting for in-flight tasks");
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(
                    pool_id = %inner.name(),
                    busy_workers = busy,
                    "Shutdown grace period expired, terminating workers"
                );
                break;
            }
        }

        let released = {
            let mut state = inner.state();
            for (_, abort) in state.running.drain() {
                abort.abort();
            }
            let workers = std::mem::take(&mut state.workers);
            workers
                .into_iter()
                .map(|mut worker| {
                    if let Some(from) = worker.mark_terminating() {
                        inner.emit_worker(&worker, Some(from));
                    }
                    worker.external_ref
                })
                .collect::<Vec<_>>()
        };
        for external_ref in released {
            inner.backend.release(external_ref.as_deref()).await;
        }

        {
            let mut state = inner.state();
            inner.set_status(&mut state, PoolStatus::Stopped);
        }
        inner.task_finished.notify_waiters();
        inner.publish_gauges();
        info!(pool_id = %inner.name(), "Pool closed");
    }
}

//! Pool registry and routed execution.
//!
//! The [`PoolManager`] keeps pools in registration order, routes tasks to
//! healthy pools through a [`Router`], bounds cross-pool concurrency with a
//! semaphore and, when a [`DeadLetterQueue`] is attached, turns retryable
//! failures into dead-letter entries.

pub mod routing;

pub use routing::{RouteCandidate, Router, RouterError, RoutingStrategy};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::dlq::{DeadLetterQueue, DlqError, RetryError, RetryHandler, RetryPolicy};
use crate::error::{Categorize, ErrorCategory};
use crate::events::{EventType, OrchestratorEvent, SharedEventSink};
use crate::metrics::MetricsCollector;
use crate::pool::{Pool, PoolError, PoolHealth};
use crate::task::{Task, TaskId, TaskOutput};

/// Errors that can occur in manager operations.
#[derive(Debug, Clone, Error)]
pub enum ManagerError {
    /// The registry is full.
    #[error("Maximum number of pools ({0}) reached")]
    MaxPoolsReached(usize),

    /// A pool with this id is already registered.
    #[error("Pool {0} is already registered")]
    DuplicatePool(String),

    /// No pool with this id is registered.
    #[error("Pool {0} not found")]
    PoolNotFound(String),

    #[error(transparent)]
    Routing(#[from] RouterError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Dlq(#[from] DlqError),

    /// The manager has been closed.
    #[error("Pool manager is closed")]
    Closed,

    /// The operation needs an attached dead-letter queue.
    #[error("No dead-letter queue attached")]
    NoDeadLetterQueue,
}

impl Categorize for ManagerError {
    fn category(&self) -> ErrorCategory {
        match self {
            ManagerError::MaxPoolsReached(_) | ManagerError::Closed => {
                ErrorCategory::ResourceExhaustion
            }
            ManagerError::DuplicatePool(_)
            | ManagerError::PoolNotFound(_)
            | ManagerError::NoDeadLetterQueue => ErrorCategory::Configuration,
            ManagerError::Routing(e) => e.category(),
            ManagerError::Pool(e) => e.category(),
            ManagerError::Dlq(e) => e.category(),
        }
    }
}

/// Whether `submit` waits for the outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionMode {
    #[default]
    Sync,
    Async,
}

/// A task submitted through the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub task: Task,
    /// Preferred pools; ignored when none of them is healthy.
    #[serde(default)]
    pub target_pools_hint: Vec<String>,
    /// Policy for retryable failures; the queue's default when unset.
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub mode: SubmissionMode,
}

impl Submission {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            target_pools_hint: Vec::new(),
            retry_policy: None,
            max_retries: None,
            mode: SubmissionMode::Sync,
        }
    }

    pub fn with_hint(mut self, pool_id: impl Into<String>) -> Self {
        self.target_pools_hint.push(pool_id.into());
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy, max_retries: u32) -> Self {
        self.retry_policy = Some(policy);
        self.max_retries = Some(max_retries);
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.mode = SubmissionMode::Async;
        self
    }
}

/// Immediate result of `submit`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    Completed(TaskOutput),
    /// The task failed and was handed to the dead-letter queue.
    QueuedForRetry {
        task_id: TaskId,
        category: ErrorCategory,
        error: String,
    },
    /// Async mode: poll with [`PoolManager::task_state`].
    Accepted { task_id: TaskId },
}

/// Last known state of an asynchronously submitted task.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Completed(TaskOutput),
    QueuedForRetry {
        category: ErrorCategory,
        error: String,
    },
    Failed {
        category: ErrorCategory,
        error: String,
    },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of pools with routed execution.
pub struct PoolManager {
    config: ManagerConfig,
    /// Registration order is routing order.
    pools: Mutex<Vec<Pool>>,
    router: Router,
    workflows: Semaphore,
    dlq: Option<Arc<DeadLetterQueue>>,
    task_states: Mutex<HashMap<TaskId, TaskState>>,
    events: SharedEventSink,
    metrics: MetricsCollector,
    closed: AtomicBool,
}

impl PoolManager {
    pub fn new(config: ManagerConfig, events: SharedEventSink) -> Self {
        Self {
            router: Router::new(config.routing_strategy),
            workflows: Semaphore::new(config.max_concurrent_workflows),
            config,
            pools: Mutex::new(Vec::new()),
            dlq: None,
            task_states: Mutex::new(HashMap::new()),
            events,
            metrics: MetricsCollector::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Attaches the queue that receives retryable failures of `submit`.
    pub fn with_dead_letter_queue(mut self, dlq: Arc<DeadLetterQueue>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    pub fn dead_letter_queue(&self) -> Option<&Arc<DeadLetterQueue>> {
        self.dlq.as_ref()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn strategy(&self) -> RoutingStrategy {
        self.router.strategy()
    }

    fn ensure_open(&self) -> Result<(), ManagerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ManagerError::Closed);
        }
        Ok(())
    }

    /// Adds a pool at the end of the routing order.
    ///
    /// # Errors
    ///
    /// Returns `DuplicatePool` if the id is taken and `MaxPoolsReached` when
    /// the registry is full.
    pub fn register(&self, pool: Pool) -> Result<(), ManagerError> {
        self.ensure_open()?;
        let mut pools = lock(&self.pools);
        if pools.iter().any(|p| p.id() == pool.id()) {
            return Err(ManagerError::DuplicatePool(pool.id().to_string()));
        }
        if pools.len() >= self.config.max_pools {
            return Err(ManagerError::MaxPoolsReached(self.config.max_pools));
        }
        info!(pool_id = %pool.id(), kind = %pool.kind(), registered = pools.len() + 1, "Pool registered");
        pools.push(pool);
        Ok(())
    }

    /// Removes a pool from routing and hands it back; the pool keeps running.
    pub fn unregister(&self, pool_id: &str) -> Result<Pool, ManagerError> {
        let mut pools = lock(&self.pools);
        let index = pools
            .iter()
            .position(|p| p.id() == pool_id)
            .ok_or_else(|| ManagerError::PoolNotFound(pool_id.to_string()))?;
        let pool = pools.remove(index);
        info!(pool_id = %pool_id, "Pool unregistered");
        Ok(pool)
    }

    pub fn pool(&self, pool_id: &str) -> Option<Pool> {
        lock(&self.pools).iter().find(|p| p.id() == pool_id).cloned()
    }

    /// Registered pools in registration order.
    pub fn pools(&self) -> Vec<Pool> {
        lock(&self.pools).clone()
    }

    /// Starts the heartbeat monitor of every registered pool.
    pub fn start_monitors(&self) -> usize {
        let started = self
            .pools()
            .iter()
            .filter(|p| p.start_monitor(self.config.monitor_interval))
            .count();
        debug!(started = started, "Pool monitors started");
        started
    }

    /// Picks the pool for a task among those currently healthy.
    ///
    /// Pools named in `task.targets` are preferred when any of them is healthy.
    fn select_pool(&self, task: &Task) -> Result<Pool, ManagerError> {
        let healthy: Vec<(Pool, PoolHealth)> = self
            .pools()
            .into_iter()
            .map(|pool| {
                let health = pool.health_snapshot();
                (pool, health)
            })
            .filter(|(_, health)| health.is_healthy())
            .collect();

        let hinted: Vec<&(Pool, PoolHealth)> = healthy
            .iter()
            .filter(|(pool, _)| task.targets.iter().any(|t| t == pool.id()))
            .collect();
        let eligible: Vec<&(Pool, PoolHealth)> = if hinted.is_empty() {
            healthy.iter().collect()
        } else {
            hinted
        };

        let candidates: Vec<RouteCandidate> = eligible
            .iter()
            .map(|(pool, health)| RouteCandidate {
                pool_id: pool.id().to_string(),
                busy_workers: health.busy_workers,
                tags: pool.tags().clone(),
            })
            .collect();

        let index = match self.router.select(&candidates, task) {
            Ok(index) => index,
            Err(e) => {
                warn!(task_id = %task.id, registered = self.pools().len(), "No healthy pool to route to");
                return Err(e.into());
            }
        };
        let pool = eligible[index].0.clone();

        let strategy = self.router.strategy();
        self.metrics.record_routing(strategy.as_str(), pool.id());
        self.events.emit(OrchestratorEvent::new(
            EventType::TaskRouted,
            task.id.to_string(),
            json!({
                "pool_id": pool.id(),
                "strategy": strategy,
                "candidates": candidates.len(),
            }),
        ));
        debug!(task_id = %task.id, pool_id = %pool.id(), strategy = %strategy, "Task routed");
        Ok(pool)
    }

    /// Returns the id of the pool `task` would be routed to.
    pub fn route(&self, task: &Task) -> Result<String, ManagerError> {
        self.select_pool(task).map(|pool| pool.id().to_string())
    }

    /// Routes and executes a task, waiting for its output.
    pub async fn execute_routed(&self, task: Task) -> Result<TaskOutput, ManagerError> {
        self.ensure_open()?;
        let _permit = self
            .workflows
            .acquire()
            .await
            .map_err(|_| ManagerError::Closed)?;
        let pool = self.select_pool(&task)?;
        Ok(pool.execute(task).await?)
    }

    /// Probes every pool concurrently.
    pub async fn health_all(&self) -> BTreeMap<String, PoolHealth> {
        let pools = self.pools();
        join_all(pools.iter().map(|pool| pool.health()))
            .await
            .into_iter()
            .map(|health| (health.pool_id.clone(), health))
            .collect()
    }

    pub async fn scale(&self, pool_id: &str, target: usize) -> Result<(), ManagerError> {
        let pool = self
            .pool(pool_id)
            .ok_or_else(|| ManagerError::PoolNotFound(pool_id.to_string()))?;
        Ok(pool.scale(target).await?)
    }

    /// Submits a task.
    ///
    /// Retryable and permanent failures are handed to the attached
    /// dead-letter queue and acknowledged as `QueuedForRetry`; anything else
    /// is returned as an error. In async mode the task id is returned at once.
    pub async fn submit(
        self: &Arc<Self>,
        submission: Submission,
    ) -> Result<SubmissionOutcome, ManagerError> {
        self.ensure_open()?;
        let Submission {
            mut task,
            target_pools_hint,
            retry_policy,
            max_retries,
            mode,
        } = submission;
        for hint in target_pools_hint {
            if !task.targets.contains(&hint) {
                task.targets.push(hint);
            }
        }

        match mode {
            SubmissionMode::Sync => self.run_submission(task, retry_policy, max_retries).await,
            SubmissionMode::Async => {
                let task_id = task.id;
                lock(&self.task_states).insert(task_id, TaskState::Pending);

                let manager = Arc::clone(self);
                tokio::spawn(async move {
                    let state = match manager.run_submission(task, retry_policy, max_retries).await {
                        Ok(SubmissionOutcome::Completed(output)) => TaskState::Completed(output),
                        Ok(SubmissionOutcome::QueuedForRetry { category, error, .. }) => {
                            TaskState::QueuedForRetry { category, error }
                        }
                        Ok(SubmissionOutcome::Accepted { .. }) => TaskState::Pending,
                        Err(e) => TaskState::Failed {
                            category: e.category(),
                            error: e.to_string(),
                        },
                    };
                    lock(&manager.task_states).insert(task_id, state);
                });

                debug!(task_id = %task_id, "Task accepted");
                Ok(SubmissionOutcome::Accepted { task_id })
            }
        }
    }

    async fn run_submission(
        &self,
        task: Task,
        retry_policy: Option<RetryPolicy>,
        max_retries: Option<u32>,
    ) -> Result<SubmissionOutcome, ManagerError> {
        let err = match self.execute_routed(task.clone()).await {
            Ok(output) => return Ok(SubmissionOutcome::Completed(output)),
            Err(err) => err,
        };

        let category = err.category();
        let dlq = match &self.dlq {
            Some(dlq) if category.is_dead_letter() => dlq,
            _ => return Err(err),
        };

        let policy = retry_policy.unwrap_or(dlq.config().default_policy);
        let max_retries = max_retries.unwrap_or(dlq.config().default_max_retries);
        let task_id = task.id;
        let entry = dlq.enqueue(task, &err, policy, max_retries)?;
        warn!(
            task_id = %task_id,
            category = %category,
            policy = %entry.policy,
            error = %err,
            "Task failed, queued for retry"
        );

        Ok(SubmissionOutcome::QueuedForRetry {
            task_id,
            category,
            error: err.to_string(),
        })
    }

    /// State of an asynchronously submitted task.
    pub fn task_state(&self, task_id: TaskId) -> Option<TaskState> {
        lock(&self.task_states).get(&task_id).cloned()
    }

    /// Starts the attached queue's processor with this manager as handler.
    pub fn start_retry_processor(self: &Arc<Self>) -> Result<(), ManagerError> {
        let dlq = self.dlq.as_ref().ok_or(ManagerError::NoDeadLetterQueue)?;
        let handler: Arc<dyn RetryHandler> = Arc::clone(self) as Arc<dyn RetryHandler>;
        dlq.start_processor(handler, dlq.config().processor_interval)?;
        Ok(())
    }

    /// Stops routing, the retry processor and every pool.
    pub async fn close_all(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.workflows.close();

        if let Some(dlq) = &self.dlq {
            dlq.stop_processor().await;
        }

        let pools = std::mem::take(&mut *lock(&self.pools));
        info!(pools = pools.len(), "Closing all pools");
        join_all(pools.iter().map(|pool| pool.close())).await;
        info!("Pool manager closed");
    }
}

/// Retries re-enter the normal routing path.
#[async_trait]
impl RetryHandler for PoolManager {
    async fn retry(&self, task: &Task) -> Result<(), RetryError> {
        let output = self.execute_routed(task.clone()).await?;
        let mut states = lock(&self.task_states);
        if let Some(state) = states.get_mut(&task.id) {
            *state = TaskState::Completed(output);
        }
        Ok(())
    }
}

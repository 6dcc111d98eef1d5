//! Dead-letter queue with scheduled retries.
//!
//! Failed tasks are enqueued with an error, a retry policy and a retry budget.
//! A background processor wakes on a fixed interval, retries every due entry
//! once through a [`RetryHandler`], and moves entries through:
//!
//! ```text
//! pending -> retrying -> completed -> archived
//!                     -> exhausted -> archived
//! ```
//!
//! `completed` and `exhausted` are terminal; `exhausted` entries wait for an
//! operator (`retry_now` or `archive`).

mod policy;

pub use policy::{BackoffSchedule, RetryPolicy};

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DlqConfig;
use crate::error::{Categorize, ErrorCategory};
use crate::events::{EventType, OrchestratorEvent, SharedEventSink};
use crate::metrics::MetricsCollector;
use crate::task::{Task, TaskId};

/// Errors that can occur in dead-letter queue operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DlqError {
    /// No entry for this task.
    #[error("No dead-letter entry for task {0}")]
    NotFound(TaskId),

    /// The operation is not allowed in the entry's current status.
    #[error("Cannot {operation} task {task_id} in status {status}")]
    InvalidState {
        task_id: TaskId,
        status: DlqStatus,
        operation: &'static str,
    },

    /// A retry of this entry is already running.
    #[error("Task {0} is being retried")]
    InFlight(TaskId),

    /// A processor is already running.
    #[error("Retry processor already running")]
    ProcessorRunning,

    /// No retry handler has been installed.
    #[error("No retry handler installed")]
    NoHandler,

    /// Unknown retry policy name.
    #[error("Unknown retry policy: {0}")]
    UnknownPolicy(String),
}

impl Categorize for DlqError {
    fn category(&self) -> ErrorCategory {
        match self {
            DlqError::InFlight(_) => ErrorCategory::Transient,
            DlqError::NotFound(_)
            | DlqError::InvalidState { .. }
            | DlqError::ProcessorRunning
            | DlqError::NoHandler
            | DlqError::UnknownPolicy(_) => ErrorCategory::Configuration,
        }
    }
}

/// Status of a dead-letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqStatus {
    Pending,
    Retrying,
    Exhausted,
    Completed,
    Archived,
}

impl DlqStatus {
    /// Entries the processor may pick up.
    pub fn is_schedulable(self) -> bool {
        matches!(self, DlqStatus::Pending | DlqStatus::Retrying)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DlqStatus::Completed | DlqStatus::Exhausted)
    }
}

impl fmt::Display for DlqStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DlqStatus::Pending => "pending",
            DlqStatus::Retrying => "retrying",
            DlqStatus::Exhausted => "exhausted",
            DlqStatus::Completed => "completed",
            DlqStatus::Archived => "archived",
        };
        write!(f, "{}", s)
    }
}

/// Record of one retry attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 1-based retry number.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    /// Manual retries are triggered by `retry_now`.
    pub manual: bool,
}

/// A dead-lettered task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTask {
    pub task: Task,
    /// Error of the original failure.
    pub error: String,
    pub category: ErrorCategory,
    pub retry_count: u32,
    pub max_retries: u32,
    pub policy: RetryPolicy,
    pub status: DlqStatus,
    /// Set only while the entry is pending or retrying.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub failed_at: DateTime<Utc>,
    pub last_error: String,
    pub attempts: Vec<RetryAttempt>,
    #[serde(skip)]
    in_flight: bool,
}

impl FailedTask {
    pub fn task_id(&self) -> TaskId {
        self.task.id
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_schedulable()
            && !self.in_flight
            && self.next_retry_at.is_some_and(|at| at <= now)
    }
}

/// Per-status counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqStats {
    pub pending: usize,
    pub retrying: usize,
    pub exhausted: usize,
    pub completed: usize,
    pub archived: usize,
    pub in_flight: usize,
}

impl DlqStats {
    pub fn total(&self) -> usize {
        self.pending + self.retrying + self.exhausted + self.completed + self.archived
    }
}

/// Outcome of one processor cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub exhausted: usize,
}

/// Failure reported by a retry handler.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RetryError {
    pub message: String,
    pub category: ErrorCategory,
}

impl RetryError {
    pub fn new(message: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            message: message.into(),
            category,
        }
    }
}

impl<E: Categorize + fmt::Display> From<E> for RetryError {
    fn from(err: E) -> Self {
        Self {
            message: err.to_string(),
            category: err.category(),
        }
    }
}

/// Re-executes a dead-lettered task.
#[async_trait]
pub trait RetryHandler: Send + Sync {
    async fn retry(&self, task: &Task) -> Result<(), RetryError>;
}

struct Processor {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Dead-letter queue.
pub struct DeadLetterQueue {
    config: DlqConfig,
    schedule: BackoffSchedule,
    entries: Mutex<HashMap<TaskId, FailedTask>>,
    handler: Mutex<Option<Arc<dyn RetryHandler>>>,
    processor: Mutex<Option<Processor>>,
    events: SharedEventSink,
    metrics: MetricsCollector,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DeadLetterQueue {
    pub fn new(config: DlqConfig, events: SharedEventSink) -> Self {
        Self {
            schedule: config.schedule(),
            config,
            entries: Mutex::new(HashMap::new()),
            handler: Mutex::new(None),
            processor: Mutex::new(None),
            events,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn config(&self) -> &DlqConfig {
        &self.config
    }

    fn transition(&self, entry: &mut FailedTask, to: DlqStatus) {
        let from = entry.status;
        entry.status = to;
        if !to.is_schedulable() {
            entry.next_retry_at = None;
        }
        if from == to {
            return;
        }
        debug!(task_id = %entry.task.id, from = %from, to = %to, "Dead-letter entry status changed");
        self.metrics.record_dlq_transition(&to.to_string());
        self.events.emit(OrchestratorEvent::new(
            EventType::DlqStatusChanged,
            entry.task.id.to_string(),
            json!({
                "from": from,
                "to": to,
                "retry_count": entry.retry_count,
                "max_retries": entry.max_retries,
                "next_retry_at": entry.next_retry_at,
            }),
        ));
    }

    /// Adds a failed task.
    ///
    /// The error is classified now. Permanent failures and the `Never` policy
    /// go straight to `exhausted`; everything else is scheduled under `policy`.
    /// An existing entry for the same task is replaced unless it is being
    /// retried.
    pub fn enqueue<E>(
        &self,
        task: Task,
        error: &E,
        policy: RetryPolicy,
        max_retries: u32,
    ) -> Result<FailedTask, DlqError>
    where
        E: Categorize + fmt::Display + ?Sized,
    {
        let category = error.category();
        let policy = if category == ErrorCategory::Permanent {
            RetryPolicy::Never
        } else {
            policy
        };
        let now = Utc::now();
        let message = error.to_string();
        let task_id = task.id;

        let mut entries = lock(&self.entries);
        if entries.get(&task_id).is_some_and(|e| e.in_flight) {
            return Err(DlqError::InFlight(task_id));
        }

        let mut entry = FailedTask {
            task,
            error: message.clone(),
            category,
            retry_count: 0,
            max_retries,
            policy,
            status: DlqStatus::Pending,
            next_retry_at: self.schedule.next_retry_at(policy, 0, now, now),
            failed_at: now,
            last_error: message,
            attempts: Vec::new(),
            in_flight: false,
        };

        self.metrics.record_dlq_transition(&DlqStatus::Pending.to_string());
        if policy == RetryPolicy::Never || max_retries == 0 {
            self.transition(&mut entry, DlqStatus::Exhausted);
            warn!(
                task_id = %task_id,
                category = %category,
                policy = %policy,
                error = %entry.error,
                "Task dead-lettered without retries"
            );
        } else {
            info!(
                task_id = %task_id,
                category = %category,
                policy = %policy,
                max_retries = max_retries,
                next_retry_at = ?entry.next_retry_at,
                "Task dead-lettered for retry"
            );
            self.events.emit(OrchestratorEvent::new(
                EventType::DlqStatusChanged,
                task_id.to_string(),
                json!({
                    "from": null,
                    "to": DlqStatus::Pending,
                    "retry_count": 0,
                    "max_retries": max_retries,
                    "next_retry_at": entry.next_retry_at,
                }),
            ));
        }

        if entries.insert(task_id, entry.clone()).is_some() {
            warn!(task_id = %task_id, "Replaced existing dead-letter entry");
        }
        Ok(entry)
    }

    /// Entries in failure order, optionally filtered by status.
    pub fn list(&self, status: Option<DlqStatus>, limit: usize) -> Vec<FailedTask> {
        let entries = lock(&self.entries);
        let mut matching: Vec<FailedTask> = entries
            .values()
            .filter(|e| status.is_none_or(|s| e.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.failed_at.cmp(&b.failed_at).then(a.task.id.cmp(&b.task.id)));
        matching.truncate(limit);
        matching
    }

    pub fn get(&self, task_id: TaskId) -> Option<FailedTask> {
        lock(&self.entries).get(&task_id).cloned()
    }

    /// Moves a terminal entry to `archived`.
    pub fn archive(&self, task_id: TaskId) -> Result<FailedTask, DlqError> {
        let mut entries = lock(&self.entries);
        let entry = entries
            .get_mut(&task_id)
            .ok_or(DlqError::NotFound(task_id))?;
        if entry.in_flight {
            return Err(DlqError::InFlight(task_id));
        }
        if !entry.status.is_terminal() {
            return Err(DlqError::InvalidState {
                task_id,
                status: entry.status,
                operation: "archive",
            });
        }
        self.transition(entry, DlqStatus::Archived);
        info!(task_id = %task_id, "Dead-letter entry archived");
        Ok(entry.clone())
    }

    /// Deletes entries (optionally only those in `status`) and returns how many.
    /// Entries being retried are kept.
    pub fn clear(&self, status: Option<DlqStatus>) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, e| e.in_flight || status.is_some_and(|s| e.status != s));
        let removed = before - entries.len();
        info!(removed = removed, status = ?status, "Dead-letter entries cleared");
        removed
    }

    pub fn stats(&self) -> DlqStats {
        let entries = lock(&self.entries);
        let mut stats = DlqStats::default();
        for entry in entries.values() {
            match entry.status {
                DlqStatus::Pending => stats.pending += 1,
                DlqStatus::Retrying => stats.retrying += 1,
                DlqStatus::Exhausted => stats.exhausted += 1,
                DlqStatus::Completed => stats.completed += 1,
                DlqStatus::Archived => stats.archived += 1,
            }
            if entry.in_flight {
                stats.in_flight += 1;
            }
        }
        stats
    }

    /// Installs the handler used by the processor and `retry_now`.
    pub fn set_handler(&self, handler: Arc<dyn RetryHandler>) {
        *lock(&self.handler) = Some(handler);
    }

    fn current_handler(&self) -> Result<Arc<dyn RetryHandler>, DlqError> {
        lock(&self.handler).clone().ok_or(DlqError::NoHandler)
    }

    /// Runs one retry in its own task so a panicking handler only fails that entry.
    async fn run_retry(handler: Arc<dyn RetryHandler>, task: Task) -> Result<(), RetryError> {
        let task_id = task.id;
        match tokio::spawn(async move { handler.retry(&task).await }).await {
            Ok(result) => result,
            Err(join_err) => {
                error!(task_id = %task_id, error = %join_err, "Retry handler panicked");
                Err(RetryError::new(
                    format!("retry handler panicked: {}", join_err),
                    ErrorCategory::Transient,
                ))
            }
        }
    }

    /// Applies a retry outcome to an in-flight entry.
    fn finish_retry(
        &self,
        task_id: TaskId,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
        manual: bool,
        result: Result<(), RetryError>,
    ) -> Option<FailedTask> {
        let mut entries = lock(&self.entries);
        let entry = entries.get_mut(&task_id)?;
        entry.in_flight = false;
        let attempt = entry.attempts.len() as u32 + 1;

        match result {
            Ok(()) => {
                entry.attempts.push(RetryAttempt {
                    attempt,
                    started_at,
                    finished_at: Utc::now(),
                    success: true,
                    error: None,
                    manual,
                });
                self.transition(entry, DlqStatus::Completed);
                info!(task_id = %task_id, attempt = attempt, "Dead-letter retry succeeded");
            }
            Err(e) => {
                entry.attempts.push(RetryAttempt {
                    attempt,
                    started_at,
                    finished_at: Utc::now(),
                    success: false,
                    error: Some(e.message.clone()),
                    manual,
                });
                entry.retry_count += 1;
                entry.last_error = e.message.clone();

                if entry.retry_count >= entry.max_retries || e.category == ErrorCategory::Permanent {
                    self.transition(entry, DlqStatus::Exhausted);
                    warn!(
                        task_id = %task_id,
                        retry_count = entry.retry_count,
                        max_retries = entry.max_retries,
                        error = %e,
                        "Dead-letter entry exhausted"
                    );
                } else {
                    entry.next_retry_at = self.schedule.next_retry_at(
                        entry.policy,
                        entry.retry_count,
                        entry.failed_at,
                        now,
                    );
                    self.transition(entry, DlqStatus::Retrying);
                    debug!(
                        task_id = %task_id,
                        retry_count = entry.retry_count,
                        next_retry_at = ?entry.next_retry_at,
                        error = %e,
                        "Dead-letter retry failed, rescheduled"
                    );
                }
            }
        }
        Some(entry.clone())
    }

    /// Runs one processor cycle at the current time.
    pub async fn process_due(&self) -> Result<ProcessReport, DlqError> {
        self.process_due_at(Utc::now()).await
    }

    /// Runs one processor cycle as if the clock read `now`.
    ///
    /// Every due entry is retried exactly once, concurrently with the others.
    pub async fn process_due_at(&self, now: DateTime<Utc>) -> Result<ProcessReport, DlqError> {
        let handler = self.current_handler()?;

        let due: Vec<Task> = {
            let mut entries = lock(&self.entries);
            let mut due = Vec::new();
            for entry in entries.values_mut().filter(|e| e.is_due(now)) {
                entry.in_flight = true;
                self.transition(entry, DlqStatus::Retrying);
                due.push(entry.task.clone());
            }
            due
        };

        let mut report = ProcessReport {
            attempted: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(report);
        }
        debug!(due = due.len(), "Processing due dead-letter entries");

        let started_at = Utc::now();
        let retries = due.into_iter().map(|task| {
            let handler = Arc::clone(&handler);
            async move {
                let task_id = task.id;
                (task_id, Self::run_retry(handler, task).await)
            }
        });

        for (task_id, result) in join_all(retries).await {
            let success = result.is_ok();
            match self.finish_retry(task_id, started_at, now, false, result) {
                Some(entry) if success => {
                    debug_assert_eq!(entry.status, DlqStatus::Completed);
                    report.succeeded += 1;
                }
                Some(entry) => {
                    report.failed += 1;
                    if entry.status == DlqStatus::Exhausted {
                        report.exhausted += 1;
                    }
                }
                None => debug!(task_id = %task_id, "Entry removed while being retried"),
            }
        }

        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            exhausted = report.exhausted,
            "Dead-letter cycle complete"
        );
        Ok(report)
    }

    /// Retries an entry right away, outside the schedule.
    ///
    /// Allowed for pending, retrying and exhausted entries that are not
    /// already being retried.
    pub async fn retry_now(&self, task_id: TaskId) -> Result<FailedTask, DlqError> {
        let handler = self.current_handler()?;

        let task = {
            let mut entries = lock(&self.entries);
            let entry = entries
                .get_mut(&task_id)
                .ok_or(DlqError::NotFound(task_id))?;
            if entry.in_flight {
                return Err(DlqError::InFlight(task_id));
            }
            if !matches!(
                entry.status,
                DlqStatus::Pending | DlqStatus::Retrying | DlqStatus::Exhausted
            ) {
                return Err(DlqError::InvalidState {
                    task_id,
                    status: entry.status,
                    operation: "retry",
                });
            }
            if entry.status == DlqStatus::Exhausted {
                // manual intervention grants one more attempt
                entry.max_retries = entry.max_retries.max(entry.retry_count + 1);
            }
            entry.in_flight = true;
            self.transition(entry, DlqStatus::Retrying);
            entry.task.clone()
        };

        info!(task_id = %task_id, "Manual dead-letter retry");
        let started_at = Utc::now();
        let result = Self::run_retry(handler, task).await;
        self.finish_retry(task_id, started_at, Utc::now(), true, result)
            .ok_or(DlqError::NotFound(task_id))
    }

    /// Starts the background processor.
    ///
    /// # Errors
    ///
    /// Returns `DlqError::ProcessorRunning` if one is already running.
    pub fn start_processor(
        self: &Arc<Self>,
        handler: Arc<dyn RetryHandler>,
        interval: Duration,
    ) -> Result<(), DlqError> {
        let mut processor = lock(&self.processor);
        if processor.is_some() {
            return Err(DlqError::ProcessorRunning);
        }
        self.set_handler(handler);

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let weak: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(interval_ms = interval.as_millis() as u64, "Dead-letter processor started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        let Some(dlq) = weak.upgrade() else { break };
                        if let Err(e) = dlq.process_due().await {
                            warn!(error = %e, "Dead-letter cycle skipped");
                        }
                    }
                }
            }

            info!("Dead-letter processor stopped");
        });

        *processor = Some(Processor {
            shutdown_tx,
            handle,
        });
        Ok(())
    }

    /// Stops the processor, waiting for the in-flight cycle, and drops the
    /// handler it was started with.
    pub async fn stop_processor(&self) {
        let processor = lock(&self.processor).take();
        if let Some(processor) = processor {
            let _ = processor.shutdown_tx.send(());
            if let Err(e) = processor.handle.await {
                error!(error = %e, "Dead-letter processor panicked");
            }
            lock(&self.handler).take();
        }
    }

    pub fn is_processor_running(&self) -> bool {
        lock(&self.processor).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdapterError;
    use crate::events::{noop_sink, BroadcastEventSink};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Handler that fails a fixed number of times, then succeeds.
    struct FlakyHandler {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FlakyHandler {
        fn failing(times: usize) -> Arc<Self> {
            Arc::new(Self {
                failures_left: AtomicUsize::new(times),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RetryHandler for FlakyHandler {
        async fn retry(&self, _task: &Task) -> Result<(), RetryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(AdapterError::Unreachable("still down".to_string()).into());
            }
            Ok(())
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl RetryHandler for PanickingHandler {
        async fn retry(&self, task: &Task) -> Result<(), RetryError> {
            if task.payload["panic"] == true {
                panic!("handler bug");
            }
            Ok(())
        }
    }

    fn dlq() -> DeadLetterQueue {
        DeadLetterQueue::new(DlqConfig::default(), noop_sink())
    }

    fn transient() -> AdapterError {
        AdapterError::Timeout(Duration::from_secs(30))
    }

    #[test]
    fn test_never_goes_straight_to_exhausted() {
        let dlq = dlq();
        let entry = dlq
            .enqueue(Task::new(json!({})), &transient(), RetryPolicy::Never, 5)
            .unwrap();

        assert_eq!(entry.status, DlqStatus::Exhausted);
        assert_eq!(entry.next_retry_at, None);
        assert_eq!(entry.retry_count, 0);
    }

    #[test]
    fn test_permanent_error_forces_never() {
        let dlq = dlq();
        let err = AdapterError::InvalidTask("bad".to_string());
        let entry = dlq
            .enqueue(Task::new(json!({})), &err, RetryPolicy::Immediate, 5)
            .unwrap();

        assert_eq!(entry.category, ErrorCategory::Permanent);
        assert_eq!(entry.policy, RetryPolicy::Never);
        assert_eq!(entry.status, DlqStatus::Exhausted);
    }

    #[tokio::test]
    async fn test_never_is_never_scheduled() {
        let dlq = dlq();
        let handler = FlakyHandler::failing(0);
        dlq.set_handler(handler.clone());
        dlq.enqueue(Task::new(json!({})), &transient(), RetryPolicy::Never, 3)
            .unwrap();

        let far_future = Utc::now() + chrono::Duration::days(365);
        let report = dlq.process_due_at(far_future).await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_exponential_schedule_until_exhausted() {
        let dlq = dlq();
        let handler = FlakyHandler::failing(usize::MAX);
        dlq.set_handler(handler.clone());

        let entry = dlq
            .enqueue(Task::new(json!({})), &transient(), RetryPolicy::Exponential, 4)
            .unwrap();
        let task_id = entry.task_id();
        assert_eq!(
            entry.next_retry_at.unwrap() - entry.failed_at,
            chrono::Duration::minutes(1)
        );

        let mut now = entry.next_retry_at.unwrap();
        let mut deltas = Vec::new();
        for _ in 0..3 {
            dlq.process_due_at(now).await.unwrap();
            let entry = dlq.get(task_id).unwrap();
            assert_eq!(entry.status, DlqStatus::Retrying);
            let next = entry.next_retry_at.unwrap();
            deltas.push((next - now).num_minutes());
            now = next;
        }
        assert_eq!(deltas, vec![2, 4, 8]);

        let report = dlq.process_due_at(now).await.unwrap();
        assert_eq!(report.exhausted, 1);
        let entry = dlq.get(task_id).unwrap();
        assert_eq!(entry.status, DlqStatus::Exhausted);
        assert_eq!(entry.retry_count, 4);
        assert_eq!(entry.next_retry_at, None);
        assert_eq!(entry.attempts.len(), 4);

        let later = now + chrono::Duration::days(1);
        assert_eq!(dlq.process_due_at(later).await.unwrap().attempted, 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_linear_exhausts_after_three_cycles() {
        let dlq = dlq();
        dlq.set_handler(FlakyHandler::failing(usize::MAX));

        let entry = dlq
            .enqueue(Task::new(json!({})), &transient(), RetryPolicy::Linear, 3)
            .unwrap();
        let task_id = entry.task_id();

        for k in 1..=3 {
            let due = entry.failed_at + chrono::Duration::minutes(5 * k);
            let before_due = due - chrono::Duration::seconds(1);
            assert_eq!(dlq.process_due_at(before_due).await.unwrap().attempted, 0);
            assert_eq!(dlq.process_due_at(due).await.unwrap().attempted, 1);
        }

        let entry = dlq.get(task_id).unwrap();
        assert_eq!(entry.status, DlqStatus::Exhausted);
        assert_eq!(entry.retry_count, 3);
    }

    #[tokio::test]
    async fn test_success_completes_and_archives() {
        let dlq = dlq();
        dlq.set_handler(FlakyHandler::failing(1));

        let entry = dlq
            .enqueue(Task::new(json!({})), &transient(), RetryPolicy::Immediate, 3)
            .unwrap();
        let task_id = entry.task_id();

        let err = dlq.archive(task_id).unwrap_err();
        assert!(matches!(err, DlqError::InvalidState { .. }));

        let report = dlq.process_due_at(Utc::now()).await.unwrap();
        assert_eq!(report.failed, 1);
        let report = dlq.process_due_at(Utc::now()).await.unwrap();
        assert_eq!(report.succeeded, 1);

        let entry = dlq.get(task_id).unwrap();
        assert_eq!(entry.status, DlqStatus::Completed);
        assert_eq!(entry.next_retry_at, None);
        assert_eq!(entry.retry_count, 1);

        let err = dlq.retry_now(task_id).await.unwrap_err();
        assert!(matches!(err, DlqError::InvalidState { .. }));

        let archived = dlq.archive(task_id).unwrap();
        assert_eq!(archived.status, DlqStatus::Archived);
        assert_eq!(dlq.stats().archived, 1);
    }

    #[tokio::test]
    async fn test_retry_now_on_exhausted_entry() {
        let dlq = dlq();
        dlq.set_handler(FlakyHandler::failing(0));

        let entry = dlq
            .enqueue(Task::new(json!({})), &transient(), RetryPolicy::Never, 3)
            .unwrap();
        let retried = dlq.retry_now(entry.task_id()).await.unwrap();

        assert_eq!(retried.status, DlqStatus::Completed);
        assert_eq!(retried.attempts.len(), 1);
        assert!(retried.attempts[0].manual);
    }

    #[tokio::test]
    async fn test_retry_now_requires_handler() {
        let dlq = dlq();
        let entry = dlq
            .enqueue(Task::new(json!({})), &transient(), RetryPolicy::Linear, 3)
            .unwrap();
        assert_eq!(
            dlq.retry_now(entry.task_id()).await.unwrap_err(),
            DlqError::NoHandler
        );
        assert!(matches!(
            dlq.retry_now(uuid::Uuid::new_v4()).await.unwrap_err(),
            DlqError::NoHandler
        ));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let dlq = dlq();
        dlq.set_handler(Arc::new(PanickingHandler));

        let bad = dlq
            .enqueue(Task::new(json!({"panic": true})), &transient(), RetryPolicy::Immediate, 2)
            .unwrap();
        let good = dlq
            .enqueue(Task::new(json!({"panic": false})), &transient(), RetryPolicy::Immediate, 2)
            .unwrap();

        let report = dlq.process_due_at(Utc::now()).await.unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);

        let bad = dlq.get(bad.task_id()).unwrap();
        assert_eq!(bad.status, DlqStatus::Retrying);
        assert!(bad.last_error.contains("panicked"));
        assert!(!bad.is_in_flight());
        assert_eq!(dlq.get(good.task_id()).unwrap().status, DlqStatus::Completed);
    }

    #[tokio::test]
    async fn test_list_clear_and_stats() {
        let dlq = dlq();
        for policy in [RetryPolicy::Never, RetryPolicy::Linear, RetryPolicy::Exponential] {
            dlq.enqueue(Task::new(json!({})), &transient(), policy, 3)
                .unwrap();
        }

        let stats = dlq.stats();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.exhausted, 1);
        assert_eq!(stats.total(), 3);

        assert_eq!(dlq.list(None, 10).len(), 3);
        assert_eq!(dlq.list(None, 2).len(), 2);
        assert_eq!(dlq.list(Some(DlqStatus::Exhausted), 10).len(), 1);

        assert_eq!(dlq.clear(Some(DlqStatus::Exhausted)), 1);
        assert_eq!(dlq.clear(None), 2);
        assert_eq!(dlq.stats().total(), 0);
    }

    #[tokio::test]
    async fn test_status_events() {
        let sink = BroadcastEventSink::new();
        let mut rx = sink.subscribe();
        let dlq = DeadLetterQueue::new(DlqConfig::default(), Arc::new(sink));
        dlq.set_handler(FlakyHandler::failing(0));

        dlq.enqueue(Task::new(json!({})), &transient(), RetryPolicy::Immediate, 1)
            .unwrap();
        dlq.process_due_at(Utc::now()).await.unwrap();

        let mut statuses = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.event_type, EventType::DlqStatusChanged);
            statuses.push(event.payload["to"].as_str().unwrap_or_default().to_string());
        }
        assert_eq!(statuses, vec!["pending", "retrying", "completed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_processor_runs_and_stops() {
        let dlq = Arc::new(dlq());
        let handler = FlakyHandler::failing(0);

        dlq.enqueue(Task::new(json!({})), &transient(), RetryPolicy::Immediate, 3)
            .unwrap();
        dlq.start_processor(handler.clone(), Duration::from_secs(5))
            .unwrap();
        assert_eq!(
            dlq.start_processor(handler.clone(), Duration::from_secs(5)),
            Err(DlqError::ProcessorRunning)
        );

        tokio::time::sleep(Duration::from_secs(6)).await;
        dlq.stop_processor().await;

        assert!(!dlq.is_processor_running());
        assert_eq!(dlq.stats().completed, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        assert_eq!(Arc::strong_count(&handler), 1);
        let task = Task::new(json!({}));
        dlq.enqueue(task.clone(), &transient(), RetryPolicy::Immediate, 3)
            .unwrap();
        assert_eq!(dlq.retry_now(task.id).await.unwrap_err(), DlqError::NoHandler);
    }

    #[test]
    fn test_in_flight_clash_is_transient() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(DlqError::InFlight(id).category(), ErrorCategory::Transient);
        assert_eq!(DlqError::NotFound(id).category(), ErrorCategory::Configuration);
        assert_eq!(DlqError::NoHandler.category(), ErrorCategory::Configuration);
    }
}

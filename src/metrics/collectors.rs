//! High-level interface for recording orchestration metrics.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics so call sites never deal
//! with label ordering or uninitialized registries. Every method is a no-op
//! until `init_metrics()` has run.

use super::prometheus::{
    ACTIVE_WORKERS, AGGREGATOR_ITEMS_SYNCED, BUSY_WORKERS, DLQ_TRANSITIONS, QUEUED_TASKS,
    ROUTING_DECISIONS, SEARCH_CACHE, TASKS_TOTAL, TASK_DURATION,
};

/// Metrics collector for recording pool-forge operational metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a task execution.
    ///
    /// # Arguments
    ///
    /// * `pool` - Pool that executed the task
    /// * `status` - Outcome (e.g. "success", "failure", "timeout")
    /// * `duration_secs` - Execution duration in seconds
    pub fn record_task(&self, pool: &str, status: &str, duration_secs: f64) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&[pool, status]).inc();
        }

        if let Some(task_duration) = TASK_DURATION.get() {
            task_duration
                .with_label_values(&[pool])
                .observe(duration_secs);
        }

        tracing::trace!(
            pool = pool,
            status = status,
            duration_secs = duration_secs,
            "Recorded task metric"
        );
    }

    /// Update the worker gauges of a pool.
    pub fn update_pool(&self, pool: &str, active: usize, busy: usize, queued: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.with_label_values(&[pool]).set(active as f64);
        }
        if let Some(busy_workers) = BUSY_WORKERS.get() {
            busy_workers.with_label_values(&[pool]).set(busy as f64);
        }
        if let Some(queued_tasks) = QUEUED_TASKS.get() {
            queued_tasks.with_label_values(&[pool]).set(queued as f64);
        }
    }

    /// Record a routing decision.
    pub fn record_routing(&self, strategy: &str, pool: &str) {
        if let Some(routing) = ROUTING_DECISIONS.get() {
            routing.with_label_values(&[strategy, pool]).inc();
        }
    }

    /// Record a dead-letter queue transition into `status`.
    pub fn record_dlq_transition(&self, status: &str) {
        if let Some(transitions) = DLQ_TRANSITIONS.get() {
            transitions.with_label_values(&[status]).inc();
        }
    }

    /// Record items written by an aggregator sync.
    pub fn record_items_synced(&self, count: usize) {
        if let Some(synced) = AGGREGATOR_ITEMS_SYNCED.get() {
            synced.inc_by(count as u64);
        }
    }

    /// Record a search cache lookup.
    pub fn record_cache_lookup(&self, hit: bool) {
        if let Some(cache) = SEARCH_CACHE.get() {
            let result = if hit { "hit" } else { "miss" };
            cache.with_label_values(&[result]).inc();
        }
    }
}

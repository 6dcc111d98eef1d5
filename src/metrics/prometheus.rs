//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by pool-forge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all pool-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of tasks executed, labeled by pool and status.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Task execution duration in seconds, labeled by pool.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Live workers per pool.
pub static ACTIVE_WORKERS: OnceLock<GaugeVec> = OnceLock::new();

/// Workers holding a task, per pool.
pub static BUSY_WORKERS: OnceLock<GaugeVec> = OnceLock::new();

/// Tasks waiting for a worker, per pool.
pub static QUEUED_TASKS: OnceLock<GaugeVec> = OnceLock::new();

/// Routing decisions, labeled by strategy and selected pool.
pub static ROUTING_DECISIONS: OnceLock<CounterVec> = OnceLock::new();

/// Dead-letter queue status transitions, labeled by the new status.
pub static DLQ_TRANSITIONS: OnceLock<CounterVec> = OnceLock::new();

/// Items written to the durable sink by the aggregator.
pub static AGGREGATOR_ITEMS_SYNCED: OnceLock<IntCounter> = OnceLock::new();

/// Cross-pool search cache lookups, labeled by result (hit/miss).
pub static SEARCH_CACHE: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls are harmless: the first registry wins.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric creation or registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Task metrics
    let tasks_total = CounterVec::new(
        Opts::new("pool_forge_tasks_total", "Total number of tasks executed"),
        &["pool", "status"],
    )?;

    let task_duration = HistogramVec::new(
        HistogramOpts::new(
            "pool_forge_task_duration_seconds",
            "Task execution duration in seconds",
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        &["pool"],
    )?;

    // Worker metrics
    let active_workers = GaugeVec::new(
        Opts::new("pool_forge_active_workers", "Number of live workers"),
        &["pool"],
    )?;

    let busy_workers = GaugeVec::new(
        Opts::new("pool_forge_busy_workers", "Number of workers holding a task"),
        &["pool"],
    )?;

    let queued_tasks = GaugeVec::new(
        Opts::new("pool_forge_queued_tasks", "Number of tasks waiting for a worker"),
        &["pool"],
    )?;

    // Routing metrics
    let routing_decisions = CounterVec::new(
        Opts::new("pool_forge_routing_decisions_total", "Total routing decisions"),
        &["strategy", "pool"],
    )?;

    // Dead-letter queue metrics
    let dlq_transitions = CounterVec::new(
        Opts::new(
            "pool_forge_dlq_transitions_total",
            "Dead-letter queue status transitions",
        ),
        &["status"],
    )?;

    // Aggregator metrics
    let items_synced = IntCounter::new(
        "pool_forge_aggregator_items_synced_total",
        "Items written to the durable sink",
    )?;

    let search_cache = CounterVec::new(
        Opts::new(
            "pool_forge_search_cache_total",
            "Cross-pool search cache lookups",
        ),
        &["result"],
    )?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(busy_workers.clone()))?;
    registry.register(Box::new(queued_tasks.clone()))?;
    registry.register(Box::new(routing_decisions.clone()))?;
    registry.register(Box::new(dlq_transitions.clone()))?;
    registry.register(Box::new(items_synced.clone()))?;
    registry.register(Box::new(search_cache.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = BUSY_WORKERS.set(busy_workers);
    let _ = QUEUED_TASKS.set(queued_tasks);
    let _ = ROUTING_DECISIONS.set(routing_decisions);
    let _ = DLQ_TRANSITIONS.set(dlq_transitions);
    let _ = AGGREGATOR_ITEMS_SYNCED.set(items_synced);
    let _ = SEARCH_CACHE.set(search_cache);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(tasks) = TASKS_TOTAL.get() {
            tasks.with_label_values(&["export-test", "success"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.is_empty());
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("pool_forge_tasks_total"));
    }
}

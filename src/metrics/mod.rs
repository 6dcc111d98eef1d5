//! Metrics module for Prometheus-based monitoring.
//!
//! Covers task execution per pool, worker occupancy, routing decisions,
//! dead-letter queue transitions and aggregator activity.
//!
//! # Example
//!
//! ```ignore
//! use pool_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_task("local-a", "success", 0.4);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, AGGREGATOR_ITEMS_SYNCED, BUSY_WORKERS, DLQ_TRANSITIONS, QUEUED_TASKS,
    REGISTRY, ROUTING_DECISIONS, SEARCH_CACHE, TASKS_TOTAL, TASK_DURATION,
};

//! pool-forge: worker-pool orchestration with dead-letter retries and result
//! aggregation.
//!
//! Pools of local, delegated or cluster workers sit behind a [`PoolManager`]
//! that routes each task to a healthy pool. Failed tasks are parked in a
//! [`DeadLetterQueue`] and retried according to their policy, and a
//! [`MemoryAggregator`] collects results from every pool into a durable sink.

pub mod adapter;
pub mod aggregator;
pub mod cli;
pub mod config;
pub mod dlq;
pub mod error;
pub mod events;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod sinks;
pub mod task;

pub use aggregator::{MemoryAggregator, SyncReport};
pub use config::{ConfigError, OrchestratorConfig, PoolSpec, Topology};
pub use dlq::{DeadLetterQueue, DlqError, DlqStatus, FailedTask, RetryPolicy};
pub use error::{AdapterError, Categorize, ErrorCategory, SinkError};
pub use events::{EventSink, EventType, OrchestratorEvent, SharedEventSink};
pub use manager::{
    ManagerError, PoolManager, RoutingStrategy, Submission, SubmissionOutcome, TaskState,
};
pub use pool::{Pool, PoolConfig, PoolError, PoolHealth, PoolKind};
pub use task::{MemoryItem, Task, TaskId, TaskOutput};

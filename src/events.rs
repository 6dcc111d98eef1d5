//! Structured orchestration events.
//!
//! Pools, the dead-letter queue and the aggregator emit events through an
//! [`EventSink`]. Emission is fire-and-forget: a sink must never block the
//! emitting component and must never fail it.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Default capacity of the broadcast event channel.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Kind of an orchestration event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkerStateChanged,
    PoolScaled,
    PoolStatusChanged,
    TaskRouted,
    DlqStatusChanged,
    AggregatorSyncCompleted,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::WorkerStateChanged => "worker_state_changed",
            EventType::PoolScaled => "pool_scaled",
            EventType::PoolStatusChanged => "pool_status_changed",
            EventType::TaskRouted => "task_routed",
            EventType::DlqStatusChanged => "dlq_status_changed",
            EventType::AggregatorSyncCompleted => "aggregator_sync_completed",
        };
        write!(f, "{}", name)
    }
}

/// A single orchestration event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorEvent {
    pub event_type: EventType,
    /// Worker id, pool id, task id or aggregator name, depending on the type.
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl OrchestratorEvent {
    /// Creates an event stamped with the current time.
    pub fn new(
        event_type: EventType,
        entity_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            entity_id: entity_id.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Receiver of orchestration events.
pub trait EventSink: Send + Sync {
    /// Records an event. Must not block.
    fn emit(&self, event: OrchestratorEvent);
}

/// Shared event sink handle.
pub type SharedEventSink = Arc<dyn EventSink>;

/// Sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: OrchestratorEvent) {}
}

/// Sink that fans events out to any number of subscribers.
///
/// Slow subscribers lag and lose the oldest events; emitters are never held up.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl BroadcastEventSink {
    /// Creates a sink with the default channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a sink with the given channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribes to events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    /// Subscribes as a stream, for transports that forward events to clients.
    pub fn stream(&self) -> BroadcastStream<OrchestratorEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: OrchestratorEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}

/// Returns a shared no-op sink.
pub fn noop_sink() -> SharedEventSink {
    Arc::new(NoopEventSink)
}

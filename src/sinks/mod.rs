//! Destinations for aggregated pool results.
//!
//! - [`DurableSink`]: stores memory items and answers text searches
//! - [`AnalyticsSink`]: receives one summary per aggregator sync

pub mod analytics;
pub mod memory;
pub mod sqlite;

pub use analytics::TracingAnalyticsSink;
pub use memory::InMemoryDurableSink;
pub use sqlite::SqliteDurableSink;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SinkError;
use crate::task::MemoryItem;

/// Persistent store of memory items.
#[async_trait]
pub trait DurableSink: Send + Sync {
    /// Stores a batch; the batch is written entirely or not at all.
    async fn store(&self, items: &[MemoryItem]) -> Result<(), SinkError>;

    /// Items whose searchable text contains `query` (case-insensitive),
    /// newest first, at most `limit`.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryItem>, SinkError>;
}

/// Receiver of sync summaries.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn record(&self, summary: &SyncSummary) -> Result<(), SinkError>;
}

/// Aggregate record of one collect-and-sync run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub sync_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub synced_count: usize,
    pub failed_count: usize,
    pub pools_collected: usize,
    pub pools_failed: usize,
    /// Items collected per pool.
    pub items_per_pool: BTreeMap<String, usize>,
}

/// Lower-cases a search query for substring matching.
pub(crate) fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

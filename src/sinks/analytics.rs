use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::info;

use super::{AnalyticsSink, SyncSummary};
use crate::error::SinkError;

/// Logs each summary and keeps the most recent one.
#[derive(Debug, Default)]
pub struct TracingAnalyticsSink {
    last: Mutex<Option<SyncSummary>>,
}

impl TracingAnalyticsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_summary(&self) -> Option<SyncSummary> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl AnalyticsSink for TracingAnalyticsSink {
    async fn record(&self, summary: &SyncSummary) -> Result<(), SinkError> {
        let duration_ms = (summary.finished_at - summary.started_at).num_milliseconds();
        info!(
            sync_id = %summary.sync_id,
            synced = summary.synced_count,
            failed = summary.failed_count,
            pools_collected = summary.pools_collected,
            pools_failed = summary.pools_failed,
            duration_ms = duration_ms,
            "Aggregator sync summary"
        );
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(summary.clone());
        Ok(())
    }
}

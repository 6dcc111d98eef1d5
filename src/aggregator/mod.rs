//! Cross-pool result aggregation.
//!
//! The [`MemoryAggregator`] drains every registered pool's collected results,
//! writes them to a [`DurableSink`] in bounded concurrent batches, reports one
//! summary per sync to an [`AnalyticsSink`], and serves cached text searches
//! over the durable store.

pub mod cache;

pub use cache::{CacheStats, SearchCache, SearchKey};

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AggregatorConfig;
use crate::error::SinkError;
use crate::events::{EventType, OrchestratorEvent, SharedEventSink};
use crate::manager::PoolManager;
use crate::metrics::MetricsCollector;
use crate::sinks::{AnalyticsSink, DurableSink, SyncSummary};
use crate::task::MemoryItem;

/// Items from failed batches kept for the next sync; the oldest are dropped beyond this.
const BACKLOG_LIMIT: usize = 10_000;

/// Outcome of one collect-and-sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub sync_id: Uuid,
    /// Items in batches the durable sink accepted.
    pub synced_count: usize,
    /// Items in batches the durable sink rejected.
    pub failed_count: usize,
    pub pools_collected: usize,
    /// Pools whose collection timed out.
    pub pools_failed: usize,
    pub batches_ok: usize,
    pub batches_failed: usize,
}

struct SyncLoop {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MemoryAggregator {
    manager: Arc<PoolManager>,
    durable: Arc<dyn DurableSink>,
    analytics: Arc<dyn AnalyticsSink>,
    config: AggregatorConfig,
    cache: SearchCache,
    backlog: Mutex<Vec<MemoryItem>>,
    /// One sync at a time.
    sync_lock: tokio::sync::Mutex<()>,
    events: SharedEventSink,
    metrics: MetricsCollector,
    periodic: Mutex<Option<SyncLoop>>,
}

impl MemoryAggregator {
    pub fn new(
        manager: Arc<PoolManager>,
        durable: Arc<dyn DurableSink>,
        analytics: Arc<dyn AnalyticsSink>,
        config: AggregatorConfig,
        events: SharedEventSink,
    ) -> Self {
        Self {
            manager,
            durable,
            analytics,
            cache: SearchCache::new(config.cache_ttl),
            config,
            backlog: Mutex::new(Vec::new()),
            sync_lock: tokio::sync::Mutex::new(()),
            events,
            metrics: MetricsCollector::new(),
            periodic: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Items waiting to be re-sent after failed batch writes.
    pub fn backlog_len(&self) -> usize {
        lock(&self.backlog).len()
    }

    /// Collects from every registered pool and writes the results out.
    ///
    /// A pool that does not answer within the collection timeout contributes
    /// nothing. Batches rejected by the durable sink are retried on the next
    /// sync.
    pub async fn collect_and_sync(&self) -> SyncReport {
        let _sync = self.sync_lock.lock().await;
        let sync_id = Uuid::new_v4();
        let started_at = Utc::now();
        let collection_timeout = self.config.collection_timeout;

        let pools = self.manager.pools();
        let collections = join_all(pools.iter().map(|pool| async move {
            let result = tokio::time::timeout(collection_timeout, pool.collect()).await;
            (pool.id().to_string(), result)
        }))
        .await;

        let mut report = SyncReport {
            sync_id,
            ..Default::default()
        };
        let mut items = std::mem::take(&mut *lock(&self.backlog));
        let mut items_per_pool = BTreeMap::new();

        for (pool_id, result) in collections {
            match result {
                Ok(collected) => {
                    report.pools_collected += 1;
                    items_per_pool.insert(pool_id, collected.len());
                    items.extend(collected);
                }
                Err(_) => {
                    report.pools_failed += 1;
                    warn!(
                        pool_id = %pool_id,
                        timeout_ms = collection_timeout.as_millis() as u64,
                        "Pool collection timed out"
                    );
                }
            }
        }

        let failed = self.write_batches(&items, &mut report).await;
        if !failed.is_empty() {
            self.retain_backlog(failed);
        }

        self.metrics.record_items_synced(report.synced_count);

        let summary = SyncSummary {
            sync_id,
            started_at,
            finished_at: Utc::now(),
            synced_count: report.synced_count,
            failed_count: report.failed_count,
            pools_collected: report.pools_collected,
            pools_failed: report.pools_failed,
            items_per_pool,
        };
        if let Err(e) = self.analytics.record(&summary).await {
            warn!(sync_id = %sync_id, error = %e, "Failed to record sync summary");
        }

        self.events.emit(OrchestratorEvent::new(
            EventType::AggregatorSyncCompleted,
            sync_id.to_string(),
            json!({
                "synced_count": report.synced_count,
                "failed_count": report.failed_count,
                "pools_collected": report.pools_collected,
                "pools_failed": report.pools_failed,
            }),
        ));

        info!(
            sync_id = %sync_id,
            synced = report.synced_count,
            failed = report.failed_count,
            pools_collected = report.pools_collected,
            pools_failed = report.pools_failed,
            "Aggregator sync complete"
        );
        report
    }

    /// Writes `items` in batches, at most `max_in_flight_batches` at once.
    /// Returns the items of rejected batches.
    async fn write_batches(&self, items: &[MemoryItem], report: &mut SyncReport) -> Vec<MemoryItem> {
        let semaphore = Semaphore::new(self.config.max_in_flight_batches.max(1));
        let writes = items.chunks(self.config.batch_size.max(1)).map(|batch| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore.acquire().await.ok();
                (batch, self.durable.store(batch).await)
            }
        });

        let mut failed = Vec::new();
        for (batch, result) in join_all(writes).await {
            match result {
                Ok(()) => {
                    report.batches_ok += 1;
                    report.synced_count += batch.len();
                }
                Err(e) => {
                    report.batches_failed += 1;
                    report.failed_count += batch.len();
                    error!(items = batch.len(), error = %e, "Failed to store batch");
                    failed.extend_from_slice(batch);
                }
            }
        }
        debug!(ok = report.batches_ok, failed = report.batches_failed, "Batches written");
        failed
    }

    fn retain_backlog(&self, failed: Vec<MemoryItem>) {
        let mut backlog = lock(&self.backlog);
        backlog.extend(failed);
        if backlog.len() > BACKLOG_LIMIT {
            let dropped = backlog.len() - BACKLOG_LIMIT;
            backlog.drain(..dropped);
            warn!(dropped = dropped, "Sync backlog full, dropped oldest items");
        }
    }

    /// Searches the durable store, serving repeated queries from the cache.
    pub async fn cross_pool_search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryItem>, SinkError> {
        let key = SearchKey::new(query, limit);
        if let Some(results) = self.cache.get(&key) {
            self.metrics.record_cache_lookup(true);
            debug!(key = %key.as_str(), results = results.len(), "Search cache hit");
            return Ok(results);
        }

        self.metrics.record_cache_lookup(false);
        let results = self.durable.search(query, limit).await?;
        self.cache.insert(key, results.clone());
        Ok(results)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Starts syncing every `interval`. Returns `false` if already running.
    pub fn start_periodic_sync(self: &Arc<Self>, interval: Duration) -> bool {
        let mut periodic = lock(&self.periodic);
        if periodic.is_some() {
            return false;
        }

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let weak: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_ms = interval.as_millis() as u64, "Periodic sync started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        let Some(aggregator) = weak.upgrade() else { break };
                        aggregator.collect_and_sync().await;
                    }
                }
            }

            info!("Periodic sync stopped");
        });

        *periodic = Some(SyncLoop {
            shutdown_tx,
            handle,
        });
        true
    }

    /// Stops the periodic sync, waiting for a sync in progress.
    pub async fn stop_periodic_sync(&self) {
        let periodic = lock(&self.periodic).take();
        if let Some(periodic) = periodic {
            let _ = periodic.shutdown_tx.send(());
            if let Err(e) = periodic.handle.await {
                error!(error = %e, "Periodic sync task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterHealth;
    use crate::config::ManagerConfig;
    use crate::error::AdapterError;
    use crate::events::{noop_sink, BroadcastEventSink};
    use crate::pool::tests::MockAdapter;
    use crate::pool::{DelegateClient, DelegatedBackend, LocalBackend, Pool, PoolConfig};
    use crate::sinks::{InMemoryDurableSink, TracingAnalyticsSink};
    use crate::task::Task;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Delegate whose result collection never finishes in time.
    struct StalledDelegate;

    #[async_trait]
    impl DelegateClient for StalledDelegate {
        fn endpoint(&self) -> &str {
            "http://stalled"
        }

        async fn execute(&self, task: &Task) -> Result<serde_json::Value, AdapterError> {
            Ok(task.payload.clone())
        }

        async fn health(&self) -> AdapterHealth {
            AdapterHealth::healthy()
        }

        async fn collect(&self) -> Result<Vec<MemoryItem>, AdapterError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    /// Sink that rejects every other write.
    #[derive(Default)]
    struct FlakySink {
        inner: InMemoryDurableSink,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl DurableSink for FlakySink {
        async fn store(&self, items: &[MemoryItem]) -> Result<(), SinkError> {
            if self.writes.fetch_add(1, Ordering::SeqCst) % 2 == 1 {
                return Err(SinkError::Unavailable("disk full".to_string()));
            }
            self.inner.store(items).await
        }

        async fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryItem>, SinkError> {
            self.inner.search(query, limit).await
        }
    }

    async fn local_pool(name: &str, tasks: usize) -> Pool {
        let pool = Pool::spawn(
            PoolConfig::new(name, 1, 2),
            LocalBackend::new(Arc::new(MockAdapter::new())),
            noop_sink(),
        )
        .await
        .unwrap();
        for n in 0..tasks {
            pool.execute(Task::new(json!(format!("{} result {}", name, n))))
                .await
                .unwrap();
        }
        pool
    }

    fn aggregator(
        manager: Arc<PoolManager>,
        durable: Arc<dyn DurableSink>,
        config: AggregatorConfig,
    ) -> Arc<MemoryAggregator> {
        Arc::new(MemoryAggregator::new(
            manager,
            durable,
            Arc::new(TracingAnalyticsSink::new()),
            config,
            noop_sink(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_pool_contributes_nothing() {
        let manager = Arc::new(PoolManager::new(ManagerConfig::default(), noop_sink()));
        manager.register(local_pool("a", 2).await).unwrap();
        manager.register(local_pool("b", 3).await).unwrap();
        let stalled = Pool::spawn(
            PoolConfig::new("stalled", 1, 1),
            DelegatedBackend::new(Arc::new(StalledDelegate)),
            noop_sink(),
        )
        .await
        .unwrap();
        manager.register(stalled).unwrap();

        let sink = Arc::new(InMemoryDurableSink::new());
        let analytics = Arc::new(TracingAnalyticsSink::new());
        let config = AggregatorConfig {
            collection_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let aggregator = MemoryAggregator::new(
            manager,
            sink.clone(),
            analytics.clone(),
            config,
            noop_sink(),
        );

        let report = aggregator.collect_and_sync().await;
        assert_eq!(report.synced_count, 5);
        assert_eq!(report.pools_collected, 2);
        assert_eq!(report.pools_failed, 1);
        assert_eq!(sink.len(), 5);

        let summary = analytics.last_summary().unwrap();
        assert_eq!(summary.synced_count, 5);
        assert_eq!(summary.items_per_pool.get("a"), Some(&2));
        assert_eq!(summary.items_per_pool.get("b"), Some(&3));

        // results are drained by the first sync
        let report = aggregator.collect_and_sync().await;
        assert_eq!(report.synced_count, 0);
    }

    #[tokio::test]
    async fn test_items_are_batched() {
        let manager = Arc::new(PoolManager::new(ManagerConfig::default(), noop_sink()));
        manager.register(local_pool("a", 45).await).unwrap();

        let sink = Arc::new(InMemoryDurableSink::new());
        let aggregator = aggregator(manager, sink.clone(), AggregatorConfig::default());

        let report = aggregator.collect_and_sync().await;
        assert_eq!(report.synced_count, 45);
        assert_eq!(report.batches_ok, 3);
        assert_eq!(sink.store_calls(), 3);
    }

    #[tokio::test]
    async fn test_failed_batches_are_resent() {
        let manager = Arc::new(PoolManager::new(ManagerConfig::default(), noop_sink()));
        manager.register(local_pool("a", 4).await).unwrap();

        let sink = Arc::new(FlakySink::default());
        let config = AggregatorConfig {
            batch_size: 2,
            max_in_flight_batches: 1,
            ..Default::default()
        };
        let aggregator = aggregator(manager, sink.clone(), config);

        let report = aggregator.collect_and_sync().await;
        assert_eq!(report.synced_count, 2);
        assert_eq!(report.failed_count, 2);
        assert_eq!(report.batches_failed, 1);
        assert_eq!(aggregator.backlog_len(), 2);

        let report = aggregator.collect_and_sync().await;
        assert_eq!(report.synced_count, 2);
        assert_eq!(aggregator.backlog_len(), 0);
        assert_eq!(sink.inner.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_is_cached_within_ttl() {
        let manager = Arc::new(PoolManager::new(ManagerConfig::default(), noop_sink()));
        manager.register(local_pool("a", 3).await).unwrap();

        let sink = Arc::new(InMemoryDurableSink::new());
        let aggregator = aggregator(manager, sink.clone(), AggregatorConfig::default());
        aggregator.collect_and_sync().await;

        let first = aggregator.cross_pool_search("A result", 10).await.unwrap();
        let second = aggregator.cross_pool_search("  a   RESULT", 10).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
        assert_eq!(sink.search_calls(), 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        aggregator.cross_pool_search("a result", 10).await.unwrap();
        assert_eq!(sink.search_calls(), 2);

        let stats = aggregator.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sync() {
        let manager = Arc::new(PoolManager::new(ManagerConfig::default(), noop_sink()));
        let pool = local_pool("a", 1).await;
        manager.register(pool.clone()).unwrap();

        let sink = Arc::new(InMemoryDurableSink::new());
        let events = BroadcastEventSink::new();
        let mut rx = events.subscribe();
        let aggregator = Arc::new(MemoryAggregator::new(
            manager,
            sink.clone(),
            Arc::new(TracingAnalyticsSink::new()),
            AggregatorConfig::default(),
            Arc::new(events),
        ));

        assert!(aggregator.start_periodic_sync(Duration::from_secs(60)));
        assert!(!aggregator.start_periodic_sync(Duration::from_secs(60)));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(sink.len(), 1);

        pool.execute(Task::new(json!("later"))).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        aggregator.stop_periodic_sync().await;
        assert_eq!(sink.len(), 2);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, EventType::AggregatorSyncCompleted);
        assert_eq!(event.payload["synced_count"], 1);
    }
}

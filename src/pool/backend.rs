//! The closed set of execution localities behind a [`Pool`](super::Pool).

use std::collections::HashSet;

use tracing::warn;

use super::cluster::ClusterBackend;
use super::delegated::DelegatedBackend;
use super::local::LocalBackend;
use super::PoolKind;
use crate::adapter::AdapterHealth;
use crate::error::AdapterError;
use crate::task::{MemoryItem, Task};

/// Where a pool's workers execute.
#[derive(Debug)]
pub enum PoolBackend {
    Local(LocalBackend),
    Delegated(DelegatedBackend),
    Cluster(ClusterBackend),
}

impl PoolBackend {
    pub fn kind(&self) -> PoolKind {
        match self {
            PoolBackend::Local(_) => PoolKind::Local,
            PoolBackend::Delegated(_) => PoolKind::Delegated,
            PoolBackend::Cluster(_) => PoolKind::Cluster,
        }
    }

    /// Provisions `count` workers and returns their external references.
    pub(crate) async fn provision(
        &self,
        pool_id: &str,
        count: usize,
    ) -> Result<Vec<Option<String>>, AdapterError> {
        match self {
            PoolBackend::Local(_) => Ok(vec![None; count]),
            PoolBackend::Delegated(delegated) => {
                Ok(vec![Some(delegated.endpoint().to_string()); count])
            }
            PoolBackend::Cluster(cluster) => Ok(cluster
                .provision(pool_id, count)
                .await?
                .into_iter()
                .map(Some)
                .collect()),
        }
    }

    /// Releases a worker's external resources. Failures are logged.
    pub(crate) async fn release(&self, external_ref: Option<&str>) {
        if let (PoolBackend::Cluster(cluster), Some(handle)) = (self, external_ref) {
            cluster.release(handle).await;
        }
    }

    pub(crate) async fn run(
        &self,
        external_ref: Option<&str>,
        task: &Task,
    ) -> Result<serde_json::Value, AdapterError> {
        match self {
            PoolBackend::Local(local) => local.run(task).await,
            PoolBackend::Delegated(delegated) => delegated.run(task).await,
            PoolBackend::Cluster(cluster) => {
                let handle = external_ref.ok_or_else(|| {
                    AdapterError::WorkerCrashed("cluster worker has no handle".to_string())
                })?;
                cluster.run(handle, task).await
            }
        }
    }

    pub(crate) async fn health(&self) -> AdapterHealth {
        match self {
            PoolBackend::Local(local) => local.health().await,
            PoolBackend::Delegated(delegated) => delegated.health().await,
            PoolBackend::Cluster(cluster) => cluster.health().await,
        }
    }

    /// Returns which of the given workers are alive.
    ///
    /// Local and delegated workers live exactly as long as the backend is
    /// healthy; cluster workers are checked one by one.
    pub(crate) async fn live_workers(
        &self,
        workers: &[(String, Option<String>)],
        backend_healthy: bool,
    ) -> HashSet<String> {
        match self {
            PoolBackend::Local(_) | PoolBackend::Delegated(_) => {
                if backend_healthy {
                    workers.iter().map(|(id, _)| id.clone()).collect()
                } else {
                    HashSet::new()
                }
            }
            PoolBackend::Cluster(cluster) => {
                let handles: Vec<String> =
                    workers.iter().filter_map(|(_, h)| h.clone()).collect();
                let live = cluster.live_handles(&handles).await;
                workers
                    .iter()
                    .filter(|(_, h)| h.as_ref().is_some_and(|h| live.contains(h)))
                    .map(|(id, _)| id.clone())
                    .collect()
            }
        }
    }

    /// Results recorded on the backend's side.
    pub(crate) async fn collect(&self) -> Vec<MemoryItem> {
        match self {
            PoolBackend::Delegated(delegated) => match delegated.collect().await {
                Ok(items) => items,
                Err(e) => {
                    warn!(endpoint = %delegated.endpoint(), error = %e, "Failed to collect delegate results");
                    Vec::new()
                }
            },
            PoolBackend::Local(_) | PoolBackend::Cluster(_) => Vec::new(),
        }
    }
}

impl From<LocalBackend> for PoolBackend {
    fn from(backend: LocalBackend) -> Self {
        PoolBackend::Local(backend)
    }
}

impl From<DelegatedBackend> for PoolBackend {
    fn from(backend: DelegatedBackend) -> Self {
        PoolBackend::Delegated(backend)
    }
}

impl From<ClusterBackend> for PoolBackend {
    fn from(backend: ClusterBackend) -> Self {
        PoolBackend::Cluster(backend)
    }
}

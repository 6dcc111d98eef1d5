//! Cluster execution: workers are provisioned by an external scheduler.
//!
//! Provisioning is asynchronous. The backend requests a worker, then polls its
//! status until it is ready, fails, or the provisioning timeout expires.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::delegated::check_response;
use crate::adapter::AdapterHealth;
use crate::error::AdapterError;
use crate::task::Task;

/// Default interval between provisioning status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default time allowed for a worker to become ready.
pub const DEFAULT_PROVISION_TIMEOUT: Duration = Duration::from_secs(300);

/// Status of a worker as reported by the cluster scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ClusterWorkerStatus {
    Pending,
    Ready,
    Failed(String),
    Gone,
}

/// External scheduler that owns cluster worker placement.
#[async_trait]
pub trait ClusterScheduler: Send + Sync {
    /// Requests a new worker for `pool_id` and returns its handle.
    async fn request_worker(&self, pool_id: &str) -> Result<String, AdapterError>;

    async fn worker_status(&self, handle: &str) -> Result<ClusterWorkerStatus, AdapterError>;

    async fn dispatch(&self, handle: &str, task: &Task) -> Result<serde_json::Value, AdapterError>;

    async fn release_worker(&self, handle: &str) -> Result<(), AdapterError>;

    async fn health(&self) -> AdapterHealth;
}

#[derive(Debug, Deserialize)]
struct WorkerCreated {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DispatchResponse {
    output: serde_json::Value,
}

/// JSON-over-HTTP cluster scheduler.
///
/// - `POST {base}/workers` with `{"pool": ...}`, answers `{"id": ...}`
/// - `GET {base}/workers/{id}` answers `{"status": "pending" | "ready" | "failed" | "gone", "reason": ...}`
/// - `POST {base}/workers/{id}/tasks` with the task, answers `{"output": ...}`
/// - `DELETE {base}/workers/{id}`
/// - `GET {base}/health`
#[derive(Debug, Clone)]
pub struct HttpClusterScheduler {
    base_url: String,
    http_client: Client,
}

impl HttpClusterScheduler {
    pub fn new(base_url: impl Into<String>) -> Result<Self, AdapterError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| AdapterError::Failed(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl ClusterScheduler for HttpClusterScheduler {
    async fn request_worker(&self, pool_id: &str) -> Result<String, AdapterError> {
        let response = self
            .http_client
            .post(self.url("/workers"))
            .json(&json!({ "pool": pool_id }))
            .send()
            .await?;
        let created: WorkerCreated = check_response(response).await?.json().await?;
        Ok(created.id)
    }

    async fn worker_status(&self, handle: &str) -> Result<ClusterWorkerStatus, AdapterError> {
        let response = self
            .http_client
            .get(self.url(&format!("/workers/{}", handle)))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(ClusterWorkerStatus::Gone);
        }
        Ok(check_response(response).await?.json().await?)
    }

    async fn dispatch(&self, handle: &str, task: &Task) -> Result<serde_json::Value, AdapterError> {
        let response = self
            .http_client
            .post(self.url(&format!("/workers/{}/tasks", handle)))
            .json(task)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AdapterError::WorkerCrashed(format!(
                "cluster worker {} is gone",
                handle
            )));
        }
        let body: DispatchResponse = check_response(response).await?.json().await?;
        Ok(body.output)
    }

    async fn release_worker(&self, handle: &str) -> Result<(), AdapterError> {
        let response = self
            .http_client
            .delete(self.url(&format!("/workers/{}", handle)))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_response(response).await?;
        Ok(())
    }

    async fn health(&self) -> AdapterHealth {
        match self.http_client.get(self.url("/health")).send().await {
            Ok(response) => match check_response(response).await {
                Ok(_) => AdapterHealth::healthy(),
                Err(e) => AdapterHealth::unhealthy(e.to_string()),
            },
            Err(e) => AdapterHealth::unhealthy(format!("unreachable: {}", e)),
        }
    }
}

/// Backend for cluster-managed pools.
pub struct ClusterBackend {
    scheduler: Arc<dyn ClusterScheduler>,
    poll_interval: Duration,
    provision_timeout: Duration,
}

impl ClusterBackend {
    pub fn new(scheduler: Arc<dyn ClusterScheduler>) -> Self {
        Self {
            scheduler,
            poll_interval: DEFAULT_POLL_INTERVAL,
            provision_timeout: DEFAULT_PROVISION_TIMEOUT,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_provision_timeout(mut self, timeout: Duration) -> Self {
        self.provision_timeout = timeout;
        self
    }

    async fn wait_ready(&self, handle: &str) -> Result<(), AdapterError> {
        let poll = async {
            loop {
                match self.scheduler.worker_status(handle).await? {
                    ClusterWorkerStatus::Ready => return Ok(()),
                    ClusterWorkerStatus::Pending => {
                        debug!(handle = %handle, "Cluster worker still pending");
                        tokio::time::sleep(self.poll_interval).await;
                    }
                    ClusterWorkerStatus::Failed(reason) => {
                        return Err(AdapterError::WorkerCrashed(format!(
                            "provisioning of {} failed: {}",
                            handle, reason
                        )))
                    }
                    ClusterWorkerStatus::Gone => {
                        return Err(AdapterError::WorkerCrashed(format!(
                            "cluster worker {} disappeared during provisioning",
                            handle
                        )))
                    }
                }
            }
        };

        tokio::time::timeout(self.provision_timeout, poll)
            .await
            .map_err(|_| AdapterError::Timeout(self.provision_timeout))?
    }

    async fn provision_one(&self, pool_id: &str) -> Result<String, AdapterError> {
        let handle = self.scheduler.request_worker(pool_id).await?;
        if let Err(e) = self.wait_ready(&handle).await {
            if let Err(release_err) = self.scheduler.release_worker(&handle).await {
                warn!(handle = %handle, error = %release_err, "Failed to release unready cluster worker");
            }
            return Err(e);
        }
        Ok(handle)
    }

    /// Provisions `count` workers. Either all become ready or none are kept.
    pub(crate) async fn provision(
        &self,
        pool_id: &str,
        count: usize,
    ) -> Result<Vec<String>, AdapterError> {
        let results = join_all((0..count).map(|_| self.provision_one(pool_id))).await;

        let mut ready = Vec::with_capacity(count);
        let mut first_error = None;
        for result in results {
            match result {
                Ok(handle) => ready.push(handle),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            for handle in &ready {
                self.release(handle).await;
            }
            return Err(e);
        }
        Ok(ready)
    }

    pub(crate) async fn release(&self, handle: &str) {
        if let Err(e) = self.scheduler.release_worker(handle).await {
            warn!(handle = %handle, error = %e, "Failed to release cluster worker");
        }
    }

    pub(crate) async fn run(&self, handle: &str, task: &Task) -> Result<serde_json::Value, AdapterError> {
        self.scheduler.dispatch(handle, task).await
    }

    pub(crate) async fn health(&self) -> AdapterHealth {
        self.scheduler.health().await
    }

    /// Returns the handles the scheduler still reports as ready.
    pub(crate) async fn live_handles(&self, handles: &[String]) -> HashSet<String> {
        let statuses = join_all(handles.iter().map(|h| self.scheduler.worker_status(h))).await;
        handles
            .iter()
            .zip(statuses)
            .filter_map(|(handle, status)| match status {
                Ok(ClusterWorkerStatus::Ready) => Some(handle.clone()),
                _ => None,
            })
            .collect()
    }
}

impl std::fmt::Debug for ClusterBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterBackend")
            .field("poll_interval", &self.poll_interval)
            .field("provision_timeout", &self.provision_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scheduler whose workers become ready after a fixed number of polls.
    #[derive(Default)]
    struct MockScheduler {
        polls_until_ready: usize,
        fail_provisioning: bool,
        workers: Mutex<HashMap<String, usize>>,
        released: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ClusterScheduler for MockScheduler {
        async fn request_worker(&self, pool_id: &str) -> Result<String, AdapterError> {
            let mut workers = self.workers.lock().unwrap();
            let handle = format!("{}-node-{}", pool_id, workers.len());
            workers.insert(handle.clone(), 0);
            Ok(handle)
        }

        async fn worker_status(&self, handle: &str) -> Result<ClusterWorkerStatus, AdapterError> {
            if self.fail_provisioning {
                return Ok(ClusterWorkerStatus::Failed("no capacity".to_string()));
            }
            let mut workers = self.workers.lock().unwrap();
            match workers.get_mut(handle) {
                Some(polls) if *polls >= self.polls_until_ready => Ok(ClusterWorkerStatus::Ready),
                Some(polls) => {
                    *polls += 1;
                    Ok(ClusterWorkerStatus::Pending)
                }
                None => Ok(ClusterWorkerStatus::Gone),
            }
        }

        async fn dispatch(&self, handle: &str, task: &Task) -> Result<serde_json::Value, AdapterError> {
            Ok(json!({"handle": handle, "task": task.id}))
        }

        async fn release_worker(&self, handle: &str) -> Result<(), AdapterError> {
            self.workers.lock().unwrap().remove(handle);
            self.released.lock().unwrap().push(handle.to_string());
            Ok(())
        }

        async fn health(&self) -> AdapterHealth {
            AdapterHealth::healthy()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_polls_until_ready() {
        let scheduler = Arc::new(MockScheduler {
            polls_until_ready: 3,
            ..Default::default()
        });
        let backend = ClusterBackend::new(scheduler.clone())
            .with_poll_interval(Duration::from_millis(100));

        let handles = backend.provision("gpu", 2).await.expect("should provision");
        assert_eq!(handles.len(), 2);

        let live = backend.live_handles(&handles).await;
        assert_eq!(live.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_timeout_releases_worker() {
        let scheduler = Arc::new(MockScheduler {
            polls_until_ready: usize::MAX,
            ..Default::default()
        });
        let backend = ClusterBackend::new(scheduler.clone())
            .with_poll_interval(Duration::from_secs(1))
            .with_provision_timeout(Duration::from_secs(5));

        let err = backend.provision("gpu", 1).await.unwrap_err();
        assert!(matches!(err, AdapterError::Timeout(_)));
        assert_eq!(scheduler.released.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_failure_is_reported() {
        let scheduler = Arc::new(MockScheduler {
            fail_provisioning: true,
            ..Default::default()
        });
        let backend = ClusterBackend::new(scheduler.clone());

        let err = backend.provision("gpu", 2).await.unwrap_err();
        assert!(matches!(err, AdapterError::WorkerCrashed(_)));
        assert!(scheduler.workers.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_health_reaps_workers_the_scheduler_lost() {
        use crate::events::noop_sink;
        use crate::pool::{HealthStatus, Pool, PoolConfig};

        let scheduler = Arc::new(MockScheduler::default());
        let backend = ClusterBackend::new(scheduler.clone())
            .with_poll_interval(Duration::from_millis(100));
        let pool = Pool::spawn(PoolConfig::new("gpu", 2, 5), backend, noop_sink())
            .await
            .expect("pool should spawn");
        pool.scale(5).await.expect("scale");
        assert_eq!(pool.health().await.active_workers, 5);

        {
            let mut workers = scheduler.workers.lock().unwrap();
            workers.remove("gpu-node-1");
            workers.remove("gpu-node-3");
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        let health = pool.health().await;
        assert_eq!(health.active_workers, 3);
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(pool.workers().len(), 3);
    }

    #[test]
    fn test_worker_status_wire_format() {
        let status: ClusterWorkerStatus =
            serde_json::from_str(r#"{"status":"failed","reason":"evicted"}"#).expect("parse");
        assert_eq!(status, ClusterWorkerStatus::Failed("evicted".to_string()));

        let status: ClusterWorkerStatus =
            serde_json::from_str(r#"{"status":"ready"}"#).expect("parse");
        assert_eq!(status, ClusterWorkerStatus::Ready);
    }
}

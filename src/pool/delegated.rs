//! Delegated execution: workers are slots on a remote agent.
//!
//! The pool forwards every execute call to the delegate and trusts the
//! delegate's own concurrency limit; the pool's worker count only bounds how
//! many calls are in flight at once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;

use crate::adapter::AdapterHealth;
use crate::error::AdapterError;
use crate::task::{MemoryItem, Task};

/// Default request timeout for delegate calls.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Remote agent that executes tasks on behalf of a pool.
#[async_trait]
pub trait DelegateClient: Send + Sync {
    /// Endpoint or name of the delegate, recorded as the workers' external reference.
    fn endpoint(&self) -> &str;

    async fn execute(&self, task: &Task) -> Result<serde_json::Value, AdapterError>;

    async fn health(&self) -> AdapterHealth;

    /// Results the delegate recorded on its own side since the last call.
    async fn collect(&self) -> Result<Vec<MemoryItem>, AdapterError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    output: serde_json::Value,
}

/// JSON-over-HTTP delegate.
///
/// - `POST {base}/tasks` with the task, answers `{"output": ...}`
/// - `GET {base}/health` answers `{"healthy": bool, "message": ...}`
/// - `GET {base}/results` answers a list of memory items
#[derive(Debug, Clone)]
pub struct HttpDelegateClient {
    base_url: String,
    api_key: Option<String>,
    http_client: Client,
}

impl HttpDelegateClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, AdapterError> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AdapterError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdapterError::Failed(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            http_client,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http_client.request(method, &url);
        if let Some(ref api_key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }
        request
    }
}

/// Maps a non-success HTTP response onto the adapter error taxonomy.
pub(crate) async fn check_response(response: Response) -> Result<Response, AdapterError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read error response".to_string());

    Err(match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            AdapterError::InvalidTask(body)
        }
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT => {
            AdapterError::Unreachable(format!("{}: {}", status, body))
        }
        _ => AdapterError::Failed(format!("{}: {}", status, body)),
    })
}

#[async_trait]
impl DelegateClient for HttpDelegateClient {
    fn endpoint(&self) -> &str {
        &self.base_url
    }

    async fn execute(&self, task: &Task) -> Result<serde_json::Value, AdapterError> {
        let response = self
            .request(reqwest::Method::POST, "/tasks")
            .json(task)
            .send()
            .await?;
        let response = check_response(response).await?;
        let body: ExecuteResponse = response.json().await?;
        Ok(body.output)
    }

    async fn health(&self) -> AdapterHealth {
        let response = match self.request(reqwest::Method::GET, "/health").send().await {
            Ok(response) => response,
            Err(e) => return AdapterHealth::unhealthy(format!("unreachable: {}", e)),
        };
        match check_response(response).await {
            Ok(response) => response
                .json::<AdapterHealth>()
                .await
                .unwrap_or_else(|e| AdapterHealth::unhealthy(format!("bad health body: {}", e))),
            Err(e) => AdapterHealth::unhealthy(e.to_string()),
        }
    }

    async fn collect(&self) -> Result<Vec<MemoryItem>, AdapterError> {
        let response = self
            .request(reqwest::Method::GET, "/results")
            .send()
            .await?;
        let response = check_response(response).await?;
        Ok(response.json().await?)
    }
}

/// Backend for delegated pools.
pub struct DelegatedBackend {
    client: Arc<dyn DelegateClient>,
}

impl DelegatedBackend {
    pub fn new(client: Arc<dyn DelegateClient>) -> Self {
        Self { client }
    }

    pub fn endpoint(&self) -> &str {
        self.client.endpoint()
    }

    pub(crate) async fn run(&self, task: &Task) -> Result<serde_json::Value, AdapterError> {
        self.client.execute(task).await
    }

    pub(crate) async fn health(&self) -> AdapterHealth {
        self.client.health().await
    }

    pub(crate) async fn collect(&self) -> Result<Vec<MemoryItem>, AdapterError> {
        self.client.collect().await
    }
}

impl std::fmt::Debug for DelegatedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegatedBackend")
            .field("endpoint", &self.client.endpoint())
            .finish()
    }
}

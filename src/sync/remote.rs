//! Remote API contract and its HTTP implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::record::FIELD_ID;
use super::types::{EntityType, OperationType, SyncQueueItem};
use crate::error::{SyncError, SyncResult};

/// Server answer to a single push
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// 2xx, with the canonical record when the server returned one
    Accepted(Option<Value>),
    /// 409, with the server's record when the body carried one
    Conflict(Option<Value>),
}

/// One entry of a pull response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    pub entity_type: EntityType,
    pub entity_id: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub server_version: Option<u64>,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    #[serde(default)]
    changes: Vec<Value>,
}

/// What the orchestrator needs from the server
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Transmit one queued mutation
    async fn push(&self, item: &SyncQueueItem) -> SyncResult<PushOutcome>;

    /// Authoritative server state of an entity, `None` if it does not exist
    async fn fetch(&self, entity_type: EntityType, id: &str) -> SyncResult<Option<Value>>;

    /// Changes newer than `since`, or everything when `since` is `None`
    async fn pull(&self, since: Option<DateTime<Utc>>) -> SyncResult<Vec<RemoteChange>>;
}

/// Source of the bearer token attached to requests
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Option<String>;
}

/// Fixed token (or none)
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.is_empty()))
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// `reqwest`-backed [`RemoteApi`]
pub struct HttpRemote {
    base_url: String,
    client: Client,
    tokens: Box<dyn TokenProvider>,
}

impl HttpRemote {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        tokens: Box<dyn TokenProvider>,
    ) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            tokens,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `true` when `GET /health` answers with a success status
    pub async fn health(&self) -> bool {
        match self.request(Method::GET, "/health").await.send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Health check failed: {}", e);
                false
            }
        }
    }

    async fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.request(method, url);
        if let Some(token) = self.tokens.token().await {
            request = request.bearer_auth(token);
        }
        request
    }
}

/// HTTP method and path for a queued mutation
pub fn route(item: &SyncQueueItem) -> (Method, String) {
    let collection = item.entity_type.collection();
    match item.operation_type {
        OperationType::Create => (Method::POST, format!("/{}", collection)),
        OperationType::Update => (Method::PUT, format!("/{}/{}", collection, item.entity_id)),
        OperationType::Delete => (
            Method::DELETE,
            format!("/{}/{}", collection, item.entity_id),
        ),
        OperationType::AiProcess => (
            Method::POST,
            format!("/{}/{}/ai-process", collection, item.entity_id),
        ),
    }
}

fn push_body(item: &SyncQueueItem) -> Option<Value> {
    if item.operation_type == OperationType::Delete {
        return None;
    }
    let mut body = item.payload.clone().unwrap_or_default();
    body.entry(FIELD_ID.to_string())
        .or_insert_with(|| Value::String(item.entity_id.clone()));
    Some(Value::Object(body))
}

async fn json_body(response: Response) -> Option<Value> {
    let text = response.text().await.ok()?;
    if text.trim().is_empty() {
        return None;
    }
    serde_json::from_str(&text).ok()
}

fn retry_after(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

async fn error_for(response: Response) -> SyncError {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return SyncError::RateLimited {
            retry_after: retry_after(&response),
        };
    }
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    SyncError::http(status.as_u16(), message)
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn push(&self, item: &SyncQueueItem) -> SyncResult<PushOutcome> {
        let (method, path) = route(item);
        debug!(
            entity_type = %item.entity_type,
            entity_id = %item.entity_id,
            "{} {}",
            method,
            path
        );

        let mut request = self.request(method, &path).await;
        if let Some(body) = push_body(item) {
            request = request.json(&body);
        }
        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(PushOutcome::Accepted(json_body(response).await));
        }
        if status == StatusCode::CONFLICT {
            return Ok(PushOutcome::Conflict(json_body(response).await));
        }
        if status == StatusCode::NOT_FOUND && item.operation_type == OperationType::Delete {
            debug!(entity_id = %item.entity_id, "Delete target already gone");
            return Ok(PushOutcome::Accepted(None));
        }
        Err(error_for(response).await)
    }

    async fn fetch(&self, entity_type: EntityType, id: &str) -> SyncResult<Option<Value>> {
        let path = format!("/{}/{}", entity_type.collection(), id);
        let response = self.request(Method::GET, &path).await.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(error_for(response).await);
        }
        Ok(json_body(response).await)
    }

    async fn pull(&self, since: Option<DateTime<Utc>>) -> SyncResult<Vec<RemoteChange>> {
        let mut request = self.request(Method::GET, "/sync/pull").await;
        if let Some(since) = since {
            request = request.query(&[("since", since.to_rfc3339())]);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(error_for(response).await);
        }

        let body: PullResponse = response.json().await?;
        let mut changes = Vec::with_capacity(body.changes.len());
        for raw in body.changes {
            match serde_json::from_value::<RemoteChange>(raw) {
                Ok(change) => changes.push(change),
                Err(e) => warn!("Skipping malformed remote change: {}", e),
            }
        }
        Ok(changes)
    }
}

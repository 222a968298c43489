//! Sync API Client - HTTP communication with the ingestion server
//!
//! Handles all REST API calls made by the kiosk:
//! - Batch upload of access and audit records
//! - Entity operations from the pending-operations queue
//! - Incremental reads of already ingested records
//!
//! Every call carries `Authorization: Bearer` and `X-Tenant-ID` taken from
//! the session that woke the controller; the client itself holds no session.

use super::models::{EventRecord, IngestedRecord, RecordOutcome, RecordQuery, RecordStream, WakeSignal, WireRecord};
use super::queue::{OperationKind, PendingOperation};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use std::time::Duration;
use url::Url;

/// Header carrying the tenant partition key
pub const TENANT_HEADER: &str = "X-Tenant-ID";

/// Header carrying the client-generated key of an entity operation
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Ships bounded batches to the ingestion endpoint
#[async_trait]
pub trait BatchUploader: Send + Sync {
    /// Upload one batch and return the per-record outcomes reported by the server
    async fn upload_batch(
        &self,
        stream: RecordStream,
        records: &[EventRecord],
        credentials: &WakeSignal,
    ) -> Result<Vec<RecordOutcome>, SyncApiError>;

    /// Push one queued entity operation
    async fn push_operation(
        &self,
        operation: &PendingOperation,
        credentials: &WakeSignal,
    ) -> Result<(), SyncApiError>;
}

/// API client for the ingestion server
pub struct SyncApiClient {
    client: Client,
    base_url: String,
}

impl SyncApiClient {
    /// Create new API client with the default timeout
    pub fn new(base_url: &str) -> Result<Self, SyncApiError> {
        Self::with_timeout(base_url, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Create new API client with an explicit request timeout
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, SyncApiError> {
        let parsed = Url::parse(base_url)
            .map_err(|e| SyncApiError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if parsed.cannot_be_a_base() {
            return Err(SyncApiError::InvalidUrl(base_url.to_string()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("acesso-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder, credentials: &WakeSignal) -> RequestBuilder {
        request
            .bearer_auth(&credentials.auth_credential)
            .header(TENANT_HEADER, &credentials.tenant_id)
    }

    /// Read ingested access records of the session tenant
    pub async fn list_access(
        &self,
        query: &RecordQuery,
        credentials: &WakeSignal,
    ) -> Result<Vec<IngestedRecord>, SyncApiError> {
        self.list(RecordStream::Access, query, credentials).await
    }

    /// Read ingested audit records of the session tenant
    pub async fn list_audit(
        &self,
        since: Option<chrono::DateTime<chrono::Utc>>,
        credentials: &WakeSignal,
    ) -> Result<Vec<IngestedRecord>, SyncApiError> {
        let query = RecordQuery {
            since,
            ..RecordQuery::default()
        };
        self.list(RecordStream::Audit, &query, credentials).await
    }

    async fn list(
        &self,
        stream: RecordStream,
        query: &RecordQuery,
        credentials: &WakeSignal,
    ) -> Result<Vec<IngestedRecord>, SyncApiError> {
        let request = self.client.get(self.url(stream.endpoint())).query(query);

        let response = self.authorized(request, credentials).send().await?;

        handle_response(response).await
    }
}

#[async_trait]
impl BatchUploader for SyncApiClient {
    async fn upload_batch(
        &self,
        stream: RecordStream,
        records: &[EventRecord],
        credentials: &WakeSignal,
    ) -> Result<Vec<RecordOutcome>, SyncApiError> {
        let body: Vec<WireRecord> = records.iter().map(EventRecord::to_wire).collect();

        log::debug!(
            "Uploading {} {} records for tenant {}",
            body.len(),
            stream,
            credentials.tenant_id
        );

        let request = self.client.post(self.url(stream.endpoint())).json(&body);

        let response = self.authorized(request, credentials).send().await?;

        handle_response(response).await
    }

    async fn push_operation(
        &self,
        operation: &PendingOperation,
        credentials: &WakeSignal,
    ) -> Result<(), SyncApiError> {
        let url = self.url(&format!("/{}/{}", operation.entity.path(), operation.entity_id));

        let request = match operation.operation {
            OperationKind::Upsert => self
                .client
                .put(url)
                .json(operation.payload.as_ref().unwrap_or(&serde_json::Value::Null)),
            OperationKind::Delete => self.client.delete(url),
        };

        let response = self
            .authorized(request, credentials)
            .header(IDEMPOTENCY_HEADER, &operation.operation_id)
            .send()
            .await?;

        // Deleting something already gone is success
        if response.status().is_success()
            || (operation.operation == OperationKind::Delete && response.status() == StatusCode::NOT_FOUND)
        {
            Ok(())
        } else {
            Err(handle_error(response).await)
        }
    }
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("Unauthorized - invalid or missing token")]
    Unauthorized,

    #[error("Forbidden - token not valid for tenant")]
    Forbidden,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Batch too large")]
    PayloadTooLarge,

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid response from server")]
    InvalidResponse,
}

/// Handle successful JSON response
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, SyncApiError> {
    let status = response.status();

    if status.is_success() {
        response.json::<T>().await
            .map_err(|_| SyncApiError::InvalidResponse)
    } else {
        Err(handle_error(response).await)
    }
}

/// Convert error response to SyncApiError
async fn handle_error(response: reqwest::Response) -> SyncApiError {
    let status = response.status();

    match status {
        StatusCode::UNAUTHORIZED => SyncApiError::Unauthorized,
        StatusCode::FORBIDDEN => SyncApiError::Forbidden,
        StatusCode::PAYLOAD_TOO_LARGE => SyncApiError::PayloadTooLarge,
        StatusCode::TOO_MANY_REQUESTS => SyncApiError::RateLimitExceeded,
        StatusCode::BAD_REQUEST => SyncApiError::BadRequest(error_message(response).await),
        s if s.is_server_error() => SyncApiError::ServerError(error_message(response).await),
        _ => {
            let msg = error_message(response).await;
            SyncApiError::NetworkError(format!("{}: {}", status, msg))
        }
    }
}

/// Prefer the `erro` field of a JSON error body, fall back to raw text
async fn error_message(response: reqwest::Response) -> String {
    let text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
    serde_json::from_str::<ErrorResponse>(&text)
        .map(|body| body.erro)
        .unwrap_or(text)
}

#[derive(Debug, Clone, serde::Deserialize)]
struct ErrorResponse {
    erro: String,
}

// ============================================================================
// Tests
// ============================================================================

//! Route handlers of the ingestion server

use super::auth::Authenticated;
use super::error::ApiError;
use super::ingest::IngestItem;
use super::AppState;
use crate::sync::models::{IngestedRecord, RecordOutcome, RecordQuery, RecordStream};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::Json;

/// Largest batch accepted in one request
pub const MAX_INGEST_BATCH: usize = 500;

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn ingest_access(
    State(state): State<AppState>,
    auth: Authenticated,
    body: Result<Json<Vec<serde_json::Value>>, JsonRejection>,
) -> Result<Json<Vec<RecordOutcome>>, ApiError> {
    ingest(state, auth, RecordStream::Access, body).await
}

pub async fn ingest_audit(
    State(state): State<AppState>,
    auth: Authenticated,
    body: Result<Json<Vec<serde_json::Value>>, JsonRejection>,
) -> Result<Json<Vec<RecordOutcome>>, ApiError> {
    ingest(state, auth, RecordStream::Audit, body).await
}

pub async fn list_access(
    State(state): State<AppState>,
    auth: Authenticated,
    query: Result<Query<RecordQuery>, QueryRejection>,
) -> Result<Json<Vec<IngestedRecord>>, ApiError> {
    list(state, auth, RecordStream::Access, query).await
}

pub async fn list_audit(
    State(state): State<AppState>,
    auth: Authenticated,
    query: Result<Query<RecordQuery>, QueryRejection>,
) -> Result<Json<Vec<IngestedRecord>>, ApiError> {
    list(state, auth, RecordStream::Audit, query).await
}

async fn ingest(
    state: AppState,
    auth: Authenticated,
    stream: RecordStream,
    body: Result<Json<Vec<serde_json::Value>>, JsonRejection>,
) -> Result<Json<Vec<RecordOutcome>>, ApiError> {
    let Json(values) = body.map_err(|e| ApiError::InvalidBody(e.body_text()))?;

    if values.len() > MAX_INGEST_BATCH {
        return Err(ApiError::BatchTooLarge(MAX_INGEST_BATCH));
    }

    let items: Vec<IngestItem> = values.into_iter().map(IngestItem::decode).collect();

    let store = state.store.clone();
    let outcomes = tokio::task::spawn_blocking(move || store.ingest(stream, &auth.tenant_id, &items))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(outcomes))
}

async fn list(
    state: AppState,
    auth: Authenticated,
    stream: RecordStream,
    query: Result<Query<RecordQuery>, QueryRejection>,
) -> Result<Json<Vec<IngestedRecord>>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::InvalidQuery(e.body_text()))?;

    let store = state.store.clone();
    let records = tokio::task::spawn_blocking(move || store.list(stream, &auth.tenant_id, &query))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(records))
}

//! Ingestion Server - idempotent endpoint for kiosk uploads
//!
//! Routes:
//! - POST /acessos, POST /auditoria - insert-if-absent, per-record outcomes
//! - GET /acessos, GET /auditoria - tenant-scoped reads, newest first
//! - GET /health - connectivity probe

pub mod auth;
pub mod error;
pub mod handlers;
pub mod ingest;

use crate::config::{ConfigError, ServerConfig};
use crate::db::{Database, DbError};
use auth::{FailedAuthLimiter, StaticTokenVerifier, TokenVerifier};
use axum::routing::get;
use axum::Router;
use ingest::{IngestError, IngestStore};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Shared server state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<IngestStore>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub limiter: Arc<FailedAuthLimiter>,
}

impl AppState {
    pub fn new(store: Arc<IngestStore>, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            store,
            verifier,
            limiter: Arc::new(FailedAuthLimiter::default()),
        }
    }
}

/// Build the router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/acessos", get(handlers::list_access).post(handlers::ingest_access))
        .route("/auditoria", get(handlers::list_audit).post(handlers::ingest_audit))
        .with_state(state)
}

/// Serve on an already bound listener until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        log::info!("Ingestion server listening on {}", addr);
    }

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    log::info!("Ingestion server stopped");
    Ok(())
}

/// Open storage, bind and serve with the given configuration
pub async fn run<F>(config: &ServerConfig, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let verifier = StaticTokenVerifier::parse(&config.api_tokens)?;
    if verifier.is_empty() {
        log::warn!("No API tokens configured, every upload will be rejected");
    }

    let db = Arc::new(Database::new(config.db_path.clone())?);
    let store = Arc::new(IngestStore::new(db)?);
    let state = AppState::new(store, Arc::new(verifier));

    let listener = TcpListener::bind(&config.bind_addr).await?;
    serve(listener, state, shutdown).await
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Ingest store error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use auth::TenantScope;
    use reqwest::StatusCode;
    use std::collections::HashSet;

    async fn spawn_server() -> (String, Arc<IngestStore>, tokio::sync::oneshot::Sender<()>) {
        let db = Arc::new(Database::in_memory().unwrap());
        let store = Arc::new(IngestStore::new(db).unwrap());
        let verifier = StaticTokenVerifier::new()
            .grant("tok-t1", TenantScope::Only(HashSet::from(["t1".to_string()])))
            .grant("tok-admin", TenantScope::Any);
        let state = AppState::new(store.clone(), Arc::new(verifier));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(serve(listener, state, async {
            rx.await.ok();
        }));

        (url, store, tx)
    }

    fn record(id: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "referencia": "aluno-1",
            "tipo": "ENTRADA",
            "timestamp": "2026-03-01T10:00:00.000Z"
        })
    }

    #[tokio::test]
    async fn test_health() {
        let (url, _store, _shutdown) = spawn_server().await;
        let response = reqwest::get(format!("{url}/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_tenant_is_bad_request() {
        let (url, _store, _shutdown) = spawn_server().await;
        let response = reqwest::Client::new()
            .post(format!("{url}/acessos"))
            .bearer_auth("tok-t1")
            .json(&vec![record("a")])
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = response.json().await.unwrap();
        assert!(body["erro"].as_str().unwrap().contains("X-Tenant-ID"));
    }

    #[tokio::test]
    async fn test_auth_failures() {
        let (url, store, _shutdown) = spawn_server().await;
        let client = reqwest::Client::new();

        let missing = client
            .post(format!("{url}/acessos"))
            .header("X-Tenant-ID", "t1")
            .json(&vec![record("a")])
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let invalid = client
            .post(format!("{url}/acessos"))
            .header("X-Tenant-ID", "t1")
            .bearer_auth("wrong")
            .json(&vec![record("a")])
            .send()
            .await
            .unwrap();
        assert_eq!(invalid.status(), StatusCode::UNAUTHORIZED);

        let forbidden = client
            .post(format!("{url}/acessos"))
            .header("X-Tenant-ID", "t2")
            .bearer_auth("tok-t1")
            .json(&vec![record("a")])
            .send()
            .await
            .unwrap();
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

        assert_eq!(store.count(crate::sync::RecordStream::Access, "t1").unwrap(), 0);
        assert_eq!(store.count(crate::sync::RecordStream::Access, "t2").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ingest_reports_per_record_outcomes() {
        let (url, _store, _shutdown) = spawn_server().await;

        let response = reqwest::Client::new()
            .post(format!("{url}/acessos"))
            .header("X-Tenant-ID", "t1")
            .bearer_auth("tok-t1")
            .json(&vec![record("a"), serde_json::json!({"id": "b"}), record("c")])
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let outcomes: serde_json::Value = response.json().await.unwrap();
        assert_eq!(outcomes[0], serde_json::json!({"id": "a", "status": "sincronizado"}));
        assert_eq!(outcomes[1]["id"], "b");
        assert_eq!(outcomes[1]["status"], "erro");
        assert!(outcomes[1]["erro"].is_string());
        assert_eq!(outcomes[2]["status"], "sincronizado");
    }

    #[tokio::test]
    async fn test_oversized_batch_is_rejected() {
        let (url, _store, _shutdown) = spawn_server().await;
        let batch: Vec<_> = (0..501).map(|i| record(&format!("r{i}"))).collect();

        let response = reqwest::Client::new()
            .post(format!("{url}/acessos"))
            .header("X-Tenant-ID", "t1")
            .bearer_auth("tok-t1")
            .json(&batch)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_read_side_query_params() {
        let (url, _store, _shutdown) = spawn_server().await;
        let client = reqwest::Client::new();

        client
            .post(format!("{url}/acessos"))
            .header("X-Tenant-ID", "t1")
            .bearer_auth("tok-t1")
            .json(&vec![record("a"), record("b")])
            .send()
            .await
            .unwrap();

        let listed: Vec<crate::sync::IngestedRecord> = client
            .get(format!("{url}/acessos?data=2026-03-01&limite=1"))
            .header("X-Tenant-ID", "t1")
            .bearer_auth("tok-t1")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);

        let bad = client
            .get(format!("{url}/acessos?data=ontem"))
            .header("X-Tenant-ID", "t1")
            .bearer_auth("tok-t1")
            .send()
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }
}

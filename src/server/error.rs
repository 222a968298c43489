//! HTTP error responses of the ingestion server
//!
//! Every error renders as `{"erro": "..."}` with the matching status code.

use super::ingest::IngestError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("cabecalho X-Tenant-ID ausente")]
    MissingTenant,

    #[error("X-Tenant-ID invalido")]
    InvalidTenant,

    #[error("token de acesso ausente")]
    MissingToken,

    #[error("token de acesso invalido")]
    InvalidToken,

    #[error("token sem acesso ao tenant {0}")]
    TenantForbidden(String),

    #[error("muitas tentativas, aguarde {0} segundos")]
    TooManyAttempts(u64),

    #[error("lote excede o limite de {0} registros")]
    BatchTooLarge(usize),

    #[error("corpo invalido: {0}")]
    InvalidBody(String),

    #[error("parametro invalido: {0}")]
    InvalidQuery(String),

    #[error("erro interno")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingTenant | Self::InvalidTenant | Self::InvalidBody(_) | Self::InvalidQuery(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::MissingToken | Self::InvalidToken => StatusCode::UNAUTHORIZED,
            Self::TenantForbidden(_) => StatusCode::FORBIDDEN,
            Self::TooManyAttempts(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::BatchTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(detail) = &self {
            log::error!("Internal server error: {}", detail);
        }
        let body = serde_json::json!({ "erro": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::InvalidQuery(detail) => ApiError::InvalidQuery(detail),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::MissingTenant.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::InvalidToken.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::TenantForbidden("t1".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::BatchTooLarge(500).status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn test_internal_detail_is_not_exposed() {
        let err = ApiError::Internal("disk I/O error at /var/lib".into());
        assert_eq!(err.to_string(), "erro interno");
    }
}

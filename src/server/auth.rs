//! Request authentication for the ingestion server
//!
//! Tenant and bearer token are checked before any handler runs. The tenant
//! comes only from `X-Tenant-ID`; there is no default tenant.

use super::error::ApiError;
use super::AppState;
use crate::config::ConfigError;
use async_trait::async_trait;
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use regex_lite::Regex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const TENANT_HEADER: &str = "x-tenant-id";

lazy_static::lazy_static! {
    /// Tenant ids: 1-64 chars, alphanumeric start, then alphanumerics, `_`, `-` or `.`
    static ref TENANT_PATTERN: Option<Regex> =
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]{0,63}$").ok();
}

pub fn is_valid_tenant(tenant_id: &str) -> bool {
    TENANT_PATTERN
        .as_ref()
        .map_or(false, |pattern| pattern.is_match(tenant_id))
}

// ============================================================================
// Token verification
// ============================================================================

/// Tenants a token may act for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantScope {
    Any,
    Only(HashSet<String>),
}

impl TenantScope {
    pub fn allows(&self, tenant_id: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Only(tenants) => tenants.contains(tenant_id),
        }
    }
}

/// Validates bearer tokens. Identity-provider verification plugs in here.
pub trait TokenVerifier: Send + Sync {
    /// Scope granted to `token`, or `None` if the token is not valid
    fn verify(&self, token: &str) -> Option<TenantScope>;
}

/// Fixed token table, keyed by SHA-256 of the token
#[derive(Debug, Default)]
pub struct StaticTokenVerifier {
    grants: HashMap<String, TenantScope>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, token: &str, scope: TenantScope) -> Self {
        self.grants.insert(token_digest(token), scope);
        self
    }

    /// Parse `token=tenantA,tenantB;token2=*`
    pub fn parse(tokens: &str) -> Result<Self, ConfigError> {
        let mut verifier = Self::new();

        for entry in tokens.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (token, tenants) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::Invalid("ACESSO_API_TOKENS".into(), "esperado token=tenants".into()))?;

            let token = token.trim();
            if token.is_empty() {
                return Err(ConfigError::Invalid("ACESSO_API_TOKENS".into(), "token vazio".into()));
            }

            let scope = if tenants.trim() == "*" {
                TenantScope::Any
            } else {
                let set: HashSet<String> = tenants
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect();
                if let Some(bad) = set.iter().find(|t| !is_valid_tenant(t)) {
                    return Err(ConfigError::Invalid(
                        "ACESSO_API_TOKENS".into(),
                        format!("tenant invalido: {}", bad),
                    ));
                }
                TenantScope::Only(set)
            };

            verifier = verifier.grant(token, scope);
        }

        Ok(verifier)
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Option<TenantScope> {
        self.grants.get(&token_digest(token)).cloned()
    }
}

fn token_digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

// ============================================================================
// Rate limiting of failed authentication
// ============================================================================

/// Clients tracked before stale windows are swept
const MAX_TRACKED_CLIENTS: usize = 10_000;

/// Counts failed token checks per client inside a sliding window
pub struct FailedAuthLimiter {
    attempts: Mutex<HashMap<String, Vec<Instant>>>,
    max_attempts: usize,
    window: Duration,
}

impl FailedAuthLimiter {
    pub fn new(max_attempts: usize, window_secs: u64) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            max_attempts,
            window: Duration::from_secs(window_secs),
        }
    }

    /// Err when `key` already used up its failures for the window
    pub fn check(&self, key: &str) -> Result<(), ApiError> {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        let recent = match attempts.get_mut(key) {
            Some(timestamps) => {
                timestamps.retain(|t| now.duration_since(*t) < self.window);
                timestamps.len()
            }
            None => return Ok(()),
        };

        if recent == 0 {
            attempts.remove(key);
        } else if recent >= self.max_attempts {
            return Err(ApiError::TooManyAttempts(self.window.as_secs()));
        }
        Ok(())
    }

    pub fn record_failure(&self, key: &str) {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        if attempts.len() >= MAX_TRACKED_CLIENTS {
            attempts.retain(|_, timestamps| {
                timestamps.retain(|t| now.duration_since(*t) < self.window);
                !timestamps.is_empty()
            });
        }
        attempts.entry(key.to_string()).or_default().push(now);
    }

    pub fn tracked_clients(&self) -> usize {
        self.attempts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for FailedAuthLimiter {
    fn default() -> Self {
        Self::new(10, 60)
    }
}

// ============================================================================
// Extractors
// ============================================================================

/// Tenant taken from `X-Tenant-ID`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantId(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for TenantId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(TENANT_HEADER)
            .ok_or(ApiError::MissingTenant)?
            .to_str()
            .map_err(|_| ApiError::InvalidTenant)?
            .trim();

        if raw.is_empty() {
            return Err(ApiError::MissingTenant);
        }
        if !is_valid_tenant(raw) {
            return Err(ApiError::InvalidTenant);
        }
        Ok(TenantId(raw.to_string()))
    }
}

/// A request whose bearer token is valid for its tenant
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub tenant_id: String,
}

#[async_trait]
impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let TenantId(tenant_id) = TenantId::from_request_parts(parts, state).await?;

        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(ApiError::MissingToken)?;

        // Peer address when served with connect info, otherwise the presented token
        let client_key = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| token_digest(token));

        state.limiter.check(&client_key)?;

        let Some(scope) = state.verifier.verify(token) else {
            state.limiter.record_failure(&client_key);
            log::warn!("Rejected invalid token for tenant {} from {}", tenant_id, client_key);
            return Err(ApiError::InvalidToken);
        };

        if !scope.allows(&tenant_id) {
            log::warn!("Token not allowed for tenant {}", tenant_id);
            return Err(ApiError::TenantForbidden(tenant_id));
        }

        Ok(Authenticated { tenant_id })
    }
}

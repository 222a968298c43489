//! Runtime configuration
//!
//! Both binaries read `ACESSO_*` environment variables (a `.env` file is
//! loaded first by the binaries). Unset variables fall back to defaults.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8787";
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// Settings of the kiosk process
#[derive(Clone)]
pub struct KioskConfig {
    pub api_url: String,
    pub db_path: PathBuf,
    pub device_name: String,
    pub batch_size: usize,
    pub sync_interval_secs: u64,
    pub http_timeout_secs: u64,
    pub retention_months: u32,
    pub poison_threshold: Option<u32>,
    pub tenant_id: Option<String>,
    pub auth_token: Option<String>,
}

impl Default for KioskConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            db_path: PathBuf::from("acesso-kiosk.db"),
            device_name: default_device_name(),
            batch_size: 50,
            sync_interval_secs: 60,
            http_timeout_secs: 30,
            retention_months: 24,
            poison_threshold: None,
            tenant_id: None,
            auth_token: None,
        }
    }
}

impl fmt::Debug for KioskConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KioskConfig")
            .field("api_url", &self.api_url)
            .field("db_path", &self.db_path)
            .field("device_name", &self.device_name)
            .field("batch_size", &self.batch_size)
            .field("sync_interval_secs", &self.sync_interval_secs)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("retention_months", &self.retention_months)
            .field("poison_threshold", &self.poison_threshold)
            .field("tenant_id", &self.tenant_id)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl KioskConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key lookup (environment, test map)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let config = Self {
            api_url: get("ACESSO_API_URL").unwrap_or(defaults.api_url),
            db_path: get("ACESSO_DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            device_name: get("ACESSO_DEVICE_NAME").unwrap_or(defaults.device_name),
            batch_size: parse_or("ACESSO_BATCH_SIZE", get("ACESSO_BATCH_SIZE"), defaults.batch_size)?,
            sync_interval_secs: parse_or(
                "ACESSO_SYNC_INTERVAL_SECS",
                get("ACESSO_SYNC_INTERVAL_SECS"),
                defaults.sync_interval_secs,
            )?,
            http_timeout_secs: parse_or(
                "ACESSO_HTTP_TIMEOUT_SECS",
                get("ACESSO_HTTP_TIMEOUT_SECS"),
                defaults.http_timeout_secs,
            )?,
            retention_months: parse_or(
                "ACESSO_RETENTION_MONTHS",
                get("ACESSO_RETENTION_MONTHS"),
                defaults.retention_months,
            )?,
            poison_threshold: get("ACESSO_POISON_THRESHOLD")
                .map(|raw| parse_value("ACESSO_POISON_THRESHOLD", &raw))
                .transpose()?,
            tenant_id: get("ACESSO_TENANT_ID"),
            auth_token: get("ACESSO_AUTH_TOKEN"),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.api_url)
            .map_err(|e| ConfigError::Invalid("ACESSO_API_URL".into(), e.to_string()))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::Invalid(
                "ACESSO_API_URL".into(),
                format!("unsupported scheme {}", url.scheme()),
            ));
        }

        if !(1..=500).contains(&self.batch_size) {
            return Err(ConfigError::Invalid(
                "ACESSO_BATCH_SIZE".into(),
                format!("must be 1-500, got {}", self.batch_size),
            ));
        }
        if !(1..=86_400).contains(&self.sync_interval_secs) {
            return Err(ConfigError::Invalid(
                "ACESSO_SYNC_INTERVAL_SECS".into(),
                format!("must be 1-86400, got {}", self.sync_interval_secs),
            ));
        }
        if self.http_timeout_secs == 0 {
            return Err(ConfigError::Invalid("ACESSO_HTTP_TIMEOUT_SECS".into(), "must be positive".into()));
        }
        if self.retention_months == 0 {
            return Err(ConfigError::Invalid("ACESSO_RETENTION_MONTHS".into(), "must be positive".into()));
        }
        if self.poison_threshold == Some(0) {
            return Err(ConfigError::Invalid("ACESSO_POISON_THRESHOLD".into(), "must be positive".into()));
        }
        Ok(())
    }
}

/// Settings of the ingestion server
#[derive(Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub db_path: PathBuf,
    /// `token=tenantA,tenantB;token2=*`
    pub api_tokens: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            db_path: PathBuf::from("acesso-server.db"),
            api_tokens: String::new(),
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("db_path", &self.db_path)
            .field("api_tokens", &"<redacted>")
            .finish()
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let config = Self {
            bind_addr: get("ACESSO_BIND_ADDR").unwrap_or(defaults.bind_addr),
            db_path: get("ACESSO_SERVER_DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            api_tokens: get("ACESSO_API_TOKENS").unwrap_or(defaults.api_tokens),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        SocketAddr::from_str(&self.bind_addr)
            .map_err(|e| ConfigError::Invalid("ACESSO_BIND_ADDR".into(), e.to_string()))?;
        Ok(())
    }
}

fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "kiosk".to_string())
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| ConfigError::Invalid(key.to_string(), format!("{}: {}", raw, e)))
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    match raw {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

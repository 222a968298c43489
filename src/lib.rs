//! # Acesso Escolar Sync
//!
//! Offline-first synchronization engine for school access kiosks, plus the
//! idempotent ingestion server it uploads to.

pub mod capture;
pub mod config;
pub mod db;
pub mod server;
pub mod sync;

use capture::CaptureService;
use config::{ConfigError, KioskConfig, ServerConfig};
use db::{Database, DbError};
use std::sync::Arc;
use std::time::Duration;
use sync::{
    BackgroundScheduler, DrainController, HttpConnectivityProbe, LocalStore, SchedulerError,
    StoreError, SyncApiClient, SyncApiError, SyncEvent, SyncManagerError, SyncState, WakeSignal,
};

/// Controller wired to the real HTTP uploader and health probe
pub type KioskController = DrainController<SyncApiClient, HttpConnectivityProbe>;
pub type KioskScheduler = BackgroundScheduler<SyncApiClient, HttpConnectivityProbe>;

const MAINTENANCE_INTERVAL_SECS: u64 = 3600;
const HISTORY_RETENTION_DAYS: i64 = 90;
const COMPLETED_OPERATIONS_DAYS: i64 = 7;

/// Load `.env` and initialise the logger (idempotent)
pub fn init_logging() {
    dotenvy::dotenv().ok();

    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
}

// ============================================================================
// Kiosk runtime
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum KioskError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncManagerError),

    #[error("API client error: {0}")]
    Api(#[from] SyncApiError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Connectivity probe error: {0}")]
    Probe(#[from] reqwest::Error),
}

/// Everything the kiosk process runs
pub struct KioskRuntime {
    pub db: Arc<Database>,
    pub store: Arc<LocalStore>,
    pub controller: Arc<KioskController>,
    pub scheduler: KioskScheduler,
    pub capture: Arc<CaptureService>,
}

impl KioskRuntime {
    /// Open storage, build the sync stack and start the scheduler
    pub async fn start(config: &KioskConfig) -> Result<Self, KioskError> {
        log::info!("Starting kiosk {} (database {:?})", config.device_name, config.db_path);

        let db = Arc::new(Database::new(config.db_path.clone())?);
        let store = Arc::new(LocalStore::new(db.clone())?.with_poison_threshold(config.poison_threshold));

        let uploader = Arc::new(SyncApiClient::with_timeout(
            &config.api_url,
            Duration::from_secs(config.http_timeout_secs),
        )?);
        let probe = Arc::new(HttpConnectivityProbe::new(&config.api_url)?);

        let controller = Arc::new(
            DrainController::new(db.clone(), store.clone(), uploader, probe)?
                .with_batch_size(config.batch_size),
        );

        let scheduler = BackgroundScheduler::new(db.clone(), controller.clone());
        scheduler.load_config().await?;
        scheduler.update_config(true, config.sync_interval_secs).await?;

        let capture = Arc::new(
            CaptureService::new(store.clone(), controller.operations().clone(), config.retention_months)
                .with_wake_handle(scheduler.handle()),
        );

        Ok(Self {
            db,
            store,
            controller,
            scheduler,
            capture,
        })
    }

    /// Retention purge and ledger cleanup
    pub fn maintenance(&self) {
        match self.store.purge_expired(chrono::Utc::now()) {
            Ok(purged) if purged > 0 => log::info!("Purged {} expired records", purged),
            Ok(_) => {}
            Err(e) => log::error!("Retention purge failed: {}", e),
        }
        if let Err(e) = self.controller.history().enforce_retention_policy(HISTORY_RETENTION_DAYS) {
            log::warn!("Failed to trim cycle history: {}", e);
        }
        if let Err(e) = self.controller.operations().clear_completed(COMPLETED_OPERATIONS_DAYS) {
            log::warn!("Failed to clear completed operations: {}", e);
        }
    }

    pub async fn shutdown(&self) {
        if self.scheduler.is_running() {
            let _ = self.scheduler.stop().await;
        }
        log::info!("Kiosk stopped");
    }
}

/// Log status events for operators
fn spawn_event_logger(controller: &KioskController) {
    let mut events = controller.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SyncEvent::Status { status: SyncState::Syncing, pending }) => {
                    log::debug!("Syncing, {} pending", pending)
                }
                Ok(SyncEvent::Status { status, pending }) => {
                    log::info!("Sync status {}: {} pending", status.as_str(), pending)
                }
                Ok(SyncEvent::SyncSuccess { processed_count, .. }) => {
                    log::debug!("Batch acknowledged: {} records", processed_count)
                }
                Ok(SyncEvent::SyncError { reason, .. }) => log::warn!("Sync error: {}", reason),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    log::debug!("Event logger skipped {} events", skipped)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Kiosk process entry point
pub async fn run_kiosk() -> Result<(), KioskError> {
    init_logging();

    let config = KioskConfig::from_env()?;
    let runtime = KioskRuntime::start(&config).await?;
    spawn_event_logger(&runtime.controller);

    match (config.tenant_id.clone(), config.auth_token.clone()) {
        (Some(tenant_id), Some(token)) => {
            runtime.capture.set_session(Some(WakeSignal::new(tenant_id, token)));
        }
        _ => log::info!("No session configured, waiting for login"),
    }

    let mut maintenance = tokio::time::interval(Duration::from_secs(MAINTENANCE_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = maintenance.tick() => runtime.maintenance(),
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    log::error!("Failed to listen for shutdown signal: {}", e);
                }
                break;
            }
        }
    }

    runtime.shutdown().await;
    Ok(())
}

/// Ingestion server entry point
pub async fn run_server() -> Result<(), server::ServerError> {
    init_logging();

    let config = ServerConfig::from_env()?;
    log::info!("Starting ingestion server ({:?})", config);

    server::run(&config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for shutdown signal: {}", e);
        }
    })
    .await
}

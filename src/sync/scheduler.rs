//! Background Sync Scheduler
//!
//! Owns the task that drives the drain controller. Wakes arrive on an mpsc
//! channel (capture path, login, connectivity regained) and from a periodic
//! tick that reuses the last session seen. After a failed cycle, further
//! wakes are held back with exponential backoff.

use super::api::BatchUploader;
use super::connectivity::ConnectivityProbe;
use super::manager::{CycleOutcome, DrainController};
use super::models::WakeSignal;
use super::queue::backoff_delay_secs;
use crate::db::Database;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

const CONFIG_KEY: &str = "scheduler_config";
const WAKE_CHANNEL_CAPACITY: usize = 64;
const MIN_INTERVAL_SECS: u64 = 1;
const MAX_INTERVAL_SECS: u64 = 86_400;

/// Scheduler configuration stored in settings table
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub last_run: Option<String>, // ISO 8601 timestamp
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            last_run: None,
        }
    }
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

/// Sending side of the wake channel
#[derive(Clone)]
pub struct WakeHandle {
    tx: mpsc::Sender<WakeSignal>,
}

impl WakeHandle {
    /// Request a cycle without waiting. Returns false when the request was dropped.
    pub fn wake(&self, signal: WakeSignal) -> bool {
        match self.tx.try_send(signal) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::debug!("Wake channel full, request coalesced");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::warn!("Wake channel closed, scheduler is gone");
                false
            }
        }
    }
}

/// Backoff bookkeeping between cycles
#[derive(Debug, Default)]
struct Backoff {
    failures: u32,
    until: Option<Instant>,
}

impl Backoff {
    fn active(&self) -> bool {
        self.until.map_or(false, |until| Instant::now() < until)
    }

    fn observe(&mut self, outcome: &CycleOutcome) {
        if outcome.is_failure() {
            let delay = backoff_delay_secs(self.failures as i32) as u64;
            self.failures += 1;
            self.until = Some(Instant::now() + Duration::from_secs(delay));
            log::info!("Sync failed {} time(s), backing off {}s", self.failures, delay);
        } else if !matches!(outcome, CycleOutcome::Skipped(_)) {
            self.reset();
        }
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.until = None;
    }
}

/// Background scheduler for automatic drain cycles
pub struct BackgroundScheduler<U: BatchUploader + 'static, P: ConnectivityProbe + 'static> {
    db: Arc<Database>,
    controller: Arc<DrainController<U, P>>,
    config: Arc<RwLock<SchedulerConfig>>,
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
    wake_tx: mpsc::Sender<WakeSignal>,
    wake_rx: Arc<Mutex<mpsc::Receiver<WakeSignal>>>,
}

impl<U: BatchUploader + 'static, P: ConnectivityProbe + 'static> BackgroundScheduler<U, P> {
    /// Create new scheduler instance
    pub fn new(db: Arc<Database>, controller: Arc<DrainController<U, P>>) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(WAKE_CHANNEL_CAPACITY);

        Self {
            db,
            controller,
            config: Arc::new(RwLock::new(SchedulerConfig::default())),
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
            wake_tx,
            wake_rx: Arc::new(Mutex::new(wake_rx)),
        }
    }

    /// Handle for callers that want to trigger a cycle
    pub fn handle(&self) -> WakeHandle {
        WakeHandle {
            tx: self.wake_tx.clone(),
        }
    }

    pub fn controller(&self) -> &Arc<DrainController<U, P>> {
        &self.controller
    }

    /// Load configuration from database settings table
    pub async fn load_config(&self) -> Result<(), SchedulerError> {
        let config: SchedulerConfig = self.db
            .get_setting(CONFIG_KEY)
            .map_err(|e| SchedulerError::Database(e.to_string()))?
            .unwrap_or_default();

        *self.config.write().await = config;
        Ok(())
    }

    /// Save configuration to database settings table
    pub async fn save_config(&self) -> Result<(), SchedulerError> {
        let config = self.config.read().await.clone();
        self.db
            .set_setting(CONFIG_KEY, &config)
            .map_err(|e| SchedulerError::Database(e.to_string()))?;
        Ok(())
    }

    /// Start background scheduler task
    pub async fn start(&self) -> Result<(), SchedulerError> {
        // Check if already running
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let interval_secs = self.config.read().await.interval_secs;
        if let Err(e) = validate_interval(interval_secs) {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let running = self.running.clone();
        let db = self.db.clone();
        let config = self.config.clone();
        let controller = self.controller.clone();
        let wake_rx = self.wake_rx.clone();

        let handle = tokio::spawn(async move {
            Self::scheduler_loop(running, db, config, controller, wake_rx).await;
        });

        *self.task_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        log::info!("Background scheduler started (interval: {}s)", interval_secs);
        Ok(())
    }

    /// Stop background scheduler task
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        // Abort the task
        let handle = self.task_handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        log::info!("Background scheduler stopped");
        Ok(())
    }

    /// Check if scheduler is currently running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get current configuration
    pub async fn get_config(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    /// Update configuration and restart scheduler if needed
    pub async fn update_config(&self, enabled: bool, interval_secs: u64) -> Result<(), SchedulerError> {
        validate_interval(interval_secs)?;

        {
            let mut config = self.config.write().await;
            config.enabled = enabled;
            config.interval_secs = interval_secs;
        }

        self.save_config().await?;

        if self.is_running() {
            // Ignore error if not running (race condition)
            let _ = self.stop().await;
        }

        if enabled {
            self.start().await?;
        }

        log::info!("Scheduler config updated: enabled={}, interval={}s", enabled, interval_secs);
        Ok(())
    }

    /// Background scheduler loop (runs in spawned task)
    async fn scheduler_loop(
        running: Arc<AtomicBool>,
        db: Arc<Database>,
        config: Arc<RwLock<SchedulerConfig>>,
        controller: Arc<DrainController<U, P>>,
        wake_rx: Arc<Mutex<mpsc::Receiver<WakeSignal>>>,
    ) {
        let mut rx = wake_rx.lock().await;
        let interval_secs = config.read().await.interval_secs;
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut session: Option<WakeSignal> = None;
        let mut backoff = Backoff::default();

        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(signal) => {
                        if session.as_ref() != Some(&signal) {
                            backoff.reset();
                        }
                        session = Some(signal);
                    }
                    None => break,
                },
                _ = interval.tick() => {}
            }

            // Check if we should stop
            if !running.load(Ordering::SeqCst) {
                break;
            }

            let Some(signal) = session.clone() else {
                continue;
            };

            if backoff.active() {
                log::debug!("Wake deferred by backoff");
                continue;
            }

            let outcome = controller.wake(&signal).await;
            backoff.observe(&outcome);

            // Wakes that arrived during the cycle are not queued
            while let Ok(latest) = rx.try_recv() {
                session = Some(latest);
            }

            if matches!(outcome, CycleOutcome::Skipped(_)) {
                continue;
            }

            let mut cfg = config.write().await;
            cfg.last_run = Some(Utc::now().to_rfc3339());
            if let Err(e) = db.set_setting(CONFIG_KEY, &*cfg) {
                log::error!("Failed to save last_run timestamp: {}", e);
            }
        }

        log::info!("Scheduler loop exited");
    }
}

fn validate_interval(interval_secs: u64) -> Result<(), SchedulerError> {
    if !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&interval_secs) {
        return Err(SchedulerError::InvalidInterval(format!(
            "Interval must be {}-{} seconds, got {}",
            MIN_INTERVAL_SECS, MAX_INTERVAL_SECS, interval_secs
        )));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

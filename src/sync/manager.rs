//! Drain Loop Controller - Orchestrates synchronization cycles
//!
//! Coordinates between the local store, the queue reader and the uploader.
//! Handles:
//! - Wake-signal validation (tenant + credential)
//! - Connectivity gate (OFFLINE short-circuit)
//! - Mutual exclusion (one active cycle per controller)
//! - Bounded batch loop until the backlog is exhausted or an upload fails
//! - Pending-operation push after the event backlog drains
//! - Status events and the cycle ledger

use super::api::{BatchUploader, SyncApiError};
use super::connectivity::ConnectivityProbe;
use super::history::{CycleHistory, CycleRecord, CycleStatus, HistoryError};
use super::models::{EventRecord, RecordOutcome, SyncEvent, SyncState, WakeSignal};
use super::queue::{OperationQueue, QueueError, QueueStatus};
use super::reader::{DrainCursor, SyncQueueReader};
use super::store::{LocalStore, StoreError};
use crate::db::{Database, DbError};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Records per upload call
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Largest batch the ingestion endpoint accepts
pub const MAX_BATCH_SIZE: usize = 500;

/// Operations pushed per cycle
const OPERATIONS_PER_CYCLE: usize = 50;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Reason attached to ids the server did not mention in its response
pub const UNACKNOWLEDGED_REASON: &str = "sem confirmacao do servidor";

// ============================================================================
// Cycle outcome
// ============================================================================

/// Why a wake did not start a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingCredentials,
    AlreadySyncing,
}

/// How a wake ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Skipped(SkipReason),
    Offline { pending: u64 },
    Drained { processed: u64, batches: u32, pending: u64 },
    SoftFailure { processed: u64, batches: u32, reason: String },
    StorageFault { reason: String },
}

impl CycleOutcome {
    /// True when the scheduler should back off before the next attempt
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::SoftFailure { .. } | Self::StorageFault { .. })
    }
}

/// Releases the syncing flag on every exit path
struct CycleGuard<'a> {
    state: &'a Mutex<SyncState>,
    release_to: SyncState,
}

impl CycleGuard<'_> {
    fn release_to(&mut self, state: SyncState) {
        self.release_to = state;
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = self.release_to;
    }
}

// ============================================================================
// Drain Controller
// ============================================================================

/// Drain controller - one instance per device
pub struct DrainController<U: BatchUploader, P: ConnectivityProbe> {
    store: Arc<LocalStore>,
    reader: SyncQueueReader,
    operations: Arc<OperationQueue>,
    history: Arc<CycleHistory>,
    uploader: Arc<U>,
    probe: Arc<P>,
    batch_size: usize,
    device_id: String,
    state: Mutex<SyncState>,
    events: broadcast::Sender<SyncEvent>,
}

impl<U: BatchUploader, P: ConnectivityProbe> DrainController<U, P> {
    /// Create new controller over an opened database
    pub fn new(
        db: Arc<Database>,
        store: Arc<LocalStore>,
        uploader: Arc<U>,
        probe: Arc<P>,
    ) -> Result<Self, SyncManagerError> {
        let operations = Arc::new(OperationQueue::new(db.clone())?);
        let history = Arc::new(CycleHistory::new(db.clone())?);
        let device_id = db.device_id()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            reader: SyncQueueReader::new(store.clone()),
            store,
            operations,
            history,
            uploader,
            probe,
            batch_size: DEFAULT_BATCH_SIZE,
            device_id,
            state: Mutex::new(SyncState::Idle),
            events,
        })
    }

    /// Records per upload call, clamped to 1..=500
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn state(&self) -> SyncState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe to status events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn operations(&self) -> &Arc<OperationQueue> {
        &self.operations
    }

    pub fn history(&self) -> &Arc<CycleHistory> {
        &self.history
    }

    /// Run one drain cycle for the session in `signal`
    pub async fn wake(&self, signal: &WakeSignal) -> CycleOutcome {
        if !signal.is_complete() {
            log::debug!("Wake ignored: session has no tenant or credential");
            return CycleOutcome::Skipped(SkipReason::MissingCredentials);
        }

        let Some(mut guard) = self.try_begin() else {
            log::debug!("Wake ignored: a cycle is already running");
            return CycleOutcome::Skipped(SkipReason::AlreadySyncing);
        };

        let tenant_id = signal.tenant_id.as_str();
        let mut cycle = CycleRecord::started(tenant_id, &self.device_id);

        let outcome = if self.probe.is_online().await {
            let outcome = self.drain(signal, &mut cycle).await;
            if let CycleOutcome::Drained { .. } = outcome {
                cycle.operations_pushed = self.push_operations(signal).await;
            }
            outcome
        } else {
            guard.release_to(SyncState::Offline);
            match self.store.count_all_pending(tenant_id) {
                Ok(pending) => {
                    log::info!("Offline, {} records waiting for tenant {}", pending, tenant_id);
                    self.emit(SyncEvent::status(SyncState::Offline, pending));
                    cycle.pending_after = pending;
                    CycleOutcome::Offline { pending }
                }
                Err(e) => self.storage_fault(&cycle, e),
            }
        };

        let (status, error) = match &outcome {
            CycleOutcome::Offline { .. } => (CycleStatus::Offline, None),
            CycleOutcome::Drained { .. } => (CycleStatus::Drained, None),
            CycleOutcome::Skipped(_) => return outcome,
            CycleOutcome::SoftFailure { reason, .. } => (CycleStatus::SoftFailure, Some(reason.clone())),
            CycleOutcome::StorageFault { reason } => (CycleStatus::StorageFault, Some(reason.clone())),
        };
        cycle.finish(status, error);
        if let Err(e) = self.history.record(&cycle) {
            log::warn!("Failed to record cycle in history: {}", e);
        }

        outcome
    }

    fn try_begin(&self) -> Option<CycleGuard<'_>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == SyncState::Syncing {
            return None;
        }
        *state = SyncState::Syncing;

        Some(CycleGuard {
            state: &self.state,
            release_to: SyncState::Idle,
        })
    }

    /// The batch loop. Ends when nothing is left to send, on a failed upload or on a storage fault.
    async fn drain(&self, signal: &WakeSignal, cycle: &mut CycleRecord) -> CycleOutcome {
        let tenant_id = signal.tenant_id.as_str();
        let mut cursor = DrainCursor::default();

        loop {
            let backlog = match self.reader.read(tenant_id, &cursor, self.batch_size) {
                Ok(backlog) => backlog,
                Err(e) => return self.storage_fault(cycle, e),
            };

            let Some(stream) = backlog.stream else {
                self.emit(SyncEvent::status(SyncState::Idle, backlog.total_pending));
                cycle.pending_after = backlog.total_pending;
                if cycle.batches > 0 {
                    log::info!(
                        "Sync cycle complete for tenant {}: {} records in {} batches, {} pending",
                        tenant_id,
                        cycle.processed,
                        cycle.batches,
                        backlog.total_pending
                    );
                }
                return CycleOutcome::Drained {
                    processed: cycle.processed,
                    batches: cycle.batches,
                    pending: backlog.total_pending,
                };
            };

            self.emit(SyncEvent::status(SyncState::Syncing, backlog.total_pending));

            let outcomes = match self
                .uploader
                .upload_batch(stream, &backlog.batch, signal)
                .await
            {
                Ok(outcomes) => outcomes,
                Err(e) => {
                    log::warn!("Upload of {} {} records failed: {}", backlog.batch.len(), stream, e);
                    cycle.pending_after = backlog.total_pending;
                    return self.soft_failure(cycle, e.to_string());
                }
            };

            cursor.advance(stream, &backlog.batch);
            cycle.batches += 1;

            let (acknowledged, rejected) = partition_outcomes(&backlog.batch, &outcomes);

            if let Err(e) = self.store.mark_synchronized(stream, tenant_id, &acknowledged) {
                return self.storage_fault(cycle, e);
            }
            if let Err(e) = self.store.record_rejections(stream, tenant_id, &rejected) {
                return self.storage_fault(cycle, e);
            }

            if !rejected.is_empty() {
                log::warn!(
                    "Server did not accept {} of {} {} records",
                    rejected.len(),
                    backlog.batch.len(),
                    stream
                );
            }
            cycle.rejected += rejected.len() as u64;

            // Rejections are per record; the cursor already moved past them
            if acknowledged.is_empty() {
                continue;
            }

            cycle.processed += acknowledged.len() as u64;
            self.emit(SyncEvent::success(acknowledged.len() as u64));
        }
    }

    /// Push due entity operations one at a time
    async fn push_operations(&self, signal: &WakeSignal) -> u32 {
        let ready = match self
            .operations
            .ready_operations(&signal.tenant_id, OPERATIONS_PER_CYCLE)
        {
            Ok(ready) => ready,
            Err(e) => {
                log::error!("Failed to read pending operations: {}", e);
                return 0;
            }
        };

        let mut pushed = 0;
        for operation in ready {
            let Some(id) = operation.id else { continue };

            if let Err(e) = self.operations.update_status(id, QueueStatus::InProgress, None) {
                log::error!("Failed to update operation {}: {}", id, e);
                break;
            }

            match self.uploader.push_operation(&operation, signal).await {
                Ok(()) => {
                    pushed += 1;
                    if let Err(e) = self.operations.update_status(id, QueueStatus::Completed, None) {
                        log::error!("Failed to complete operation {}: {}", id, e);
                        break;
                    }
                }
                Err(e) => {
                    let stop = halts_operation_push(&e);
                    if let Err(qe) = self.operations.mark_failed_and_retry(id, e.to_string()) {
                        log::error!("Failed to reschedule operation {}: {}", id, qe);
                        break;
                    }
                    if stop {
                        log::warn!("Stopping operation push for this cycle: {}", e);
                        break;
                    }
                }
            }
        }

        if pushed > 0 {
            log::info!("Pushed {} pending operations", pushed);
        }
        pushed
    }

    fn soft_failure(&self, cycle: &CycleRecord, reason: String) -> CycleOutcome {
        self.emit(SyncEvent::error(reason.clone()));
        CycleOutcome::SoftFailure {
            processed: cycle.processed,
            batches: cycle.batches,
            reason,
        }
    }

    fn storage_fault(&self, cycle: &CycleRecord, e: StoreError) -> CycleOutcome {
        log::error!(
            "Storage fault during sync for tenant {} after {} batches: {}",
            cycle.tenant_id,
            cycle.batches,
            e
        );
        let reason = e.to_string();
        self.emit(SyncEvent::error(reason.clone()));
        CycleOutcome::StorageFault { reason }
    }

    fn emit(&self, event: SyncEvent) {
        log::debug!("Sync event: {:?}", event);
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Errors that would fail every remaining operation of the cycle
fn halts_operation_push(e: &SyncApiError) -> bool {
    matches!(
        e,
        SyncApiError::Request(_)
            | SyncApiError::NetworkError(_)
            | SyncApiError::Unauthorized
            | SyncApiError::Forbidden
            | SyncApiError::RateLimitExceeded
            | SyncApiError::ServerError(_)
    )
}

/// Split a batch into ids to mark and ids to charge an attempt.
///
/// Only ids present in the batch and reported `sincronizado` are eligible
/// for marking. An id the server did not mention counts as rejected.
fn partition_outcomes(
    batch: &[EventRecord],
    outcomes: &[RecordOutcome],
) -> (Vec<String>, Vec<(String, String)>) {
    let mut by_id: HashMap<&str, &RecordOutcome> = HashMap::new();
    for outcome in outcomes {
        let entry = by_id.entry(outcome.id.as_str()).or_insert(outcome);
        if outcome.is_synchronized() {
            *entry = outcome;
        }
    }

    let mut seen = HashSet::new();
    let mut acknowledged = Vec::new();
    let mut rejected = Vec::new();

    for record in batch {
        if !seen.insert(record.id.as_str()) {
            continue;
        }
        match by_id.get(record.id.as_str()) {
            Some(outcome) if outcome.is_synchronized() => acknowledged.push(record.id.clone()),
            Some(outcome) => rejected.push((
                record.id.clone(),
                outcome.error.clone().unwrap_or_else(|| "erro".to_string()),
            )),
            None => rejected.push((record.id.clone(), UNACKNOWLEDGED_REASON.to_string())),
        }
    }

    (acknowledged, rejected)
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncManagerError {
    #[error("Queue error: {0}")]
    QueueError(#[from] QueueError),

    #[error("History error: {0}")]
    HistoryError(#[from] HistoryError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] DbError),
}

// ============================================================================
// Tests
// ============================================================================

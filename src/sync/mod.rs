//! Sync Module - Offline-first event synchronization
//!
//! Keeps access and audit events in a durable local store and drains them
//! to the ingestion server in bounded batches:
//! - Local store and queue reader (pending backlog, insertion order)
//! - Batch uploader (per-record acknowledgements)
//! - Drain controller (connectivity gate, one cycle at a time, status events)
//! - Background scheduler (wake channel, periodic tick, backoff)
//!
//! Architecture:
//! - At-least-once: a record is only marked after the server acknowledges its id
//! - Idempotent server: replaying an id is a no-op
//! - Tenant-scoped: every read and write carries the session tenant

pub mod api;
pub mod connectivity;
pub mod history;
pub mod manager;
pub mod models;
pub mod queue;
pub mod reader;
pub mod scheduler;
pub mod store;

#[cfg(test)]
pub(crate) mod tests;

// Re-export commonly used types
pub use models::{
    AccessKind, AuditAction, CaptureMethod, EventKind, EventRecord, IngestedRecord,
    OutcomeStatus, RecordOutcome, RecordQuery, RecordStream, SyncEvent, SyncState,
    WakeSignal, WireRecord, DEFAULT_RETENTION_MONTHS,
};

pub use api::{BatchUploader, SyncApiClient, SyncApiError};
pub use connectivity::{ConnectivityProbe, HttpConnectivityProbe, ManualConnectivity};
pub use history::{CycleHistory, CycleRecord, CycleStatus, HistoryError, HistoryStats};
pub use manager::{CycleOutcome, DrainController, SkipReason, SyncManagerError};
pub use queue::{EntityKind, OperationKind, OperationQueue, PendingOperation, QueueError, QueueStats, QueueStatus};
pub use reader::{Backlog, DrainCursor, SyncQueueReader};
pub use scheduler::{BackgroundScheduler, SchedulerConfig, SchedulerError, WakeHandle};
pub use store::{LocalStore, StoreError, StoreStats};

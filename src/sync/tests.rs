//! Integration Tests for Sync Module
//!
//! Drives the drain controller end to end:
//! - Batch capping and backlog exhaustion
//! - Offline short-circuit and concurrent wakes
//! - Partial acknowledgement and at-least-once delivery
//! - Tenant isolation
//! - Real HTTP round trips against the ingestion server

use super::api::{BatchUploader, SyncApiError};
use super::models::{EventRecord, RecordOutcome, RecordStream, WakeSignal};
use super::queue::PendingOperation;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

// ============================================================================
// Test uploader
// ============================================================================

#[derive(Debug, Clone)]
pub(crate) enum UploadMode {
    AcceptAll,
    /// Every call fails before reaching the server
    Unreachable,
    /// Acknowledge only these ids, reject the rest
    AcceptOnly(HashSet<String>),
}

/// In-memory uploader that records what it was sent
pub(crate) struct FakeUploader {
    mode: Mutex<UploadMode>,
    delay: Option<Duration>,
    batches: Mutex<Vec<(RecordStream, Vec<EventRecord>)>>,
    operations: Mutex<Vec<String>>,
    reject_operations: AtomicBool,
    operation_attempts: AtomicUsize,
}

impl FakeUploader {
    pub(crate) fn new(mode: UploadMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            delay: None,
            batches: Mutex::new(Vec::new()),
            operations: Mutex::new(Vec::new()),
            reject_operations: AtomicBool::new(false),
            operation_attempts: AtomicUsize::new(0),
        }
    }

    pub(crate) fn accept_all() -> Self {
        Self::new(UploadMode::AcceptAll)
    }

    pub(crate) fn unreachable() -> Self {
        Self::new(UploadMode::Unreachable)
    }

    /// Sleep inside every upload
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn set_mode(&self, mode: UploadMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub(crate) fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(|(_, b)| b.len()).collect()
    }

    pub(crate) fn uploaded(&self) -> Vec<EventRecord> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, b)| b.iter().cloned())
            .collect()
    }

    pub(crate) fn streams(&self) -> Vec<RecordStream> {
        self.batches.lock().unwrap().iter().map(|(s, _)| *s).collect()
    }

    pub(crate) fn pushed_operations(&self) -> Vec<String> {
        self.operations.lock().unwrap().clone()
    }

    /// Answer every operation push with 401
    pub(crate) fn reject_operations(&self) {
        self.reject_operations.store(true, Ordering::SeqCst);
    }

    pub(crate) fn operation_attempts(&self) -> usize {
        self.operation_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchUploader for FakeUploader {
    async fn upload_batch(
        &self,
        stream: RecordStream,
        records: &[EventRecord],
        _credentials: &WakeSignal,
    ) -> Result<Vec<RecordOutcome>, SyncApiError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mode = self.mode.lock().unwrap().clone();
        if let UploadMode::Unreachable = mode {
            return Err(SyncApiError::NetworkError("connection refused".to_string()));
        }

        self.batches.lock().unwrap().push((stream, records.to_vec()));

        Ok(records
            .iter()
            .map(|record| match &mode {
                UploadMode::AcceptOnly(ids) if !ids.contains(&record.id) => {
                    RecordOutcome::error(record.id.clone(), "rejeitado")
                }
                _ => RecordOutcome::synchronized(record.id.clone()),
            })
            .collect())
    }

    async fn push_operation(
        &self,
        operation: &PendingOperation,
        _credentials: &WakeSignal,
    ) -> Result<(), SyncApiError> {
        self.operation_attempts.fetch_add(1, Ordering::SeqCst);
        if self.reject_operations.load(Ordering::SeqCst) {
            return Err(SyncApiError::Unauthorized);
        }
        if let UploadMode::Unreachable = *self.mode.lock().unwrap() {
            return Err(SyncApiError::NetworkError("connection refused".to_string()));
        }
        self.operations.lock().unwrap().push(operation.entity_id.clone());
        Ok(())
    }
}

// ============================================================================
// Drain controller flows
// ============================================================================

#[cfg(test)]
mod controller_tests {
    use super::*;
    use crate::db::Database;
    use crate::sync::connectivity::ManualConnectivity;
    use crate::sync::history::CycleStatus;
    use crate::sync::manager::{CycleOutcome, DrainController, SkipReason};
    use crate::sync::models::{AccessKind, AuditAction, SyncEvent, SyncState};
    use crate::sync::queue::{EntityKind, QueueStatus};
    use crate::sync::store::LocalStore;
    use std::sync::Arc;
    use tokio::sync::broadcast;

    type TestController = DrainController<FakeUploader, ManualConnectivity>;

    struct Harness {
        db: Arc<Database>,
        store: Arc<LocalStore>,
        uploader: Arc<FakeUploader>,
        probe: Arc<ManualConnectivity>,
        controller: Arc<TestController>,
    }

    fn harness(uploader: FakeUploader) -> Harness {
        let db = Arc::new(Database::in_memory().unwrap());
        let store = Arc::new(LocalStore::new(db.clone()).unwrap());
        let uploader = Arc::new(uploader);
        let probe = Arc::new(ManualConnectivity::new(true));
        let controller = Arc::new(
            DrainController::new(db.clone(), store.clone(), uploader.clone(), probe.clone()).unwrap(),
        );
        Harness {
            db,
            store,
            uploader,
            probe,
            controller,
        }
    }

    fn session(tenant: &str) -> WakeSignal {
        WakeSignal::new(tenant, "tok")
    }

    fn capture(store: &LocalStore, tenant: &str, n: usize) -> Vec<EventRecord> {
        (0..n)
            .map(|i| {
                let record = EventRecord::access(tenant, format!("aluno-{i}"), AccessKind::Entry, None);
                store.append(&record).unwrap();
                record
            })
            .collect()
    }

    fn drain_events(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_backlog_drains_in_capped_batches() {
        let h = harness(FakeUploader::accept_all());
        capture(&h.store, "t1", 120);
        let mut events = h.controller.subscribe();

        let outcome = h.controller.wake(&session("t1")).await;

        assert_eq!(outcome, CycleOutcome::Drained { processed: 120, batches: 3, pending: 0 });
        assert_eq!(h.uploader.batch_sizes(), vec![50, 50, 20]);
        assert_eq!(h.store.count_all_pending("t1").unwrap(), 0);

        let events = drain_events(&mut events);
        assert_eq!(events.first(), Some(&SyncEvent::status(SyncState::Syncing, 120)));
        assert_eq!(events.last(), Some(&SyncEvent::status(SyncState::Idle, 0)));
        assert!(events.contains(&SyncEvent::success(50)));
        assert!(events.contains(&SyncEvent::success(20)));
        assert_eq!(h.controller.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn test_access_stream_drains_before_audit() {
        let h = harness(FakeUploader::accept_all());
        h.store
            .append(&EventRecord::audit("t1", "turmas/3A", AuditAction::Create, None))
            .unwrap();
        capture(&h.store, "t1", 2);

        h.controller.wake(&session("t1")).await;

        assert_eq!(h.uploader.streams(), vec![RecordStream::Access, RecordStream::Audit]);
    }

    #[tokio::test]
    async fn test_empty_backlog_reports_idle() {
        let h = harness(FakeUploader::accept_all());
        let mut events = h.controller.subscribe();

        let outcome = h.controller.wake(&session("t1")).await;

        assert_eq!(outcome, CycleOutcome::Drained { processed: 0, batches: 0, pending: 0 });
        assert!(h.uploader.batch_sizes().is_empty());
        assert_eq!(drain_events(&mut events), vec![SyncEvent::status(SyncState::Idle, 0)]);
    }

    #[tokio::test]
    async fn test_offline_short_circuits() {
        let h = harness(FakeUploader::accept_all());
        h.probe.set_online(false);
        capture(&h.store, "t1", 3);
        let mut events = h.controller.subscribe();

        let outcome = h.controller.wake(&session("t1")).await;

        assert_eq!(outcome, CycleOutcome::Offline { pending: 3 });
        assert!(h.uploader.batch_sizes().is_empty());
        assert_eq!(drain_events(&mut events), vec![SyncEvent::status(SyncState::Offline, 3)]);
        assert_eq!(h.controller.state(), SyncState::Offline);

        // Back online, the next wake drains
        h.probe.set_online(true);
        let outcome = h.controller.wake(&session("t1")).await;
        assert!(matches!(outcome, CycleOutcome::Drained { processed: 3, .. }));
        assert_eq!(h.controller.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn test_partial_acknowledgement_marks_only_confirmed_ids() {
        let h = harness(FakeUploader::accept_all());
        let records = capture(&h.store, "t1", 3);
        let (a, b, c) = (&records[0].id, &records[1].id, &records[2].id);
        h.uploader.set_mode(UploadMode::AcceptOnly(HashSet::from([a.clone(), c.clone()])));

        let outcome = h.controller.wake(&session("t1")).await;

        // The rejected record is not re-sent within the same cycle
        assert_eq!(outcome, CycleOutcome::Drained { processed: 2, batches: 1, pending: 1 });

        let find = |id: &str| h.store.find(RecordStream::Access, "t1", id).unwrap().unwrap();
        assert!(find(a).synchronized);
        assert!(find(c).synchronized);
        let rejected = find(b);
        assert!(!rejected.synchronized);
        assert_eq!(rejected.sync_attempts, 1);
        assert_eq!(rejected.last_error.as_deref(), Some("rejeitado"));
    }

    #[tokio::test]
    async fn test_rejected_head_batch_does_not_block_later_records() {
        let h = harness(FakeUploader::accept_all());
        let records = capture(&h.store, "t1", 60);
        let audit = EventRecord::audit("t1", "turmas/3A", AuditAction::Create, None);
        h.store.append(&audit).unwrap();
        h.controller
            .operations()
            .enqueue(&PendingOperation::delete("t1", EntityKind::Class, "3A"))
            .unwrap();

        let mut accepted: HashSet<String> = records[50..].iter().map(|r| r.id.clone()).collect();
        accepted.insert(audit.id.clone());
        h.uploader.set_mode(UploadMode::AcceptOnly(accepted));

        let outcome = h.controller.wake(&session("t1")).await;

        assert_eq!(outcome, CycleOutcome::Drained { processed: 11, batches: 3, pending: 50 });
        assert_eq!(h.uploader.batch_sizes(), vec![50, 10, 1]);
        assert_eq!(h.uploader.pushed_operations(), vec!["3A".to_string()]);

        let last = h.store.find(RecordStream::Access, "t1", &records[59].id).unwrap().unwrap();
        assert!(last.synchronized);
        let head = h.store.find(RecordStream::Access, "t1", &records[0].id).unwrap().unwrap();
        assert!(!head.synchronized);
        assert_eq!(head.sync_attempts, 1);

        // Rejected records are retried on the next wake, without ending it as a failure
        let outcome = h.controller.wake(&session("t1")).await;
        assert_eq!(outcome, CycleOutcome::Drained { processed: 0, batches: 1, pending: 50 });
        assert_eq!(h.controller.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn test_storage_fault_while_offline_is_reported() {
        let h = harness(FakeUploader::accept_all());
        h.probe.set_online(false);
        h.db.execute_batch("DROP TABLE access_records").unwrap();

        let outcome = h.controller.wake(&session("t1")).await;

        assert!(matches!(outcome, CycleOutcome::StorageFault { .. }));
        assert!(outcome.is_failure());
        assert_eq!(h.controller.state(), SyncState::Offline);

        let cycles = h.controller.history().recent("t1", 1).unwrap();
        assert_eq!(cycles[0].status, CycleStatus::StorageFault);
    }

    #[tokio::test]
    async fn test_operation_push_stops_when_session_is_rejected() {
        let h = harness(FakeUploader::accept_all());
        for id in ["aluno-1", "aluno-2", "aluno-3"] {
            h.controller
                .operations()
                .enqueue(&PendingOperation::delete("t1", EntityKind::Student, id))
                .unwrap();
        }
        h.uploader.reject_operations();

        let outcome = h.controller.wake(&session("t1")).await;

        assert!(matches!(outcome, CycleOutcome::Drained { .. }));
        assert_eq!(h.uploader.operation_attempts(), 1);
        assert!(h.uploader.pushed_operations().is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_marks_nothing_and_retry_delivers() {
        let h = harness(FakeUploader::unreachable());
        let records = capture(&h.store, "t1", 5);

        let outcome = h.controller.wake(&session("t1")).await;
        assert!(matches!(outcome, CycleOutcome::SoftFailure { processed: 0, batches: 0, .. }));
        assert_eq!(h.store.count_all_pending("t1").unwrap(), 5);

        // A transport failure is not charged to the records
        let first = h.store.find(RecordStream::Access, "t1", &records[0].id).unwrap().unwrap();
        assert_eq!(first.sync_attempts, 0);

        h.uploader.set_mode(UploadMode::AcceptAll);
        let outcome = h.controller.wake(&session("t1")).await;
        assert_eq!(outcome, CycleOutcome::Drained { processed: 5, batches: 1, pending: 0 });
    }

    #[tokio::test]
    async fn test_missing_credentials_is_noop() {
        let h = harness(FakeUploader::accept_all());
        capture(&h.store, "t1", 2);
        let mut events = h.controller.subscribe();

        for signal in [WakeSignal::new("", "tok"), WakeSignal::new("t1", "")] {
            let outcome = h.controller.wake(&signal).await;
            assert_eq!(outcome, CycleOutcome::Skipped(SkipReason::MissingCredentials));
        }

        assert!(h.uploader.batch_sizes().is_empty());
        assert!(drain_events(&mut events).is_empty());
        assert!(h.controller.history().recent("t1", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_wake_is_skipped() {
        let h = harness(FakeUploader::accept_all().with_delay(Duration::from_millis(200)));
        capture(&h.store, "t1", 10);

        let controller = h.controller.clone();
        let first = tokio::spawn(async move { controller.wake(&session("t1")).await });

        for _ in 0..100 {
            if h.controller.state() == SyncState::Syncing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.controller.state(), SyncState::Syncing);

        let second = h.controller.wake(&session("t1")).await;
        assert_eq!(second, CycleOutcome::Skipped(SkipReason::AlreadySyncing));

        let first = first.await.unwrap();
        assert_eq!(first, CycleOutcome::Drained { processed: 10, batches: 1, pending: 0 });
        assert_eq!(h.uploader.batch_sizes(), vec![10]);
    }

    #[tokio::test]
    async fn test_cycle_only_sees_its_tenant() {
        let h = harness(FakeUploader::accept_all());
        capture(&h.store, "t1", 3);
        capture(&h.store, "t2", 4);

        let outcome = h.controller.wake(&session("t1")).await;

        assert_eq!(outcome, CycleOutcome::Drained { processed: 3, batches: 1, pending: 0 });
        assert!(h.uploader.uploaded().iter().all(|r| r.tenant_id == "t1"));
        assert_eq!(h.store.count_all_pending("t2").unwrap(), 4);
    }

    #[tokio::test]
    async fn test_synchronized_flag_never_reverts() {
        let h = harness(FakeUploader::accept_all());
        let records = capture(&h.store, "t1", 1);
        let id = records[0].id.clone();

        h.controller.wake(&session("t1")).await;

        let charged = h
            .store
            .record_rejections(RecordStream::Access, "t1", &[(id.clone(), "late".into())])
            .unwrap();
        assert_eq!(charged, 0);

        let stored = h.store.find(RecordStream::Access, "t1", &id).unwrap().unwrap();
        assert!(stored.synchronized);
        assert_eq!(stored.sync_attempts, 0);

        // Nothing left to send on the next wake
        h.controller.wake(&session("t1")).await;
        assert_eq!(h.uploader.batch_sizes(), vec![1]);
    }

    #[tokio::test]
    async fn test_operations_pushed_after_drain() {
        let h = harness(FakeUploader::accept_all());
        capture(&h.store, "t1", 1);
        let op_id = h
            .controller
            .operations()
            .enqueue(&PendingOperation::upsert(
                "t1",
                EntityKind::Student,
                "aluno-9",
                serde_json::json!({"nome": "Ana"}),
            ))
            .unwrap();

        h.probe.set_online(false);
        h.controller.wake(&session("t1")).await;
        assert!(h.uploader.pushed_operations().is_empty());

        h.probe.set_online(true);
        h.controller.wake(&session("t1")).await;

        assert_eq!(h.uploader.pushed_operations(), vec!["aluno-9".to_string()]);
        let op = h.controller.operations().get_by_id(op_id).unwrap();
        assert_eq!(op.status, QueueStatus::Completed);

        let cycles = h.controller.history().recent("t1", 1).unwrap();
        assert_eq!(cycles[0].operations_pushed, 1);
    }

    #[tokio::test]
    async fn test_cycles_are_recorded() {
        let h = harness(FakeUploader::accept_all());
        capture(&h.store, "t1", 2);

        h.probe.set_online(false);
        h.controller.wake(&session("t1")).await;
        h.probe.set_online(true);
        h.controller.wake(&session("t1")).await;

        let cycles = h.controller.history().recent("t1", 10).unwrap();
        assert_eq!(cycles.len(), 2);
        let statuses: Vec<_> = cycles.iter().map(|c| c.status).collect();
        assert!(statuses.contains(&CycleStatus::Offline));
        assert!(statuses.contains(&CycleStatus::Drained));

        let drained = cycles.iter().find(|c| c.status == CycleStatus::Drained).unwrap();
        assert_eq!(drained.processed, 2);
        assert_eq!(drained.pending_after, 0);
    }
}

// ============================================================================
// Kiosk against a live ingestion server
// ============================================================================

#[cfg(test)]
mod end_to_end_tests {
    use crate::db::Database;
    use crate::server::auth::{StaticTokenVerifier, TenantScope};
    use crate::server::ingest::IngestStore;
    use crate::server::{serve, AppState};
    use crate::sync::api::{BatchUploader, SyncApiClient};
    use crate::sync::connectivity::ManualConnectivity;
    use crate::sync::manager::{CycleOutcome, DrainController};
    use crate::sync::models::{AccessKind, EventRecord, RecordQuery, RecordStream, WakeSignal};
    use crate::sync::store::LocalStore;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn spawn_server() -> (String, Arc<IngestStore>, tokio::sync::oneshot::Sender<()>) {
        let db = Arc::new(Database::in_memory().unwrap());
        let ingest = Arc::new(IngestStore::new(db).unwrap());
        let verifier = StaticTokenVerifier::new()
            .grant("tok-escola", TenantScope::Only(HashSet::from(["escola-1".to_string()])));
        let state = AppState::new(ingest.clone(), Arc::new(verifier));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(serve(listener, state, async {
            rx.await.ok();
        }));

        (url, ingest, tx)
    }

    fn kiosk(url: &str) -> (Arc<LocalStore>, DrainController<SyncApiClient, ManualConnectivity>) {
        let db = Arc::new(Database::in_memory().unwrap());
        let store = Arc::new(LocalStore::new(db.clone()).unwrap());
        let controller = DrainController::new(
            db,
            store.clone(),
            Arc::new(SyncApiClient::new(url).unwrap()),
            Arc::new(ManualConnectivity::new(true)),
        )
        .unwrap();
        (store, controller)
    }

    #[tokio::test]
    async fn test_kiosk_drains_into_server() {
        let (url, ingest, _shutdown) = spawn_server().await;
        let (store, controller) = kiosk(&url);

        for i in 0..60 {
            store
                .append(&EventRecord::access("escola-1", format!("aluno-{i}"), AccessKind::Entry, None))
                .unwrap();
        }

        let outcome = controller.wake(&WakeSignal::new("escola-1", "tok-escola")).await;

        assert_eq!(outcome, CycleOutcome::Drained { processed: 60, batches: 2, pending: 0 });
        assert_eq!(ingest.count(RecordStream::Access, "escola-1").unwrap(), 60);

        let client = SyncApiClient::new(&url).unwrap();
        let listed = client
            .list_access(&RecordQuery::default().with_limit(10), &WakeSignal::new("escola-1", "tok-escola"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 10);
    }

    #[tokio::test]
    async fn test_replayed_batch_is_idempotent() {
        let (url, ingest, _shutdown) = spawn_server().await;
        let client = SyncApiClient::new(&url).unwrap();
        let session = WakeSignal::new("escola-1", "tok-escola");
        let batch: Vec<_> = (0..3)
            .map(|i| EventRecord::access("escola-1", format!("aluno-{i}"), AccessKind::Exit, None))
            .collect();

        let first = client.upload_batch(RecordStream::Access, &batch, &session).await.unwrap();
        let replay = client.upload_batch(RecordStream::Access, &batch, &session).await.unwrap();

        assert!(first.iter().all(|o| o.is_synchronized()));
        assert!(replay.iter().all(|o| o.is_synchronized()));
        assert_eq!(ingest.count(RecordStream::Access, "escola-1").unwrap(), 3);
    }

    #[tokio::test]
    async fn test_rejected_credentials_leave_backlog_untouched() {
        let (url, ingest, _shutdown) = spawn_server().await;
        let (store, controller) = kiosk(&url);
        store
            .append(&EventRecord::access("escola-1", "aluno-1", AccessKind::Entry, None))
            .unwrap();

        let outcome = controller.wake(&WakeSignal::new("escola-1", "expirado")).await;

        assert!(matches!(outcome, CycleOutcome::SoftFailure { processed: 0, .. }));
        assert_eq!(store.count_all_pending("escola-1").unwrap(), 1);
        assert_eq!(ingest.count(RecordStream::Access, "escola-1").unwrap(), 0);
    }
}

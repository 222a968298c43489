//! Event capture on the kiosk
//!
//! Builds records from scans and administrative edits, appends them to the
//! local store and nudges the scheduler. Capture never waits on the network.

use crate::sync::models::{AccessKind, AuditAction, CaptureMethod, EventKind, EventRecord, WakeSignal};
use crate::sync::queue::{EntityKind, OperationQueue, PendingOperation, QueueError};
use crate::sync::scheduler::WakeHandle;
use crate::sync::store::{LocalStore, StoreError};
use std::sync::{Arc, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("No active session - tenant unknown")]
    NoSession,

    #[error("{0} of {1} requires a payload")]
    MissingPayload(&'static str, String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

pub struct CaptureService {
    store: Arc<LocalStore>,
    operations: Arc<OperationQueue>,
    wake: Option<WakeHandle>,
    session: RwLock<Option<WakeSignal>>,
    retention_months: u32,
}

impl CaptureService {
    pub fn new(store: Arc<LocalStore>, operations: Arc<OperationQueue>, retention_months: u32) -> Self {
        Self {
            store,
            operations,
            wake: None,
            session: RwLock::new(None),
            retention_months,
        }
    }

    /// Nudge this scheduler after every capture
    pub fn with_wake_handle(mut self, wake: WakeHandle) -> Self {
        self.wake = Some(wake);
        self
    }

    /// Replace the session (login) or clear it (logout). A new session triggers a cycle.
    pub fn set_session(&self, session: Option<WakeSignal>) {
        let mut guard = self.session.write().unwrap_or_else(|e| e.into_inner());
        *guard = session;
        match guard.as_ref() {
            Some(session) => {
                log::info!("Session started for tenant {}", session.tenant_id);
                self.nudge(session.clone());
            }
            None => log::info!("Session cleared"),
        }
    }

    pub fn tenant_id(&self) -> Option<String> {
        self.session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| s.tenant_id.clone())
    }

    /// Record an entrance or exit scan
    pub fn record_access(
        &self,
        subject_reference: &str,
        kind: AccessKind,
        method: Option<CaptureMethod>,
    ) -> Result<EventRecord, CaptureError> {
        let session = self.current_session()?;
        let record = EventRecord::access(session.tenant_id.as_str(), subject_reference, kind, method)
            .with_retention_months(self.retention_months);

        self.store.append(&record)?;
        log::info!(
            "Captured {} for {} via {}",
            record.event_kind.as_str(),
            subject_reference,
            record.capture_method.as_str()
        );

        self.nudge(session);
        Ok(record)
    }

    /// Record an audit entry
    pub fn record_audit(
        &self,
        subject_reference: &str,
        action: AuditAction,
        payload: Option<serde_json::Value>,
    ) -> Result<EventRecord, CaptureError> {
        let session = self.current_session()?;
        let record = EventRecord::audit(session.tenant_id.as_str(), subject_reference, action, payload)
            .with_retention_months(self.retention_months);

        self.store.append(&record)?;
        self.nudge(session);
        Ok(record)
    }

    /// Queue an entity mutation and audit it
    pub fn record_entity_change(
        &self,
        entity: EntityKind,
        entity_id: &str,
        action: AuditAction,
        payload: Option<serde_json::Value>,
    ) -> Result<EventRecord, CaptureError> {
        let session = self.current_session()?;
        let tenant_id = session.tenant_id.as_str();

        let operation = match (action, payload.clone()) {
            (AuditAction::Delete, _) => PendingOperation::delete(tenant_id, entity, entity_id),
            (_, Some(body)) => PendingOperation::upsert(tenant_id, entity, entity_id, body),
            (_, None) => {
                let kind = EventKind::Audit(action);
                return Err(CaptureError::MissingPayload(kind.as_str(), format!("{}/{}", entity.path(), entity_id)));
            }
        };
        self.operations.enqueue(&operation)?;

        let subject = format!("{}/{}", entity.path(), entity_id);
        let record = EventRecord::audit(tenant_id, subject, action, payload)
            .with_retention_months(self.retention_months);
        self.store.append(&record)?;

        self.nudge(session);
        Ok(record)
    }

    fn current_session(&self) -> Result<WakeSignal, CaptureError> {
        self.session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(CaptureError::NoSession)
    }

    fn nudge(&self, session: WakeSignal) {
        if let Some(wake) = &self.wake {
            wake.wake(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::sync::models::{EventKind, RecordStream};

    fn create_service() -> (Arc<LocalStore>, Arc<OperationQueue>, CaptureService) {
        let db = Arc::new(Database::in_memory().unwrap());
        let store = Arc::new(LocalStore::new(db.clone()).unwrap());
        let operations = Arc::new(OperationQueue::new(db).unwrap());
        let service = CaptureService::new(store.clone(), operations.clone(), 12);
        (store, operations, service)
    }

    #[test]
    fn test_capture_requires_session() {
        let (_store, _ops, service) = create_service();
        let result = service.record_access("aluno-1", AccessKind::Entry, None);
        assert!(matches!(result, Err(CaptureError::NoSession)));
    }

    #[test]
    fn test_record_access_uses_session_tenant() {
        let (store, _ops, service) = create_service();
        service.set_session(Some(WakeSignal::new("escola-1", "tok")));

        let record = service
            .record_access("aluno-1", AccessKind::Exit, Some(CaptureMethod::Card))
            .unwrap();

        assert_eq!(record.tenant_id, "escola-1");
        assert_eq!(record.retention_months, 12);
        let pending = store.list_pending(RecordStream::Access, "escola-1", 0, 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].capture_method, CaptureMethod::Card);
    }

    #[test]
    fn test_entity_change_queues_operation_and_audits() {
        let (store, ops, service) = create_service();
        service.set_session(Some(WakeSignal::new("escola-1", "tok")));

        service
            .record_entity_change(
                EntityKind::Student,
                "aluno-7",
                AuditAction::Update,
                Some(serde_json::json!({"nome": "Caio"})),
            )
            .unwrap();
        service
            .record_entity_change(EntityKind::Class, "3A", AuditAction::Delete, None)
            .unwrap();

        let ready = ops.ready_operations("escola-1", 10).unwrap();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].entity_id, "aluno-7");

        let audit = store.list_pending(RecordStream::Audit, "escola-1", 0, 10).unwrap();
        assert_eq!(audit[0].subject_reference, "alunos/aluno-7");
        assert_eq!(audit[1].event_kind, EventKind::Audit(AuditAction::Delete));
    }

    #[test]
    fn test_update_without_payload_is_rejected_not_deleted() {
        let (store, ops, service) = create_service();
        service.set_session(Some(WakeSignal::new("escola-1", "tok")));

        let result = service.record_entity_change(EntityKind::Student, "aluno-7", AuditAction::Update, None);
        assert!(matches!(result, Err(CaptureError::MissingPayload("UPDATE", _))));

        let result = service.record_entity_change(EntityKind::User, "u-1", AuditAction::Create, None);
        assert!(matches!(result, Err(CaptureError::MissingPayload("CREATE", _))));

        assert!(ops.ready_operations("escola-1", 10).unwrap().is_empty());
        assert_eq!(store.count_all_pending("escola-1").unwrap(), 0);
    }

    #[test]
    fn test_logout_clears_tenant() {
        let (_store, _ops, service) = create_service();
        service.set_session(Some(WakeSignal::new("escola-1", "tok")));
        assert_eq!(service.tenant_id().as_deref(), Some("escola-1"));

        service.set_session(None);
        assert!(service.tenant_id().is_none());
    }
}

//! Sync Data Models - Client and Wire Structures
//!
//! Data categories:
//! - EventRecord: access and audit events captured on the kiosk
//! - WireRecord / RecordOutcome: JSON shapes exchanged with the server
//! - WakeSignal / SyncEvent: controller input and output messages

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Retention applied when capture does not specify one
pub const DEFAULT_RETENTION_MONTHS: u32 = 24;

// ============================================================================
// Record streams and kinds
// ============================================================================

/// The two append-only event streams kept on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStream {
    Access,
    Audit,
}

impl RecordStream {
    /// Streams in drain order
    pub const ALL: [RecordStream; 2] = [RecordStream::Access, RecordStream::Audit];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Audit => "audit",
        }
    }

    /// Local table holding this stream
    pub fn table(&self) -> &'static str {
        match self {
            Self::Access => "access_records",
            Self::Audit => "audit_records",
        }
    }

    /// Remote collection path
    pub fn endpoint(&self) -> &'static str {
        match self {
            Self::Access => "/acessos",
            Self::Audit => "/auditoria",
        }
    }
}

impl fmt::Display for RecordStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a physical access event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessKind {
    #[serde(rename = "ENTRADA")]
    Entry,
    #[serde(rename = "SAIDA")]
    Exit,
}

/// Audited mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

/// Event kind, tied to the stream it belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Access(AccessKind),
    Audit(AuditAction),
}

impl EventKind {
    pub fn stream(&self) -> RecordStream {
        match self {
            Self::Access(_) => RecordStream::Access,
            Self::Audit(_) => RecordStream::Audit,
        }
    }

    /// Wire/storage code (`ENTRADA`, `SAIDA`, `CREATE`, ...)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Access(AccessKind::Entry) => "ENTRADA",
            Self::Access(AccessKind::Exit) => "SAIDA",
            Self::Audit(AuditAction::Create) => "CREATE",
            Self::Audit(AuditAction::Update) => "UPDATE",
            Self::Audit(AuditAction::Delete) => "DELETE",
        }
    }

    /// Parse a code, accepting only kinds valid for `stream`
    pub fn parse(stream: RecordStream, code: &str) -> Option<Self> {
        match (stream, code) {
            (RecordStream::Access, "ENTRADA") => Some(Self::Access(AccessKind::Entry)),
            (RecordStream::Access, "SAIDA") => Some(Self::Access(AccessKind::Exit)),
            (RecordStream::Audit, "CREATE") => Some(Self::Audit(AuditAction::Create)),
            (RecordStream::Audit, "UPDATE") => Some(Self::Audit(AuditAction::Update)),
            (RecordStream::Audit, "DELETE") => Some(Self::Audit(AuditAction::Delete)),
            _ => None,
        }
    }
}

/// How the event was sensed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CaptureMethod {
    #[default]
    #[serde(rename = "qrcode")]
    QrCode,
    #[serde(rename = "manual")]
    Manual,
    #[serde(rename = "cartao")]
    Card,
    #[serde(rename = "facial")]
    Facial,
}

impl CaptureMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QrCode => "qrcode",
            Self::Manual => "manual",
            Self::Card => "cartao",
            Self::Facial => "facial",
        }
    }

    /// Unknown values fall back to the default method
    pub fn from_str(s: &str) -> Self {
        match s {
            "manual" => Self::Manual,
            "cartao" => Self::Card,
            "facial" => Self::Facial,
            _ => Self::QrCode,
        }
    }
}

// ============================================================================
// Local record
// ============================================================================

/// An access or audit event as held by the local durable store
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// Local insertion sequence (0 until appended)
    pub seq: i64,
    /// Client-generated idempotency key
    pub id: String,
    pub tenant_id: String,
    pub subject_reference: String,
    pub event_kind: EventKind,
    /// Audit payload; `None` for access events
    pub payload: Option<serde_json::Value>,
    pub capture_method: CaptureMethod,
    pub occurred_at: DateTime<Utc>,
    pub synchronized: bool,
    pub retention_months: u32,
    /// Rejected or unacknowledged upload attempts
    pub sync_attempts: u32,
    pub last_error: Option<String>,
}

impl EventRecord {
    /// New access event, not yet synchronized
    pub fn access(
        tenant_id: impl Into<String>,
        subject_reference: impl Into<String>,
        kind: AccessKind,
        capture_method: Option<CaptureMethod>,
    ) -> Self {
        Self::new(
            tenant_id.into(),
            subject_reference.into(),
            EventKind::Access(kind),
            None,
            capture_method.unwrap_or_default(),
        )
    }

    /// New audit event, not yet synchronized
    pub fn audit(
        tenant_id: impl Into<String>,
        subject_reference: impl Into<String>,
        action: AuditAction,
        payload: Option<serde_json::Value>,
    ) -> Self {
        Self::new(
            tenant_id.into(),
            subject_reference.into(),
            EventKind::Audit(action),
            payload,
            CaptureMethod::Manual,
        )
    }

    fn new(
        tenant_id: String,
        subject_reference: String,
        event_kind: EventKind,
        payload: Option<serde_json::Value>,
        capture_method: CaptureMethod,
    ) -> Self {
        Self {
            seq: 0,
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id,
            subject_reference,
            event_kind,
            payload,
            capture_method,
            occurred_at: Utc::now(),
            synchronized: false,
            retention_months: DEFAULT_RETENTION_MONTHS,
            sync_attempts: 0,
            last_error: None,
        }
    }

    pub fn with_retention_months(mut self, months: u32) -> Self {
        self.retention_months = months;
        self
    }

    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn stream(&self) -> RecordStream {
        self.event_kind.stream()
    }

    /// JSON projection sent to the server (tenant travels in a header)
    pub fn to_wire(&self) -> WireRecord {
        WireRecord {
            id: self.id.clone(),
            subject_reference: self.subject_reference.clone(),
            event_kind: self.event_kind.as_str().to_string(),
            capture_method: self.capture_method,
            occurred_at: self.occurred_at,
            payload: self.payload.clone(),
            retention_months: self.retention_months,
        }
    }
}

// ============================================================================
// Wire format
// ============================================================================

fn default_retention_months() -> u32 {
    DEFAULT_RETENTION_MONTHS
}

/// Record body exchanged with the ingestion endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRecord {
    pub id: String,
    #[serde(rename = "referencia")]
    pub subject_reference: String,
    #[serde(rename = "tipo")]
    pub event_kind: String,
    #[serde(rename = "metodo", default)]
    pub capture_method: CaptureMethod,
    #[serde(rename = "timestamp")]
    pub occurred_at: DateTime<Utc>,
    #[serde(rename = "dados", default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(rename = "meses_retencao", default = "default_retention_months")]
    pub retention_months: u32,
}

/// Per-record acknowledgement status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeStatus {
    #[serde(rename = "sincronizado")]
    Synchronized,
    #[serde(rename = "erro")]
    Error,
}

/// Per-record result of an ingestion request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub id: String,
    pub status: OutcomeStatus,
    #[serde(rename = "erro", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecordOutcome {
    pub fn synchronized(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: OutcomeStatus::Synchronized,
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: OutcomeStatus::Error,
            error: Some(reason.into()),
        }
    }

    pub fn is_synchronized(&self) -> bool {
        self.status == OutcomeStatus::Synchronized
    }
}

/// Record as returned by the read side of the ingestion server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestedRecord {
    #[serde(flatten)]
    pub record: WireRecord,
    #[serde(rename = "recebido_em")]
    pub received_at: DateTime<Utc>,
}

/// Filters accepted by `GET /acessos` and `GET /auditoria`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordQuery {
    /// Exact calendar day (UTC) of `timestamp`
    #[serde(rename = "data", default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    /// Only records whose `timestamp` is at or after this instant
    #[serde(rename = "desde", default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(rename = "limite", default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl RecordQuery {
    pub fn since(since: DateTime<Utc>) -> Self {
        Self {
            since: Some(since),
            ..Self::default()
        }
    }

    pub fn on_date(date: NaiveDate) -> Self {
        Self {
            date: Some(date),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

// ============================================================================
// Controller messages
// ============================================================================

/// Session context that triggers a drain cycle
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct WakeSignal {
    pub tenant_id: String,
    pub auth_credential: String,
}

impl WakeSignal {
    pub fn new(tenant_id: impl Into<String>, auth_credential: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            auth_credential: auth_credential.into(),
        }
    }

    /// Both fields present and non-blank
    pub fn is_complete(&self) -> bool {
        !self.tenant_id.trim().is_empty() && !self.auth_credential.trim().is_empty()
    }
}

impl fmt::Debug for WakeSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WakeSignal")
            .field("tenant_id", &self.tenant_id)
            .field("auth_credential", &"<redacted>")
            .finish()
    }
}

/// Drain controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncState {
    Idle,
    Syncing,
    Offline,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Offline => "offline",
        }
    }
}

/// Status events published for UI and telemetry consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SyncEvent {
    Status {
        status: SyncState,
        pending: u64,
    },
    SyncSuccess {
        event: EventTag,
        #[serde(rename = "processedCount")]
        processed_count: u64,
    },
    SyncError {
        event: EventTag,
        reason: String,
    },
}

/// Discriminator carried by non-status events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventTag {
    SyncSuccess,
    SyncError,
}

impl SyncEvent {
    pub fn status(status: SyncState, pending: u64) -> Self {
        Self::Status { status, pending }
    }

    pub fn success(processed_count: u64) -> Self {
        Self::SyncSuccess {
            event: EventTag::SyncSuccess,
            processed_count,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::SyncError {
            event: EventTag::SyncError,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_record_defaults() {
        let record = EventRecord::access("escola-1", "aluno-42", AccessKind::Entry, None);

        assert!(!record.synchronized);
        assert_eq!(record.capture_method, CaptureMethod::QrCode);
        assert_eq!(record.retention_months, DEFAULT_RETENTION_MONTHS);
        assert_eq!(record.stream(), RecordStream::Access);
        assert!(uuid::Uuid::parse_str(&record.id).is_ok());
    }

    #[test]
    fn test_event_kind_parse_respects_stream() {
        assert_eq!(
            EventKind::parse(RecordStream::Access, "SAIDA"),
            Some(EventKind::Access(AccessKind::Exit))
        );
        assert_eq!(EventKind::parse(RecordStream::Audit, "ENTRADA"), None);
        assert_eq!(EventKind::parse(RecordStream::Access, "DELETE"), None);
    }

    #[test]
    fn test_wire_record_defaults_when_absent() {
        let json = r#"{"id":"a1","referencia":"aluno-1","tipo":"ENTRADA","timestamp":"2026-03-01T10:00:00Z"}"#;
        let wire: WireRecord = serde_json::from_str(json).unwrap();

        assert_eq!(wire.capture_method, CaptureMethod::QrCode);
        assert_eq!(wire.retention_months, DEFAULT_RETENTION_MONTHS);
        assert!(wire.payload.is_none());
    }

    #[test]
    fn test_wire_record_omits_tenant() {
        let record = EventRecord::audit(
            "escola-1",
            "alunos/7",
            AuditAction::Update,
            Some(serde_json::json!({"nome": "Ana"})),
        );
        let json = serde_json::to_value(record.to_wire()).unwrap();

        assert!(json.get("tenant_id").is_none());
        assert_eq!(json["tipo"], "UPDATE");
        assert_eq!(json["metodo"], "manual");
        assert_eq!(json["dados"]["nome"], "Ana");
    }

    #[test]
    fn test_outcome_wire_shape() {
        let ok = serde_json::to_value(RecordOutcome::synchronized("a")).unwrap();
        assert_eq!(ok, serde_json::json!({"id": "a", "status": "sincronizado"}));

        let parsed: RecordOutcome =
            serde_json::from_str(r#"{"id":"b","status":"erro","erro":"tipo invalido"}"#).unwrap();
        assert!(!parsed.is_synchronized());
        assert_eq!(parsed.error.as_deref(), Some("tipo invalido"));
    }

    #[test]
    fn test_record_query_uses_portuguese_params() {
        let query = RecordQuery::on_date(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()).with_limit(10);
        let json = serde_json::to_value(&query).unwrap();

        assert_eq!(json, serde_json::json!({"data": "2026-03-01", "limite": 10}));
    }

    #[test]
    fn test_sync_event_shapes() {
        let status = serde_json::to_value(SyncEvent::status(SyncState::Idle, 0)).unwrap();
        assert_eq!(status, serde_json::json!({"status": "IDLE", "pending": 0}));

        let success = serde_json::to_value(SyncEvent::success(3)).unwrap();
        assert_eq!(
            success,
            serde_json::json!({"event": "SYNC_SUCCESS", "processedCount": 3})
        );
    }

    #[test]
    fn test_wake_signal_debug_redacts_credential() {
        let signal = WakeSignal::new("escola-1", "secret-token");
        let rendered = format!("{:?}", signal);

        assert!(rendered.contains("escola-1"));
        assert!(!rendered.contains("secret-token"));
        assert!(signal.is_complete());
        assert!(!WakeSignal::new("escola-1", "  ").is_complete());
    }
}

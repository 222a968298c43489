//! Server-side record store with insert-if-absent semantics
//!
//! The record id is the primary key. A replayed id is a no-op reported as
//! synchronized; an existing row is never updated. Each record in a batch
//! gets its own outcome, so one bad record does not fail its siblings.

use crate::db::{timestamp_column, to_db_timestamp, Database, DbError};
use crate::sync::models::{
    CaptureMethod, EventKind, IngestedRecord, RecordOutcome, RecordQuery, RecordStream, WireRecord,
};
use chrono::{Duration, Utc};
use rusqlite::params;
use std::sync::Arc;

/// Records returned by a read when `limite` is absent
pub const DEFAULT_READ_LIMIT: u32 = 100;

/// Hard cap on records returned by a read
pub const MAX_READ_LIMIT: u32 = 500;

const MAX_ID_LEN: usize = 128;

/// One element of an ingestion request after decoding
#[derive(Debug, Clone)]
pub enum IngestItem {
    Valid(WireRecord),
    Malformed { id: String, reason: String },
}

impl IngestItem {
    /// Decode one JSON element, keeping its id for the error outcome
    pub fn decode(value: serde_json::Value) -> Self {
        let id = value
            .get("id")
            .and_then(|id| id.as_str())
            .unwrap_or_default()
            .to_string();

        match serde_json::from_value::<WireRecord>(value) {
            Ok(record) => IngestItem::Valid(record),
            Err(e) => IngestItem::Malformed {
                id,
                reason: format!("registro invalido: {}", e),
            },
        }
    }
}

fn table(stream: RecordStream) -> &'static str {
    match stream {
        RecordStream::Access => "ingested_access",
        RecordStream::Audit => "ingested_audit",
    }
}

/// Persistent store behind the ingestion endpoint
pub struct IngestStore {
    db: Arc<Database>,
}

impl IngestStore {
    pub fn new(db: Arc<Database>) -> Result<Self, IngestError> {
        let store = Self { db };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), IngestError> {
        for stream in RecordStream::ALL {
            let table = table(stream);
            self.db.execute_batch(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL,
                    subject_reference TEXT NOT NULL,
                    event_kind TEXT NOT NULL,
                    capture_method TEXT NOT NULL,
                    occurred_at TEXT NOT NULL,
                    payload TEXT,
                    retention_months INTEGER NOT NULL CHECK (retention_months > 0),
                    received_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_{table}_tenant_occurred
                    ON {table}(tenant_id, occurred_at);
                "#
            ))?;
        }
        Ok(())
    }

    /// Insert-if-absent every item, one outcome per item in request order
    pub fn ingest(
        &self,
        stream: RecordStream,
        tenant_id: &str,
        items: &[IngestItem],
    ) -> Result<Vec<RecordOutcome>, IngestError> {
        let table = table(stream);
        let insert_sql = format!(
            "INSERT INTO {table} (
                id, tenant_id, subject_reference, event_kind, capture_method,
                occurred_at, payload, retention_months, received_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO NOTHING"
        );
        let owner_sql = format!("SELECT tenant_id FROM {table} WHERE id = ?1");
        let received_at = to_db_timestamp(&Utc::now());

        let outcomes = self.db.transaction(|tx| {
            let mut insert = tx.prepare(&insert_sql)?;
            let mut owner = tx.prepare(&owner_sql)?;
            let mut outcomes = Vec::with_capacity(items.len());

            for item in items {
                let record = match item {
                    IngestItem::Valid(record) => record,
                    IngestItem::Malformed { id, reason } => {
                        outcomes.push(RecordOutcome::error(id.clone(), reason.clone()));
                        continue;
                    }
                };

                if let Err(reason) = validate(stream, record) {
                    outcomes.push(RecordOutcome::error(record.id.clone(), reason));
                    continue;
                }

                let payload = match record.payload.as_ref().map(serde_json::to_string).transpose() {
                    Ok(payload) => payload,
                    Err(e) => {
                        outcomes.push(RecordOutcome::error(record.id.clone(), e.to_string()));
                        continue;
                    }
                };

                let inserted = insert.execute(params![
                    record.id,
                    tenant_id,
                    record.subject_reference,
                    record.event_kind,
                    record.capture_method.as_str(),
                    to_db_timestamp(&record.occurred_at),
                    payload,
                    record.retention_months,
                    received_at,
                ]);

                let outcome = match inserted {
                    Ok(1) => RecordOutcome::synchronized(record.id.clone()),
                    Ok(_) => {
                        // Already present: a replay if the tenant matches
                        let existing: String = owner.query_row(params![record.id], |row| row.get(0))?;
                        if existing == tenant_id {
                            RecordOutcome::synchronized(record.id.clone())
                        } else {
                            log::warn!("Record id {} already owned by another tenant", record.id);
                            RecordOutcome::error(record.id.clone(), "id ja utilizado por outro tenant")
                        }
                    }
                    Err(rusqlite::Error::SqliteFailure(err, msg))
                        if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        RecordOutcome::error(
                            record.id.clone(),
                            msg.unwrap_or_else(|| "violacao de restricao".to_string()),
                        )
                    }
                    Err(e) => return Err(e),
                };
                outcomes.push(outcome);
            }

            Ok(outcomes)
        })?;

        let accepted = outcomes.iter().filter(|o| o.is_synchronized()).count();
        log::info!(
            "Ingested {} {} records for tenant {} ({} rejected)",
            accepted,
            stream,
            tenant_id,
            outcomes.len() - accepted
        );

        Ok(outcomes)
    }

    /// Tenant records, newest first, filtered by date or lower bound
    pub fn list(
        &self,
        stream: RecordStream,
        tenant_id: &str,
        query: &RecordQuery,
    ) -> Result<Vec<IngestedRecord>, IngestError> {
        let limit = query.limit.unwrap_or(DEFAULT_READ_LIMIT).clamp(1, MAX_READ_LIMIT);

        let (day_start, day_end) = match query.date {
            Some(date) => {
                let start = date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
                let start = start.ok_or_else(|| IngestError::InvalidQuery(date.to_string()))?;
                (Some(to_db_timestamp(&start)), Some(to_db_timestamp(&(start + Duration::days(1)))))
            }
            None => (None, None),
        };
        let since = query.since.as_ref().map(to_db_timestamp);

        let records = self.db.query(
            &format!(
                "SELECT id, subject_reference, event_kind, capture_method, occurred_at,
                        payload, retention_months, received_at
                 FROM {}
                 WHERE tenant_id = ?1
                   AND (?2 IS NULL OR occurred_at >= ?2)
                   AND (?3 IS NULL OR occurred_at < ?3)
                   AND (?4 IS NULL OR occurred_at >= ?4)
                 ORDER BY occurred_at DESC, id DESC
                 LIMIT ?5",
                table(stream)
            ),
            params![tenant_id, day_start, day_end, since, limit],
            |row| {
                let payload = match row.get::<_, Option<String>>(5)? {
                    Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
                    })?),
                    None => None,
                };

                Ok(IngestedRecord {
                    record: WireRecord {
                        id: row.get(0)?,
                        subject_reference: row.get(1)?,
                        event_kind: row.get(2)?,
                        capture_method: CaptureMethod::from_str(&row.get::<_, String>(3)?),
                        occurred_at: timestamp_column(row, 4)?,
                        payload,
                        retention_months: row.get(6)?,
                    },
                    received_at: timestamp_column(row, 7)?,
                })
            },
        )?;

        Ok(records)
    }

    /// Number of stored records of a tenant
    pub fn count(&self, stream: RecordStream, tenant_id: &str) -> Result<u64, IngestError> {
        let count: i64 = self.db.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE tenant_id = ?1", table(stream)),
            params![tenant_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

/// Per-record checks done before touching the table
fn validate(stream: RecordStream, record: &WireRecord) -> Result<(), String> {
    if record.id.trim().is_empty() {
        return Err("id vazio".to_string());
    }
    if record.id.len() > MAX_ID_LEN {
        return Err(format!("id excede {} caracteres", MAX_ID_LEN));
    }
    if record.subject_reference.trim().is_empty() {
        return Err("referencia vazia".to_string());
    }
    if EventKind::parse(stream, &record.event_kind).is_none() {
        return Err(format!("tipo invalido para {}: {}", stream.endpoint(), record.event_kind));
    }
    if record.retention_months == 0 {
        return Err("meses_retencao deve ser positivo".to_string());
    }
    Ok(())
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

impl From<DbError> for IngestError {
    fn from(e: DbError) -> Self {
        IngestError::DatabaseError(e.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Sync History Module - per-cycle ledger
//!
//! Records one row per drain cycle:
//! - How the cycle ended (drained, soft failure, offline, storage fault)
//! - Batches sent, records acknowledged and rejected
//! - Backlog left behind
//! - Enforces a retention policy to limit storage

use crate::db::{optional_timestamp_column, timestamp_column, to_db_timestamp, Database};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// Types & Structures
// ============================================================================

/// How a drain cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Drained,
    SoftFailure,
    Offline,
    StorageFault,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Drained => "drained",
            CycleStatus::SoftFailure => "soft_failure",
            CycleStatus::Offline => "offline",
            CycleStatus::StorageFault => "storage_fault",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "drained" => Ok(CycleStatus::Drained),
            "soft_failure" => Ok(CycleStatus::SoftFailure),
            "offline" => Ok(CycleStatus::Offline),
            "storage_fault" => Ok(CycleStatus::StorageFault),
            _ => Err(format!("Invalid cycle status: {}", s)),
        }
    }
}

/// A single drain cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    pub id: Option<i64>,
    pub tenant_id: String,
    pub device_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: CycleStatus,
    pub batches: u32,
    pub processed: u64,
    pub rejected: u64,
    pub operations_pushed: u32,
    pub pending_after: u64,
    pub error_message: Option<String>,
}

impl CycleRecord {
    pub fn started(tenant_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            id: None,
            tenant_id: tenant_id.into(),
            device_id: device_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            status: CycleStatus::Drained,
            batches: 0,
            processed: 0,
            rejected: 0,
            operations_pushed: 0,
            pending_after: 0,
            error_message: None,
        }
    }

    pub fn finish(&mut self, status: CycleStatus, error_message: Option<String>) {
        self.status = status;
        self.error_message = error_message;
        self.finished_at = Some(Utc::now());
    }
}

/// History statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryStats {
    pub total_cycles: i64,
    pub drained_cycles: i64,
    pub failed_cycles: i64,
    pub total_processed: i64,
    pub last_drained_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Cycle History
// ============================================================================

/// Manages the cycle ledger
pub struct CycleHistory {
    db: Arc<Database>,
}

impl CycleHistory {
    /// Create new history manager
    pub fn new(db: Arc<Database>) -> Result<Self, HistoryError> {
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sync_cycles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                status TEXT NOT NULL,
                batches INTEGER NOT NULL DEFAULT 0,
                processed INTEGER NOT NULL DEFAULT 0,
                rejected INTEGER NOT NULL DEFAULT 0,
                operations_pushed INTEGER NOT NULL DEFAULT 0,
                pending_after INTEGER NOT NULL DEFAULT 0,
                error_message TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_sync_cycles_tenant_started
                ON sync_cycles(tenant_id, started_at);
            "#,
        ).map_err(|e| HistoryError::DatabaseError(e.to_string()))?;

        Ok(Self { db })
    }

    /// Record a finished cycle
    pub fn record(&self, cycle: &CycleRecord) -> Result<i64, HistoryError> {
        self.db.execute_insert(
            "INSERT INTO sync_cycles (
                tenant_id, device_id, started_at, finished_at, status, batches,
                processed, rejected, operations_pushed, pending_after, error_message
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                cycle.tenant_id,
                cycle.device_id,
                to_db_timestamp(&cycle.started_at),
                cycle.finished_at.as_ref().map(to_db_timestamp),
                cycle.status.as_str(),
                cycle.batches,
                cycle.processed as i64,
                cycle.rejected as i64,
                cycle.operations_pushed,
                cycle.pending_after as i64,
                cycle.error_message,
            ],
        ).map_err(|e| HistoryError::DatabaseError(e.to_string()))
    }

    /// Most recent cycles of a tenant, newest first
    pub fn recent(&self, tenant_id: &str, limit: i32) -> Result<Vec<CycleRecord>, HistoryError> {
        self.db.query(
            "SELECT id, tenant_id, device_id, started_at, finished_at, status, batches,
                    processed, rejected, operations_pushed, pending_after, error_message
             FROM sync_cycles
             WHERE tenant_id = ?1
             ORDER BY started_at DESC, id DESC
             LIMIT ?2",
            rusqlite::params![tenant_id, limit],
            |row| {
                let status_raw: String = row.get(5)?;
                let status = CycleStatus::from_str(&status_raw).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, e.into())
                })?;

                Ok(CycleRecord {
                    id: Some(row.get(0)?),
                    tenant_id: row.get(1)?,
                    device_id: row.get(2)?,
                    started_at: timestamp_column(row, 3)?,
                    finished_at: optional_timestamp_column(row, 4)?,
                    status,
                    batches: row.get(6)?,
                    processed: row.get::<_, i64>(7)? as u64,
                    rejected: row.get::<_, i64>(8)? as u64,
                    operations_pushed: row.get(9)?,
                    pending_after: row.get::<_, i64>(10)? as u64,
                    error_message: row.get(11)?,
                })
            }
        ).map_err(|e| HistoryError::DatabaseError(e.to_string()))
    }

    /// Enforce retention policy - delete cycles older than specified days
    pub fn enforce_retention_policy(
        &self,
        retention_days: i64,
    ) -> Result<i32, HistoryError> {
        if retention_days < 0 {
            return Err(HistoryError::InvalidRetention(retention_days));
        }
        let cutoff_date = Utc::now() - chrono::Duration::days(retention_days);

        let deleted = self.db.execute(
            "DELETE FROM sync_cycles WHERE started_at < ?1",
            rusqlite::params![to_db_timestamp(&cutoff_date)],
        ).map_err(|e| HistoryError::DatabaseError(e.to_string()))?;

        Ok(deleted as i32)
    }

    /// Get statistics about a tenant's cycles
    pub fn get_stats(&self, tenant_id: &str) -> Result<HistoryStats, HistoryError> {
        self.db.query_row(
            "SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN status = 'drained' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status IN ('soft_failure', 'storage_fault') THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(processed), 0),
                MAX(CASE WHEN status = 'drained' THEN finished_at END)
             FROM sync_cycles
             WHERE tenant_id = ?1",
            rusqlite::params![tenant_id],
            |row| {
                Ok(HistoryStats {
                    total_cycles: row.get(0)?,
                    drained_cycles: row.get(1)?,
                    failed_cycles: row.get(2)?,
                    total_processed: row.get(3)?,
                    last_drained_at: optional_timestamp_column(row, 4)?,
                })
            }
        ).map_err(|e| HistoryError::DatabaseError(e.to_string()))
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Invalid retention period: {0} days")]
    InvalidRetention(i64),
}

// ============================================================================
// Tests
// ============================================================================

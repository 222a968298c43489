//! Local Durable Store - access and audit records held on the kiosk
//!
//! Records are appended once with `synchronized = 0` and only ever move to
//! `synchronized = 1`; a trigger rejects the reverse transition. Insertion
//! order (`seq`) is the drain order. Duplicated ids are accepted: they are a
//! normal result of offline capture plus retry and are de-duplicated by the
//! server.

use super::models::{CaptureMethod, EventKind, EventRecord, RecordStream};
use crate::db::{timestamp_column, to_db_timestamp, Database, DbError};
use chrono::{DateTime, Months, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const RECORD_COLUMNS: &str = "seq, id, tenant_id, subject_reference, event_kind, payload, \
     capture_method, occurred_at, synchronized, retention_months, sync_attempts, last_error";

/// Per-tenant counters for the status screen
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub access_pending: u64,
    pub access_synchronized: u64,
    pub audit_pending: u64,
    pub audit_synchronized: u64,
    /// Pending records excluded from the backlog by the poison threshold
    pub parked: u64,
}

impl StoreStats {
    pub fn total_pending(&self) -> u64 {
        self.access_pending + self.audit_pending
    }
}

/// Persistent keyed record storage on the device
pub struct LocalStore {
    db: Arc<Database>,
    poison_threshold: Option<u32>,
}

impl LocalStore {
    /// Open the store, creating tables on first use
    pub fn new(db: Arc<Database>) -> Result<Self, StoreError> {
        let store = Self {
            db,
            poison_threshold: None,
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Exclude records rejected `threshold` times from the backlog
    pub fn with_poison_threshold(mut self, threshold: Option<u32>) -> Self {
        self.poison_threshold = threshold.filter(|t| *t > 0);
        self
    }

    pub fn poison_threshold(&self) -> Option<u32> {
        self.poison_threshold
    }

    fn initialize_schema(&self) -> Result<(), StoreError> {
        for stream in RecordStream::ALL {
            let table = stream.table();
            self.db.execute_batch(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL,
                    tenant_id TEXT NOT NULL,
                    subject_reference TEXT NOT NULL,
                    event_kind TEXT NOT NULL,
                    payload TEXT,
                    capture_method TEXT NOT NULL,
                    occurred_at TEXT NOT NULL,
                    synchronized INTEGER NOT NULL DEFAULT 0 CHECK (synchronized IN (0, 1)),
                    retention_months INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    synchronized_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_{table}_pending
                    ON {table}(tenant_id, synchronized, seq);

                CREATE INDEX IF NOT EXISTS idx_{table}_id
                    ON {table}(id);

                CREATE TRIGGER IF NOT EXISTS {table}_sync_is_monotonic
                BEFORE UPDATE OF synchronized ON {table}
                WHEN OLD.synchronized = 1 AND NEW.synchronized = 0
                BEGIN
                    SELECT RAISE(ABORT, 'synchronized flag cannot be reset');
                END;
                "#
            ))?;

            // Migration: attempt bookkeeping for the poison-record policy
            if !self.db.has_column(table, "sync_attempts")? {
                log::info!("Running migration: adding sync_attempts/last_error to {}", table);
                self.db.execute_batch(&format!(
                    "ALTER TABLE {table} ADD COLUMN sync_attempts INTEGER NOT NULL DEFAULT 0;
                     ALTER TABLE {table} ADD COLUMN last_error TEXT;"
                ))?;
            }
        }
        Ok(())
    }

    /// Append a record. Only storage faults fail; duplicates are kept.
    pub fn append(&self, record: &EventRecord) -> Result<i64, StoreError> {
        let payload = record
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let seq = self.db.execute_insert(
            &format!(
                "INSERT INTO {} (
                    id, tenant_id, subject_reference, event_kind, payload, capture_method,
                    occurred_at, synchronized, retention_months, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9)",
                record.stream().table()
            ),
            params![
                record.id,
                record.tenant_id,
                record.subject_reference,
                record.event_kind.as_str(),
                payload,
                record.capture_method.as_str(),
                to_db_timestamp(&record.occurred_at),
                record.retention_months,
                to_db_timestamp(&Utc::now()),
            ],
        )?;

        log::debug!("Appended {} record {} (seq {})", record.stream(), record.id, seq);
        Ok(seq)
    }

    /// Pending records after `after_seq`, in insertion order
    pub fn list_pending(
        &self,
        stream: RecordStream,
        tenant_id: &str,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let records = self.db.query(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM {}
                 WHERE tenant_id = ?1 AND synchronized = 0 AND seq > ?2
                   AND (?3 IS NULL OR sync_attempts < ?3)
                 ORDER BY seq ASC
                 LIMIT ?4",
                stream.table()
            ),
            params![tenant_id, after_seq, self.poison_threshold, limit as i64],
            |row| record_from_row(stream, row),
        )?;
        Ok(records)
    }

    /// Size of the pending backlog for one stream
    pub fn count_pending(&self, stream: RecordStream, tenant_id: &str) -> Result<u64, StoreError> {
        let count: i64 = self.db.query_row(
            &format!(
                "SELECT COUNT(*) FROM {}
                 WHERE tenant_id = ?1 AND synchronized = 0
                   AND (?2 IS NULL OR sync_attempts < ?2)",
                stream.table()
            ),
            params![tenant_id, self.poison_threshold],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Size of the pending backlog across both streams
    pub fn count_all_pending(&self, tenant_id: &str) -> Result<u64, StoreError> {
        let mut total = 0;
        for stream in RecordStream::ALL {
            total += self.count_pending(stream, tenant_id)?;
        }
        Ok(total)
    }

    /// Flip the flag for exactly the given ids. Unknown ids are ignored.
    pub fn mark_synchronized(
        &self,
        stream: RecordStream,
        tenant_id: &str,
        ids: &[String],
    ) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let now = to_db_timestamp(&Utc::now());
        let sql = format!(
            "UPDATE {} SET synchronized = 1, synchronized_at = ?3
             WHERE tenant_id = ?1 AND id = ?2 AND synchronized = 0",
            stream.table()
        );

        let updated = self.db.transaction(|tx| {
            let mut stmt = tx.prepare(&sql)?;
            let mut updated = 0;
            for id in ids {
                updated += stmt.execute(params![tenant_id, id, now])?;
            }
            Ok(updated)
        })?;

        log::debug!("Marked {} {} records synchronized", updated, stream);
        Ok(updated)
    }

    /// Count a failed attempt for records the server rejected or skipped
    pub fn record_rejections(
        &self,
        stream: RecordStream,
        tenant_id: &str,
        rejections: &[(String, String)],
    ) -> Result<usize, StoreError> {
        if rejections.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "UPDATE {} SET sync_attempts = sync_attempts + 1, last_error = ?3
             WHERE tenant_id = ?1 AND id = ?2 AND synchronized = 0",
            stream.table()
        );

        let updated = self.db.transaction(|tx| {
            let mut stmt = tx.prepare(&sql)?;
            let mut updated = 0;
            for (id, reason) in rejections {
                updated += stmt.execute(params![tenant_id, id, reason])?;
            }
            Ok(updated)
        })?;

        if let Some(threshold) = self.poison_threshold {
            let parked: i64 = self.db.query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE tenant_id = ?1 AND synchronized = 0 AND sync_attempts >= ?2",
                    stream.table()
                ),
                params![tenant_id, threshold],
                |row| row.get(0),
            )?;
            if parked > 0 {
                log::warn!(
                    "{} {} records reached {} rejected attempts and are parked",
                    parked,
                    stream,
                    threshold
                );
            }
        }

        Ok(updated)
    }

    /// First stored copy of a record by id
    pub fn find(
        &self,
        stream: RecordStream,
        tenant_id: &str,
        id: &str,
    ) -> Result<Option<EventRecord>, StoreError> {
        let mut records = self.db.query(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM {} WHERE tenant_id = ?1 AND id = ?2 ORDER BY seq ASC LIMIT 1",
                stream.table()
            ),
            params![tenant_id, id],
            |row| record_from_row(stream, row),
        )?;
        Ok(records.pop())
    }

    /// Delete records whose retention ended before `now`, synced or not
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut purged = 0;

        for stream in RecordStream::ALL {
            let candidates: Vec<(i64, DateTime<Utc>, u32)> = self.db.query(
                &format!("SELECT seq, occurred_at, retention_months FROM {}", stream.table()),
                [],
                |row| Ok((row.get(0)?, timestamp_column(row, 1)?, row.get(2)?)),
            )?;

            let expired: Vec<i64> = candidates
                .into_iter()
                .filter(|(_, occurred_at, months)| {
                    occurred_at
                        .checked_add_months(Months::new(*months))
                        .map(|expires_at| expires_at < now)
                        .unwrap_or(false)
                })
                .map(|(seq, _, _)| seq)
                .collect();

            if expired.is_empty() {
                continue;
            }

            let sql = format!("DELETE FROM {} WHERE seq = ?1", stream.table());
            purged += self.db.transaction(|tx| {
                let mut stmt = tx.prepare(&sql)?;
                let mut deleted = 0;
                for seq in &expired {
                    deleted += stmt.execute(params![seq])?;
                }
                Ok(deleted)
            })?;
        }

        if purged > 0 {
            log::info!("Retention purge removed {} records", purged);
        }
        Ok(purged)
    }

    /// Counters for one tenant
    pub fn stats(&self, tenant_id: &str) -> Result<StoreStats, StoreError> {
        let mut stats = StoreStats::default();

        for stream in RecordStream::ALL {
            let (pending, synchronized, parked): (i64, i64, i64) = self.db.query_row(
                &format!(
                    "SELECT
                        COALESCE(SUM(CASE WHEN synchronized = 0 AND (?2 IS NULL OR sync_attempts < ?2) THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN synchronized = 1 THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN synchronized = 0 AND ?2 IS NOT NULL AND sync_attempts >= ?2 THEN 1 ELSE 0 END), 0)
                     FROM {} WHERE tenant_id = ?1",
                    stream.table()
                ),
                params![tenant_id, self.poison_threshold],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;

            match stream {
                RecordStream::Access => {
                    stats.access_pending = pending as u64;
                    stats.access_synchronized = synchronized as u64;
                }
                RecordStream::Audit => {
                    stats.audit_pending = pending as u64;
                    stats.audit_synchronized = synchronized as u64;
                }
            }
            stats.parked += parked as u64;
        }

        Ok(stats)
    }
}

fn record_from_row(stream: RecordStream, row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRecord> {
    let kind_code: String = row.get(4)?;
    let event_kind = EventKind::parse(stream, &kind_code).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("invalid {} event kind: {}", stream, kind_code).into(),
        )
    })?;

    let payload = match row.get::<_, Option<String>>(5)? {
        Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };

    Ok(EventRecord {
        seq: row.get(0)?,
        id: row.get(1)?,
        tenant_id: row.get(2)?,
        subject_reference: row.get(3)?,
        event_kind,
        payload,
        capture_method: CaptureMethod::from_str(&row.get::<_, String>(6)?),
        occurred_at: timestamp_column(row, 7)?,
        synchronized: row.get(8)?,
        retention_months: row.get(9)?,
        sync_attempts: row.get(10)?,
        last_error: row.get(11)?,
    })
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================

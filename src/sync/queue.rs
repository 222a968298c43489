//! Pending Operations Queue - entity upserts/deletes awaiting upload
//!
//! Separate from the append-only event streams: each item is one mutation
//! of a student, class or user that the kiosk made while offline. Items are
//! pushed one at a time and retried with exponential backoff.
//!
//! Features:
//! - SQLite-backed persistent queue, scoped per tenant
//! - Exponential backoff retry policy
//! - Max retry limit (default: 5 attempts)
//! - Cleanup of completed items
//! - Queue status reporting (pending, failed counts)

use crate::db::{optional_timestamp_column, timestamp_column, to_db_timestamp, Database};
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// Constants
// ============================================================================

const BASE_DELAY_SECS: i64 = 30;      // Initial retry delay: 30 seconds
const MAX_DELAY_SECS: i64 = 3600;     // Max retry delay: 1 hour
const DEFAULT_MAX_RETRIES: i32 = 5;   // Max retry attempts

const OPERATION_COLUMNS: &str = "id, operation_id, tenant_id, entity, entity_id, operation, payload, \
     retry_count, max_retries, status, error_message, created_at, next_retry_at, updated_at";

// ============================================================================
// Data Types
// ============================================================================

/// Entity collection targeted by an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Student,
    Class,
    User,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Class => "class",
            Self::User => "user",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "student" => Some(Self::Student),
            "class" => Some(Self::Class),
            "user" => Some(Self::User),
            _ => None,
        }
    }

    /// Remote collection path
    pub fn path(&self) -> &'static str {
        match self {
            Self::Student => "alunos",
            Self::Class => "turmas",
            Self::User => "usuarios",
        }
    }
}

/// Mutation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Upsert,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "upsert" => Some(Self::Upsert),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Queue item status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    InProgress,
    Failed,
    Completed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "in_progress" => Self::InProgress,
            "failed" => Self::Failed,
            "completed" => Self::Completed,
            _ => Self::Pending, // Default
        }
    }
}

/// Queued entity operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: Option<i64>,
    /// Client-generated key sent as `Idempotency-Key`
    pub operation_id: String,
    pub tenant_id: String,
    pub entity: EntityKind,
    pub entity_id: String,
    pub operation: OperationKind,
    pub payload: Option<serde_json::Value>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub status: QueueStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl PendingOperation {
    /// Upsert of an entity with its full body
    pub fn upsert(
        tenant_id: impl Into<String>,
        entity: EntityKind,
        entity_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(tenant_id.into(), entity, entity_id.into(), OperationKind::Upsert, Some(payload))
    }

    /// Delete of an entity
    pub fn delete(
        tenant_id: impl Into<String>,
        entity: EntityKind,
        entity_id: impl Into<String>,
    ) -> Self {
        Self::new(tenant_id.into(), entity, entity_id.into(), OperationKind::Delete, None)
    }

    fn new(
        tenant_id: String,
        entity: EntityKind,
        entity_id: String,
        operation: OperationKind,
        payload: Option<serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            operation_id: uuid::Uuid::new_v4().to_string(),
            tenant_id,
            entity,
            entity_id,
            operation,
            payload,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            status: QueueStatus::Pending,
            error_message: None,
            created_at: now,
            next_retry_at: Some(now), // Ready immediately
            updated_at: now,
        }
    }

    /// Check if item should be retried now
    pub fn should_retry(&self) -> bool {
        if self.status != QueueStatus::Pending && self.status != QueueStatus::Failed {
            return false;
        }

        if self.retry_count >= self.max_retries {
            return false;
        }

        if let Some(next_retry) = self.next_retry_at {
            Utc::now() >= next_retry
        } else {
            true
        }
    }

    /// Calculate next retry timestamp with exponential backoff
    pub fn calculate_next_retry(&self) -> DateTime<Utc> {
        Utc::now() + Duration::seconds(backoff_delay_secs(self.retry_count))
    }
}

/// Backoff after `retry_count` failures: 30s, 60s, 120s ... capped at 1h
pub fn backoff_delay_secs(retry_count: i32) -> i64 {
    let exponent = retry_count.clamp(0, 16) as u32;
    (BASE_DELAY_SECS * 2_i64.pow(exponent)).min(MAX_DELAY_SECS)
}

/// Queue statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending_count: i32,
    pub in_progress_count: i32,
    pub failed_count: i32,
    pub completed_count: i32,
    pub total_count: i32,
}

// ============================================================================
// Operation Queue
// ============================================================================

/// Manages the pending-operations queue
pub struct OperationQueue {
    db: Arc<Database>,
}

impl OperationQueue {
    /// Create new queue manager
    pub fn new(db: Arc<Database>) -> Result<Self, QueueError> {
        let queue = Self { db };
        queue.initialize_schema()?;
        Ok(queue)
    }

    /// Initialize database schema for queue
    fn initialize_schema(&self) -> Result<(), QueueError> {
        self.db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS pending_operations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                operation_id TEXT NOT NULL UNIQUE,
                tenant_id TEXT NOT NULL,
                entity TEXT NOT NULL CHECK (entity IN ('student', 'class', 'user')),
                entity_id TEXT NOT NULL,
                operation TEXT NOT NULL CHECK (operation IN ('upsert', 'delete')),
                payload TEXT,
                retry_count INTEGER DEFAULT 0,
                max_retries INTEGER DEFAULT 5,
                status TEXT DEFAULT 'pending',
                error_message TEXT,
                created_at TEXT NOT NULL,
                next_retry_at TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_pending_operations_tenant_status
                ON pending_operations(tenant_id, status);

            CREATE INDEX IF NOT EXISTS idx_pending_operations_next_retry
                ON pending_operations(next_retry_at);
            "#
        ).map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    /// Add item to queue
    pub fn enqueue(&self, item: &PendingOperation) -> Result<i64, QueueError> {
        log::info!(
            "Queueing {} {} {} for tenant {}",
            item.operation.as_str(),
            item.entity.as_str(),
            item.entity_id,
            item.tenant_id
        );

        let payload = item
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        let id = self.db.execute_insert(
            r#"
            INSERT INTO pending_operations (
                operation_id, tenant_id, entity, entity_id, operation, payload,
                retry_count, max_retries, status, error_message,
                created_at, next_retry_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                item.operation_id,
                item.tenant_id,
                item.entity.as_str(),
                item.entity_id,
                item.operation.as_str(),
                payload,
                item.retry_count,
                item.max_retries,
                item.status.as_str(),
                item.error_message,
                to_db_timestamp(&item.created_at),
                item.next_retry_at.as_ref().map(to_db_timestamp),
                to_db_timestamp(&item.updated_at),
            ],
        ).map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        Ok(id)
    }

    /// Operations of a tenant that are due for (re)submission, oldest first
    pub fn ready_operations(&self, tenant_id: &str, limit: usize) -> Result<Vec<PendingOperation>, QueueError> {
        let now = to_db_timestamp(&Utc::now());

        let items = self.db.query(
            &format!(
                r#"
                SELECT {OPERATION_COLUMNS}
                FROM pending_operations
                WHERE tenant_id = ?1
                  AND (status = 'pending' OR status = 'failed')
                  AND retry_count < max_retries
                  AND (next_retry_at IS NULL OR next_retry_at <= ?2)
                ORDER BY id ASC
                LIMIT ?3
                "#
            ),
            params![tenant_id, now, limit as i64],
            operation_from_row,
        ).map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        log::debug!("Found {} ready operations for tenant {}", items.len(), tenant_id);
        Ok(items)
    }

    /// Update queue item status
    pub fn update_status(
        &self,
        id: i64,
        status: QueueStatus,
        error_message: Option<String>,
    ) -> Result<(), QueueError> {
        log::debug!("Updating operation {} status to {:?}", id, status);

        let affected = self.db.execute(
            r#"
            UPDATE pending_operations
            SET status = ?1, error_message = ?2, updated_at = ?3
            WHERE id = ?4
            "#,
            params![
                status.as_str(),
                error_message,
                to_db_timestamp(&Utc::now()),
                id
            ],
        ).map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        if affected == 0 {
            return Err(QueueError::ItemNotFound(id));
        }
        Ok(())
    }

    /// Mark item as failed and schedule retry
    pub fn mark_failed_and_retry(
        &self,
        id: i64,
        error_message: String,
    ) -> Result<(), QueueError> {
        log::warn!("Operation {} failed: {}", id, error_message);

        let item = self.get_by_id(id)?;

        let new_retry_count = item.retry_count + 1;
        let next_retry = if new_retry_count < item.max_retries {
            Some(Utc::now() + Duration::seconds(backoff_delay_secs(new_retry_count)))
        } else {
            None // Max retries exceeded, don't retry
        };

        self.db.execute(
            r#"
            UPDATE pending_operations
            SET status = ?1, error_message = ?2, retry_count = ?3,
                next_retry_at = ?4, updated_at = ?5
            WHERE id = ?6
            "#,
            params![
                QueueStatus::Failed.as_str(),
                Some(error_message),
                new_retry_count,
                next_retry.as_ref().map(to_db_timestamp),
                to_db_timestamp(&Utc::now()),
                id
            ],
        ).map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        if let Some(retry_time) = next_retry {
            log::info!(
                "Operation {} will retry at {} (attempt {}/{})",
                id, retry_time, new_retry_count + 1, item.max_retries
            );
        } else {
            log::warn!("Operation {} exceeded max retries", id);
        }

        Ok(())
    }

    /// Get queue item by ID
    pub fn get_by_id(&self, id: i64) -> Result<PendingOperation, QueueError> {
        let items = self.db.query(
            &format!("SELECT {OPERATION_COLUMNS} FROM pending_operations WHERE id = ?1"),
            params![id],
            operation_from_row,
        ).map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        items.into_iter().next()
            .ok_or(QueueError::ItemNotFound(id))
    }

    /// Get queue statistics for a tenant
    pub fn stats(&self, tenant_id: &str) -> Result<QueueStats, QueueError> {
        let stats = self.db.query_row(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'in_progress' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                COUNT(*)
            FROM pending_operations
            WHERE tenant_id = ?1
            "#,
            params![tenant_id],
            |row| {
                Ok(QueueStats {
                    pending_count: row.get(0)?,
                    in_progress_count: row.get(1)?,
                    failed_count: row.get(2)?,
                    completed_count: row.get(3)?,
                    total_count: row.get(4)?,
                })
            },
        ).map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        Ok(stats)
    }

    /// Clear completed items older than N days
    pub fn clear_completed(&self, older_than_days: i64) -> Result<usize, QueueError> {
        let cutoff = Utc::now() - Duration::days(older_than_days);

        let deleted = self.db.execute(
            r#"
            DELETE FROM pending_operations
            WHERE status = 'completed' AND updated_at <= ?1
            "#,
            params![to_db_timestamp(&cutoff)],
        ).map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        log::info!("Cleared {} completed operations", deleted);
        Ok(deleted)
    }

    /// Reset failed items for manual retry
    pub fn retry_failed(&self, tenant_id: &str) -> Result<usize, QueueError> {
        let now = to_db_timestamp(&Utc::now());

        let updated = self.db.execute(
            r#"
            UPDATE pending_operations
            SET status = 'pending',
                retry_count = 0,
                next_retry_at = ?1,
                updated_at = ?1,
                error_message = NULL
            WHERE status = 'failed' AND tenant_id = ?2
            "#,
            params![now, tenant_id],
        ).map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        log::info!("Reset {} failed operations for retry", updated);
        Ok(updated)
    }
}

fn operation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingOperation> {
    let entity_raw: String = row.get(3)?;
    let entity = EntityKind::from_str(&entity_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown entity: {}", entity_raw).into(),
        )
    })?;

    let operation_raw: String = row.get(5)?;
    let operation = OperationKind::from_str(&operation_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("unknown operation: {}", operation_raw).into(),
        )
    })?;

    let payload = match row.get::<_, Option<String>>(6)? {
        Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };

    Ok(PendingOperation {
        id: Some(row.get(0)?),
        operation_id: row.get(1)?,
        tenant_id: row.get(2)?,
        entity,
        entity_id: row.get(4)?,
        operation,
        payload,
        retry_count: row.get(7)?,
        max_retries: row.get(8)?,
        status: QueueStatus::from_str(&row.get::<_, String>(9)?),
        error_message: row.get(10)?,
        created_at: timestamp_column(row, 11)?,
        next_retry_at: optional_timestamp_column(row, 12)?,
        updated_at: timestamp_column(row, 13)?,
    })
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Queue item not found: {0}")]
    ItemNotFound(i64),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

// ============================================================================
// Tests
// ============================================================================

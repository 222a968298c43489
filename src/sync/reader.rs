//! Sync Queue Reader - pure view over the pending backlog
//!
//! Returns the total backlog size and a capped slice for the next upload.
//! The access stream drains before the audit stream. A [`DrainCursor`]
//! tracks how far the current cycle has read so that records the server
//! rejected are not re-sent within the same cycle.

use super::models::{EventRecord, RecordStream};
use super::store::{LocalStore, StoreError};
use std::sync::Arc;

/// Highest sequence already handed out per stream in the current cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainCursor {
    access_after: i64,
    audit_after: i64,
}

impl DrainCursor {
    pub fn after(&self, stream: RecordStream) -> i64 {
        match stream {
            RecordStream::Access => self.access_after,
            RecordStream::Audit => self.audit_after,
        }
    }

    /// Move past every record in `batch`
    pub fn advance(&mut self, stream: RecordStream, batch: &[EventRecord]) {
        if let Some(last) = batch.iter().map(|r| r.seq).max() {
            let slot = match stream {
                RecordStream::Access => &mut self.access_after,
                RecordStream::Audit => &mut self.audit_after,
            };
            *slot = (*slot).max(last);
        }
    }
}

/// Snapshot returned by one read
#[derive(Debug, Clone)]
pub struct Backlog {
    /// Every pending record of the tenant, both streams
    pub total_pending: u64,
    /// Stream the batch was taken from (`None` when nothing is left to send)
    pub stream: Option<RecordStream>,
    pub batch: Vec<EventRecord>,
}

impl Backlog {
    pub fn is_drained(&self) -> bool {
        self.batch.is_empty()
    }
}

pub struct SyncQueueReader {
    store: Arc<LocalStore>,
}

impl SyncQueueReader {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    /// Read the backlog size and the next batch of at most `cap` records
    pub fn read(
        &self,
        tenant_id: &str,
        cursor: &DrainCursor,
        cap: usize,
    ) -> Result<Backlog, StoreError> {
        let total_pending = self.store.count_all_pending(tenant_id)?;

        if total_pending > 0 && cap > 0 {
            for stream in RecordStream::ALL {
                let batch = self
                    .store
                    .list_pending(stream, tenant_id, cursor.after(stream), cap)?;
                if !batch.is_empty() {
                    return Ok(Backlog {
                        total_pending,
                        stream: Some(stream),
                        batch,
                    });
                }
            }
        }

        Ok(Backlog {
            total_pending,
            stream: None,
            batch: Vec::new(),
        })
    }
}

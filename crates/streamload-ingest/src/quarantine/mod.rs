//! Quarantine sink: durable notes for records that did not load
//!
//! Writing a note never fails the pipeline. [`record_or_warn`] is the entry
//! point the pipeline uses; it logs and swallows sink errors.

mod memory;
pub mod schema;
mod sqlite;

pub use memory::MemoryQuarantineSink;
pub use sqlite::SqliteQuarantineSink;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::types::{QuarantineEntry, ReasonCode};

/// Default cap on entries returned by a listing
pub const DEFAULT_LIST_LIMIT: usize = 500;

/// Operator query over quarantine contents.
///
/// Every set criterion must match. `row_from`/`row_to` bound the source row
/// index inclusively.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuarantineFilter {
    pub entity: Option<String>,
    pub reason: Option<ReasonCode>,
    pub source_id: Option<String>,
    pub row_from: Option<u64>,
    pub row_to: Option<u64>,
    pub limit: Option<usize>,
}

impl QuarantineFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    pub fn reason(mut self, reason: ReasonCode) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn rows(mut self, from: Option<u64>, to: Option<u64>) -> Self {
        self.row_from = from;
        self.row_to = to;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT)
    }

    pub fn matches(&self, entry: &QuarantineEntry) -> bool {
        let provenance = entry.provenance();
        self.entity.as_ref().is_none_or(|e| *e == entry.entity)
            && self.reason.is_none_or(|r| r == entry.reason)
            && self
                .source_id
                .as_ref()
                .is_none_or(|s| *s == provenance.source_id)
            && self.row_from.is_none_or(|from| provenance.row_index >= from)
            && self.row_to.is_none_or(|to| provenance.row_index <= to)
    }
}

/// Append-only store of quarantine entries
#[async_trait]
pub trait QuarantineSink: Send + Sync {
    /// Persist one entry. Returns the assigned id, or `None` when an entry
    /// for the same row, stage and reason is already held.
    async fn record(&self, entry: QuarantineEntry) -> Result<Option<i64>>;

    /// Entries matching `filter`, oldest first
    async fn list(&self, filter: &QuarantineFilter) -> Result<Vec<QuarantineEntry>>;

    /// Remove entries by id after operator reprocessing. Returns how many
    /// were removed.
    async fn clear(&self, ids: &[i64]) -> Result<usize>;
}

/// Record `entry`, logging and swallowing any sink failure.
///
/// Returns whether the entry is now held by the sink.
pub async fn record_or_warn(sink: &dyn QuarantineSink, entry: QuarantineEntry) -> bool {
    let entity = entry.entity.clone();
    let reason = entry.reason;
    let provenance = entry.provenance().to_string();
    match sink.record(entry).await {
        Ok(_) => true,
        Err(e) => {
            warn!(
                entity = %entity,
                reason = %reason,
                provenance = %provenance,
                error = %e,
                "Failed to write quarantine entry"
            );
            false
        },
    }
}

//! Target store collaborator
//!
//! The loader needs three things from the store: an atomic multi-row
//! upsert keyed by business key, the set of committed keys per entity type,
//! and persistence for one checkpoint per (entity, source) pair.

mod memory;
mod sqlite;

pub use memory::MemoryTargetStore;
pub use sqlite::SqliteTargetStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{IngestError, Result};
use crate::types::{BusinessKey, KeyedRecord, LoadCheckpoint, QualityClass};

/// A committed row as the store holds it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub entity: String,
    pub key: BusinessKey,
    pub payload: serde_json::Value,
    pub quality: QualityClass,
    pub fingerprint: String,
    pub source_id: String,
    pub sheet_id: String,
    pub row_index: u64,
    pub updated_at: DateTime<Utc>,
}

impl StoredRecord {
    /// Row for `keyed`, stamped with `now`.
    pub fn from_keyed(keyed: &KeyedRecord, now: DateTime<Utc>) -> Result<Self> {
        let payload = keyed.record.payload();
        let fingerprint = streamload_common::fingerprint::fingerprint_json(&serde_json::json!({
            "payload": &payload,
            "quality": keyed.record.quality.as_str(),
        }))
        .map_err(IngestError::store)?;
        Ok(Self {
            entity: keyed.record.entity.clone(),
            key: keyed.key.clone(),
            payload,
            quality: keyed.record.quality,
            fingerprint,
            source_id: keyed.record.provenance.source_id.clone(),
            sheet_id: keyed.record.provenance.sheet_id.clone(),
            row_index: keyed.record.provenance.row_index,
            updated_at: now,
        })
    }
}

/// Transactional persistence for canonical records and load checkpoints
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Insert or update every record of the chunk in one transaction.
    ///
    /// Either all rows are applied or none are. A row whose content
    /// fingerprint is unchanged is left untouched. Returns the number of
    /// rows in the chunk.
    async fn upsert_chunk(&self, entity: &str, chunk: &[KeyedRecord]) -> Result<usize>;

    async fn committed_keys(&self, entity: &str) -> Result<HashSet<BusinessKey>>;

    async fn fetch(&self, entity: &str, key: &BusinessKey) -> Result<Option<StoredRecord>>;

    async fn record_count(&self, entity: &str) -> Result<u64>;

    async fn read_checkpoint(&self, entity: &str, source_id: &str) -> Result<Option<LoadCheckpoint>>;

    async fn write_checkpoint(&self, checkpoint: &LoadCheckpoint) -> Result<()>;

    /// Remove a checkpoint so the next run reloads the source from the
    /// start. Returns whether one existed.
    async fn clear_checkpoint(&self, entity: &str, source_id: &str) -> Result<bool>;

    async fn list_checkpoints(&self) -> Result<Vec<LoadCheckpoint>>;
}

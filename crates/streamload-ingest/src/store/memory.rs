//! In-memory target store with failure injection, for tests and dry runs

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;

use super::{StoredRecord, TargetStore};
use crate::error::{IngestError, Result};
use crate::types::{BusinessKey, KeyedRecord, LoadCheckpoint};

#[derive(Default)]
struct State {
    records: BTreeMap<(String, BusinessKey), StoredRecord>,
    checkpoints: BTreeMap<(String, String), LoadCheckpoint>,
    poisoned: HashSet<(String, BusinessKey)>,
    transient_failures: u32,
    upsert_calls: u64,
    delay: Option<Duration>,
}

/// Target store kept in process memory.
///
/// Chunks are validated before any row is applied, so a failing chunk
/// leaves no trace, matching a rolled-back transaction.
#[derive(Default)]
pub struct MemoryTargetStore {
    state: Mutex<State>,
}

impl MemoryTargetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every chunk containing one of `keys` fails to commit.
    pub async fn fail_keys<'k>(&self, entity: &str, keys: impl IntoIterator<Item = &'k str>) {
        let mut state = self.state.lock().await;
        for key in keys {
            state
                .poisoned
                .insert((entity.to_string(), BusinessKey::new(key)));
        }
    }

    /// Drop every injected failure.
    pub async fn clear_failures(&self) {
        let mut state = self.state.lock().await;
        state.poisoned.clear();
        state.transient_failures = 0;
    }

    /// The next `count` chunk upserts fail, whatever they contain.
    pub async fn fail_next_upserts(&self, count: u32) {
        self.state.lock().await.transient_failures = count;
    }

    /// Sleep before applying each chunk.
    pub async fn set_upsert_delay(&self, delay: Duration) {
        self.state.lock().await.delay = Some(delay);
    }

    pub async fn upsert_calls(&self) -> u64 {
        self.state.lock().await.upsert_calls
    }

    pub async fn records(&self, entity: &str) -> Vec<StoredRecord> {
        self.state
            .lock()
            .await
            .records
            .iter()
            .filter(|((e, _), _)| e == entity)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

#[async_trait]
impl TargetStore for MemoryTargetStore {
    async fn upsert_chunk(&self, entity: &str, chunk: &[KeyedRecord]) -> Result<usize> {
        let delay = {
            let mut state = self.state.lock().await;
            state.upsert_calls += 1;
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(IngestError::store("injected transient failure"));
        }
        if let Some(bad) = chunk
            .iter()
            .find(|r| state.poisoned.contains(&(entity.to_string(), r.key.clone())))
        {
            return Err(IngestError::store(format!(
                "constraint violation on key '{}'",
                bad.key
            )));
        }

        let now = Utc::now();
        let rows = chunk
            .iter()
            .map(|keyed| StoredRecord::from_keyed(keyed, now))
            .collect::<Result<Vec<_>>>()?;

        for row in rows {
            let slot = (entity.to_string(), row.key.clone());
            let unchanged = state
                .records
                .get(&slot)
                .is_some_and(|existing| existing.fingerprint == row.fingerprint);
            if !unchanged {
                state.records.insert(slot, row);
            }
        }
        Ok(chunk.len())
    }

    async fn committed_keys(&self, entity: &str) -> Result<HashSet<BusinessKey>> {
        Ok(self
            .state
            .lock()
            .await
            .records
            .keys()
            .filter(|(e, _)| e == entity)
            .map(|(_, k)| k.clone())
            .collect())
    }

    async fn fetch(&self, entity: &str, key: &BusinessKey) -> Result<Option<StoredRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .records
            .get(&(entity.to_string(), key.clone()))
            .cloned())
    }

    async fn record_count(&self, entity: &str) -> Result<u64> {
        Ok(self
            .state
            .lock()
            .await
            .records
            .keys()
            .filter(|(e, _)| e == entity)
            .count() as u64)
    }

    async fn read_checkpoint(&self, entity: &str, source_id: &str) -> Result<Option<LoadCheckpoint>> {
        Ok(self
            .state
            .lock()
            .await
            .checkpoints
            .get(&(entity.to_string(), source_id.to_string()))
            .cloned())
    }

    async fn write_checkpoint(&self, checkpoint: &LoadCheckpoint) -> Result<()> {
        self.state.lock().await.checkpoints.insert(
            (checkpoint.entity.clone(), checkpoint.source_id.clone()),
            checkpoint.clone(),
        );
        Ok(())
    }

    async fn clear_checkpoint(&self, entity: &str, source_id: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .await
            .checkpoints
            .remove(&(entity.to_string(), source_id.to_string()))
            .is_some())
    }

    async fn list_checkpoints(&self) -> Result<Vec<LoadCheckpoint>> {
        Ok(self.state.lock().await.checkpoints.values().cloned().collect())
    }
}

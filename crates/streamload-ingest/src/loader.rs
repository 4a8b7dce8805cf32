//! Chunked, idempotent, resumable loading
//!
//! The accepted stream of one (entity, source) pair is cut into fixed-size
//! chunks. Each chunk is upserted in one store transaction; after it
//! commits, the checkpoint moves to the end of that chunk. A chunk that
//! keeps failing is rolled back, its records are quarantined, and the load
//! moves on to the next chunk.

use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use streamload_common::fingerprint::SequenceFingerprint;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::LoadConfig;
use crate::error::{IngestError, Result};
use crate::integrity::RunRegistry;
use crate::quarantine::{record_or_warn, QuarantineSink};
use crate::report::LoadReport;
use crate::store::TargetStore;
use crate::types::{
    KeyedRecord, LoadCheckpoint, QuarantineEntry, QuarantinePayload, ReasonCode, Stage,
};

/// Where one entity load currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    Idle,
    Reading,
    Chunking,
    Committing,
    Checkpointing,
    Done,
    Aborted,
}

impl LoadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadState::Idle => "idle",
            LoadState::Reading => "reading",
            LoadState::Chunking => "chunking",
            LoadState::Committing => "committing",
            LoadState::Checkpointing => "checkpointing",
            LoadState::Done => "done",
            LoadState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub struct ChunkedLoader {
    store: Arc<dyn TargetStore>,
    quarantine: Arc<dyn QuarantineSink>,
    registry: RunRegistry,
    config: LoadConfig,
    cancel: CancellationToken,
    state: LoadState,
}

impl ChunkedLoader {
    pub fn new(
        store: Arc<dyn TargetStore>,
        quarantine: Arc<dyn QuarantineSink>,
        registry: RunRegistry,
        config: LoadConfig,
    ) -> Self {
        Self {
            store,
            quarantine,
            registry,
            config,
            cancel: CancellationToken::new(),
            state: LoadState::Idle,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    fn transition(&mut self, next: LoadState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "Load state transition");
            self.state = next;
        }
    }

    /// Load `records`, the accepted stream of `source_id`, into `entity`.
    ///
    /// Counts land in `report`. An `Err` means the load was aborted; chunks
    /// committed before that stay committed and checkpointed.
    pub async fn load(
        &mut self,
        entity: &str,
        source_id: &str,
        records: Vec<KeyedRecord>,
        report: &mut LoadReport,
    ) -> Result<()> {
        let result = self.run(entity, source_id, records, report).await;
        match &result {
            Ok(()) => self.transition(LoadState::Done),
            Err(e) => {
                self.transition(LoadState::Aborted);
                report.fail(e);
            },
        }
        report.state = self.state;
        result
    }

    async fn run(
        &mut self,
        entity: &str,
        source_id: &str,
        records: Vec<KeyedRecord>,
        report: &mut LoadReport,
    ) -> Result<()> {
        self.transition(LoadState::Reading);
        let resume_at = self.resume_offset(entity, source_id, &records).await?;
        if resume_at > 0 {
            info!(entity, source = source_id, offset = resume_at, "Resuming from checkpoint");
        }

        let chunk_size = self.config.chunk_size.max(1);
        let mut advancing = true;
        let mut prefix = SequenceFingerprint::new();

        for (index, chunk) in records.chunks(chunk_size).enumerate() {
            if self.cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            self.transition(LoadState::Chunking);
            for keyed in chunk {
                prefix.push(keyed.key.as_str());
            }

            let start = index * chunk_size;
            let end = start + chunk.len();
            if end <= resume_at {
                report.chunks_skipped += 1;
                continue;
            }

            self.transition(LoadState::Committing);
            match self.commit_with_retry(entity, index as u64, chunk).await {
                Ok(rows) => {
                    report.committed += rows as u64;
                    report.chunks_committed += 1;
                    if advancing {
                        self.transition(LoadState::Checkpointing);
                        let digest = prefix.hex();
                        match self.advance(entity, source_id, index as u64, end, chunk, digest).await {
                            Ok(checkpoint) => report.checkpoint = Some(checkpoint),
                            Err(e) => {
                                error!(
                                    entity,
                                    source = source_id,
                                    chunk = index,
                                    error = %e,
                                    "Failed to write checkpoint; it stays at the previous chunk"
                                );
                                advancing = false;
                            },
                        }
                    }
                },
                Err(IngestError::Cancelled) => return Err(IngestError::Cancelled),
                Err(e) => {
                    report.chunks_failed += 1;
                    advancing = false;
                    self.quarantine_chunk(entity, chunk, &e, start, end, report).await;
                },
            }
        }

        Ok(())
    }

    /// Offset to resume from. A checkpoint that no longer lines up with the
    /// stream (different length, last key or key prefix) is ignored, so the
    /// whole stream reloads.
    async fn resume_offset(&self, entity: &str, source_id: &str, records: &[KeyedRecord]) -> Result<usize> {
        let Some(checkpoint) = self.store.read_checkpoint(entity, source_id).await? else {
            return Ok(0);
        };
        let offset = usize::try_from(checkpoint.offset).unwrap_or(usize::MAX);
        let lines_up = offset > 0
            && offset <= records.len()
            && records[offset - 1].key == checkpoint.last_key
            && key_prefix_digest(&records[..offset]) == checkpoint.prefix_digest;
        if lines_up {
            Ok(offset)
        } else {
            warn!(
                entity,
                source = source_id,
                offset = checkpoint.offset,
                last_key = %checkpoint.last_key,
                "Checkpoint does not match the input; reloading from the start"
            );
            Ok(0)
        }
    }

    async fn commit_with_retry(&self, entity: &str, chunk_index: u64, chunk: &[KeyedRecord]) -> Result<usize> {
        let mut attempt: u32 = 0;
        loop {
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(IngestError::Cancelled),
                outcome = self.store.upsert_chunk(entity, chunk) => outcome,
            };

            let err = match outcome {
                Ok(rows) => return Ok(rows),
                Err(e) => e,
            };
            if attempt >= self.config.max_chunk_retries {
                return Err(IngestError::ChunkCommitFailure {
                    entity: entity.to_string(),
                    chunk_index,
                    reason: err.to_string(),
                });
            }

            attempt += 1;
            let backoff = Duration::from_millis(self.config.retry_backoff_ms * u64::from(attempt));
            warn!(
                entity,
                chunk = chunk_index,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Chunk commit failed, retrying"
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(IngestError::Cancelled),
                _ = tokio::time::sleep(backoff) => {},
            }
        }
    }

    async fn advance(
        &self,
        entity: &str,
        source_id: &str,
        chunk_index: u64,
        end: usize,
        chunk: &[KeyedRecord],
        prefix_digest: String,
    ) -> Result<LoadCheckpoint> {
        let last_key = chunk
            .last()
            .map(|r| r.key.clone())
            .ok_or_else(|| IngestError::store("cannot checkpoint an empty chunk"))?;
        let checkpoint = LoadCheckpoint {
            entity: entity.to_string(),
            source_id: source_id.to_string(),
            offset: end as u64,
            last_key,
            prefix_digest,
            chunk_index,
            updated_at: Utc::now(),
        };
        self.store.write_checkpoint(&checkpoint).await?;
        debug!(entity, source = source_id, offset = end, "Checkpoint advanced");
        Ok(checkpoint)
    }

    async fn quarantine_chunk(
        &self,
        entity: &str,
        chunk: &[KeyedRecord],
        err: &IngestError,
        start: usize,
        end: usize,
        report: &mut LoadReport,
    ) {
        let first_key = chunk.first().map(|r| r.key.to_string()).unwrap_or_default();
        let last_key = chunk.last().map(|r| r.key.to_string()).unwrap_or_default();
        error!(
            entity,
            offset_start = start,
            offset_end = end,
            first_key = %first_key,
            last_key = %last_key,
            error = %err,
            "Chunk rolled back"
        );

        self.registry.revoke(entity, chunk.iter().map(|r| &r.key));
        for keyed in chunk {
            let entry = QuarantineEntry::new(
                entity,
                ReasonCode::ChunkCommitFailure,
                Stage::Loading,
                QuarantinePayload::Canonical(keyed.record.clone()),
            )
            .with_detail(err.to_string());
            report.count_quarantined(ReasonCode::ChunkCommitFailure);
            if !record_or_warn(self.quarantine.as_ref(), entry).await {
                report.quarantine_write_failures += 1;
            }
        }
    }
}

fn key_prefix_digest(records: &[KeyedRecord]) -> String {
    let mut prefix = SequenceFingerprint::new();
    for keyed in records {
        prefix.push(keyed.key.as_str());
    }
    prefix.hex()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::quarantine::{MemoryQuarantineSink, QuarantineFilter};
    use crate::store::MemoryTargetStore;
    use crate::types::{BusinessKey, CanonicalRecord, Provenance, Value};

    fn stream(n: usize) -> Vec<KeyedRecord> {
        (0..n)
            .map(|i| {
                let code = format!("S{:02}", i);
                let mut record = CanonicalRecord::new(
                    "site",
                    Provenance {
                        source_id: "sites".into(),
                        file_id: "sites.csv".into(),
                        sheet_id: "csv".into(),
                        row_index: i as u64 + 2,
                        ordinal: i as u64,
                    },
                );
                record.set("site_code", Value::Text(code.clone()));
                KeyedRecord {
                    key: BusinessKey::new(code),
                    record,
                }
            })
            .collect()
    }

    fn config(chunk_size: usize) -> LoadConfig {
        LoadConfig::default()
            .with_chunk_size(chunk_size)
            .with_max_chunk_retries(1)
            .with_retry_backoff_ms(1)
    }

    fn loader(
        store: &Arc<MemoryTargetStore>,
        sink: &Arc<MemoryQuarantineSink>,
        registry: &RunRegistry,
        chunk_size: usize,
    ) -> ChunkedLoader {
        ChunkedLoader::new(store.clone(), sink.clone(), registry.clone(), config(chunk_size))
    }

    #[tokio::test]
    async fn test_loads_all_chunks_and_checkpoints() {
        let store = Arc::new(MemoryTargetStore::new());
        let sink = Arc::new(MemoryQuarantineSink::new());
        let mut loader = loader(&store, &sink, &RunRegistry::new(), 2);

        let mut report = LoadReport::new("site", "sites");
        loader.load("site", "sites", stream(5), &mut report).await.unwrap();

        assert_eq!(loader.state(), LoadState::Done);
        assert_eq!(report.committed, 5);
        assert_eq!(report.chunks_committed, 3);
        let checkpoint = store.read_checkpoint("site", "sites").await.unwrap().unwrap();
        assert_eq!(checkpoint.offset, 5);
        assert_eq!(checkpoint.chunk_index, 2);
        assert_eq!(checkpoint.last_key, BusinessKey::new("S04"));
    }

    #[tokio::test]
    async fn test_resume_skips_checkpointed_chunks() {
        let store = Arc::new(MemoryTargetStore::new());
        let sink = Arc::new(MemoryQuarantineSink::new());
        let records = stream(10);

        // First run commits three chunks of two, then is interrupted
        let mut report = LoadReport::new("site", "sites");
        loader(&store, &sink, &RunRegistry::new(), 2)
            .load("site", "sites", records[..6].to_vec(), &mut report)
            .await
            .unwrap();
        let calls_before = store.upsert_calls().await;

        let mut report = LoadReport::new("site", "sites");
        loader(&store, &sink, &RunRegistry::new(), 2)
            .load("site", "sites", records, &mut report)
            .await
            .unwrap();
        assert_eq!(report.chunks_skipped, 3);
        assert_eq!(report.chunks_committed, 2);
        assert_eq!(store.upsert_calls().await - calls_before, 2);
        assert_eq!(store.record_count("site").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_stale_checkpoint_reloads_everything() {
        let store = Arc::new(MemoryTargetStore::new());
        let sink = Arc::new(MemoryQuarantineSink::new());
        store
            .write_checkpoint(&LoadCheckpoint {
                entity: "site".into(),
                source_id: "sites".into(),
                offset: 2,
                last_key: BusinessKey::new("GONE"),
                prefix_digest: String::new(),
                chunk_index: 0,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let mut report = LoadReport::new("site", "sites");
        loader(&store, &sink, &RunRegistry::new(), 2)
            .load("site", "sites", stream(4), &mut report)
            .await
            .unwrap();
        assert_eq!(report.chunks_skipped, 0);
        assert_eq!(report.chunks_committed, 2);
    }

    #[tokio::test]
    async fn test_changed_prefix_with_same_last_key_reloads_everything() {
        let store = Arc::new(MemoryTargetStore::new());
        let sink = Arc::new(MemoryQuarantineSink::new());
        let first = stream(6);

        let mut report = LoadReport::new("site", "sites");
        loader(&store, &sink, &RunRegistry::new(), 2)
            .load("site", "sites", first[..4].to_vec(), &mut report)
            .await
            .unwrap();
        let checkpoint = store.read_checkpoint("site", "sites").await.unwrap().unwrap();
        assert_eq!(checkpoint.offset, 4);
        assert_eq!(checkpoint.prefix_digest, key_prefix_digest(&first[..4]));

        // S01 no longer passes upstream checks and a new record takes its
        // place, so the stream keeps its length and S03 stays at offset 3.
        let mut replacement = first[1].clone();
        replacement.key = BusinessKey::new("S01b");
        replacement.record.set("site_code", Value::Text("S01b".into()));
        let mut second = first.clone();
        second[1] = replacement;
        assert_eq!(second[3].key, checkpoint.last_key);

        let mut report = LoadReport::new("site", "sites");
        loader(&store, &sink, &RunRegistry::new(), 2)
            .load("site", "sites", second, &mut report)
            .await
            .unwrap();
        assert_eq!(report.chunks_skipped, 0);
        assert_eq!(report.chunks_committed, 3);
        assert!(store.fetch("site", &BusinessKey::new("S01b")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_chunk_is_quarantined_and_run_continues() {
        let store = Arc::new(MemoryTargetStore::new());
        let sink = Arc::new(MemoryQuarantineSink::new());
        let registry = RunRegistry::new();
        let records = stream(6);
        registry.accept("site", records.iter().map(|r| &r.key));
        store.fail_keys("site", ["S03"]).await;

        let mut report = LoadReport::new("site", "sites");
        loader(&store, &sink, &registry, 2)
            .load("site", "sites", records, &mut report)
            .await
            .unwrap();

        assert_eq!(report.chunks_committed, 2);
        assert_eq!(report.chunks_failed, 1);
        assert_eq!(report.quarantined_for(ReasonCode::ChunkCommitFailure), 2);
        assert_eq!(store.record_count("site").await.unwrap(), 4);
        assert!(!registry.contains("site", &BusinessKey::new("S02")));
        assert!(registry.contains("site", &BusinessKey::new("S04")));

        // The checkpoint stops at the last chunk before the failure
        let checkpoint = store.read_checkpoint("site", "sites").await.unwrap().unwrap();
        assert_eq!(checkpoint.offset, 2);

        let held = sink
            .list(&QuarantineFilter::new().reason(ReasonCode::ChunkCommitFailure))
            .await
            .unwrap();
        assert_eq!(held.len(), 2);
        assert_eq!(held[0].stage, Stage::Loading);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let store = Arc::new(MemoryTargetStore::new());
        let sink = Arc::new(MemoryQuarantineSink::new());
        store.fail_next_upserts(1).await;

        let mut report = LoadReport::new("site", "sites");
        loader(&store, &sink, &RunRegistry::new(), 10)
            .load("site", "sites", stream(3), &mut report)
            .await
            .unwrap();
        assert_eq!(report.chunks_failed, 0);
        assert_eq!(report.committed, 3);
        assert_eq!(store.upsert_calls().await, 2);
    }

    #[tokio::test]
    async fn test_cancellation_between_chunks() {
        let store = Arc::new(MemoryTargetStore::new());
        let sink = Arc::new(MemoryQuarantineSink::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut loader = loader(&store, &sink, &RunRegistry::new(), 2).with_cancellation(cancel);
        let mut report = LoadReport::new("site", "sites");
        let err = loader.load("site", "sites", stream(4), &mut report).await.unwrap_err();

        assert!(matches!(err, IngestError::Cancelled));
        assert_eq!(loader.state(), LoadState::Aborted);
        assert!(report.fatal);
        assert_eq!(store.record_count("site").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_mid_chunk_rolls_back() {
        let store = Arc::new(MemoryTargetStore::new());
        let sink = Arc::new(MemoryQuarantineSink::new());
        store.set_upsert_delay(Duration::from_millis(200)).await;
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let mut loader = loader(&store, &sink, &RunRegistry::new(), 4).with_cancellation(cancel);
        let mut report = LoadReport::new("site", "sites");
        let result = loader.load("site", "sites", stream(4), &mut report).await;

        assert!(matches!(result, Err(IngestError::Cancelled)));
        assert_eq!(store.record_count("site").await.unwrap(), 0);
        assert!(store.read_checkpoint("site", "sites").await.unwrap().is_none());
    }
}

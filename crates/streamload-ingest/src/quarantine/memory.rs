use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{QuarantineFilter, QuarantineSink};
use crate::error::{IngestError, Result};
use crate::types::QuarantineEntry;

#[derive(Default)]
struct State {
    entries: Vec<QuarantineEntry>,
    next_id: i64,
    failing: bool,
}

/// Quarantine sink held in process memory
#[derive(Default)]
pub struct MemoryQuarantineSink {
    state: Mutex<State>,
}

impl MemoryQuarantineSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail until switched off again
    pub async fn fail_writes(&self, failing: bool) {
        self.state.lock().await.failing = failing;
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn same_note(a: &QuarantineEntry, b: &QuarantineEntry) -> bool {
    let (pa, pb) = (a.provenance(), b.provenance());
    a.entity == b.entity
        && a.reason == b.reason
        && a.stage == b.stage
        && pa.source_id == pb.source_id
        && pa.file_id == pb.file_id
        && pa.sheet_id == pb.sheet_id
        && pa.row_index == pb.row_index
}

#[async_trait]
impl QuarantineSink for MemoryQuarantineSink {
    async fn record(&self, mut entry: QuarantineEntry) -> Result<Option<i64>> {
        let mut state = self.state.lock().await;
        if state.failing {
            return Err(IngestError::quarantine("quarantine storage unavailable"));
        }
        if state.entries.iter().any(|held| same_note(held, &entry)) {
            return Ok(None);
        }
        state.next_id += 1;
        let id = state.next_id;
        entry.id = Some(id);
        state.entries.push(entry);
        Ok(Some(id))
    }

    async fn list(&self, filter: &QuarantineFilter) -> Result<Vec<QuarantineEntry>> {
        Ok(self
            .state
            .lock()
            .await
            .entries
            .iter()
            .filter(|e| filter.matches(e))
            .take(filter.effective_limit())
            .cloned()
            .collect())
    }

    async fn clear(&self, ids: &[i64]) -> Result<usize> {
        let mut state = self.state.lock().await;
        let before = state.entries.len();
        state
            .entries
            .retain(|e| e.id.is_none_or(|id| !ids.contains(&id)));
        Ok(before - state.entries.len())
    }
}

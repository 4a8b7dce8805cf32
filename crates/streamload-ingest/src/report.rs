//! Operator-facing run and load reports

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::error::IngestError;
use crate::loader::LoadState;
use crate::types::{LoadCheckpoint, QualityClass, ReasonCode};

/// Counts for one (entity, source) load
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadReport {
    pub entity: String,
    pub source_id: String,
    pub read: u64,
    pub mapped: u64,
    /// Quality classes as assigned at coercion, one per mapped record
    pub quality: BTreeMap<QualityClass, u64>,
    /// Records of this source that merged into an earlier one
    pub duplicates_merged: u64,
    pub quarantined: BTreeMap<ReasonCode, u64>,
    /// Quarantine notes the sink failed to store
    pub quarantine_write_failures: u64,
    pub accepted: u64,
    pub committed: u64,
    pub chunks_committed: u64,
    pub chunks_failed: u64,
    pub chunks_skipped: u64,
    pub checkpoint: Option<LoadCheckpoint>,
    pub state: LoadState,
    pub error: Option<String>,
    pub fatal: bool,
}

impl LoadReport {
    pub fn new(entity: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            source_id: source_id.into(),
            read: 0,
            mapped: 0,
            quality: BTreeMap::new(),
            duplicates_merged: 0,
            quarantined: BTreeMap::new(),
            quarantine_write_failures: 0,
            accepted: 0,
            committed: 0,
            chunks_committed: 0,
            chunks_failed: 0,
            chunks_skipped: 0,
            checkpoint: None,
            state: LoadState::Idle,
            error: None,
            fatal: false,
        }
    }

    pub fn count_quality(&mut self, quality: QualityClass) {
        *self.quality.entry(quality).or_default() += 1;
    }

    pub fn count_quarantined(&mut self, reason: ReasonCode) {
        *self.quarantined.entry(reason).or_default() += 1;
    }

    pub fn quarantined_for(&self, reason: ReasonCode) -> u64 {
        self.quarantined.get(&reason).copied().unwrap_or(0)
    }

    pub fn total_quarantined(&self) -> u64 {
        self.quarantined.values().sum()
    }

    /// Record an error that stopped this load
    pub fn fail(&mut self, err: &IngestError) {
        self.error = Some(err.to_string());
        self.fatal = err.is_fatal();
        self.state = LoadState::Aborted;
    }
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<12} {:<20} read={:<6} mapped={:<6} committed={:<6} quarantined={:<5} chunks={}/{}/{} ({})",
            self.entity,
            self.source_id,
            self.read,
            self.mapped,
            self.committed,
            self.total_quarantined(),
            self.chunks_committed,
            self.chunks_failed,
            self.chunks_skipped,
            self.state,
        )?;
        if let Some(cp) = &self.checkpoint {
            write!(f, " checkpoint={}@{}", cp.offset, cp.last_key)?;
        }
        if let Some(error) = &self.error {
            write!(f, " error: {}", error)?;
        }
        Ok(())
    }
}

/// Everything one pipeline run did
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub loads: Vec<LoadReport>,
    /// Entity types not attempted because an earlier level failed fatally
    pub skipped_entities: Vec<String>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            loads: Vec::new(),
            skipped_entities: Vec::new(),
            cancelled: false,
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn has_fatal(&self) -> bool {
        self.loads.iter().any(|l| l.fatal)
    }

    /// Process exit status: 1 when any fatal condition occurred, otherwise 0
    /// whatever was quarantined.
    pub fn exit_code(&self) -> i32 {
        if self.has_fatal() || self.cancelled {
            1
        } else {
            0
        }
    }

    pub fn load(&self, entity: &str, source_id: &str) -> Option<&LoadReport> {
        self.loads
            .iter()
            .find(|l| l.entity == entity && l.source_id == source_id)
    }

    pub fn committed(&self) -> u64 {
        self.loads.iter().map(|l| l.committed).sum()
    }

    pub fn quarantined(&self) -> u64 {
        self.loads.iter().map(|l| l.total_quarantined()).sum()
    }

    pub fn quarantined_for(&self, reason: ReasonCode) -> u64 {
        self.loads.iter().map(|l| l.quarantined_for(reason)).sum()
    }
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {}", self.run_id)?;
        for load in &self.loads {
            writeln!(f, "  {}", load)?;
        }
        if !self.skipped_entities.is_empty() {
            writeln!(f, "  skipped: {}", self.skipped_entities.join(", "))?;
        }
        if self.cancelled {
            writeln!(f, "  cancelled")?;
        }
        write!(
            f,
            "  total committed={} quarantined={} fatal={}",
            self.committed(),
            self.quarantined(),
            self.has_fatal()
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_quarantine_does_not_affect_exit_code() {
        let mut load = LoadReport::new("sample", "samples-2023");
        load.count_quarantined(ReasonCode::OrphanedReference);
        load.count_quarantined(ReasonCode::OrphanedReference);
        load.count_quarantined(ReasonCode::BlankRow);
        assert_eq!(load.total_quarantined(), 3);
        assert_eq!(load.quarantined_for(ReasonCode::OrphanedReference), 2);

        let mut run = RunReport::new();
        run.loads.push(load);
        assert_eq!(run.exit_code(), 0);
    }

    #[test]
    fn test_fatal_load_sets_exit_code() {
        let mut load = LoadReport::new("bacteria", "bact-2023");
        load.fail(&IngestError::source_unavailable("bact-2023", "missing"));
        assert_eq!(load.state, LoadState::Aborted);

        let mut run = RunReport::new();
        run.loads.push(load);
        assert!(run.has_fatal());
        assert_eq!(run.exit_code(), 1);
    }

    #[test]
    fn test_report_serializes_reason_keys() {
        let mut load = LoadReport::new("sample", "samples-2023");
        load.count_quarantined(ReasonCode::OrphanedReference);
        load.count_quality(QualityClass::PotentialOutlier);
        let json = serde_json::to_value(&load).unwrap();
        assert_eq!(json["quarantined"]["orphaned-reference"], 1);
        assert_eq!(json["quality"]["potential_outlier"], 1);
        assert_eq!(json["state"], "idle");
    }
}

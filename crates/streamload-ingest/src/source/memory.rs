use async_trait::async_trait;

use super::{row_number, RecordSource};
use crate::error::{IngestError, Result};
use crate::types::{Provenance, RawField, RawRecord, RawValue};

/// Source over rows held in memory.
///
/// Rows read as if they came from one sheet named `rows` whose header is
/// the first line.
#[derive(Debug, Clone)]
pub struct MemorySource {
    source_id: String,
    entity: String,
    headers: Vec<String>,
    rows: Vec<Vec<RawValue>>,
    mapping_revision: Option<u32>,
    unavailable: bool,
    fail_after: Option<usize>,
    cursor: usize,
}

impl MemorySource {
    pub fn new(source_id: impl Into<String>, entity: impl Into<String>, headers: &[&str]) -> Self {
        Self {
            source_id: source_id.into(),
            entity: entity.into(),
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
            mapping_revision: None,
            unavailable: false,
            fail_after: None,
            cursor: 0,
        }
    }

    pub fn row(mut self, values: Vec<RawValue>) -> Self {
        self.rows.push(values);
        self
    }

    pub fn push_row(&mut self, values: Vec<RawValue>) {
        self.rows.push(values);
    }

    pub fn with_mapping_revision(mut self, revision: u32) -> Self {
        self.mapping_revision = Some(revision);
        self
    }

    /// Fail on open, like a missing file
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// Fail once `rows` rows have been yielded
    pub fn fail_after(mut self, rows: usize) -> Self {
        self.fail_after = Some(rows);
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn entity(&self) -> &str {
        &self.entity
    }

    fn mapping_revision(&self) -> Option<u32> {
        self.mapping_revision
    }

    async fn open(&mut self) -> Result<()> {
        if self.unavailable {
            return Err(IngestError::source_unavailable(
                &self.source_id,
                "source marked unavailable",
            ));
        }
        self.cursor = 0;
        Ok(())
    }

    async fn next_record(&mut self) -> Result<Option<RawRecord>> {
        if self.fail_after.is_some_and(|limit| self.cursor >= limit) {
            return Err(IngestError::source_unavailable(
                &self.source_id,
                format!("read failed after {} rows", self.cursor),
            ));
        }
        let Some(values) = self.rows.get(self.cursor) else {
            return Ok(None);
        };

        let fields = values
            .iter()
            .enumerate()
            .map(|(position, value)| RawField {
                name: self.headers.get(position).cloned().unwrap_or_default(),
                position,
                value: value.clone(),
            })
            .collect();
        let record = RawRecord {
            provenance: Provenance {
                source_id: self.source_id.clone(),
                file_id: "memory".to_string(),
                sheet_id: "rows".to_string(),
                row_index: row_number(0, self.cursor),
                ordinal: self.cursor as u64,
            },
            fields,
        };
        self.cursor += 1;
        Ok(Some(record))
    }
}

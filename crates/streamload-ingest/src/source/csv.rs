//! Delimited text files via the `csv` crate

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{header_text, row_number, RecordSource, SourceConfig};
use crate::error::{IngestError, Result};
use crate::types::{Provenance, RawField, RawRecord, RawValue};

/// Sheet id reported for rows of a delimited file
pub const CSV_SHEET_ID: &str = "csv";

/// Reads each configured file in turn.
///
/// Files load one at a time on a blocking thread. Ragged rows are accepted
/// and invalid UTF-8 is replaced rather than rejected.
pub struct CsvSource {
    config: SourceConfig,
    pending: VecDeque<PathBuf>,
    buffer: VecDeque<RawRecord>,
    ordinal: u64,
}

impl CsvSource {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            pending: VecDeque::new(),
            buffer: VecDeque::new(),
            ordinal: 0,
        }
    }
}

fn file_id(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn cell(raw: &[u8]) -> RawValue {
    let text = String::from_utf8_lossy(raw);
    if text.trim().is_empty() {
        RawValue::Empty
    } else {
        RawValue::Text(text.into_owned())
    }
}

fn read_file(path: &Path, config: &SourceConfig) -> Result<Vec<RawRecord>> {
    let unavailable = |e: &dyn std::fmt::Display| {
        IngestError::source_unavailable(&config.id, format!("{}: {}", path.display(), e))
    };

    let mut reader = ::csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| unavailable(&e))?;

    let file_id = file_id(path);
    let mut headers: Vec<String> = Vec::new();
    let mut records = Vec::new();
    let limit = config.row_limit.unwrap_or(usize::MAX);

    for (index, row) in reader.byte_records().enumerate() {
        let row = row.map_err(|e| unavailable(&e))?;
        if index < config.header_row {
            continue;
        }
        if index == config.header_row {
            headers = row
                .iter()
                .map(|h| header_text(&String::from_utf8_lossy(h)))
                .collect();
            continue;
        }

        let data_index = index - config.header_row - 1;
        if data_index >= limit {
            break;
        }
        // The reader skips empty lines, so count rows by file line
        let row_index = row
            .position()
            .map(|p| p.line())
            .unwrap_or_else(|| row_number(config.header_row, data_index));
        let width = row.len().max(headers.len());
        let fields = (0..width)
            .map(|position| RawField {
                name: headers.get(position).cloned().unwrap_or_default(),
                position,
                value: row.get(position).map(cell).unwrap_or(RawValue::Empty),
            })
            .collect();
        records.push(RawRecord {
            provenance: Provenance {
                source_id: config.id.clone(),
                file_id: file_id.clone(),
                sheet_id: CSV_SHEET_ID.to_string(),
                row_index,
                ordinal: 0,
            },
            fields,
        });
    }

    Ok(records)
}

#[async_trait]
impl RecordSource for CsvSource {
    fn source_id(&self) -> &str {
        &self.config.id
    }

    fn entity(&self) -> &str {
        &self.config.entity
    }

    fn mapping_revision(&self) -> Option<u32> {
        self.config.mapping_revision
    }

    async fn open(&mut self) -> Result<()> {
        for path in &self.config.paths {
            let metadata = tokio::fs::metadata(path).await.map_err(|e| {
                IngestError::source_unavailable(&self.config.id, format!("{}: {}", path.display(), e))
            })?;
            if !metadata.is_file() {
                return Err(IngestError::source_unavailable(
                    &self.config.id,
                    format!("{} is not a file", path.display()),
                ));
            }
        }
        self.pending = self.config.paths.iter().cloned().collect();
        self.buffer.clear();
        self.ordinal = 0;
        Ok(())
    }

    async fn next_record(&mut self) -> Result<Option<RawRecord>> {
        loop {
            if let Some(mut record) = self.buffer.pop_front() {
                record.provenance.ordinal = self.ordinal;
                self.ordinal += 1;
                return Ok(Some(record));
            }
            let Some(path) = self.pending.pop_front() else {
                return Ok(None);
            };

            let config = self.config.clone();
            let source_id = self.config.id.clone();
            let records = tokio::task::spawn_blocking(move || read_file(&path, &config))
                .await
                .map_err(|e| IngestError::source_unavailable(source_id, e))??;
            debug!(source = %self.config.id, rows = records.len(), "Read delimited file");
            self.buffer.extend(records);
        }
    }
}

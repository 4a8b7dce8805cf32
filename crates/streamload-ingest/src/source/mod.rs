//! Source readers
//!
//! A source yields the rows of one logical dataset as [`RawRecord`]s in
//! file order, then sheet order, then row order. Each source feeds exactly
//! one entity type. A source that cannot be opened fails with
//! `SourceUnavailable`; a row that reads oddly is still yielded and left for
//! the quality engine to judge.

mod csv;
mod memory;
mod workbook;

pub use self::csv::CsvSource;
pub use self::memory::MemorySource;
pub use self::workbook::WorkbookSource;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Result;
use crate::types::RawRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Spreadsheet files (xlsx, xls, xlsb, ods)
    Workbook,
    Csv,
}

/// Declaration of one logical source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub entity: String,
    pub kind: SourceKind,
    pub paths: Vec<PathBuf>,
    /// Only sheets whose name matches this regex are read
    #[serde(default)]
    pub sheet_pattern: Option<String>,
    /// Zero-based row holding the column headers
    #[serde(default)]
    pub header_row: usize,
    /// Maximum data rows read per sheet
    #[serde(default)]
    pub row_limit: Option<usize>,
    /// Pin a mapping table revision instead of using the active one
    #[serde(default)]
    pub mapping_revision: Option<u32>,
}

impl SourceConfig {
    pub fn new(id: impl Into<String>, entity: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            id: id.into(),
            entity: entity.into(),
            kind,
            paths: Vec::new(),
            sheet_pattern: None,
            header_row: 0,
            row_limit: None,
            mapping_revision: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.push(path.into());
        self
    }

    pub fn with_sheet_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.sheet_pattern = Some(pattern.into());
        self
    }

    pub fn with_header_row(mut self, row: usize) -> Self {
        self.header_row = row;
        self
    }

    pub fn with_row_limit(mut self, limit: usize) -> Self {
        self.row_limit = Some(limit);
        self
    }
}

/// A lazy, finite sequence of raw rows for one entity type
#[async_trait]
pub trait RecordSource: Send {
    fn source_id(&self) -> &str;

    fn entity(&self) -> &str;

    /// Mapping revision this source was written against, if pinned
    fn mapping_revision(&self) -> Option<u32> {
        None
    }

    /// Make the source ready to read. Fails with `SourceUnavailable` when
    /// any of its files cannot be opened.
    async fn open(&mut self) -> Result<()>;

    /// Next row, or `None` once the source is exhausted
    async fn next_record(&mut self) -> Result<Option<RawRecord>>;
}

/// Build the reader declared by `config`
pub fn from_config(config: &SourceConfig) -> Result<Box<dyn RecordSource>> {
    Ok(match config.kind {
        SourceKind::Workbook => Box::new(WorkbookSource::new(config.clone())?),
        SourceKind::Csv => Box::new(CsvSource::new(config.clone())),
    })
}

/// Open `source` and drain it.
///
/// Rows are only handed back once the whole source has been read, so a
/// source that fails halfway contributes nothing.
pub async fn read_all(source: &mut dyn RecordSource) -> Result<Vec<RawRecord>> {
    source.open().await?;
    let mut records = Vec::new();
    while let Some(record) = source.next_record().await? {
        records.push(record);
    }
    Ok(records)
}

/// Header cell text, trimmed
pub(crate) fn header_text(raw: &str) -> String {
    raw.trim().to_string()
}

/// Spreadsheet-style row number (1-based) of a data row
pub(crate) fn row_number(header_row: usize, data_index: usize) -> u64 {
    (header_row + data_index + 2) as u64
}

//! Spreadsheet workbooks via calamine
//!
//! Sheet names are listed when the source opens; each sheet's cells are
//! loaded on a blocking thread only when the reader reaches it.

use async_trait::async_trait;
use calamine::{open_workbook_auto, Data, Reader};
use regex::Regex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{header_text, row_number, RecordSource, SourceConfig};
use crate::error::{IngestError, Result};
use crate::types::{format_number, Provenance, RawField, RawRecord, RawValue};

pub struct WorkbookSource {
    config: SourceConfig,
    sheet_filter: Option<Regex>,
    pending: VecDeque<(PathBuf, String)>,
    buffer: VecDeque<RawRecord>,
    ordinal: u64,
}

impl WorkbookSource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        let sheet_filter = config
            .sheet_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| {
                IngestError::config(format!(
                    "source '{}' has an invalid sheet_pattern: {}",
                    config.id, e
                ))
            })?;
        Ok(Self {
            config,
            sheet_filter,
            pending: VecDeque::new(),
            buffer: VecDeque::new(),
            ordinal: 0,
        })
    }
}

/// Map one cell to a raw scalar.
///
/// Dates stay as Excel serial numbers; the quality engine turns them into
/// dates when the target field asks for one.
pub(crate) fn cell_value(cell: &Data) -> RawValue {
    match cell {
        Data::Int(i) => RawValue::Number(*i as f64),
        Data::Float(f) => RawValue::Number(*f),
        Data::String(s) if s.trim().is_empty() => RawValue::Empty,
        Data::String(s) => RawValue::Text(s.clone()),
        Data::Bool(b) => RawValue::Text(b.to_string()),
        Data::DateTime(dt) => RawValue::Number(dt.as_f64()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => RawValue::Text(s.clone()),
        Data::Error(_) | Data::Empty => RawValue::Empty,
    }
}

fn header_cell(cell: &Data) -> String {
    match cell_value(cell) {
        RawValue::Text(s) => header_text(&s),
        RawValue::Number(n) => format_number(n),
        RawValue::Empty => String::new(),
    }
}

fn file_id(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn list_sheets(path: &Path, source_id: &str) -> Result<Vec<String>> {
    let workbook = open_workbook_auto(path).map_err(|e| {
        IngestError::source_unavailable(source_id, format!("{}: {}", path.display(), e))
    })?;
    Ok(workbook.sheet_names())
}

fn read_sheet(path: &Path, sheet: &str, config: &SourceConfig) -> Result<Vec<RawRecord>> {
    let unavailable = |e: &dyn std::fmt::Display| {
        IngestError::source_unavailable(
            &config.id,
            format!("{} [{}]: {}", path.display(), sheet, e),
        )
    };
    let mut workbook = open_workbook_auto(path).map_err(|e| unavailable(&e))?;
    let range = workbook.worksheet_range(sheet).map_err(|e| unavailable(&e))?;

    // Ranges start at the first used cell; keep positions absolute
    let (first_row, first_col) = range.start().unwrap_or((0, 0));
    let (first_row, first_col) = (first_row as usize, first_col as usize);
    let file_id = file_id(path);
    let limit = config.row_limit.unwrap_or(usize::MAX);

    let mut headers: Vec<String> = Vec::new();
    let mut records = Vec::new();

    for (offset, row) in range.rows().enumerate() {
        let line = first_row + offset;
        if line < config.header_row {
            continue;
        }
        if line == config.header_row {
            headers = vec![String::new(); first_col];
            headers.extend(row.iter().map(header_cell));
            continue;
        }

        let data_index = line - config.header_row - 1;
        if data_index >= limit {
            break;
        }
        let fields = row
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let position = first_col + i;
                RawField {
                    name: headers.get(position).cloned().unwrap_or_default(),
                    position,
                    value: cell_value(cell),
                }
            })
            .collect();
        records.push(RawRecord {
            provenance: Provenance {
                source_id: config.id.clone(),
                file_id: file_id.clone(),
                sheet_id: sheet.to_string(),
                row_index: row_number(config.header_row, data_index),
                ordinal: 0,
            },
            fields,
        });
    }

    Ok(records)
}

#[async_trait]
impl RecordSource for WorkbookSource {
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
        self.pending.clear();
        self.buffer.clear();
        self.ordinal = 0;

        for path in &self.config.paths {
            let owned = path.clone();
            let source_id = self.config.id.clone();
            let sheets = tokio::task::spawn_blocking(move || list_sheets(&owned, &source_id))
                .await
                .map_err(|e| IngestError::source_unavailable(&self.config.id, e))??;

            let selected: Vec<String> = sheets
                .into_iter()
                .filter(|name| self.sheet_filter.as_ref().is_none_or(|re| re.is_match(name)))
                .collect();
            if selected.is_empty() {
                warn!(
                    source = %self.config.id,
                    file = %path.display(),
                    "No sheets selected from workbook"
                );
            }
            self.pending
                .extend(selected.into_iter().map(|sheet| (path.clone(), sheet)));
        }
        Ok(())
    }

    async fn next_record(&mut self) -> Result<Option<RawRecord>> {
        loop {
            if let Some(mut record) = self.buffer.pop_front() {
                record.provenance.ordinal = self.ordinal;
                self.ordinal += 1;
                return Ok(Some(record));
            }
            let Some((path, sheet)) = self.pending.pop_front() else {
                return Ok(None);
            };

            let config = self.config.clone();
            let sheet_name = sheet.clone();
            let records = tokio::task::spawn_blocking(move || read_sheet(&path, &sheet_name, &config))
                .await
                .map_err(|e| IngestError::source_unavailable(&self.config.id, e))??;
            debug!(source = %self.config.id, sheet = %sheet, rows = records.len(), "Read sheet");
            self.buffer.extend(records);
        }
    }
}

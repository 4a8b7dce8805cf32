//! Quarantine sink backed by a local SQLite file

use async_trait::async_trait;
use rusqlite::types::ToSql;
use rusqlite::{params, params_from_iter, Connection};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::{schema, QuarantineFilter, QuarantineSink};
use crate::error::{IngestError, Result};
use crate::types::{QuarantineEntry, ReasonCode, Stage};

pub struct SqliteQuarantineSink {
    db: Arc<Mutex<Connection>>,
}

impl SqliteQuarantineSink {
    /// Open (creating if needed) the quarantine database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                IngestError::quarantine(format!(
                    "Failed to create quarantine directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| {
            IngestError::quarantine(format!("Failed to open quarantine database: {}", e))
        })?;
        schema::init_schema(&conn)?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init_schema(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| IngestError::quarantine(format!("Failed to acquire database lock: {}", e)))
    }
}

fn conversion_error(column: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QuarantineEntry> {
    let reason = row.get::<_, String>(2)?;
    let stage = row.get::<_, String>(3)?;
    let payload = row.get::<_, String>(5)?;
    let created_at = row.get::<_, String>(6)?;

    Ok(QuarantineEntry {
        id: Some(row.get::<_, i64>(0)?),
        entity: row.get(1)?,
        reason: ReasonCode::from_str(&reason)
            .map_err(|e| conversion_error(2, IngestError::quarantine(e)))?,
        stage: Stage::from_str(&stage).map_err(|e| conversion_error(3, IngestError::quarantine(e)))?,
        detail: row.get(4)?,
        payload: serde_json::from_str(&payload).map_err(|e| conversion_error(5, e))?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| conversion_error(6, e))?
            .with_timezone(&chrono::Utc),
    })
}

#[async_trait]
impl QuarantineSink for SqliteQuarantineSink {
    async fn record(&self, entry: QuarantineEntry) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let provenance = entry.provenance();
        let payload = serde_json::to_string(&entry.payload).map_err(|e| {
            IngestError::quarantine(format!("Failed to serialize quarantined record: {}", e))
        })?;

        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO quarantine_entries (
                entity_type, reason, stage, source_id, file_id, sheet_id,
                row_index, detail, payload, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                entry.entity,
                entry.reason.as_str(),
                entry.stage.as_str(),
                provenance.source_id,
                provenance.file_id,
                provenance.sheet_id,
                provenance.row_index as i64,
                entry.detail,
                payload,
                entry.created_at.to_rfc3339(),
            ],
        )?;

        if inserted == 0 {
            debug!(
                entity = %entry.entity,
                reason = %entry.reason,
                provenance = %provenance,
                "Quarantine entry already held"
            );
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    async fn list(&self, filter: &QuarantineFilter) -> Result<Vec<QuarantineEntry>> {
        let mut sql = String::from(
            r#"
            SELECT id, entity_type, reason, stage, detail, payload, created_at
            FROM quarantine_entries
            WHERE 1=1
            "#,
        );
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(entity) = &filter.entity {
            values.push(Box::new(entity.clone()));
            sql.push_str(&format!(" AND entity_type = ?{}", values.len()));
        }
        if let Some(reason) = filter.reason {
            values.push(Box::new(reason.as_str()));
            sql.push_str(&format!(" AND reason = ?{}", values.len()));
        }
        if let Some(source_id) = &filter.source_id {
            values.push(Box::new(source_id.clone()));
            sql.push_str(&format!(" AND source_id = ?{}", values.len()));
        }
        if let Some(from) = filter.row_from {
            values.push(Box::new(from as i64));
            sql.push_str(&format!(" AND row_index >= ?{}", values.len()));
        }
        if let Some(to) = filter.row_to {
            values.push(Box::new(to as i64));
            sql.push_str(&format!(" AND row_index <= ?{}", values.len()));
        }
        values.push(Box::new(filter.effective_limit() as i64));
        sql.push_str(&format!(" ORDER BY id ASC LIMIT ?{}", values.len()));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params_from_iter(values.iter()), entry_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    async fn clear(&self, ids: &[i64]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut removed = 0;
        for id in ids {
            removed += tx.execute("DELETE FROM quarantine_entries WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(removed)
    }
}

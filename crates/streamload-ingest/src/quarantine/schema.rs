//! SQLite schema for the quarantine database

use rusqlite::Connection;

use crate::error::Result;

/// Initialize the quarantine schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS quarantine_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            reason TEXT NOT NULL,
            stage TEXT NOT NULL,

            -- Provenance of the rejected row
            source_id TEXT NOT NULL,
            file_id TEXT NOT NULL,
            sheet_id TEXT NOT NULL,
            row_index INTEGER NOT NULL,

            detail TEXT,
            payload TEXT NOT NULL,  -- JSON
            created_at DATETIME NOT NULL,

            UNIQUE (entity_type, source_id, file_id, sheet_id, row_index, stage, reason)
        )
        "#,
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_quarantine_entity_reason ON quarantine_entries(entity_type, reason)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_quarantine_source_row ON quarantine_entries(source_id, row_index)",
        [],
    )?;

    Ok(())
}

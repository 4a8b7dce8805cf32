//! SQLite target store on sqlx

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashSet;
use std::str::FromStr;
use tracing::{debug, info};

use super::{StoredRecord, TargetStore};
use crate::error::{IngestError, Result};
use crate::types::{BusinessKey, KeyedRecord, LoadCheckpoint, QualityClass};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS entity_records (
        entity_type  TEXT NOT NULL,
        business_key TEXT NOT NULL,
        payload      TEXT NOT NULL,
        quality      TEXT NOT NULL,
        fingerprint  TEXT NOT NULL,
        source_id    TEXT NOT NULL,
        sheet_id     TEXT NOT NULL,
        row_index    INTEGER NOT NULL,
        updated_at   TEXT NOT NULL,
        PRIMARY KEY (entity_type, business_key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS load_checkpoints (
        entity_type TEXT NOT NULL,
        source_id   TEXT NOT NULL,
        "offset"    INTEGER NOT NULL,
        last_key    TEXT NOT NULL,
        prefix_digest TEXT NOT NULL DEFAULT '',
        chunk_index INTEGER NOT NULL,
        updated_at  TEXT NOT NULL,
        PRIMARY KEY (entity_type, source_id)
    )
    "#,
];

/// Target store backed by a SQLite database.
///
/// Canonical records land in one `entity_records` table keyed by
/// `(entity_type, business_key)` with the typed fields kept as a JSON
/// payload.
#[derive(Clone)]
pub struct SqliteTargetStore {
    pool: SqlitePool,
}

impl SqliteTargetStore {
    /// Open (creating if needed) the database at `url` and initialize the
    /// schema.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        info!(url, "Connected to target store");
        Ok(store)
    }

    /// Private in-memory database, mostly for tests.
    ///
    /// Pinned to a single connection that never expires, since every
    /// connection to `sqlite::memory:` gets its own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn stored_from_row(row: &SqliteRow) -> Result<StoredRecord> {
    let payload: String = row.try_get("payload")?;
    let quality: String = row.try_get("quality")?;
    let row_index: i64 = row.try_get("row_index")?;
    Ok(StoredRecord {
        entity: row.try_get("entity_type")?,
        key: BusinessKey::new(row.try_get::<String, _>("business_key")?),
        payload: serde_json::from_str(&payload).map_err(IngestError::store)?,
        quality: QualityClass::from_str(&quality).map_err(IngestError::store)?,
        fingerprint: row.try_get("fingerprint")?,
        source_id: row.try_get("source_id")?,
        sheet_id: row.try_get("sheet_id")?,
        row_index: row_index as u64,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn checkpoint_from_row(row: &SqliteRow) -> Result<LoadCheckpoint> {
    let offset: i64 = row.try_get("offset")?;
    let chunk_index: i64 = row.try_get("chunk_index")?;
    Ok(LoadCheckpoint {
        entity: row.try_get("entity_type")?,
        source_id: row.try_get("source_id")?,
        offset: offset as u64,
        last_key: BusinessKey::new(row.try_get::<String, _>("last_key")?),
        prefix_digest: row.try_get("prefix_digest")?,
        chunk_index: chunk_index as u64,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

#[async_trait]
impl TargetStore for SqliteTargetStore {
    async fn upsert_chunk(&self, entity: &str, chunk: &[KeyedRecord]) -> Result<usize> {
        let now = Utc::now();
        let rows = chunk
            .iter()
            .map(|keyed| StoredRecord::from_keyed(keyed, now))
            .collect::<Result<Vec<_>>>()?;

        let mut tx = self.pool.begin().await?;
        for row in &rows {
            let payload = serde_json::to_string(&row.payload).map_err(IngestError::store)?;
            sqlx::query(
                r#"
                INSERT INTO entity_records (
                    entity_type, business_key, payload, quality, fingerprint,
                    source_id, sheet_id, row_index, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT (entity_type, business_key) DO UPDATE SET
                    payload = excluded.payload,
                    quality = excluded.quality,
                    fingerprint = excluded.fingerprint,
                    source_id = excluded.source_id,
                    sheet_id = excluded.sheet_id,
                    row_index = excluded.row_index,
                    updated_at = excluded.updated_at
                WHERE entity_records.fingerprint <> excluded.fingerprint
                "#,
            )
            .bind(entity)
            .bind(row.key.as_str())
            .bind(payload)
            .bind(row.quality.as_str())
            .bind(&row.fingerprint)
            .bind(&row.source_id)
            .bind(&row.sheet_id)
            .bind(row.row_index as i64)
            .bind(row.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(entity, rows = rows.len(), "Committed chunk");
        Ok(rows.len())
    }

    async fn committed_keys(&self, entity: &str) -> Result<HashSet<BusinessKey>> {
        let keys: Vec<String> =
            sqlx::query_scalar("SELECT business_key FROM entity_records WHERE entity_type = ?1")
                .bind(entity)
                .fetch_all(&self.pool)
                .await?;
        Ok(keys.into_iter().map(BusinessKey::new).collect())
    }

    async fn fetch(&self, entity: &str, key: &BusinessKey) -> Result<Option<StoredRecord>> {
        let row = sqlx::query(
            r#"
            SELECT entity_type, business_key, payload, quality, fingerprint,
                   source_id, sheet_id, row_index, updated_at
            FROM entity_records
            WHERE entity_type = ?1 AND business_key = ?2
            "#,
        )
        .bind(entity)
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(stored_from_row).transpose()
    }

    async fn record_count(&self, entity: &str) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM entity_records WHERE entity_type = ?1")
                .bind(entity)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn read_checkpoint(&self, entity: &str, source_id: &str) -> Result<Option<LoadCheckpoint>> {
        let row = sqlx::query(
            r#"
            SELECT entity_type, source_id, "offset", last_key, prefix_digest, chunk_index, updated_at
            FROM load_checkpoints
            WHERE entity_type = ?1 AND source_id = ?2
            "#,
        )
        .bind(entity)
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(checkpoint_from_row).transpose()
    }

    async fn write_checkpoint(&self, checkpoint: &LoadCheckpoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO load_checkpoints (
                entity_type, source_id, "offset", last_key, prefix_digest, chunk_index, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (entity_type, source_id) DO UPDATE SET
                "offset" = excluded."offset",
                last_key = excluded.last_key,
                prefix_digest = excluded.prefix_digest,
                chunk_index = excluded.chunk_index,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&checkpoint.entity)
        .bind(&checkpoint.source_id)
        .bind(checkpoint.offset as i64)
        .bind(checkpoint.last_key.as_str())
        .bind(&checkpoint.prefix_digest)
        .bind(checkpoint.chunk_index as i64)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_checkpoint(&self, entity: &str, source_id: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM load_checkpoints WHERE entity_type = ?1 AND source_id = ?2")
                .bind(entity)
                .bind(source_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_checkpoints(&self) -> Result<Vec<LoadCheckpoint>> {
        let rows = sqlx::query(
            r#"
            SELECT entity_type, source_id, "offset", last_key, prefix_digest, chunk_index, updated_at
            FROM load_checkpoints
            ORDER BY entity_type, source_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(checkpoint_from_row).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{CanonicalRecord, Provenance, Value};

    fn keyed(site: &str, ecoli: f64, row: u64) -> KeyedRecord {
        let mut record = CanonicalRecord::new(
            "bacteria",
            Provenance {
                source_id: "bact-2023".into(),
                file_id: "bacteria_2023.xlsx".into(),
                sheet_id: "IDEXX".into(),
                row_index: row,
                ordinal: row - 1,
            },
        );
        record.set("site_code", Value::Text(site.into()));
        record.set("ecoli_cfu", Value::Float(ecoli));
        KeyedRecord {
            key: BusinessKey::from_parts(&[site, "2023-06-01"]),
            record,
        }
    }

    #[tokio::test]
    async fn test_upsert_and_fetch() {
        let store = SqliteTargetStore::in_memory().await.unwrap();
        let chunk = vec![keyed("PR2a", 41.0, 1), keyed("PR3", 12.0, 2)];
        assert_eq!(store.upsert_chunk("bacteria", &chunk).await.unwrap(), 2);
        assert_eq!(store.record_count("bacteria").await.unwrap(), 2);

        let key = BusinessKey::from_parts(&["PR2a", "2023-06-01"]);
        let row = store.fetch("bacteria", &key).await.unwrap().unwrap();
        assert_eq!(row.payload["ecoli_cfu"], serde_json::json!(41.0));
        assert_eq!(row.sheet_id, "IDEXX");
        assert_eq!(row.row_index, 1);

        let keys = store.committed_keys("bacteria").await.unwrap();
        assert!(keys.contains(&key));
        assert!(store.committed_keys("site").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reload_of_unchanged_row_keeps_timestamp() {
        let store = SqliteTargetStore::in_memory().await.unwrap();
        let key = BusinessKey::from_parts(&["PR2a", "2023-06-01"]);

        store.upsert_chunk("bacteria", &[keyed("PR2a", 41.0, 1)]).await.unwrap();
        let first = store.fetch("bacteria", &key).await.unwrap().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.upsert_chunk("bacteria", &[keyed("PR2a", 41.0, 1)]).await.unwrap();
        let second = store.fetch("bacteria", &key).await.unwrap().unwrap();
        assert_eq!(first, second);

        store.upsert_chunk("bacteria", &[keyed("PR2a", 52.0, 1)]).await.unwrap();
        let third = store.fetch("bacteria", &key).await.unwrap().unwrap();
        assert_ne!(third.fingerprint, first.fingerprint);
        assert_eq!(third.payload["ecoli_cfu"], serde_json::json!(52.0));
    }

    #[tokio::test]
    async fn test_checkpoint_lifecycle() {
        let store = SqliteTargetStore::in_memory().await.unwrap();
        assert!(store.read_checkpoint("bacteria", "bact-2023").await.unwrap().is_none());

        let mut checkpoint = LoadCheckpoint {
            entity: "bacteria".into(),
            source_id: "bact-2023".into(),
            offset: 3,
            last_key: BusinessKey::new("PR3|2023-06-01"),
            prefix_digest: "a1b2".into(),
            chunk_index: 0,
            updated_at: Utc::now(),
        };
        store.write_checkpoint(&checkpoint).await.unwrap();
        checkpoint.offset = 6;
        checkpoint.chunk_index = 1;
        store.write_checkpoint(&checkpoint).await.unwrap();

        let read = store.read_checkpoint("bacteria", "bact-2023").await.unwrap().unwrap();
        assert_eq!(read.offset, 6);
        assert_eq!(read.chunk_index, 1);
        assert_eq!(read.prefix_digest, "a1b2");
        assert_eq!(store.list_checkpoints().await.unwrap().len(), 1);

        assert!(store.clear_checkpoint("bacteria", "bact-2023").await.unwrap());
        assert!(!store.clear_checkpoint("bacteria", "bact-2023").await.unwrap());
    }
}

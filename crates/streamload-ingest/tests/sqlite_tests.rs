//! End-to-end run against the SQLite target store and quarantine sink

mod common;

use std::path::Path;
use std::sync::Arc;

use common::{bacteria, boxed, sites};
use streamload_ingest::quarantine::{QuarantineFilter, QuarantineSink, SqliteQuarantineSink};
use streamload_ingest::store::{SqliteTargetStore, TargetStore};
use streamload_ingest::types::{BusinessKey, ReasonCode};
use streamload_ingest::Pipeline;

/// Make every insert of `key` abort, from a connection of its own.
fn reject_key(db: &Path, key: &str) {
    let conn = rusqlite::Connection::open(db).unwrap();
    conn.execute_batch(&format!(
        "CREATE TRIGGER reject_{key} BEFORE INSERT ON entity_records \
         WHEN NEW.business_key = '{key}' \
         BEGIN SELECT RAISE(ABORT, 'rejected by test trigger'); END;"
    ))
    .unwrap();
}

#[tokio::test]
async fn test_failed_chunk_rolls_back_in_sqlite() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("target.db");

    let store = Arc::new(
        SqliteTargetStore::connect(&format!("sqlite://{}", target.display()), 1)
            .await
            .unwrap(),
    );
    let sink = Arc::new(SqliteQuarantineSink::open(dir.path().join("quarantine.db")).unwrap());
    reject_key(&target, "PR3");

    let pipeline = Pipeline::builder(common::config())
        .store(store.clone())
        .quarantine(sink.clone())
        .build()
        .await
        .unwrap();

    // chunk_size is 2: [PR1, PR2a] commits, [PR3, PR4] fails on PR3
    let site_rows = sites(
        "sites",
        &[
            ("PR1", "Pine Run", "yes"),
            ("PR2A", "Pine Run East", "yes"),
            ("PR3", "Spring Creek", "no"),
            ("PR4", "Spring Creek", "yes"),
        ],
    );
    let readings = bacteria("bact", &[("PR1", "2023-06-01", "12"), ("PR2a", "2023-06-02", "8")]);

    let run = pipeline.run(boxed(vec![site_rows, readings])).await.unwrap();
    assert_eq!(run.exit_code(), 0);

    let load = run.load("site", "sites").unwrap();
    assert_eq!(load.chunks_committed, 1);
    assert_eq!(load.chunks_failed, 1);
    assert_eq!(load.committed, 2);
    assert_eq!(load.quarantined_for(ReasonCode::ChunkCommitFailure), 2);

    // PR4 was written in the same transaction as PR3
    assert_eq!(store.record_count("site").await.unwrap(), 2);
    for key in ["PR3", "PR4"] {
        assert!(store.fetch("site", &BusinessKey::new(key)).await.unwrap().is_none());
    }
    let pr1 = store.fetch("site", &BusinessKey::new("PR1")).await.unwrap().unwrap();
    assert_eq!(pr1.payload["stream_name"], "Pine Run");
    assert_eq!(pr1.source_id, "sites");

    let failed = sink
        .list(&QuarantineFilter::new().reason(ReasonCode::ChunkCommitFailure))
        .await
        .unwrap();
    assert_eq!(failed.len(), 2);
    assert!(failed.iter().all(|e| e.entity == "site"));

    // Readings of committed sites load on the next level
    assert_eq!(run.load("bacteria", "bact").unwrap().committed, 2);
    assert_eq!(store.record_count("bacteria").await.unwrap(), 2);
}

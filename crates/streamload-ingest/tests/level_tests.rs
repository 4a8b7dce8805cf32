//! Pipeline runs over two independent entity types
//!
//! `site` and `volunteer` share no foreign key, so both sit in the first
//! dependency level and load side by side.

mod common;

use std::time::Duration;

use common::{boxed, sites, text, Harness};
use streamload_ingest::loader::LoadState;
use streamload_ingest::source::MemorySource;
use streamload_ingest::store::TargetStore;
use streamload_ingest::types::{BusinessKey, QualityClass, RawValue};
use streamload_ingest::PipelineConfig;

const VOLUNTEERS: &str = r#"
[load]
chunk_size = 5
max_chunk_retries = 0
retry_backoff_ms = 1

[[entities]]
name = "site"
key = [{ field = "site_code" }]

[[entities.fields]]
name = "site_code"
required = true
criticality = "critical"

[[entities.fields]]
name = "stream_name"

[[entities.fields]]
name = "active"
kind = "boolean"

[[entities]]
name = "volunteer"
key = [{ field = "volunteer_id" }]

[[entities.fields]]
name = "volunteer_id"
required = true
criticality = "critical"

[[entities.fields]]
name = "name"
required = true

[[entities.fields]]
name = "email"
required = true

[[entities.fields]]
name = "phone"
required = true

[[mappings]]
entity = "site"
revision = 1
columns = { "Site Code" = "site_code", "Stream" = "stream_name", "Active" = "active" }

[[mappings]]
entity = "volunteer"
revision = 1
columns = { "Volunteer ID" = "volunteer_id", "Name" = "name", "Email" = "email", "Phone" = "phone" }
"#;

async fn harness() -> Harness {
    let config = PipelineConfig::from_toml_str(VOLUNTEERS).unwrap();
    Harness::with_config(config).await
}

fn volunteers(source_id: &str, rows: Vec<Vec<RawValue>>) -> MemorySource {
    let mut source =
        MemorySource::new(source_id, "volunteer", &["Volunteer ID", "Name", "Email", "Phone"]);
    for row in rows {
        source.push_row(row);
    }
    source
}

#[tokio::test(start_paused = true)]
async fn test_same_level_entities_load_concurrently() {
    let h = harness().await;
    assert_eq!(h.pipeline.catalog().levels().len(), 1);
    h.store.set_upsert_delay(Duration::from_millis(100)).await;

    let site_rows = sites("sites", &[("PR1", "Pine Run", "yes"), ("SC4", "Spring Creek", "no")]);
    let roster = volunteers(
        "roster",
        vec![vec![text("V1"), text("Ada Moss"), text("ada@example.org"), text("555-0101")]],
    );

    let started = tokio::time::Instant::now();
    let run = h.pipeline.run(boxed(vec![site_rows, roster])).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(run.exit_code(), 0);
    assert_eq!(h.store.upsert_calls().await, 2);
    // One delayed chunk per entity; one after the other would take 200ms
    assert!(elapsed >= Duration::from_millis(100), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(200), "elapsed {elapsed:?}");

    let sites_load = run.load("site", "sites").unwrap();
    assert_eq!(sites_load.committed, 2);
    assert_eq!(sites_load.state, LoadState::Done);
    let roster_load = run.load("volunteer", "roster").unwrap();
    assert_eq!(roster_load.committed, 1);
    assert_eq!(roster_load.state, LoadState::Done);
}

#[tokio::test]
async fn test_sparse_row_loads_as_high_missing() {
    let h = harness().await;
    let roster = volunteers(
        "roster",
        vec![
            vec![text("V1"), text("Ada Moss"), text("ada@example.org"), text("555-0101")],
            vec![text("V2"), RawValue::Empty, RawValue::Empty, RawValue::Empty],
            vec![text("V3"), text("Cal Reyes"), RawValue::Empty, text("555-0103")],
        ],
    );

    let run = h.pipeline.run(boxed(vec![roster])).await.unwrap();
    assert_eq!(run.exit_code(), 0);

    let load = run.load("volunteer", "roster").unwrap();
    assert_eq!(load.quality.get(&QualityClass::HighMissing).copied(), Some(1));
    assert_eq!(load.quality.get(&QualityClass::Clean).copied(), Some(2));
    // Sparse records are flagged, not rejected
    assert_eq!(load.total_quarantined(), 0);
    assert_eq!(load.committed, 3);

    let sparse = h
        .store
        .fetch("volunteer", &BusinessKey::new("V2"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sparse.quality, QualityClass::HighMissing);
    assert!(sparse.payload["email"].is_null());

    // One missing field of four stays under the threshold
    let partial = h
        .store
        .fetch("volunteer", &BusinessKey::new("V3"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(partial.quality, QualityClass::Clean);
}

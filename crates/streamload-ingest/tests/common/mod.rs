//! Shared fixtures for pipeline integration tests
//!
//! Every test builds its pipeline over [`MemoryTargetStore`] and
//! [`MemoryQuarantineSink`] so runs can be inspected and repeated without
//! touching disk.

#![allow(dead_code)]

use std::sync::Arc;
use streamload_ingest::quarantine::MemoryQuarantineSink;
use streamload_ingest::source::{MemorySource, RecordSource};
use streamload_ingest::store::MemoryTargetStore;
use streamload_ingest::types::RawValue;
use streamload_ingest::{Pipeline, PipelineConfig};

/// Two entity types: `site`, and `bacteria` readings referencing a site.
pub const STREAMWATCH: &str = r#"
[load]
chunk_size = 2
max_chunk_retries = 0
retry_backoff_ms = 1

[aliases.site_codes]
PR2A = "PR2a"

[[entities]]
name = "site"
key = [{ field = "site_code", normalize = { alias = "site_codes" } }]

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
name = "bacteria"
key = [
    { field = "site_code", normalize = { alias = "site_codes" } },
    { field = "sampled_on" },
]
foreign_keys = [{ fields = ["site_code"], references = "site" }]

[[entities.fields]]
name = "site_code"
required = true
criticality = "critical"

[[entities.fields]]
name = "sampled_on"
kind = "date"
required = true
criticality = "critical"

[[entities.fields]]
name = "ecoli_cfu"
kind = "float"
min = 0.0
max = 50.0

[[entities.fields]]
name = "unit"
default = "CFU/100mL"

[[mappings]]
entity = "site"
revision = 1
columns = { "Site Code" = "site_code", "Stream" = "stream_name", "Active" = "active" }

[[mappings]]
entity = "bacteria"
revision = 1
columns = { "Site" = "site_code", "Date" = "sampled_on", "E. coli" = "ecoli_cfu" }
"#;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,streamload_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn config() -> PipelineConfig {
    PipelineConfig::from_toml_str(STREAMWATCH).expect("fixture config parses")
}

/// Pipeline plus handles on its in-memory collaborators
pub struct Harness {
    pub pipeline: Pipeline,
    pub store: Arc<MemoryTargetStore>,
    pub sink: Arc<MemoryQuarantineSink>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(config()).await
    }

    pub async fn with_config(config: PipelineConfig) -> Self {
        init_tracing();
        let store = Arc::new(MemoryTargetStore::new());
        let sink = Arc::new(MemoryQuarantineSink::new());
        let pipeline = Pipeline::builder(config)
            .store(store.clone())
            .quarantine(sink.clone())
            .build()
            .await
            .expect("pipeline builds");
        Self {
            pipeline,
            store,
            sink,
        }
    }
}

pub fn text(s: &str) -> RawValue {
    RawValue::from(s)
}

pub fn sites(source_id: &str, rows: &[(&str, &str, &str)]) -> MemorySource {
    let mut source = MemorySource::new(source_id, "site", &["Site Code", "Stream", "Active"]);
    for (code, stream, active) in rows {
        source.push_row(vec![text(code), text(stream), text(active)]);
    }
    source
}

pub fn bacteria(source_id: &str, rows: &[(&str, &str, &str)]) -> MemorySource {
    let mut source = MemorySource::new(source_id, "bacteria", &["Site", "Date", "E. coli"]);
    for (site, date, ecoli) in rows {
        source.push_row(vec![text(site), text(date), text(ecoli)]);
    }
    source
}

pub fn boxed(sources: Vec<MemorySource>) -> Vec<Box<dyn RecordSource>> {
    sources
        .into_iter()
        .map(|s| Box::new(s) as Box<dyn RecordSource>)
        .collect()
}

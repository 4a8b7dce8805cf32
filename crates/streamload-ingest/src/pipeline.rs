//! Run orchestration
//!
//! Entity types load level by level along the dependency graph; the
//! entity types of one level load concurrently. Within one entity type the
//! stages run in order: read, map, coerce, key, merge, integrity, load.
//! A fatal error in one level stops every later level from being scheduled.

use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::catalog::{Catalog, EntitySchema};
use crate::config::PipelineConfig;
use crate::error::{IngestError, Result};
use crate::integrity::{Check, IntegrityResolver, RunRegistry};
use crate::keys::{DedupEntry, Deduplicator, KeyResolver, Resolution};
use crate::loader::ChunkedLoader;
use crate::mapping::{Mapped, MappingRegistry, SchemaMapper};
use crate::quality::QualityEngine;
use crate::quarantine::{record_or_warn, QuarantineSink, SqliteQuarantineSink};
use crate::report::{LoadReport, RunReport};
use crate::source::{self, RecordSource};
use crate::store::{SqliteTargetStore, TargetStore};
use crate::types::{
    CanonicalRecord, KeyedRecord, QualityClass, QuarantineEntry, QuarantinePayload, ReasonCode,
    Stage,
};

pub struct PipelineBuilder {
    config: PipelineConfig,
    store: Option<Arc<dyn TargetStore>>,
    quarantine: Option<Arc<dyn QuarantineSink>>,
    cancel: Option<CancellationToken>,
}

impl PipelineBuilder {
    pub fn store(mut self, store: Arc<dyn TargetStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn quarantine(mut self, sink: Arc<dyn QuarantineSink>) -> Self {
        self.quarantine = Some(sink);
        self
    }

    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Validate the configuration and connect whatever collaborators were
    /// not supplied, using the `[store]` and `[quarantine]` sections.
    pub async fn build(self) -> Result<Pipeline> {
        let config = self.config;
        config.validate()?;

        let catalog = Arc::new(config.catalog()?);
        let mappings = Arc::new(MappingRegistry::new(&config.mappings)?);
        let quality = Arc::new(QualityEngine::new(&config.coercion, &config.quality));
        let keys = Arc::new(KeyResolver::new(&config.aliases));

        let store: Arc<dyn TargetStore> = match self.store {
            Some(store) => store,
            None => Arc::new(
                SqliteTargetStore::connect(&config.store.database_url, config.store.max_connections)
                    .await?,
            ),
        };
        let quarantine: Arc<dyn QuarantineSink> = match self.quarantine {
            Some(sink) => sink,
            None => Arc::new(SqliteQuarantineSink::open(&config.quarantine.path)?),
        };

        Ok(Pipeline {
            config: Arc::new(config),
            catalog,
            mappings,
            quality,
            keys,
            store,
            quarantine,
            cancel: self.cancel.unwrap_or_default(),
        })
    }
}

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    catalog: Arc<Catalog>,
    mappings: Arc<MappingRegistry>,
    quality: Arc<QualityEngine>,
    keys: Arc<KeyResolver>,
    store: Arc<dyn TargetStore>,
    quarantine: Arc<dyn QuarantineSink>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder {
            config,
            store: None,
            quarantine: None,
            cancel: None,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Token that stops the run at the next chunk boundary when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run over the sources declared in the configuration
    pub async fn run_configured(&self) -> Result<RunReport> {
        let sources = self
            .config
            .sources
            .iter()
            .map(source::from_config)
            .collect::<Result<Vec<_>>>()?;
        self.run(sources).await
    }

    /// Run over `sources`.
    ///
    /// Only problems with the inputs themselves (a source for an unknown
    /// entity type) return `Err`; everything that happens during the run is
    /// in the report.
    pub async fn run(&self, sources: Vec<Box<dyn RecordSource>>) -> Result<RunReport> {
        let mut by_entity: HashMap<String, Vec<Box<dyn RecordSource>>> = HashMap::new();
        for source in sources {
            self.catalog.require(source.entity())?;
            by_entity
                .entry(source.entity().to_string())
                .or_default()
                .push(source);
        }

        let mut run = RunReport::new();
        let registry = RunRegistry::new();
        let mut halted = false;
        info!(run_id = %run.run_id, entities = by_entity.len(), "Starting pipeline run");

        for level in self.catalog.levels() {
            let scheduled: Vec<(String, Vec<Box<dyn RecordSource>>)> = level
                .iter()
                .filter_map(|entity| by_entity.remove(entity).map(|s| (entity.clone(), s)))
                .collect();
            if scheduled.is_empty() {
                continue;
            }

            if halted || self.cancel.is_cancelled() {
                for (entity, _) in scheduled {
                    warn!(entity = %entity, "Entity not loaded: an earlier level failed or the run was cancelled");
                    run.skipped_entities.push(entity);
                }
                continue;
            }

            let loads = join_all(scheduled.into_iter().map(|(entity, sources)| {
                let span = info_span!("entity_load", entity = %entity, sources = sources.len());
                self.load_entity(entity, sources, &registry).instrument(span)
            }))
            .await;

            for report in loads.into_iter().flatten() {
                if report.fatal {
                    halted = true;
                }
                run.loads.push(report);
            }
        }

        run.cancelled = self.cancel.is_cancelled();
        run.finish();
        info!(
            run_id = %run.run_id,
            committed = run.committed(),
            quarantined = run.quarantined(),
            fatal = run.has_fatal(),
            "Pipeline run finished"
        );
        Ok(run)
    }

    async fn load_entity(
        &self,
        entity: String,
        sources: Vec<Box<dyn RecordSource>>,
        registry: &RunRegistry,
    ) -> Vec<LoadReport> {
        let mut reports: Vec<LoadReport> = sources
            .iter()
            .map(|s| LoadReport::new(entity.as_str(), s.source_id()))
            .collect();
        let schema = match self.catalog.require(&entity) {
            Ok(schema) => schema,
            Err(e) => {
                for report in &mut reports {
                    report.fail(&e);
                }
                return reports;
            },
        };

        let mut dedup = Deduplicator::new();
        for (index, mut source) in sources.into_iter().enumerate() {
            self.ingest_source(schema, source.as_mut(), &mut dedup, &mut reports[index])
                .await;
        }

        let streams = self.partition(schema, dedup.finish(), &mut reports);

        if self.cancel.is_cancelled() {
            fail_open(&mut reports, &IngestError::Cancelled);
            return reports;
        }

        let integrity = IntegrityResolver::new(self.catalog.clone(), self.keys.clone(), registry.clone());
        let parents = match integrity.parent_keys(&entity, self.store.as_ref()).await {
            Ok(parents) => parents,
            Err(e) => {
                error!(entity = %entity, error = %e, "Failed to read parent keys");
                fail_open(&mut reports, &e);
                return reports;
            },
        };

        for (report, stream) in reports.iter_mut().zip(streams) {
            if report.error.is_some() {
                continue;
            }

            let mut accepted = Vec::with_capacity(stream.len());
            for entry in stream {
                match integrity.check(entry.record, schema, &parents) {
                    Check::Accepted(record) if record.quality == QualityClass::Invalid => {
                        let entry = invalid_record(schema, record);
                        self.reject(entry, report).await;
                    },
                    Check::Accepted(record) => accepted.push(KeyedRecord {
                        key: entry.key,
                        record,
                    }),
                    Check::Quarantined(entry) => self.reject(entry, report).await,
                }
            }

            report.accepted = accepted.len() as u64;
            registry.accept(&entity, accepted.iter().map(|r| &r.key));

            let mut loader = ChunkedLoader::new(
                self.store.clone(),
                self.quarantine.clone(),
                registry.clone(),
                self.config.load.clone(),
            )
            .with_cancellation(self.cancel.clone());
            let source_id = report.source_id.clone();
            if let Err(e) = loader.load(&entity, &source_id, accepted, report).await {
                error!(entity = %entity, source = %source_id, error = %e, "Load aborted");
            }
        }

        for report in &reports {
            info!(
                entity = %report.entity,
                source = %report.source_id,
                read = report.read,
                committed = report.committed,
                quarantined = report.total_quarantined(),
                state = %report.state,
                "Source load finished"
            );
        }
        reports
    }

    /// Read, map, coerce and key every row of one source into `dedup`.
    ///
    /// Rows are only offered once the whole source has been read.
    async fn ingest_source(
        &self,
        schema: &EntitySchema,
        reader: &mut dyn RecordSource,
        dedup: &mut Deduplicator,
        report: &mut LoadReport,
    ) {
        if self.cancel.is_cancelled() {
            report.fail(&IngestError::Cancelled);
            return;
        }
        let mapping = match self.mappings.resolve(&schema.name, reader.mapping_revision()) {
            Ok(mapping) => mapping,
            Err(e) => {
                error!(source = %report.source_id, error = %e, "No usable field mapping");
                report.fail(&e);
                return;
            },
        };

        let records = match source::read_all(reader).await {
            Ok(records) => records,
            Err(e) => {
                error!(source = %report.source_id, error = %e, "Source read failed");
                report.fail(&e);
                return;
            },
        };
        report.read = records.len() as u64;
        info!(source = %report.source_id, rows = records.len(), revision = mapping.revision, "Source read");

        let mapper = SchemaMapper::new(mapping);
        for raw in records {
            let untyped = match mapper.map(&raw) {
                Mapped::Blank => {
                    let entry = QuarantineEntry::new(
                        schema.name.clone(),
                        ReasonCode::BlankRow,
                        Stage::Mapping,
                        QuarantinePayload::Raw(raw),
                    );
                    self.reject(entry, report).await;
                    continue;
                },
                Mapped::Record(untyped) => untyped,
            };
            report.mapped += 1;

            let canonical = self.quality.coerce(untyped, schema);
            report.count_quality(canonical.quality);

            match self.keys.resolve(canonical, schema) {
                Resolution::Keyed(key, record) => {
                    if dedup.offer(key, record) {
                        report.duplicates_merged += 1;
                    }
                },
                Resolution::Quarantined(entry) => self.reject(entry, report).await,
            }
        }
    }

    /// Split merged entries into per-source streams, in first-seen order.
    ///
    /// A merged record belongs to the source of its latest contributor and
    /// is re-classified now that its fields are combined.
    fn partition(
        &self,
        schema: &EntitySchema,
        entries: Vec<DedupEntry>,
        reports: &mut Vec<LoadReport>,
    ) -> Vec<Vec<DedupEntry>> {
        let mut index: BTreeMap<String, usize> = reports
            .iter()
            .enumerate()
            .map(|(i, r)| (r.source_id.clone(), i))
            .collect();
        let mut streams: Vec<Vec<DedupEntry>> = vec![Vec::new(); reports.len()];

        for mut entry in entries {
            if entry.contributors > 1 {
                self.quality.reassess(&mut entry.record, schema);
            }
            let source_id = entry.record.provenance.source_id.clone();
            let slot = *index.entry(source_id.clone()).or_insert_with(|| {
                reports.push(LoadReport::new(schema.name.as_str(), source_id));
                streams.push(Vec::new());
                reports.len() - 1
            });
            streams[slot].push(entry);
        }
        streams
    }

    async fn reject(&self, entry: QuarantineEntry, report: &mut LoadReport) {
        report.count_quarantined(entry.reason);
        if !record_or_warn(self.quarantine.as_ref(), entry).await {
            report.quarantine_write_failures += 1;
        }
    }
}

fn invalid_record(schema: &EntitySchema, record: CanonicalRecord) -> QuarantineEntry {
    let fields: Vec<String> = record
        .defects
        .iter()
        .filter(|d| d.critical)
        .map(|d| format!("{} ({:?} is not {})", d.field, d.raw, d.expected.as_str()))
        .collect();
    QuarantineEntry::new(
        schema.name.clone(),
        ReasonCode::InvalidRecord,
        Stage::Quality,
        QuarantinePayload::Canonical(record),
    )
    .with_detail(format!("critical fields could not be coerced: {}", fields.join(", ")))
}

/// Mark every load that has not already failed with `err`
fn fail_open(reports: &mut [LoadReport], err: &IngestError) {
    for report in reports.iter_mut().filter(|r| r.error.is_none()) {
        report.fail(err);
    }
}

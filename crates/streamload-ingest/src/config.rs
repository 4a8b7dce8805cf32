//! Pipeline configuration
//!
//! One [`PipelineConfig`] value is built at startup and handed to every
//! stage. It is read from a TOML file merged with `STREAMLOAD_`-prefixed
//! environment variables (`__` separates nesting levels, so
//! `STREAMLOAD_LOAD__CHUNK_SIZE=500` overrides `[load] chunk_size`).

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::catalog::{Catalog, EntitySchema, KeyNormalization};
use crate::error::{IngestError, Result};
use crate::mapping::MappingTable;
use crate::source::SourceConfig;
use crate::types::DetectionFlag;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Records per chunk transaction.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Extra attempts for a chunk before it is quarantined.
pub const DEFAULT_MAX_CHUNK_RETRIES: u32 = 2;

/// Base delay between chunk attempts, multiplied by the attempt number.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 250;

/// Fraction of required fields that may be null before a record is
/// `high_missing`.
pub const DEFAULT_MISSING_THRESHOLD: f64 = 0.5;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://streamwatch.db";

pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 4;

pub const DEFAULT_QUARANTINE_PATH: &str = "quarantine.db";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "STREAMLOAD_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    pub chunk_size: usize,
    pub max_chunk_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_chunk_retries: DEFAULT_MAX_CHUNK_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}

impl LoadConfig {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_max_chunk_retries(mut self, retries: u32) -> Self {
        self.max_chunk_retries = retries;
        self
    }

    pub fn with_retry_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.retry_backoff_ms = backoff_ms;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub missing_threshold: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            missing_threshold: DEFAULT_MISSING_THRESHOLD,
        }
    }
}

/// A text prefix marking a reading reported against a detection limit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionMarker {
    pub marker: String,
    pub flag: DetectionFlag,
}

impl DetectionMarker {
    pub fn new(marker: impl Into<String>, flag: DetectionFlag) -> Self {
        Self {
            marker: marker.into(),
            flag,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoercionConfig {
    /// chrono formats tried in order for date fields
    pub date_formats: Vec<String>,
    /// chrono formats tried in order for date-time fields
    pub datetime_formats: Vec<String>,
    pub truthy: Vec<String>,
    pub falsy: Vec<String>,
    pub detection_markers: Vec<DetectionMarker>,
    /// Read numeric date cells as spreadsheet serial day numbers
    pub excel_serial_dates: bool,
}

impl Default for CoercionConfig {
    fn default() -> Self {
        fn strings(items: &[&str]) -> Vec<String> {
            items.iter().map(|s| s.to_string()).collect()
        }

        Self {
            // Two-digit years first: "%Y" would read "23" as year 23.
            date_formats: strings(&["%Y-%m-%d", "%m/%d/%y", "%m/%d/%Y", "%d-%b-%Y", "%Y/%m/%d"]),
            datetime_formats: strings(&[
                "%Y-%m-%d %H:%M:%S",
                "%Y-%m-%dT%H:%M:%S",
                "%Y-%m-%d %H:%M",
                "%m/%d/%y %H:%M",
                "%m/%d/%Y %H:%M",
                "%m/%d/%Y %I:%M %p",
            ]),
            truthy: strings(&["true", "1", "yes", "y", "active"]),
            falsy: strings(&["false", "0", "no", "n", "inactive"]),
            detection_markers: vec![
                DetectionMarker::new(">", DetectionFlag::AboveLimit),
                DetectionMarker::new("<", DetectionFlag::BelowLimit),
            ],
            excel_serial_dates: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuarantineConfig {
    pub path: PathBuf,
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_QUARANTINE_PATH),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub load: LoadConfig,
    pub quality: QualityConfig,
    pub coercion: CoercionConfig,
    pub store: StoreConfig,
    pub quarantine: QuarantineConfig,
    /// Alias tables by name: legacy code -> canonical code
    pub aliases: BTreeMap<String, BTreeMap<String, String>>,
    pub entities: Vec<EntitySchema>,
    pub mappings: Vec<MappingTable>,
    pub sources: Vec<SourceConfig>,
}

impl PipelineConfig {
    /// Load `path`, apply `.env` and environment overrides, then validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        dotenvy::dotenv().ok();
        let path = path.as_ref();
        if !path.exists() {
            return Err(IngestError::config(format!(
                "configuration file {} does not exist",
                path.display()
            )));
        }

        let config: PipelineConfig = Figment::from(Serialized::defaults(PipelineConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without consulting the environment.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: PipelineConfig = Figment::from(Serialized::defaults(PipelineConfig::default()))
            .merge(Toml::string(toml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Build the entity catalog, validating the dependency graph on the way.
    pub fn catalog(&self) -> Result<Catalog> {
        Catalog::new(self.entities.clone())
    }

    pub fn validate(&self) -> Result<()> {
        if self.load.chunk_size == 0 {
            return Err(IngestError::config("load.chunk_size must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.quality.missing_threshold) {
            return Err(IngestError::config(format!(
                "quality.missing_threshold must lie within 0..=1, got {}",
                self.quality.missing_threshold
            )));
        }
        if self.store.database_url.is_empty() {
            return Err(IngestError::config("store.database_url cannot be empty"));
        }
        if self.store.max_connections == 0 {
            return Err(IngestError::config("store.max_connections must be greater than 0"));
        }
        if self.coercion.detection_markers.iter().any(|m| m.marker.trim().is_empty()) {
            return Err(IngestError::config("coercion.detection_markers cannot be blank"));
        }
        let truthy: HashSet<String> =
            self.coercion.truthy.iter().map(|t| t.trim().to_lowercase()).collect();
        if let Some(both) = self
            .coercion
            .falsy
            .iter()
            .find(|f| truthy.contains(&f.trim().to_lowercase()))
        {
            return Err(IngestError::config(format!(
                "boolean token '{}' is both truthy and falsy",
                both
            )));
        }

        let catalog = self.catalog()?;

        for schema in catalog.entities() {
            for part in &schema.key {
                if let KeyNormalization::Alias(table) = &part.normalize {
                    if !self.aliases.contains_key(table) {
                        return Err(IngestError::config(format!(
                            "key of '{}' uses undefined alias table '{}'",
                            schema.name, table
                        )));
                    }
                }
            }
        }

        for mapping in &self.mappings {
            catalog.require(&mapping.entity)?;
            for position in mapping.positions.keys() {
                position.parse::<usize>().map_err(|_| {
                    IngestError::config(format!(
                        "mapping for '{}' revision {} has non-numeric position '{}'",
                        mapping.entity, mapping.revision, position
                    ))
                })?;
            }
        }

        let mut ids = HashSet::new();
        for source in &self.sources {
            if !ids.insert(source.id.as_str()) {
                return Err(IngestError::config(format!(
                    "source id '{}' is declared twice",
                    source.id
                )));
            }
            catalog.require(&source.entity)?;
            if source.paths.is_empty() {
                return Err(IngestError::config(format!(
                    "source '{}' lists no paths",
                    source.id
                )));
            }
            if let Some(pattern) = &source.sheet_pattern {
                Regex::new(pattern).map_err(|e| {
                    IngestError::config(format!(
                        "source '{}' has an invalid sheet_pattern: {}",
                        source.id, e
                    ))
                })?;
            }
        }

        Ok(())
    }
}

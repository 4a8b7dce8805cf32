//! Schema mapping: raw column names to canonical field names
//!
//! Lookup is by normalized header text. Headers that carry no information
//! (blank cells, spreadsheet `Unnamed: 3` placeholders) and names missing
//! from the table fall back to the column's position when the table knows
//! that position. Anything still unmatched is kept as `extra_<position>`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use crate::error::{IngestError, Result};
use crate::types::{RawRecord, UntypedRecord};

/// Prefix of synthetic names for columns the mapping does not know
pub const EXTRA_FIELD_PREFIX: &str = "extra_";

/// Character substitutions applied before normalization, so unit suffixes
/// survive the alphanumeric filter ("Temp (°C)" -> "temp_degc").
const SUBSTITUTIONS: &[(&str, &str)] = &[
    ("%", "pct"),
    ("°", "deg"),
    ("µ", "u"),
    ("μ", "u"),
    ("/", "_per_"),
    ("-", "_"),
    ("&", "and"),
    ("+", "plus"),
];

fn is_placeholder_header(header: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)^unnamed:?\s*\d+$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(header))
}

/// Normalize a header into its comparison key.
///
/// Applies the unit substitutions, trims, collapses whitespace runs into a
/// single underscore, drops characters outside `[A-Za-z0-9_]`, squeezes
/// repeated underscores and lower-cases the result.
pub fn normalize_field_name(raw: &str) -> String {
    let mut name = raw.trim().to_string();
    for (from, to) in SUBSTITUTIONS {
        name = name.replace(from, to);
    }

    let collapsed = name.split_whitespace().collect::<Vec<_>>().join("_");
    let filtered: String = collapsed
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();

    let mut out = String::with_capacity(filtered.len());
    for c in filtered.chars() {
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c.to_ascii_lowercase());
    }
    out.trim_matches('_').to_string()
}

/// Whether a header says nothing about its column
pub fn is_uninformative(raw: &str) -> bool {
    let trimmed = raw.trim();
    trimmed.is_empty()
        || is_placeholder_header(trimmed)
        || normalize_field_name(trimmed).is_empty()
}

/// Mapping table as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingTable {
    pub entity: String,
    #[serde(default = "default_revision")]
    pub revision: u32,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Raw header -> canonical field
    #[serde(default)]
    pub columns: BTreeMap<String, String>,
    /// Zero-based column position (as text) -> canonical field
    #[serde(default)]
    pub positions: BTreeMap<String, String>,
}

fn default_revision() -> u32 {
    1
}

fn default_active() -> bool {
    true
}

impl MappingTable {
    pub fn new(entity: impl Into<String>, revision: u32) -> Self {
        Self {
            entity: entity.into(),
            revision,
            active: true,
            columns: BTreeMap::new(),
            positions: BTreeMap::new(),
        }
    }

    pub fn column(mut self, raw: impl Into<String>, canonical: impl Into<String>) -> Self {
        self.columns.insert(raw.into(), canonical.into());
        self
    }

    pub fn position(mut self, position: usize, canonical: impl Into<String>) -> Self {
        self.positions.insert(position.to_string(), canonical.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

/// Compiled mapping for one entity revision
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMapping {
    pub entity: String,
    pub revision: u32,
    pub active: bool,
    columns: HashMap<String, String>,
    positions: HashMap<usize, String>,
}

impl FieldMapping {
    pub fn compile(table: &MappingTable) -> Result<Self> {
        let columns = table
            .columns
            .iter()
            .map(|(raw, canonical)| (normalize_field_name(raw), canonical.clone()))
            .collect();

        let mut positions = HashMap::new();
        for (position, canonical) in &table.positions {
            let index = position.trim().parse::<usize>().map_err(|_| {
                IngestError::config(format!(
                    "mapping for '{}' has non-numeric position '{}'",
                    table.entity, position
                ))
            })?;
            positions.insert(index, canonical.clone());
        }

        Ok(Self {
            entity: table.entity.clone(),
            revision: table.revision,
            active: table.active,
            columns,
            positions,
        })
    }

    /// Canonical target for a column, if the table knows it
    pub fn lookup(&self, raw_name: &str, position: usize) -> Option<&str> {
        let by_name = if is_uninformative(raw_name) {
            None
        } else {
            self.columns.get(&normalize_field_name(raw_name))
        };
        by_name
            .or_else(|| self.positions.get(&position))
            .map(String::as_str)
    }
}

/// All mapping revisions, by entity
#[derive(Debug, Clone, Default)]
pub struct MappingRegistry {
    tables: HashMap<String, Vec<FieldMapping>>,
}

impl MappingRegistry {
    pub fn new(tables: &[MappingTable]) -> Result<Self> {
        let mut registry = Self::default();
        for table in tables {
            registry.register(FieldMapping::compile(table)?);
        }
        Ok(registry)
    }

    pub fn register(&mut self, mapping: FieldMapping) {
        let revisions = self.tables.entry(mapping.entity.clone()).or_default();
        revisions.retain(|m| m.revision != mapping.revision);
        revisions.push(mapping);
        revisions.sort_by_key(|m| m.revision);
    }

    /// Mapping to use for `entity`.
    ///
    /// A pinned revision is used whether or not it is flagged active;
    /// otherwise the highest active revision wins.
    pub fn resolve(&self, entity: &str, pinned: Option<u32>) -> Result<&FieldMapping> {
        let revisions = self
            .tables
            .get(entity)
            .ok_or_else(|| IngestError::mapping_failure(entity, "no mapping table is configured"))?;

        match pinned {
            Some(revision) => revisions
                .iter()
                .find(|m| m.revision == revision)
                .ok_or_else(|| {
                    IngestError::mapping_failure(
                        entity,
                        format!("pinned revision {} does not exist", revision),
                    )
                }),
            None => revisions
                .iter()
                .rev()
                .find(|m| m.active)
                .ok_or_else(|| IngestError::mapping_failure(entity, "no revision is active")),
        }
    }
}

/// Result of mapping one raw row
#[derive(Debug, Clone, PartialEq)]
pub enum Mapped {
    Record(UntypedRecord),
    /// Every value in the row was empty
    Blank,
}

/// Applies a [`FieldMapping`] to raw rows
pub struct SchemaMapper<'a> {
    mapping: &'a FieldMapping,
}

impl<'a> SchemaMapper<'a> {
    pub fn new(mapping: &'a FieldMapping) -> Self {
        Self { mapping }
    }

    /// Map every raw field to a canonical or synthetic name.
    ///
    /// When two columns land on the same canonical field, the first keeps
    /// it and later ones become `extra_<position>`.
    pub fn map(&self, raw: &RawRecord) -> Mapped {
        if raw.is_blank() {
            return Mapped::Blank;
        }

        let mut fields = BTreeMap::new();
        for field in &raw.fields {
            let target = match self.mapping.lookup(&field.name, field.position) {
                Some(canonical) if !fields.contains_key(canonical) => canonical.to_string(),
                _ => format!("{}{}", EXTRA_FIELD_PREFIX, field.position),
            };
            fields.insert(target, field.value.clone());
        }

        Mapped::Record(UntypedRecord {
            entity: self.mapping.entity.clone(),
            provenance: raw.provenance.clone(),
            fields,
        })
    }
}

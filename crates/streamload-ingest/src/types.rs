//! Core record types shared by every pipeline stage

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::catalog::FieldKind;

/// Where a raw row came from.
///
/// `ordinal` counts rows yielded by one source, starting at 0, across all of
/// its files and sheets. It is the load order of the source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provenance {
    pub source_id: String,
    pub file_id: String,
    pub sheet_id: String,
    pub row_index: u64,
    pub ordinal: u64,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}#{}[{}]",
            self.source_id, self.file_id, self.sheet_id, self.row_index
        )
    }
}

/// Scalar as it was found in the source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RawValue {
    Text(String),
    Number(f64),
    Empty,
}

impl RawValue {
    /// Empty cells and whitespace-only text
    pub fn is_empty(&self) -> bool {
        match self {
            RawValue::Empty => true,
            RawValue::Text(s) => s.trim().is_empty(),
            RawValue::Number(_) => false,
        }
    }

    /// Text rendering used when a value has to be read as a token
    pub fn as_text(&self) -> Option<String> {
        match self {
            RawValue::Text(s) => Some(s.clone()),
            RawValue::Number(n) => Some(format_number(*n)),
            RawValue::Empty => None,
        }
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        if s.is_empty() {
            RawValue::Empty
        } else {
            RawValue::Text(s.to_string())
        }
    }
}

impl From<f64> for RawValue {
    fn from(n: f64) -> Self {
        RawValue::Number(n)
    }
}

/// Render a number without a trailing `.0` when it is integral.
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawField {
    /// Header text as found; may be empty or a placeholder
    pub name: String,
    /// Zero-based column position within the row
    pub position: usize,
    pub value: RawValue,
}

/// One source row. Never modified after the reader yields it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub provenance: Provenance,
    pub fields: Vec<RawField>,
}

impl RawRecord {
    pub fn is_blank(&self) -> bool {
        self.fields.iter().all(|f| f.value.is_empty())
    }
}

/// Mapper output: canonical names, values not yet coerced
#[derive(Debug, Clone, PartialEq)]
pub struct UntypedRecord {
    pub entity: String,
    pub provenance: Provenance,
    pub fields: BTreeMap<String, RawValue>,
}

/// Strongly-typed canonical value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Boolean(bool),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Plain JSON form written to the target store
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Date(d) => serde_json::Value::String(d.format("%Y-%m-%d").to_string()),
            Value::DateTime(dt) => {
                serde_json::Value::String(dt.format("%Y-%m-%dT%H:%M:%S").to_string())
            },
            Value::Boolean(b) => serde_json::Value::Bool(*b),
        }
    }

    /// Text used when the value takes part in a business key
    pub fn key_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Text(s) => Some(s.clone()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Float(f) => Some(format_number(*f)),
            Value::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            Value::DateTime(dt) => Some(dt.format("%Y-%m-%dT%H:%M:%S").to_string()),
            Value::Boolean(b) => Some(b.to_string()),
        }
    }
}

/// Coarse confidence tag. Ordered from best to worst; escalation only moves
/// towards `Invalid`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum QualityClass {
    #[default]
    Clean,
    HighMissing,
    PotentialOutlier,
    Invalid,
}

impl QualityClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityClass::Clean => "clean",
            QualityClass::HighMissing => "high_missing",
            QualityClass::PotentialOutlier => "potential_outlier",
            QualityClass::Invalid => "invalid",
        }
    }

    pub fn escalate(&mut self, to: QualityClass) {
        if to > *self {
            *self = to;
        }
    }
}

impl fmt::Display for QualityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QualityClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clean" => Ok(QualityClass::Clean),
            "high_missing" => Ok(QualityClass::HighMissing),
            "potential_outlier" => Ok(QualityClass::PotentialOutlier),
            "invalid" => Ok(QualityClass::Invalid),
            other => Err(format!("unknown quality class '{}'", other)),
        }
    }
}

/// Which side of a detection limit a reading was reported on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionFlag {
    AboveLimit,
    BelowLimit,
}

impl DetectionFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionFlag::AboveLimit => "above_limit",
            DetectionFlag::BelowLimit => "below_limit",
        }
    }
}

/// A field value that could not be coerced to its declared kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoercionDefect {
    pub field: String,
    pub raw: String,
    pub expected: FieldKind,
    pub critical: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub entity: String,
    pub fields: BTreeMap<String, Value>,
    pub quality: QualityClass,
    pub provenance: Provenance,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub defects: Vec<CoercionDefect>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flags: BTreeMap<String, DetectionFlag>,
}

impl CanonicalRecord {
    pub fn new(entity: impl Into<String>, provenance: Provenance) -> Self {
        Self {
            entity: entity.into(),
            fields: BTreeMap::new(),
            quality: QualityClass::Clean,
            provenance,
            defects: Vec::new(),
            flags: BTreeMap::new(),
        }
    }

    /// Field value; absent fields read as `Null`
    pub fn get(&self, field: &str) -> &Value {
        self.fields.get(field).unwrap_or(&Value::Null)
    }

    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    pub fn is_null(&self, field: &str) -> bool {
        self.get(field).is_null()
    }

    pub fn null_count(&self) -> usize {
        self.fields.values().filter(|v| v.is_null()).count()
    }

    /// JSON payload persisted for the record: fields plus detection flags
    pub fn payload(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (name, value) in &self.fields {
            map.insert(name.clone(), value.to_json());
        }
        if !self.flags.is_empty() {
            let flags: serde_json::Map<String, serde_json::Value> = self
                .flags
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.as_str().to_string())))
                .collect();
            map.insert("_flags".to_string(), serde_json::Value::Object(flags));
        }
        serde_json::Value::Object(map)
    }
}

/// Load-time identity of a record within its entity type
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusinessKey(String);

impl BusinessKey {
    pub const SEPARATOR: char = '|';

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn from_parts<S: AsRef<str>>(parts: &[S]) -> Self {
        let joined: Vec<&str> = parts.iter().map(|p| p.as_ref()).collect();
        Self(joined.join(&Self::SEPARATOR.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BusinessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A record paired with its business key, ready for the loader
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedRecord {
    pub key: BusinessKey,
    pub record: CanonicalRecord,
}

/// Why a record was quarantined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReasonCode {
    BlankRow,
    UnresolvableKey,
    OrphanedReference,
    InvalidRecord,
    ChunkCommitFailure,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::BlankRow => "blank-row",
            ReasonCode::UnresolvableKey => "unresolvable-key",
            ReasonCode::OrphanedReference => "orphaned-reference",
            ReasonCode::InvalidRecord => "invalid-record",
            ReasonCode::ChunkCommitFailure => "chunk-commit-failure",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReasonCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blank-row" => Ok(ReasonCode::BlankRow),
            "unresolvable-key" => Ok(ReasonCode::UnresolvableKey),
            "orphaned-reference" => Ok(ReasonCode::OrphanedReference),
            "invalid-record" => Ok(ReasonCode::InvalidRecord),
            "chunk-commit-failure" => Ok(ReasonCode::ChunkCommitFailure),
            other => Err(format!("unknown reason code '{}'", other)),
        }
    }
}

/// Pipeline stage that rejected a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Mapping,
    Quality,
    KeyResolution,
    Integrity,
    Loading,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Mapping => "mapping",
            Stage::Quality => "quality",
            Stage::KeyResolution => "key_resolution",
            Stage::Integrity => "integrity",
            Stage::Loading => "loading",
        }
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mapping" => Ok(Stage::Mapping),
            "quality" => Ok(Stage::Quality),
            "key_resolution" => Ok(Stage::KeyResolution),
            "integrity" => Ok(Stage::Integrity),
            "loading" => Ok(Stage::Loading),
            other => Err(format!("unknown stage '{}'", other)),
        }
    }
}

/// The rejected row, in the richest form available when it was rejected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum QuarantinePayload {
    Raw(RawRecord),
    Canonical(CanonicalRecord),
}

impl QuarantinePayload {
    pub fn provenance(&self) -> &Provenance {
        match self {
            QuarantinePayload::Raw(r) => &r.provenance,
            QuarantinePayload::Canonical(c) => &c.provenance,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    /// Assigned by the sink
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub entity: String,
    pub reason: ReasonCode,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub payload: QuarantinePayload,
    pub created_at: DateTime<Utc>,
}

impl QuarantineEntry {
    pub fn new(
        entity: impl Into<String>,
        reason: ReasonCode,
        stage: Stage,
        payload: QuarantinePayload,
    ) -> Self {
        Self {
            id: None,
            entity: entity.into(),
            reason,
            stage,
            detail: None,
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn provenance(&self) -> &Provenance {
        self.payload.provenance()
    }
}

/// Durable load progress for one (entity, source) pair.
///
/// `offset` counts records of the source's accepted stream covered by
/// committed chunks; `last_key` is the key of the record at `offset - 1`
/// and `prefix_digest` fingerprints the keys of the whole covered prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadCheckpoint {
    pub entity: String,
    pub source_id: String,
    pub offset: u64,
    pub last_key: BusinessKey,
    #[serde(default)]
    pub prefix_digest: String,
    pub chunk_index: u64,
    pub updated_at: DateTime<Utc>,
}

//! Type coercion and quality classification
//!
//! [`QualityEngine::coerce`] is pure: it turns a mapped record into a typed
//! [`CanonicalRecord`] and tags it with a [`QualityClass`]. Bad values never
//! drop the record. They null the field and leave a [`CoercionDefect`]
//! behind, which is what the classification looks at.

pub mod coerce;

use crate::catalog::{Criticality, EntitySchema};
use crate::config::{CoercionConfig, QualityConfig};
use crate::types::{CanonicalRecord, CoercionDefect, QualityClass, RawValue, UntypedRecord, Value};

pub use coerce::{Coerced, Coercer, CoercionFailure};

#[derive(Debug, Clone)]
pub struct QualityEngine {
    coercer: Coercer,
    missing_threshold: f64,
}

impl QualityEngine {
    pub fn new(coercion: &CoercionConfig, quality: &QualityConfig) -> Self {
        Self {
            coercer: Coercer::new(coercion),
            missing_threshold: quality.missing_threshold,
        }
    }

    /// Coerce every field and classify the result.
    pub fn coerce(&self, untyped: UntypedRecord, schema: &EntitySchema) -> CanonicalRecord {
        let UntypedRecord {
            entity,
            provenance,
            mut fields,
        } = untyped;
        let mut record = CanonicalRecord::new(entity, provenance);

        for spec in &schema.fields {
            let raw = fields.remove(&spec.name).unwrap_or(RawValue::Empty);
            match self.coercer.coerce(&raw, spec.kind, spec.casing) {
                Ok(coerced) => {
                    if let Some(flag) = coerced.flag {
                        record.flags.insert(spec.name.clone(), flag);
                    }
                    record.set(spec.name.clone(), coerced.value);
                },
                Err(failure) => {
                    record.defects.push(CoercionDefect {
                        field: spec.name.clone(),
                        raw: failure.raw,
                        expected: spec.kind,
                        critical: spec.criticality == Criticality::Critical
                            || schema.is_key_field(&spec.name),
                    });
                    record.set(spec.name.clone(), Value::Null);
                },
            }

            if record.is_null(&spec.name) {
                if let Some(default) = &spec.default {
                    let raw = RawValue::Text(default.clone());
                    if let Ok(coerced) = self.coercer.coerce(&raw, spec.kind, spec.casing) {
                        record.set(spec.name.clone(), coerced.value);
                    }
                }
            }
        }

        // Columns the schema does not declare, including extra_<n>
        for (name, raw) in fields {
            let value = self.coercer.passthrough(&raw);
            record.set(name, value);
        }

        record.quality = self.assess(&record, schema);
        record
    }

    /// Classify a record from its current values and outstanding defects.
    pub fn assess(&self, record: &CanonicalRecord, schema: &EntitySchema) -> QualityClass {
        let mut quality = QualityClass::Clean;

        let required: Vec<&str> = schema.required_fields().map(|f| f.name.as_str()).collect();
        if !required.is_empty() {
            let missing = required.iter().filter(|f| record.is_null(f)).count();
            if missing as f64 / required.len() as f64 > self.missing_threshold {
                quality.escalate(QualityClass::HighMissing);
            }
        }

        let outlier = schema.fields.iter().filter(|f| f.kind.is_numeric()).any(|spec| {
            record
                .get(&spec.name)
                .as_f64()
                .is_some_and(|v| spec.out_of_range(v))
        });
        if outlier {
            quality.escalate(QualityClass::PotentialOutlier);
        }

        if record
            .defects
            .iter()
            .any(|d| d.critical && record.is_null(&d.field))
        {
            quality.escalate(QualityClass::Invalid);
        }

        quality
    }

    /// Re-classify after a merge. Defects on fields that gained a value
    /// are dropped first.
    pub fn reassess(&self, record: &mut CanonicalRecord, schema: &EntitySchema) {
        let defects = std::mem::take(&mut record.defects);
        let outstanding: Vec<CoercionDefect> = defects
            .into_iter()
            .filter(|d| record.is_null(&d.field))
            .collect();
        record.defects = outstanding;
        record.quality = self.assess(record, schema);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::catalog::{Casing, FieldKind, FieldSpec, KeyPart};
    use crate::types::{DetectionFlag, Provenance};
    use std::collections::BTreeMap;

    fn engine() -> QualityEngine {
        QualityEngine::new(&CoercionConfig::default(), &QualityConfig::default())
    }

    fn bacteria() -> EntitySchema {
        EntitySchema::new("bacteria")
            .with_field(
                FieldSpec::new("site_code", FieldKind::Text)
                    .required()
                    .with_casing(Casing::Upper),
            )
            .with_field(FieldSpec::new("sampled_on", FieldKind::Date).required())
            .with_field(
                FieldSpec::new("ecoli_cfu", FieldKind::Float)
                    .required()
                    .with_range(Some(0.0), Some(50.0)),
            )
            .with_field(FieldSpec::new("unit", FieldKind::Text).with_default("CFU/100mL"))
            .with_field(FieldSpec::new("method", FieldKind::Text).with_default("IDEXX"))
            .with_field(FieldSpec::new("lab_verified", FieldKind::Boolean).critical())
            .with_key(KeyPart::new("site_code"))
            .with_key(KeyPart::new("sampled_on"))
    }

    fn untyped(fields: &[(&str, RawValue)]) -> UntypedRecord {
        UntypedRecord {
            entity: "bacteria".into(),
            provenance: Provenance {
                source_id: "bact".into(),
                file_id: "bact.xlsx".into(),
                sheet_id: "IDEXX".into(),
                row_index: 5,
                ordinal: 4,
            },
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn text(s: &str) -> RawValue {
        RawValue::Text(s.into())
    }

    #[test]
    fn test_clean_record_with_defaults() {
        let record = engine().coerce(
            untyped(&[
                ("site_code", text(" pr2a ")),
                ("sampled_on", text("2023-06-01")),
                ("ecoli_cfu", RawValue::Number(12.0)),
                ("extra_7", text("clear water")),
            ]),
            &bacteria(),
        );

        assert_eq!(record.quality, QualityClass::Clean);
        assert_eq!(record.get("site_code"), &Value::Text("PR2A".into()));
        assert_eq!(record.get("unit"), &Value::Text("CFU/100mL".into()));
        assert_eq!(record.get("method"), &Value::Text("IDEXX".into()));
        assert_eq!(record.get("extra_7"), &Value::Text("clear water".into()));
        assert!(record.defects.is_empty());
    }

    #[test]
    fn test_detection_limit_above_range_is_potential_outlier() {
        let record = engine().coerce(
            untyped(&[
                ("site_code", text("PR2a")),
                ("sampled_on", text("2023-06-01")),
                ("ecoli_cfu", text(">100")),
            ]),
            &bacteria(),
        );

        assert_eq!(record.get("ecoli_cfu"), &Value::Float(100.0));
        assert_eq!(record.flags.get("ecoli_cfu"), Some(&DetectionFlag::AboveLimit));
        assert_eq!(record.quality, QualityClass::PotentialOutlier);
    }

    #[test]
    fn test_high_missing() {
        let record = engine().coerce(untyped(&[("site_code", text("PR2a"))]), &bacteria());
        assert_eq!(record.quality, QualityClass::HighMissing);
    }

    #[test]
    fn test_standard_defect_nulls_value_only() {
        let record = engine().coerce(
            untyped(&[
                ("site_code", text("PR2a")),
                ("sampled_on", text("2023-06-01")),
                ("ecoli_cfu", text("TNTC")),
            ]),
            &bacteria(),
        );

        assert!(record.is_null("ecoli_cfu"));
        assert_eq!(record.defects.len(), 1);
        assert!(!record.defects[0].critical);
        assert_eq!(record.defects[0].raw, "TNTC");
        assert_eq!(record.quality, QualityClass::Clean);
    }

    #[test]
    fn test_key_or_critical_defect_is_invalid() {
        let engine = engine();
        let bad_key = engine.coerce(
            untyped(&[
                ("site_code", text("PR2a")),
                ("sampled_on", text("last tuesday")),
                ("ecoli_cfu", RawValue::Number(3.0)),
            ]),
            &bacteria(),
        );
        assert_eq!(bad_key.quality, QualityClass::Invalid);
        assert!(bad_key.defects[0].critical);

        let bad_critical = engine.coerce(
            untyped(&[
                ("site_code", text("PR2a")),
                ("sampled_on", text("2023-06-01")),
                ("ecoli_cfu", RawValue::Number(3.0)),
                ("lab_verified", text("perhaps")),
            ]),
            &bacteria(),
        );
        assert_eq!(bad_critical.quality, QualityClass::Invalid);
    }

    #[test]
    fn test_reassess_drops_resolved_defects() {
        let engine = engine();
        let schema = bacteria();
        let mut record = engine.coerce(
            untyped(&[
                ("site_code", text("PR2a")),
                ("sampled_on", text("2023-06-01")),
                ("ecoli_cfu", RawValue::Number(3.0)),
                ("lab_verified", text("perhaps")),
            ]),
            &schema,
        );
        assert_eq!(record.quality, QualityClass::Invalid);

        record.set("lab_verified", Value::Boolean(true));
        engine.reassess(&mut record, &schema);
        assert!(record.defects.is_empty());
        assert_eq!(record.quality, QualityClass::Clean);
    }
}

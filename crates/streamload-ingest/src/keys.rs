//! Business keys, code aliases and per-run deduplication

use std::collections::{BTreeMap, HashMap};

use crate::catalog::{EntitySchema, KeyNormalization};
use crate::types::{
    BusinessKey, CanonicalRecord, QuarantineEntry, QuarantinePayload, ReasonCode, Stage, Value,
};

/// Legacy code variants mapped to their current canonical code.
///
/// Lookups compare trimmed, upper-cased codes. Canonical codes resolve to
/// themselves, and unknown codes resolve to their upper-cased form.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    entries: HashMap<String, String>,
}

impl AliasTable {
    pub fn new(aliases: &BTreeMap<String, String>) -> Self {
        let mut entries: HashMap<String, String> = aliases
            .iter()
            .map(|(alias, canonical)| (alias.trim().to_uppercase(), canonical.trim().to_string()))
            .collect();
        for canonical in aliases.values() {
            entries
                .entry(canonical.trim().to_uppercase())
                .or_insert_with(|| canonical.trim().to_string());
        }
        Self { entries }
    }

    pub fn canonicalize(&self, code: &str) -> String {
        let upper = code.trim().to_uppercase();
        match self.entries.get(&upper) {
            Some(canonical) => canonical.clone(),
            None => upper,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of key resolution for one record
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Keyed(BusinessKey, CanonicalRecord),
    Quarantined(QuarantineEntry),
}

/// Computes business keys from configured key parts
#[derive(Debug, Clone, Default)]
pub struct KeyResolver {
    aliases: HashMap<String, AliasTable>,
}

impl KeyResolver {
    pub fn new(tables: &BTreeMap<String, BTreeMap<String, String>>) -> Self {
        Self {
            aliases: tables
                .iter()
                .map(|(name, entries)| (name.clone(), AliasTable::new(entries)))
                .collect(),
        }
    }

    fn normalize(&self, normalization: &KeyNormalization, text: &str) -> String {
        let trimmed = text.trim();
        match normalization {
            KeyNormalization::None => trimmed.to_string(),
            KeyNormalization::Upper => trimmed.to_uppercase(),
            KeyNormalization::Lower => trimmed.to_lowercase(),
            KeyNormalization::Alias(table) => match self.aliases.get(table) {
                Some(aliases) => aliases.canonicalize(trimmed),
                None => trimmed.to_uppercase(),
            },
        }
    }

    /// Key built from `values`, one per key part of `schema`, in order.
    ///
    /// Returns `None` when a non-optional part is null.
    pub fn key_for_values(&self, schema: &EntitySchema, values: &[&Value]) -> Option<BusinessKey> {
        if values.len() != schema.key.len() {
            return None;
        }
        let mut parts = Vec::with_capacity(values.len());
        for (part, value) in schema.key.iter().zip(values) {
            match value.key_text() {
                Some(text) if !text.trim().is_empty() => {
                    parts.push(self.normalize(&part.normalize, &text))
                },
                _ if part.optional => parts.push(String::new()),
                _ => return None,
            }
        }
        Some(BusinessKey::from_parts(&parts))
    }

    /// Compute the record's business key and rewrite text key fields to
    /// their canonical form.
    pub fn resolve(&self, mut record: CanonicalRecord, schema: &EntitySchema) -> Resolution {
        let values: Vec<&Value> = schema.key.iter().map(|p| record.get(&p.field)).collect();
        let Some(key) = self.key_for_values(schema, &values) else {
            let missing: Vec<&str> = schema
                .key
                .iter()
                .filter(|p| !p.optional && record.is_null(&p.field))
                .map(|p| p.field.as_str())
                .collect();
            let entry = QuarantineEntry::new(
                schema.name.clone(),
                ReasonCode::UnresolvableKey,
                Stage::KeyResolution,
                QuarantinePayload::Canonical(record),
            )
            .with_detail(format!("key fields without a usable value: {}", missing.join(", ")));
            return Resolution::Quarantined(entry);
        };

        for part in &schema.key {
            if let Value::Text(text) = record.get(&part.field) {
                let canonical = self.normalize(&part.normalize, text);
                if &canonical != text {
                    record.set(part.field.clone(), Value::Text(canonical));
                }
            }
        }

        Resolution::Keyed(key, record)
    }
}

/// Standing of one contributing record when field values conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Contributor {
    /// Null fields in the contributor as it arrived, not in the merge
    nulls: usize,
    seq: u64,
}

impl Contributor {
    /// Fewer nulls wins; equal completeness goes to the later arrival.
    fn outranks(&self, other: &Contributor) -> bool {
        self.nulls < other.nulls || (self.nulls == other.nulls && self.seq > other.seq)
    }
}

/// A surviving record after deduplication
#[derive(Debug, Clone, PartialEq)]
pub struct DedupEntry {
    pub key: BusinessKey,
    pub record: CanonicalRecord,
    /// Arrival sequence of the first contributor
    pub first_seen: u64,
    /// Arrival sequence of the record owning `record.provenance`
    pub latest_seen: u64,
    pub contributors: usize,
    /// Contributor whose value each non-null field currently holds
    owners: HashMap<String, Contributor>,
}

/// Per-run merge map for one entity type.
///
/// Records are offered in arrival order. Records with the same key merge
/// field by field: a non-null value beats a null one. Between non-null
/// values, each field takes the value of the most complete contributor
/// (fewest nulls of its own), and among equally complete contributors the
/// latest arrival. The merged record carries the provenance of the latest
/// contributor.
#[derive(Debug, Default)]
pub struct Deduplicator {
    entries: HashMap<BusinessKey, DedupEntry>,
    sequence: u64,
    merged: u64,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a record. Returns `true` when it merged into an earlier one.
    pub fn offer(&mut self, key: BusinessKey, record: CanonicalRecord) -> bool {
        let seq = self.sequence;
        self.sequence += 1;

        let contributor = Contributor {
            nulls: record.null_count(),
            seq,
        };
        match self.entries.get_mut(&key) {
            Some(entry) => {
                merge_into(entry, record, contributor);
                entry.latest_seen = seq;
                entry.contributors += 1;
                self.merged += 1;
                true
            },
            None => {
                let owners = record
                    .fields
                    .iter()
                    .filter(|(_, value)| !value.is_null())
                    .map(|(name, _)| (name.clone(), contributor))
                    .collect();
                self.entries.insert(
                    key.clone(),
                    DedupEntry {
                        key,
                        record,
                        first_seen: seq,
                        latest_seen: seq,
                        contributors: 1,
                        owners,
                    },
                );
                false
            },
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn merged(&self) -> u64 {
        self.merged
    }

    /// Surviving records in first-seen order
    pub fn finish(self) -> Vec<DedupEntry> {
        let mut entries: Vec<DedupEntry> = self.entries.into_values().collect();
        entries.sort_by_key(|e| e.first_seen);
        entries
    }
}

/// Merge `incoming` (the later arrival) into `entry`.
fn merge_into(entry: &mut DedupEntry, incoming: CanonicalRecord, contributor: Contributor) {
    let DedupEntry { record: existing, owners, .. } = entry;

    let CanonicalRecord {
        fields,
        provenance,
        defects,
        flags,
        quality,
        ..
    } = incoming;

    for (name, value) in fields {
        if value.is_null() {
            continue;
        }
        let take = match owners.get(&name) {
            Some(owner) => contributor.outranks(owner),
            None => existing.is_null(&name),
        };
        if take {
            owners.insert(name.clone(), contributor);
            match flags.get(&name) {
                Some(flag) => {
                    existing.flags.insert(name.clone(), *flag);
                },
                None => {
                    existing.flags.remove(&name);
                },
            }
            existing.fields.insert(name, value);
        }
    }

    for defect in defects {
        if !existing.defects.contains(&defect) {
            existing.defects.push(defect);
        }
    }
    existing.quality.escalate(quality);
    existing.provenance = provenance;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::catalog::{FieldKind, FieldSpec, KeyPart};
    use crate::types::{Provenance, QualityClass};
    use proptest::prelude::*;

    fn site_schema() -> EntitySchema {
        EntitySchema::new("site")
            .with_field(FieldSpec::new("site_code", FieldKind::Text).required())
            .with_key(
                KeyPart::new("site_code")
                    .with_normalization(KeyNormalization::Alias("site_codes".into())),
            )
    }

    fn resolver() -> KeyResolver {
        let mut tables = BTreeMap::new();
        tables.insert(
            "site_codes".to_string(),
            [("PR2A".to_string(), "PR2a".to_string()), ("PINE2".to_string(), "PR2a".to_string())]
                .into_iter()
                .collect(),
        );
        KeyResolver::new(&tables)
    }

    fn record(ordinal: u64, fields: &[(&str, Value)]) -> CanonicalRecord {
        let mut record = CanonicalRecord::new(
            "site",
            Provenance {
                source_id: "sites".into(),
                file_id: "sites.xlsx".into(),
                sheet_id: "Sites".into(),
                row_index: ordinal + 1,
                ordinal,
            },
        );
        for (name, value) in fields {
            record.set(*name, value.clone());
        }
        record
    }

    fn text(s: &str) -> Value {
        Value::Text(s.into())
    }

    #[test]
    fn test_alias_table_lookup() {
        let table = AliasTable::new(
            &[("PR2A".to_string(), "PR2a".to_string())].into_iter().collect(),
        );
        assert_eq!(table.canonicalize("pr2a"), "PR2a");
        assert_eq!(table.canonicalize(" PR2A "), "PR2a");
        assert_eq!(table.canonicalize("PR2a"), "PR2a");
        assert_eq!(table.canonicalize("zz9"), "ZZ9");
    }

    #[test]
    fn test_alias_variants_share_a_key() {
        let resolver = resolver();
        let schema = site_schema();

        let Resolution::Keyed(a, rec_a) = resolver.resolve(record(0, &[("site_code", text("PR2A"))]), &schema) else {
            panic!("expected a key");
        };
        let Resolution::Keyed(b, _) = resolver.resolve(record(1, &[("site_code", text("pr2a"))]), &schema) else {
            panic!("expected a key");
        };
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "PR2a");
        assert_eq!(rec_a.get("site_code"), &text("PR2a"));
    }

    #[test]
    fn test_missing_key_is_quarantined() {
        let resolver = resolver();
        let resolution = resolver.resolve(record(0, &[("site_name", text("Pine Run"))]), &site_schema());
        let Resolution::Quarantined(entry) = resolution else {
            panic!("expected quarantine");
        };
        assert_eq!(entry.reason, ReasonCode::UnresolvableKey);
        assert_eq!(entry.stage, Stage::KeyResolution);
        assert!(entry.detail.unwrap().contains("site_code"));
    }

    #[test]
    fn test_optional_key_part() {
        let schema = EntitySchema::new("sample")
            .with_key(KeyPart::new("site_code"))
            .with_key(KeyPart::new("sequence").optional());
        let key = resolver()
            .key_for_values(&schema, &[&text("PR2a"), &Value::Null])
            .unwrap();
        assert_eq!(key.as_str(), "PR2a|");
    }

    #[test]
    fn test_merge_prefers_non_null_then_completeness_then_latest() {
        let mut dedup = Deduplicator::new();
        let key = BusinessKey::new("PR2a");

        dedup.offer(
            key.clone(),
            record(0, &[("site_code", text("PR2a")), ("name", text("Pine Run")), ("county", Value::Null)]),
        );
        assert!(dedup.offer(
            key.clone(),
            record(5, &[("site_code", text("PR2a")), ("name", text("Pine Run Upper")), ("county", text("Centre"))]),
        ));

        let entries = dedup.finish();
        assert_eq!(entries.len(), 1);
        let merged = &entries[0].record;
        assert_eq!(merged.get("county"), &text("Centre"));
        // Later record has fewer nulls, so its name wins.
        assert_eq!(merged.get("name"), &text("Pine Run Upper"));
        assert_eq!(merged.provenance.ordinal, 5);
        assert_eq!(entries[0].contributors, 2);
        assert_eq!(entries[0].first_seen, 0);
        assert_eq!(entries[0].latest_seen, 1);
    }

    #[test]
    fn test_more_complete_earlier_record_keeps_conflicts() {
        let mut dedup = Deduplicator::new();
        let key = BusinessKey::new("PR2a");
        dedup.offer(
            key.clone(),
            record(0, &[("name", text("Pine Run")), ("county", text("Centre"))]),
        );
        dedup.offer(key, record(1, &[("name", text("PINE RUN")), ("county", Value::Null)]));

        let merged = &dedup.finish()[0].record;
        assert_eq!(merged.get("name"), &text("Pine Run"));
        assert_eq!(merged.get("county"), &text("Centre"));
        assert_eq!(merged.provenance.ordinal, 1);
    }

    #[test]
    fn test_equally_complete_latest_contributor_wins_after_merges() {
        let mut dedup = Deduplicator::new();
        let key = BusinessKey::new("PR2a");
        let row = |ordinal: u64, name: &str, filled: (&str, &str)| {
            let mut fields = vec![
                ("name", text(name)),
                ("county", Value::Null),
                ("elevation", Value::Null),
                ("latitude", Value::Null),
            ];
            for field in fields.iter_mut().skip(1) {
                if field.0 == filled.0 {
                    field.1 = text(filled.1);
                }
            }
            record(ordinal, &fields)
        };

        dedup.offer(key.clone(), row(0, "Pine Run", ("county", "Centre")));
        dedup.offer(key.clone(), row(1, "Pine Run Upper", ("elevation", "412")));
        // The merge so far has one null, but this row is judged on its own two.
        dedup.offer(key, row(2, "Pine Run Headwaters", ("latitude", "40.79")));

        let merged = &dedup.finish()[0].record;
        assert_eq!(merged.get("name"), &text("Pine Run Headwaters"));
        assert_eq!(merged.get("county"), &text("Centre"));
        assert_eq!(merged.get("elevation"), &text("412"));
        assert_eq!(merged.get("latitude"), &text("40.79"));
    }

    #[test]
    fn test_most_complete_contributor_wins_in_any_position() {
        let complete = |ordinal| {
            record(
                ordinal,
                &[("name", text("Pine Run")), ("county", text("Centre")), ("elevation", text("412"))],
            )
        };
        let sparse = |ordinal, name: &str| {
            record(ordinal, &[("name", text(name)), ("county", Value::Null), ("elevation", Value::Null)])
        };

        for position in 0..3u64 {
            let mut dedup = Deduplicator::new();
            for ordinal in 0..3u64 {
                let row = if ordinal == position {
                    complete(ordinal)
                } else {
                    sparse(ordinal, &format!("PINE RUN {}", ordinal))
                };
                dedup.offer(BusinessKey::new("PR2a"), row);
            }
            let merged = &dedup.finish()[0].record;
            assert_eq!(merged.get("name"), &text("Pine Run"), "complete row at {position}");
        }
    }

    #[test]
    fn test_quality_is_worst_until_reassessed() {
        let mut dedup = Deduplicator::new();
        let key = BusinessKey::new("PR2a");
        let mut bad = record(0, &[("name", Value::Null)]);
        bad.quality = QualityClass::HighMissing;
        dedup.offer(key.clone(), bad);
        dedup.offer(key, record(1, &[("name", text("Pine Run"))]));
        assert_eq!(dedup.finish()[0].record.quality, QualityClass::HighMissing);
    }

    proptest! {
        #[test]
        fn prop_merge_keeps_every_non_null_field(
            rows in proptest::collection::vec(
                proptest::collection::vec(proptest::option::of("[a-z]{1,4}"), 4),
                1..8,
            )
        ) {
            let names = ["a", "b", "c", "d"];
            let mut dedup = Deduplicator::new();
            for (i, row) in rows.iter().enumerate() {
                let fields: Vec<(&str, Value)> = names
                    .iter()
                    .zip(row)
                    .map(|(n, v)| (*n, v.clone().map(Value::Text).unwrap_or(Value::Null)))
                    .collect();
                dedup.offer(BusinessKey::new("k"), record(i as u64, &fields));
            }

            let entries = dedup.finish();
            prop_assert_eq!(entries.len(), 1);
            let merged = &entries[0].record;
            for (col, name) in names.iter().enumerate() {
                let any_value = rows.iter().any(|row| row[col].is_some());
                prop_assert_eq!(!merged.is_null(name), any_value);
            }
        }
    }
}

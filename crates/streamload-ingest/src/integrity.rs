//! Referential integrity across entity types
//!
//! A dependent record is accepted only if every parent it references is
//! either committed in the target store or accepted earlier in this run.
//! Everything else is quarantined as `orphaned-reference`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::catalog::{Catalog, EntitySchema};
use crate::error::Result;
use crate::keys::KeyResolver;
use crate::store::TargetStore;
use crate::types::{
    BusinessKey, CanonicalRecord, QuarantineEntry, QuarantinePayload, ReasonCode, Stage, Value,
};

/// Keys accepted for loading during the current run, by entity type.
///
/// Cheap to clone; clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    accepted: Arc<RwLock<HashMap<String, HashSet<BusinessKey>>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, HashSet<BusinessKey>>> {
        self.accepted.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, HashSet<BusinessKey>>> {
        self.accepted.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn accept<'k>(&self, entity: &str, keys: impl IntoIterator<Item = &'k BusinessKey>) {
        let mut accepted = self.write();
        let set = accepted.entry(entity.to_string()).or_default();
        set.extend(keys.into_iter().cloned());
    }

    /// Withdraw keys whose chunk failed to commit
    pub fn revoke<'k>(&self, entity: &str, keys: impl IntoIterator<Item = &'k BusinessKey>) {
        let mut accepted = self.write();
        if let Some(set) = accepted.get_mut(entity) {
            for key in keys {
                set.remove(key);
            }
        }
    }

    pub fn contains(&self, entity: &str, key: &BusinessKey) -> bool {
        self.read().get(entity).is_some_and(|set| set.contains(key))
    }

    pub fn snapshot(&self, entity: &str) -> HashSet<BusinessKey> {
        self.read().get(entity).cloned().unwrap_or_default()
    }
}

/// Parent keys visible to one dependent entity load
#[derive(Debug, Clone, Default)]
pub struct ParentKeys {
    by_entity: HashMap<String, HashSet<BusinessKey>>,
}

impl ParentKeys {
    pub fn contains(&self, entity: &str, key: &BusinessKey) -> bool {
        self.by_entity.get(entity).is_some_and(|set| set.contains(key))
    }

    pub fn insert(&mut self, entity: impl Into<String>, keys: impl IntoIterator<Item = BusinessKey>) {
        self.by_entity.entry(entity.into()).or_default().extend(keys);
    }
}

/// Outcome of the integrity check for one record
#[derive(Debug, Clone, PartialEq)]
pub enum Check {
    Accepted(CanonicalRecord),
    Quarantined(QuarantineEntry),
}

pub struct IntegrityResolver {
    catalog: Arc<Catalog>,
    keys: Arc<KeyResolver>,
    registry: RunRegistry,
}

impl IntegrityResolver {
    pub fn new(catalog: Arc<Catalog>, keys: Arc<KeyResolver>, registry: RunRegistry) -> Self {
        Self {
            catalog,
            keys,
            registry,
        }
    }

    /// Collect the committed and run-accepted keys of every parent of
    /// `entity`. Taken once per entity load.
    pub async fn parent_keys(&self, entity: &str, store: &dyn TargetStore) -> Result<ParentKeys> {
        let mut parents = ParentKeys::default();
        for parent in self.catalog.parents(entity) {
            let committed = store.committed_keys(parent).await?;
            let accepted = self.registry.snapshot(parent);
            debug!(
                entity,
                parent,
                committed = committed.len(),
                accepted = accepted.len(),
                "Collected parent keys"
            );
            parents.insert(parent, committed);
            parents.insert(parent, accepted);
        }
        Ok(parents)
    }

    /// Verify every foreign key of `record`.
    ///
    /// A reference whose fields are all null points at nothing and passes.
    pub fn check(&self, record: CanonicalRecord, schema: &EntitySchema, parents: &ParentKeys) -> Check {
        for fk in &schema.foreign_keys {
            let values: Vec<&Value> = fk.fields.iter().map(|f| record.get(f)).collect();
            if values.iter().all(|v| v.is_null()) {
                continue;
            }
            let Some(parent_schema) = self.catalog.get(&fk.references) else {
                continue;
            };

            let found = self
                .keys
                .key_for_values(parent_schema, &values)
                .map(|key| (parents.contains(&fk.references, &key), key));

            match found {
                Some((true, _)) => {},
                Some((false, key)) => {
                    let detail = format!("{} '{}' is not loaded", fk.references, key);
                    return Check::Quarantined(orphan(record, schema, detail));
                },
                None => {
                    let detail = format!(
                        "reference to {} via {} is incomplete",
                        fk.references,
                        fk.fields.join(", ")
                    );
                    return Check::Quarantined(orphan(record, schema, detail));
                },
            }
        }
        Check::Accepted(record)
    }
}

fn orphan(record: CanonicalRecord, schema: &EntitySchema, detail: String) -> QuarantineEntry {
    QuarantineEntry::new(
        schema.name.clone(),
        ReasonCode::OrphanedReference,
        Stage::Integrity,
        QuarantinePayload::Canonical(record),
    )
    .with_detail(detail)
}

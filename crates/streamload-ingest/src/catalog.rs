//! Entity catalog: canonical schemas, business keys and the dependency DAG
//!
//! Each entity type declares its canonical fields, how its business key is
//! composed and which parent entity types it references. The catalog turns
//! the foreign-key edges into load levels: every entity in level `n` only
//! depends on entities in levels `< n`, so one level can load concurrently.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::{IngestError, Result};

/// Declared type of a canonical field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    Text,
    Integer,
    Float,
    Date,
    DateTime,
    Boolean,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Integer => "integer",
            FieldKind::Float => "float",
            FieldKind::Date => "date",
            FieldKind::DateTime => "date_time",
            FieldKind::Boolean => "boolean",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldKind::Integer | FieldKind::Float)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Casing {
    #[default]
    Preserve,
    Upper,
    Lower,
}

/// How much a coercion failure on the field matters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// Failure nulls the value and is retained as a defect
    #[default]
    Standard,
    /// Failure makes the record invalid
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub criticality: Criticality,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default)]
    pub casing: Casing,
    /// Raw text substituted for a null value, coerced like source data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            criticality: Criticality::Standard,
            min: None,
            max: None,
            casing: Casing::Preserve,
            default: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn critical(mut self) -> Self {
        self.criticality = Criticality::Critical;
        self
    }

    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn with_casing(mut self, casing: Casing) -> Self {
        self.casing = casing;
        self
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Whether `value` lies outside the configured range
    pub fn out_of_range(&self, value: f64) -> bool {
        self.min.is_some_and(|min| value < min) || self.max.is_some_and(|max| value > max)
    }
}

/// Normalization applied to one business-key component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeyNormalization {
    #[default]
    None,
    Upper,
    Lower,
    /// Translate through the named alias table
    Alias(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPart {
    pub field: String,
    #[serde(default)]
    pub normalize: KeyNormalization,
    /// A null optional part contributes an empty component instead of
    /// making the key unresolvable
    #[serde(default)]
    pub optional: bool,
}

impl KeyPart {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            normalize: KeyNormalization::None,
            optional: false,
        }
    }

    pub fn with_normalization(mut self, normalize: KeyNormalization) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// `fields` of the child, in order, hold the parent's business key parts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub fields: Vec<String>,
    pub references: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    pub key: Vec<KeyPart>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
}

impl EntitySchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            key: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_key(mut self, part: KeyPart) -> Self {
        self.key.push(part);
        self
    }

    pub fn with_foreign_key(mut self, fields: &[&str], references: impl Into<String>) -> Self {
        self.foreign_keys.push(ForeignKey {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            references: references.into(),
        });
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_key_field(&self, name: &str) -> bool {
        self.key.iter().any(|k| k.field == name)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.required)
    }
}

/// Validated set of entity schemas with their load order
#[derive(Debug, Clone)]
pub struct Catalog {
    entities: BTreeMap<String, EntitySchema>,
    levels: Vec<Vec<String>>,
}

impl Catalog {
    pub fn new(schemas: Vec<EntitySchema>) -> Result<Self> {
        let mut entities = BTreeMap::new();
        for schema in schemas {
            if schema.key.is_empty() {
                return Err(IngestError::config(format!(
                    "entity '{}' declares no business key",
                    schema.name
                )));
            }
            if let Some(dup) = entities.insert(schema.name.clone(), schema) {
                return Err(IngestError::config(format!(
                    "entity '{}' is declared twice",
                    dup.name
                )));
            }
        }

        for schema in entities.values() {
            for fk in &schema.foreign_keys {
                let parent = entities.get(&fk.references).ok_or_else(|| {
                    IngestError::config(format!(
                        "entity '{}' references unknown entity '{}'",
                        schema.name, fk.references
                    ))
                })?;
                if fk.fields.len() != parent.key.len() {
                    return Err(IngestError::config(format!(
                        "foreign key {}.{:?} has {} fields but '{}' has a {}-part key",
                        schema.name,
                        fk.fields,
                        fk.fields.len(),
                        parent.name,
                        parent.key.len()
                    )));
                }
            }
        }

        let levels = compute_levels(&entities)?;
        Ok(Self { entities, levels })
    }

    pub fn get(&self, entity: &str) -> Option<&EntitySchema> {
        self.entities.get(entity)
    }

    pub fn require(&self, entity: &str) -> Result<&EntitySchema> {
        self.get(entity)
            .ok_or_else(|| IngestError::config(format!("unknown entity '{}'", entity)))
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntitySchema> {
        self.entities.values()
    }

    /// Entity names grouped by dependency depth, parents first
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    pub fn parents(&self, entity: &str) -> Vec<&str> {
        let mut parents: Vec<&str> = self
            .get(entity)
            .map(|s| s.foreign_keys.iter().map(|fk| fk.references.as_str()).collect())
            .unwrap_or_default();
        parents.sort_unstable();
        parents.dedup();
        parents
    }
}

fn compute_levels(entities: &BTreeMap<String, EntitySchema>) -> Result<Vec<Vec<String>>> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();

    for name in entities.keys() {
        nodes.insert(name.as_str(), graph.add_node(name.as_str()));
    }
    for schema in entities.values() {
        for fk in &schema.foreign_keys {
            if let (Some(&parent), Some(&child)) =
                (nodes.get(fk.references.as_str()), nodes.get(schema.name.as_str()))
            {
                graph.update_edge(parent, child, ());
            }
        }
    }

    let order = toposort(&graph, None).map_err(|cycle| {
        IngestError::config(format!(
            "entity dependencies form a cycle through '{}'",
            graph[cycle.node_id()]
        ))
    })?;

    let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
    for node in &order {
        let d = graph
            .neighbors_directed(*node, Direction::Incoming)
            .filter_map(|p| depth.get(&p))
            .map(|d| d + 1)
            .max()
            .unwrap_or(0);
        depth.insert(*node, d);
    }

    let mut levels: Vec<Vec<String>> = Vec::new();
    for (node, d) in depth {
        if levels.len() <= d {
            levels.resize_with(d + 1, Vec::new);
        }
        levels[d].push(graph[node].to_string());
    }
    for level in &mut levels {
        level.sort();
    }
    Ok(levels)
}

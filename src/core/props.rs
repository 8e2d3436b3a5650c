//! Write-once output bag and the per-unit views handed to dependents.
//!
//! Every published key remembers its publisher. A unit only ever sees keys
//! published by its transitive dependencies, so a forward reference to a
//! sibling or descendant output fails as a missing input instead of
//! silently reading whatever happened to run first.

use crate::error::GraphError;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub publisher: String,
    pub value: Value,
}

/// Append-only mapping of output key to value, accumulated across units.
#[derive(Debug, Clone, Default)]
pub struct PropsBag {
    entries: BTreeMap<String, Published>,
}

impl PropsBag {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(|p| &p.value)
    }

    pub fn publisher_of(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|p| p.publisher.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Published)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Keys published by `unit`, in key order.
    pub fn keys_of<'a>(&'a self, unit: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(_, p)| p.publisher == unit)
            .map(|(k, _)| k.as_str())
    }

    fn insert(&mut self, unit: &str, key: &str, value: Value) -> Result<(), GraphError> {
        if let Some(existing) = self.entries.get(key) {
            return Err(GraphError::KeyAlreadyPublished {
                key: key.to_string(),
                unit: unit.to_string(),
                publisher: existing.publisher.clone(),
            });
        }
        self.entries.insert(
            key.to_string(),
            Published {
                publisher: unit.to_string(),
                value,
            },
        );
        Ok(())
    }
}

/// Ordered outputs declared by one unit apply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outputs(Vec<(String, Value)>);

impl Outputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.push((key.into(), value.into()));
        self
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.push((key.into(), value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Read-only snapshot of the outputs visible to one unit.
#[derive(Debug, Clone)]
pub struct PropsView {
    unit: String,
    values: BTreeMap<String, Value>,
}

impl PropsView {
    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn require(&self, key: &str) -> Result<&Value, GraphError> {
        self.values.get(key).ok_or_else(|| self.missing(key))
    }

    /// A string output. Non-string values count as missing.
    pub fn require_str(&self, key: &str) -> Result<&str, GraphError> {
        self.require(key)?.as_str().ok_or_else(|| self.missing(key))
    }

    fn missing(&self, key: &str) -> GraphError {
        GraphError::MissingInput {
            unit: self.unit.clone(),
            key: key.to_string(),
        }
    }
}

/// Publishes unit outputs into the bag and builds restricted views.
#[derive(Debug, Default)]
pub struct OutputPropagator {
    bag: PropsBag,
    lineage: HashMap<String, Vec<String>>,
}

impl OutputPropagator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the direct dependencies of `unit`, used to compute its ancestry.
    pub fn declare(&mut self, unit: &str, dependencies: &[String]) {
        self.lineage.insert(unit.to_string(), dependencies.to_vec());
    }

    pub fn publish(&mut self, unit: &str, key: &str, value: Value) -> Result<(), GraphError> {
        self.bag.insert(unit, key, value)
    }

    /// Publish a whole output set, or nothing if any key is already taken.
    pub fn publish_all(&mut self, unit: &str, outputs: Outputs) -> Result<(), GraphError> {
        {
            let mut seen = BTreeSet::new();
            for (key, _) in outputs.iter() {
                let publisher = match self.bag.publisher_of(key) {
                    Some(existing) => existing,
                    None if !seen.insert(key) => unit,
                    None => continue,
                };
                return Err(GraphError::KeyAlreadyPublished {
                    key: key.to_string(),
                    unit: unit.to_string(),
                    publisher: publisher.to_string(),
                });
            }
        }
        for (key, value) in outputs.0 {
            self.bag.insert(unit, &key, value)?;
        }
        Ok(())
    }

    /// Outputs published by the transitive dependencies of `unit`.
    pub fn view_for(&self, unit: &str) -> PropsView {
        let ancestors = self.ancestors(unit);
        let values = self
            .bag
            .entries
            .iter()
            .filter(|(_, p)| ancestors.contains(p.publisher.as_str()))
            .map(|(k, p)| (k.clone(), p.value.clone()))
            .collect();
        PropsView {
            unit: unit.to_string(),
            values,
        }
    }

    pub fn bag(&self) -> &PropsBag {
        &self.bag
    }

    pub fn into_bag(self) -> PropsBag {
        self.bag
    }

    fn ancestors(&self, unit: &str) -> BTreeSet<&str> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = self
            .lineage
            .get(unit)
            .map(|deps| deps.iter().map(|d| d.as_str()).collect())
            .unwrap_or_default();
        while let Some(next) = stack.pop() {
            if next == unit || !seen.insert(next) {
                continue;
            }
            if let Some(deps) = self.lineage.get(next) {
                stack.extend(deps.iter().map(|d| d.as_str()));
            }
        }
        seen
    }
}

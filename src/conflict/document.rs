//! Field-collection record content.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::storage::error::StorageResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<FieldValue>),
    Embedded(Document),
}

impl FieldValue {
    pub fn is_collection(&self) -> bool {
        matches!(self, FieldValue::List(_) | FieldValue::Embedded(_))
    }
}

/// Named fields in key order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    fields: BTreeMap<String, FieldValue>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: &str, value: FieldValue) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: FieldValue) -> Option<FieldValue> {
        self.fields.insert(name.to_string(), value)
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Merge `incoming` into a copy of `self`.
    ///
    /// Fields present on one side only are kept. When both sides have a
    /// field, lists are unioned, embedded documents merged recursively and
    /// any other value keeps the stored (`self`) side.
    pub fn merge(&self, incoming: &Document) -> Document {
        let mut merged = self.clone();
        for (name, value) in &incoming.fields {
            let combined = match merged.fields.get(name) {
                None => value.clone(),
                Some(existing) => merge_values(existing, value),
            };
            merged.fields.insert(name.clone(), combined);
        }
        merged
    }

    pub fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

fn merge_values(stored: &FieldValue, incoming: &FieldValue) -> FieldValue {
    match (stored, incoming) {
        (FieldValue::List(stored), FieldValue::List(incoming)) => {
            let mut union = stored.clone();
            for item in incoming {
                if !union.contains(item) {
                    union.push(item.clone());
                }
            }
            FieldValue::List(union)
        }
        (FieldValue::Embedded(stored), FieldValue::Embedded(incoming)) => {
            FieldValue::Embedded(stored.merge(incoming))
        }
        (stored, _) => stored.clone(),
    }
}

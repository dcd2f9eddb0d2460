//! Record values: typed instances with scalar attributes and relationship
//! edges, identified by an opaque stable id.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Opaque stable record identity. Ordering is lexicographic, which gives
/// migration its stable page order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
  pub fn new(raw: impl Into<String>) -> Self {
    Self(raw.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for RecordId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl From<&str> for RecordId {
  fn from(raw: &str) -> Self {
    Self::new(raw)
  }
}

impl From<String> for RecordId {
  fn from(raw: String) -> Self {
    Self(raw)
  }
}

/// Scalar attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Value {
  Null,
  Bool(bool),
  Int(i64),
  Float(f64),
  Text(String),
  Bytes(Vec<u8>),
  /// Milliseconds since the unix epoch.
  Timestamp(i64),
}

/// A relationship edge's current value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum RelationshipValue {
  One(Option<RecordId>),
  Many(BTreeSet<RecordId>),
}

impl RelationshipValue {
  pub fn empty(to_many: bool) -> Self {
    if to_many {
      RelationshipValue::Many(BTreeSet::new())
    } else {
      RelationshipValue::One(None)
    }
  }

  pub fn targets(&self) -> Vec<RecordId> {
    match self {
      RelationshipValue::One(target) => target.iter().cloned().collect(),
      RelationshipValue::Many(targets) => targets.iter().cloned().collect(),
    }
  }

  pub fn is_empty(&self) -> bool {
    match self {
      RelationshipValue::One(target) => target.is_none(),
      RelationshipValue::Many(targets) => targets.is_empty(),
    }
  }

  /// Links `target`, replacing for to-one and inserting for to-many.
  pub fn link(&mut self, target: RecordId) {
    match self {
      RelationshipValue::One(slot) => *slot = Some(target),
      RelationshipValue::Many(targets) => {
        targets.insert(target);
      }
    }
  }

  pub fn unlink(&mut self, target: &RecordId) {
    match self {
      RelationshipValue::One(slot) => {
        if slot.as_ref() == Some(target) {
          *slot = None;
        }
      }
      RelationshipValue::Many(targets) => {
        targets.remove(target);
      }
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
  pub id: RecordId,
  pub type_name: String,
  #[serde(default)]
  pub attributes: BTreeMap<String, Value>,
  #[serde(default)]
  pub relationships: BTreeMap<String, RelationshipValue>,
}

impl Record {
  pub fn new(id: impl Into<RecordId>, type_name: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      type_name: type_name.into(),
      attributes: BTreeMap::new(),
      relationships: BTreeMap::new(),
    }
  }

  pub fn with_attribute(mut self, name: impl Into<String>, value: Value) -> Self {
    self.attributes.insert(name.into(), value);
    self
  }

  pub fn set_attribute(&mut self, name: impl Into<String>, value: Value) {
    self.attributes.insert(name.into(), value);
  }

  pub fn relationship(&self, name: &str) -> Option<&RelationshipValue> {
    self.relationships.get(name)
  }

  /// Links `target` under `name`, creating the edge slot when absent.
  pub fn link(&mut self, name: &str, to_many: bool, target: RecordId) {
    self
      .relationships
      .entry(name.to_string())
      .or_insert_with(|| RelationshipValue::empty(to_many))
      .link(target);
  }
}

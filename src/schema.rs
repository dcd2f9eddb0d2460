//! Record-graph schema: types, scalar attributes, relationships.
//!
//! The schema is a runtime value shared by every store the lifecycle manager
//! touches; both sides of a migration must use the same schema.

use crate::error::{Result, TideError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declares one relationship edge of a record type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipDef {
  pub name: String,
  pub target_type: String,
  /// To-many edge when true, to-one otherwise.
  pub to_many: bool,
  /// Optional relationships may be left unresolved at save time.
  pub optional: bool,
  /// Name of the mirrored relationship on the target type, if declared.
  pub inverse: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDef {
  pub name: String,
  pub attributes: Vec<String>,
  pub relationships: Vec<RelationshipDef>,
}

impl TypeDef {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      attributes: Vec::new(),
      relationships: Vec::new(),
    }
  }

  pub fn attribute(mut self, name: impl Into<String>) -> Self {
    self.attributes.push(name.into());
    self
  }

  pub fn relationship(mut self, def: RelationshipDef) -> Self {
    self.relationships.push(def);
    self
  }

  pub fn relationship_def(&self, name: &str) -> Option<&RelationshipDef> {
    self.relationships.iter().find(|rel| rel.name == name)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
  types: BTreeMap<String, TypeDef>,
}

impl Schema {
  /// Builds a schema from type definitions and checks cross-type integrity:
  /// relationship targets must exist and inverse declarations must be
  /// symmetric (each side naming the other).
  pub fn new(types: Vec<TypeDef>) -> Result<Self> {
    let map: BTreeMap<String, TypeDef> = types
      .into_iter()
      .map(|def| (def.name.clone(), def))
      .collect();
    let schema = Self { types: map };
    schema.validate()?;
    Ok(schema)
  }

  fn validate(&self) -> Result<()> {
    for def in self.types.values() {
      for rel in &def.relationships {
        let target = self.types.get(&rel.target_type).ok_or_else(|| {
          TideError::Schema(format!(
            "relationship {}.{} targets unknown type {}",
            def.name, rel.name, rel.target_type
          ))
        })?;

        if let Some(inverse) = rel.inverse.as_deref() {
          let mirrored = target.relationship_def(inverse).ok_or_else(|| {
            TideError::Schema(format!(
              "inverse of {}.{} names missing relationship {}.{}",
              def.name, rel.name, rel.target_type, inverse
            ))
          })?;

          if mirrored.target_type != def.name || mirrored.inverse.as_deref() != Some(&rel.name) {
            return Err(TideError::Schema(format!(
              "inverse declarations of {}.{} and {}.{} are not symmetric",
              def.name, rel.name, rel.target_type, inverse
            )));
          }
        }
      }
    }
    Ok(())
  }

  pub fn type_def(&self, name: &str) -> Option<&TypeDef> {
    self.types.get(name)
  }

  pub fn require_type(&self, name: &str) -> Result<&TypeDef> {
    self
      .type_def(name)
      .ok_or_else(|| TideError::Schema(format!("unknown record type: {name}")))
  }

  /// Type names in stable (sorted) order.
  pub fn type_names(&self) -> impl Iterator<Item = &str> {
    self.types.keys().map(String::as_str)
  }
}

#[cfg(test)]
mod tests {
  use super::{RelationshipDef, Schema, TypeDef};

  fn rel(name: &str, target: &str, to_many: bool, inverse: Option<&str>) -> RelationshipDef {
    RelationshipDef {
      name: name.to_string(),
      target_type: target.to_string(),
      to_many,
      optional: true,
      inverse: inverse.map(str::to_string),
    }
  }

  #[test]
  fn symmetric_inverse_pair_validates() {
    let schema = Schema::new(vec![
      TypeDef::new("Folder")
        .attribute("name")
        .relationship(rel("children", "Note", true, Some("parent"))),
      TypeDef::new("Note")
        .attribute("body")
        .relationship(rel("parent", "Folder", false, Some("children"))),
    ])
    .expect("schema");

    let parent = schema
      .type_def("Note")
      .and_then(|def| def.relationship_def("parent"))
      .expect("parent relationship");
    assert_eq!(parent.inverse.as_deref(), Some("children"));
  }

  #[test]
  fn asymmetric_inverse_is_rejected() {
    let result = Schema::new(vec![
      TypeDef::new("Folder").relationship(rel("children", "Note", true, Some("parent"))),
      TypeDef::new("Note").relationship(rel("parent", "Folder", false, None)),
    ]);
    assert!(result.is_err());
  }

  #[test]
  fn unknown_target_type_is_rejected() {
    let result =
      Schema::new(vec![
        TypeDef::new("Folder").relationship(rel("children", "Ghost", true, None))
      ]);
    assert!(result.is_err());
  }
}

//! Migration engine: copies a record subgraph between two stores in
//! bounded-memory batches.
//!
//! Semantics follow the snip/stitch model: migrating a type copies every
//! record of that type plus all records reachable through relationships not
//! in the snip set, with an identity map guaranteeing at most one
//! destination record per source record. Cycles are broken by inserting a
//! forward-reference placeholder before recursing. Committed batches are
//! never rolled back; a re-run adopts records already present in the
//! destination and continues from the failure point.

use crate::error::{Result, TideError};
use crate::record::{Record, RecordId, RelationshipValue};
use crate::schema::{RelationshipDef, Schema};
use crate::store::{StoreAccessor, StoreSession};
use hashbrown::{HashMap, HashSet};
use indexmap::IndexSet;
use std::sync::Arc;

/// Outcome counters for one `migrate_type` or `stitch_relationship` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
  /// Records of the requested type processed by this call.
  pub records_migrated: usize,
  /// Destination commits performed by this call.
  pub batches_committed: usize,
}

/// One migration session between a source and a destination accessor.
///
/// Exists only between `begin` and `end`; the identity map never outlives
/// one switchover.
pub struct MigrationEngine<'a> {
  schema: Arc<Schema>,
  source: Box<dyn StoreSession + 'a>,
  destination: Box<dyn StoreSession + 'a>,
  /// Source record identity -> destination record identity. Injective;
  /// counterparts keep the source id, so the map doubles as the visited set.
  identity: HashMap<RecordId, RecordId>,
  /// Subset of `identity` whose attributes and relationships are fully
  /// copied. An id in `identity` but not here is a placeholder mid-visit.
  materialized: HashSet<RecordId>,
  /// (type, relationship) pairs excluded from traversal.
  snips: IndexSet<(String, String)>,
  /// Identity-map entries not yet committed to the destination. Cleared on
  /// every successful save; undone together when a batch fails, so the map
  /// never claims records the destination rolled back.
  batch_added: Vec<RecordId>,
}

impl<'a> MigrationEngine<'a> {
  /// Opens a session on both accessors.
  pub fn begin(
    source: &'a dyn StoreAccessor,
    destination: &'a dyn StoreAccessor,
  ) -> Result<Self> {
    let schema = Arc::clone(source.schema());
    let source_session = source
      .session()
      .map_err(|error| TideError::StoreOpen(format!("migration source: {error}")))?;
    let destination_session = destination
      .session()
      .map_err(|error| TideError::StoreOpen(format!("migration destination: {error}")))?;

    Ok(Self {
      schema,
      source: source_session,
      destination: destination_session,
      identity: HashMap::new(),
      materialized: HashSet::new(),
      snips: IndexSet::new(),
      batch_added: Vec::new(),
    })
  }

  /// Excludes `relationship` of `type_name` from traversal. Affects only
  /// records migrated afterward. A snipped relationship with a declared
  /// inverse may still be filled by inverse mirroring from the other side.
  pub fn snip_relationship(&mut self, type_name: &str, relationship: &str) {
    self
      .snips
      .insert((type_name.to_string(), relationship.to_string()));
  }

  fn is_snipped(&self, type_name: &str, relationship: &str) -> bool {
    self
      .snips
      .contains(&(type_name.to_string(), relationship.to_string()))
  }

  /// Migrates all not-yet-migrated records of `type_name` in stable-ordered
  /// pages of `batch_size`, committing after each page when `autosave`.
  pub fn migrate_type(
    &mut self,
    type_name: &str,
    batch_size: usize,
    autosave: bool,
  ) -> Result<MigrationReport> {
    self.migrate_type_with(type_name, batch_size, autosave, &mut || true)
  }

  /// Like `migrate_type`, with a cooperative cancellation hook consulted
  /// after each batch. When `keep_going` returns false the in-flight batch
  /// has already committed (under `autosave`) and no further batch starts.
  pub fn migrate_type_with(
    &mut self,
    type_name: &str,
    batch_size: usize,
    autosave: bool,
    keep_going: &mut dyn FnMut() -> bool,
  ) -> Result<MigrationReport> {
    self.schema.require_type(type_name)?;
    if batch_size == 0 {
      return Err(TideError::Internal("batch size must be at least 1".to_string()));
    }

    let ids = self.source.ids_of(type_name);
    let mut report = MigrationReport::default();
    let mut batch_index = 0;
    let mut cursor = 0;

    loop {
      let mut batch = Vec::new();
      while cursor < ids.len() && batch.len() < batch_size {
        let id = &ids[cursor];
        cursor += 1;
        if self.materialized.contains(id) {
          continue;
        }
        if !self.identity.contains_key(id) && self.destination.contains(id) {
          // Committed by an earlier run; adopt and move on.
          self.identity.insert(id.clone(), id.clone());
          self.materialized.insert(id.clone());
          continue;
        }
        batch.push(id.clone());
      }

      if batch.is_empty() {
        break;
      }
      batch_index += 1;

      for id in &batch {
        if let Err(error) = self.ensure_migrated(id) {
          self.undo_batch();
          return Err(wrap_batch_error(type_name, batch_index, error));
        }
      }
      report.records_migrated += batch.len();

      if autosave {
        if let Err(error) = self.destination.save() {
          self.undo_batch();
          return Err(wrap_batch_error(type_name, batch_index, error));
        }
        self.batch_added.clear();
        report.batches_committed += 1;
      }

      if !keep_going() {
        break;
      }
    }

    Ok(report)
  }

  /// Copies the current source value of `relationship` into the destination
  /// for all previously migrated records of `type_name`. Targets are linked
  /// only when their counterpart exists in the destination. Needed for
  /// snipped relationships without an inverse; works for inverse pairs too.
  pub fn stitch_relationship(
    &mut self,
    type_name: &str,
    relationship: &str,
    autosave: bool,
  ) -> Result<MigrationReport> {
    let type_def = self.schema.require_type(type_name)?;
    let rel = type_def
      .relationship_def(relationship)
      .ok_or_else(|| {
        TideError::Schema(format!("unknown relationship {type_name}.{relationship}"))
      })?
      .clone();

    let mut report = MigrationReport::default();
    for id in self.source.ids_of(type_name) {
      if !self.destination.contains(&id) {
        continue;
      }
      let Some(source_record) = self.source.get(&id) else {
        continue;
      };
      let Some(value) = source_record.relationships.get(relationship) else {
        continue;
      };

      let mut stitched = RelationshipValue::empty(rel.to_many);
      let mut linked = Vec::new();
      for target in value.targets() {
        if self.destination.contains(&target) {
          stitched.link(target.clone());
          linked.push(target);
        }
      }

      let mut destination_record = self
        .destination
        .get(&id)
        .ok_or_else(|| TideError::Internal(format!("destination record vanished: {id}")))?;
      destination_record
        .relationships
        .insert(relationship.to_string(), stitched);
      self.destination.put(destination_record)?;

      for target in linked {
        self.mirror_inverse(&rel, &id, &target)?;
      }
      report.records_migrated += 1;
    }

    if autosave {
      self
        .destination
        .save()
        .map_err(|error| wrap_batch_error(type_name, 1, error))?;
      self.batch_added.clear();
      report.batches_committed += 1;
    }
    Ok(report)
  }

  /// Commits any uncommitted destination work. Used when a series of
  /// sub-migrations runs with `autosave` off.
  pub fn save(&mut self) -> Result<()> {
    self.destination.save()?;
    self.batch_added.clear();
    Ok(())
  }

  /// Discards the identity map and closes both sessions. Uncommitted
  /// destination work is rolled back.
  pub fn end(mut self) {
    self.destination.rollback();
    self.identity.clear();
    self.materialized.clear();
  }

  /// Ensures the source record and its unsnipped closure exist in the
  /// destination; returns the destination identity.
  fn ensure_migrated(&mut self, source_id: &RecordId) -> Result<RecordId> {
    if let Some(destination_id) = self.identity.get(source_id) {
      // Either fully migrated or a placeholder mid-visit (cycle).
      return Ok(destination_id.clone());
    }
    if self.destination.contains(source_id) {
      self.identity.insert(source_id.clone(), source_id.clone());
      self.materialized.insert(source_id.clone());
      return Ok(source_id.clone());
    }

    let source_record = self
      .source
      .get(source_id)
      .ok_or_else(|| TideError::Internal(format!("source record missing: {source_id}")))?;

    // Placeholder shell breaks cycles: identity is registered before any
    // relationship is traversed.
    let destination_id = source_id.clone();
    self.identity.insert(source_id.clone(), destination_id.clone());
    self.batch_added.push(source_id.clone());

    let mut shell = Record::new(destination_id.clone(), source_record.type_name.clone());
    shell.attributes = source_record.attributes.clone();
    self.destination.put(shell)?;

    let type_def = self.schema.require_type(&source_record.type_name)?.clone();
    for rel in &type_def.relationships {
      if self.is_snipped(&source_record.type_name, &rel.name) {
        continue;
      }
      let Some(value) = source_record.relationships.get(&rel.name) else {
        continue;
      };
      for target in value.targets() {
        let destination_target = self.ensure_migrated(&target)?;
        self.link(&destination_id, rel, destination_target)?;
      }
    }

    self.materialized.insert(source_id.clone());
    Ok(destination_id)
  }

  /// Writes one relationship edge in the destination, mirroring a declared
  /// inverse explicitly.
  fn link(
    &mut self,
    owner_id: &RecordId,
    rel: &RelationshipDef,
    target_id: RecordId,
  ) -> Result<()> {
    let mut owner = self
      .destination
      .get(owner_id)
      .ok_or_else(|| TideError::Internal(format!("destination record vanished: {owner_id}")))?;
    owner.link(&rel.name, rel.to_many, target_id.clone());
    self.destination.put(owner)?;

    self.mirror_inverse(rel, owner_id, &target_id)
  }

  fn mirror_inverse(
    &mut self,
    rel: &RelationshipDef,
    owner_id: &RecordId,
    target_id: &RecordId,
  ) -> Result<()> {
    let Some(inverse) = rel.inverse.as_deref() else {
      return Ok(());
    };
    let inverse_def = self
      .schema
      .require_type(&rel.target_type)?
      .relationship_def(inverse)
      .ok_or_else(|| {
        TideError::Schema(format!("unknown relationship {}.{inverse}", rel.target_type))
      })?
      .clone();

    let mut target = self
      .destination
      .get(target_id)
      .ok_or_else(|| TideError::Internal(format!("destination record vanished: {target_id}")))?;
    target.link(&inverse_def.name, inverse_def.to_many, owner_id.clone());
    self.destination.put(target)
  }

  fn undo_batch(&mut self) {
    self.destination.rollback();
    for id in self.batch_added.drain(..) {
      self.identity.remove(&id);
      self.materialized.remove(&id);
    }
  }
}

fn wrap_batch_error(type_name: &str, batch: usize, error: TideError) -> TideError {
  match error {
    already @ TideError::Migration { .. } => already,
    other => TideError::Migration {
      type_name: type_name.to_string(),
      batch,
      message: other.to_string(),
    },
  }
}

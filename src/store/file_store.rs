//! Built-in JSON-envelope store accessor.
//!
//! One file per store, rewritten atomically on every commit. Good enough for
//! modest graphs and for tests; production deployments plug their own
//! technology in through [`StoreProvider`].

use super::{StoreAccessor, StoreDescriptor, StoreProvider, StoreSession};
use crate::error::{Result, TideError};
use crate::record::{Record, RecordId};
use crate::schema::Schema;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub const STORE_ENVELOPE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreEnvelope {
  version: u32,
  #[serde(default)]
  records: BTreeMap<RecordId, Record>,
}

pub struct FileStore {
  descriptor: StoreDescriptor,
  schema: Arc<Schema>,
  records: Mutex<BTreeMap<RecordId, Record>>,
  commit_count: AtomicU64,
  read_only: AtomicBool,
  closed: AtomicBool,
}

impl FileStore {
  /// Opens the store file, creating an empty store when the file is absent.
  pub fn open(descriptor: StoreDescriptor, schema: Arc<Schema>) -> Result<Self> {
    let records = if descriptor.location.exists() {
      let bytes = fs::read(&descriptor.location)
        .map_err(|error| TideError::StoreOpen(format!("{}: {error}", descriptor.location.display())))?;
      decode_store_bytes(&bytes)?
    } else {
      BTreeMap::new()
    };

    let read_only = descriptor.options.read_only;
    Ok(Self {
      descriptor,
      schema,
      records: Mutex::new(records),
      commit_count: AtomicU64::new(0),
      read_only: AtomicBool::new(read_only),
      closed: AtomicBool::new(false),
    })
  }

  fn persist(&self, records: &BTreeMap<RecordId, Record>) -> Result<()> {
    let envelope = StoreEnvelope {
      version: STORE_ENVELOPE_VERSION,
      records: records.clone(),
    };
    let bytes = serde_json::to_vec(&envelope)
      .map_err(|error| TideError::Serialization(format!("encode store envelope: {error}")))?;

    if let Some(parent) = self.descriptor.location.parent() {
      fs::create_dir_all(parent)
        .map_err(|error| TideError::PathCreation(format!("{}: {error}", parent.display())))?;
    }

    let temp_path = temp_path_for(&self.descriptor.location);
    let mut temp_file = OpenOptions::new()
      .create(true)
      .truncate(true)
      .write(true)
      .open(&temp_path)?;
    temp_file.write_all(&bytes)?;
    temp_file.sync_all()?;

    fs::rename(&temp_path, &self.descriptor.location)?;
    sync_parent_dir(self.descriptor.location.parent())?;
    Ok(())
  }

  /// Checks the graph invariant over the full merged record set: required
  /// relationships resolve, and no edge dangles.
  fn validate(&self, records: &BTreeMap<RecordId, Record>) -> Result<()> {
    for record in records.values() {
      let type_def = self.schema.require_type(&record.type_name)?;
      for rel in &type_def.relationships {
        let value = record.relationships.get(&rel.name);
        let targets = value.map(|value| value.targets()).unwrap_or_default();

        if !rel.optional && targets.is_empty() {
          return Err(TideError::Constraint(format!(
            "record {} of type {} leaves required relationship {} unresolved",
            record.id, record.type_name, rel.name
          )));
        }

        for target in &targets {
          if !records.contains_key(target) {
            return Err(TideError::Constraint(format!(
              "record {} relationship {} references missing record {}",
              record.id, rel.name, target
            )));
          }
        }
      }
    }
    Ok(())
  }
}

impl StoreAccessor for FileStore {
  fn descriptor(&self) -> &StoreDescriptor {
    &self.descriptor
  }

  fn schema(&self) -> &Arc<Schema> {
    &self.schema
  }

  fn session(&self) -> Result<Box<dyn StoreSession + '_>> {
    if self.closed.load(Ordering::SeqCst) {
      return Err(TideError::StoreOpen(format!(
        "store is closed: {}",
        self.descriptor.location.display()
      )));
    }
    Ok(Box::new(FileSession {
      store: self,
      pending: BTreeMap::new(),
    }))
  }

  fn is_empty(&self) -> bool {
    self.records.lock().is_empty()
  }

  fn record_count(&self, type_name: &str) -> usize {
    self
      .records
      .lock()
      .values()
      .filter(|record| record.type_name == type_name)
      .count()
  }

  fn commit_count(&self) -> u64 {
    self.commit_count.load(Ordering::SeqCst)
  }

  fn set_read_only(&self, read_only: bool) {
    self.read_only.store(read_only, Ordering::SeqCst);
  }

  fn close(&self) -> Result<()> {
    self.closed.store(true, Ordering::SeqCst);
    Ok(())
  }
}

/// Session over a [`FileStore`]: mutations overlay the committed map until
/// `save` validates and persists them in one atomic rewrite.
struct FileSession<'a> {
  store: &'a FileStore,
  /// `None` marks a pending delete.
  pending: BTreeMap<RecordId, Option<Record>>,
}

impl StoreSession for FileSession<'_> {
  fn ids_of(&self, type_name: &str) -> Vec<RecordId> {
    let records = self.store.records.lock();
    let mut ids: Vec<RecordId> = records
      .values()
      .filter(|record| record.type_name == type_name)
      .map(|record| record.id.clone())
      .collect();

    for (id, entry) in &self.pending {
      match entry {
        Some(record) if record.type_name == type_name => {
          if !records.contains_key(id) {
            ids.push(id.clone());
          }
        }
        None => ids.retain(|existing| existing != id),
        _ => {}
      }
    }

    ids.sort();
    ids
  }

  fn get(&self, id: &RecordId) -> Option<Record> {
    match self.pending.get(id) {
      Some(entry) => entry.clone(),
      None => self.store.records.lock().get(id).cloned(),
    }
  }

  fn contains(&self, id: &RecordId) -> bool {
    match self.pending.get(id) {
      Some(entry) => entry.is_some(),
      None => self.store.records.lock().contains_key(id),
    }
  }

  fn put(&mut self, record: Record) -> Result<()> {
    if self.store.read_only.load(Ordering::SeqCst) {
      return Err(TideError::ReadOnly);
    }
    self.store.schema.require_type(&record.type_name)?;
    self.pending.insert(record.id.clone(), Some(record));
    Ok(())
  }

  fn delete(&mut self, id: &RecordId) -> Result<()> {
    if self.store.read_only.load(Ordering::SeqCst) {
      return Err(TideError::ReadOnly);
    }
    self.pending.insert(id.clone(), None);
    Ok(())
  }

  fn save(&mut self) -> Result<()> {
    if self.pending.is_empty() {
      return Ok(());
    }
    if self.store.read_only.load(Ordering::SeqCst) {
      return Err(TideError::ReadOnly);
    }

    let mut merged = self.store.records.lock().clone();
    for (id, entry) in &self.pending {
      match entry {
        Some(record) => {
          merged.insert(id.clone(), record.clone());
        }
        None => {
          merged.remove(id);
        }
      }
    }

    self.store.validate(&merged)?;
    self.store.persist(&merged)?;

    *self.store.records.lock() = merged;
    self.pending.clear();
    self.store.commit_count.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  fn rollback(&mut self) {
    self.pending.clear();
  }
}

pub struct FileStoreProvider {
  schema: Arc<Schema>,
}

impl FileStoreProvider {
  pub fn new(schema: Arc<Schema>) -> Self {
    Self { schema }
  }
}

impl StoreProvider for FileStoreProvider {
  fn open(&self, descriptor: &StoreDescriptor) -> Result<Arc<dyn StoreAccessor>> {
    Ok(Arc::new(FileStore::open(
      descriptor.clone(),
      Arc::clone(&self.schema),
    )?))
  }

  fn destroy(&self, descriptor: &StoreDescriptor) -> Result<()> {
    for path in [descriptor.location.clone(), temp_path_for(&descriptor.location)] {
      if path.exists() {
        fs::remove_file(&path)
          .map_err(|error| TideError::StoreClear(format!("{}: {error}", path.display())))?;
      }
    }
    Ok(())
  }

  fn exists(&self, descriptor: &StoreDescriptor) -> bool {
    descriptor.location.exists()
  }

  /// File-level copy; both stores share the envelope format, so the copied
  /// file is immediately openable.
  fn migrate(&self, source: &StoreDescriptor, destination: &StoreDescriptor) -> Result<()> {
    if !source.location.exists() {
      return Ok(());
    }
    if let Some(parent) = destination.location.parent() {
      fs::create_dir_all(parent)
        .map_err(|error| TideError::PathCreation(format!("{}: {error}", parent.display())))?;
    }
    fs::copy(&source.location, &destination.location)?;
    sync_parent_dir(destination.location.parent())?;
    Ok(())
  }
}

fn temp_path_for(path: &Path) -> PathBuf {
  match path.extension().and_then(|extension| extension.to_str()) {
    Some(extension) => path.with_extension(format!("{extension}.tmp")),
    None => path.with_extension("tmp"),
  }
}

fn decode_store_bytes(bytes: &[u8]) -> Result<BTreeMap<RecordId, Record>> {
  let envelope: StoreEnvelope = serde_json::from_slice(bytes)
    .map_err(|error| TideError::Serialization(format!("decode store envelope: {error}")))?;

  if envelope.version != STORE_ENVELOPE_VERSION {
    return Err(TideError::Serialization(format!(
      "unsupported store envelope version {}",
      envelope.version
    )));
  }

  Ok(envelope.records)
}

fn sync_parent_dir(parent: Option<&Path>) -> Result<()> {
  #[cfg(unix)]
  {
    if let Some(parent) = parent {
      let directory = File::open(parent)?;
      directory.sync_all()?;
    }
  }

  #[cfg(not(unix))]
  {
    let _ = parent;
  }

  Ok(())
}

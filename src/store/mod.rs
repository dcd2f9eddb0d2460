//! Record-graph accessor abstraction.
//!
//! A store is reachable only through an accessor; reads and writes go
//! through a transactional session. The storage technology itself stays an
//! external collaborator behind [`StoreProvider`].

pub mod file_store;

pub use file_store::{FileStore, FileStoreProvider};

use crate::error::Result;
use crate::record::{Record, RecordId};
use crate::schema::Schema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreKind {
  Local,
  Replicated,
}

impl std::fmt::Display for StoreKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let value = match self {
      StoreKind::Local => "local",
      StoreKind::Replicated => "replicated",
    };
    write!(f, "{value}")
  }
}

/// Extra options passed through to the storage technology.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOptions {
  pub read_only: bool,
  #[serde(default)]
  pub extra: BTreeMap<String, String>,
}

/// Passive configuration naming one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDescriptor {
  pub location: PathBuf,
  pub kind: StoreKind,
  pub options: StoreOptions,
}

impl StoreDescriptor {
  pub fn new(location: impl Into<PathBuf>, kind: StoreKind) -> Self {
    Self {
      location: location.into(),
      kind,
      options: StoreOptions::default(),
    }
  }

  pub fn with_options(mut self, options: StoreOptions) -> Self {
    self.options = options;
    self
  }

  pub fn is_replicated(&self) -> bool {
    self.kind == StoreKind::Replicated
  }
}

/// Transactional read/write view over one store.
///
/// Mutations are buffered in the session; `save` validates the graph
/// invariant (every required relationship resolves to an existing target)
/// and commits atomically, or commits nothing.
pub trait StoreSession: Send {
  /// Ids of all records of `type_name`, in stable sorted order.
  fn ids_of(&self, type_name: &str) -> Vec<RecordId>;

  fn get(&self, id: &RecordId) -> Option<Record>;

  fn contains(&self, id: &RecordId) -> bool;

  fn put(&mut self, record: Record) -> Result<()>;

  fn delete(&mut self, id: &RecordId) -> Result<()>;

  fn save(&mut self) -> Result<()>;

  /// Discards buffered mutations.
  fn rollback(&mut self);
}

/// Handle on one open store.
pub trait StoreAccessor: Send + Sync {
  fn descriptor(&self) -> &StoreDescriptor;

  fn schema(&self) -> &Arc<Schema>;

  fn session(&self) -> Result<Box<dyn StoreSession + '_>>;

  fn is_empty(&self) -> bool;

  fn record_count(&self, type_name: &str) -> usize;

  /// Number of successful session commits since the accessor was opened.
  fn commit_count(&self) -> u64;

  /// Toggles write rejection (used while exclusive write access is
  /// contested).
  fn set_read_only(&self, read_only: bool);

  fn close(&self) -> Result<()>;
}

/// Seam keeping the storage technology external: opens, destroys and
/// (optionally) natively migrates stores described by descriptors.
pub trait StoreProvider: Send + Sync {
  fn open(&self, descriptor: &StoreDescriptor) -> Result<Arc<dyn StoreAccessor>>;

  fn destroy(&self, descriptor: &StoreDescriptor) -> Result<()>;

  fn exists(&self, descriptor: &StoreDescriptor) -> bool;

  /// Native store-technology migration, used by the `Platform` strategy.
  /// The default refuses, forcing callers onto `CopyEntities`.
  fn migrate(&self, source: &StoreDescriptor, destination: &StoreDescriptor) -> Result<()> {
    let _ = (source, destination);
    Err(crate::error::TideError::Internal(
      "store provider does not support platform migration".to_string(),
    ))
  }
}

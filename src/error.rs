//! Error taxonomy shared across the crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TideError>;

#[derive(Debug, Error)]
pub enum TideError {
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("serialization error: {0}")]
  Serialization(String),

  #[error("schema error: {0}")]
  Schema(String),

  #[error("failed to open store: {0}")]
  StoreOpen(String),

  #[error("failed to clear store: {0}")]
  StoreClear(String),

  #[error("failed to create store path: {0}")]
  PathCreation(String),

  #[error("store constraint violated: {0}")]
  Constraint(String),

  #[error("store is read-only")]
  ReadOnly,

  #[error("migration of type '{type_name}' failed in batch {batch}: {message}")]
  Migration {
    type_name: String,
    batch: usize,
    message: String,
  },

  #[error("exclusive access held by {holder_id} ({holder_name})")]
  NoExclusiveAccess {
    holder_id: String,
    holder_name: String,
  },

  #[error("no replicated container available")]
  NoAccount,

  #[error("failed to import replicated changes: {0}")]
  Import(String),

  #[error("internal error: {0}")]
  Internal(String),
}

impl TideError {
  /// True for local filesystem hiccups worth one automatic retry.
  pub fn is_transient(&self) -> bool {
    matches!(
      self,
      TideError::PathCreation(_) | TideError::StoreClear(_) | TideError::Io(_)
    )
  }
}

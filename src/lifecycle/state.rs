//! Lifecycle states of the store manager.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Exactly one state holds at any observation instant; all transitions run
/// on the manager's single execution queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StoreState {
  #[default]
  Unloaded,
  LoadingLocal,
  LoadingReplicated,
  ActiveLocal,
  ActiveReplicated,
  SeedingReplicated,
  Degraded,
}

impl StoreState {
  /// True when an accessor is available to the consumer.
  pub fn is_active(&self) -> bool {
    matches!(self, StoreState::ActiveLocal | StoreState::ActiveReplicated)
  }

  pub fn is_replicated(&self) -> bool {
    matches!(
      self,
      StoreState::LoadingReplicated | StoreState::SeedingReplicated | StoreState::ActiveReplicated
    )
  }
}

impl fmt::Display for StoreState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let value = match self {
      StoreState::Unloaded => "unloaded",
      StoreState::LoadingLocal => "loading-local",
      StoreState::LoadingReplicated => "loading-replicated",
      StoreState::ActiveLocal => "active-local",
      StoreState::ActiveReplicated => "active-replicated",
      StoreState::SeedingReplicated => "seeding-replicated",
      StoreState::Degraded => "degraded",
    };
    write!(f, "{value}")
  }
}

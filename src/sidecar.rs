//! Control-state sidecar persisted beside the local store.
//!
//! Holds the bits that must survive a process restart: whether replication
//! is enabled, whether the replicated store has ever been seeded, and the
//! last corruption marker.

use crate::error::{Result, TideError};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const SIDECAR_ENVELOPE_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlState {
  #[serde(default)]
  pub replication_enabled: bool,
  /// Set once the replicated store has been seeded from local data; cleared
  /// when the replicated store is destroyed.
  #[serde(default)]
  pub replicated_seeded: bool,
  /// Human-readable marker left by the last unhandled corruption report.
  #[serde(default)]
  pub last_corruption: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SidecarEnvelope {
  version: u32,
  state: ControlState,
}

/// Atomic load/store of [`ControlState`] at a fixed path.
#[derive(Debug, Clone)]
pub struct ControlSidecar {
  path: PathBuf,
}

impl ControlSidecar {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Missing file yields the default state.
  pub fn load(&self) -> Result<ControlState> {
    if !self.path.exists() {
      return Ok(ControlState::default());
    }
    let bytes = fs::read(&self.path)?;
    let envelope: SidecarEnvelope = serde_json::from_slice(&bytes)
      .map_err(|error| TideError::Serialization(format!("decode control sidecar: {error}")))?;
    if envelope.version != SIDECAR_ENVELOPE_VERSION {
      return Err(TideError::Serialization(format!(
        "unsupported control sidecar version {}",
        envelope.version
      )));
    }
    Ok(envelope.state)
  }

  pub fn store(&self, state: &ControlState) -> Result<()> {
    let envelope = SidecarEnvelope {
      version: SIDECAR_ENVELOPE_VERSION,
      state: state.clone(),
    };
    let bytes = serde_json::to_vec(&envelope)
      .map_err(|error| TideError::Serialization(format!("encode control sidecar: {error}")))?;

    if let Some(parent) = self.path.parent() {
      fs::create_dir_all(parent)
        .map_err(|error| TideError::PathCreation(format!("{}: {error}", parent.display())))?;
    }

    let temp_path = self.path.with_extension("json.tmp");
    let mut temp_file = OpenOptions::new()
      .create(true)
      .truncate(true)
      .write(true)
      .open(&temp_path)?;
    temp_file.write_all(&bytes)?;
    temp_file.sync_all()?;
    fs::rename(&temp_path, &self.path)?;
    sync_parent_dir(self.path.parent())?;
    Ok(())
  }
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

//! Peer coordination token: an atomically-claimable marker in a shared
//! namespace signaling which device currently holds exclusive write access
//! to the replicated store.
//!
//! The namespace is only eventually consistent from the callers' point of
//! view; reads may be stale. Contested claims resolve last-writer-wins,
//! which can only cause a temporary fallback to the local store, never data
//! loss. Callers must re-validate ownership after an apparent grant.

use crate::error::{Result, TideError};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const TOKEN_FILE_NAME: &str = "peer-token.json";
const TOKEN_LOCK_FILE_NAME: &str = "peer-token.lock";
const TOKEN_ENVELOPE_VERSION: u32 = 1;

/// Identity a device presents when claiming the token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
  pub device_id: String,
  pub device_name: String,
}

impl DeviceIdentity {
  pub fn new(device_id: impl Into<String>, device_name: impl Into<String>) -> Self {
    Self {
      device_id: device_id.into(),
      device_name: device_name.into(),
    }
  }
}

/// The claim marker as stored in the shared namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
  pub device_id: String,
  pub device_name: String,
  /// Milliseconds since the unix epoch; a token past this instant is stale
  /// and may be overwritten.
  pub expires_at_ms: u64,
}

impl AccessToken {
  pub fn is_expired(&self, now_ms: u64) -> bool {
    self.expires_at_ms <= now_ms
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenEnvelope {
  version: u32,
  token: Option<AccessToken>,
}

/// Outcome of a claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
  Granted,
  Denied {
    holder_id: String,
    holder_name: String,
  },
}

/// Abstraction over the shared token namespace.
pub trait TokenNamespace: Send + Sync {
  /// Atomic claim attempt. Expired or own tokens are overwritten.
  fn acquire(&self, device: &DeviceIdentity, ttl: Duration) -> Result<Claim>;

  /// Re-asserts ownership before expiry. Fails if another device has taken
  /// the token in the meantime.
  fn refresh(&self, device: &DeviceIdentity, ttl: Duration) -> Result<Claim>;

  /// Best-effort clear; a no-op when the token was already overwritten by
  /// another device.
  fn release(&self, device: &DeviceIdentity) -> Result<()>;

  /// Possibly stale view of the current holder.
  fn current_holder(&self) -> Result<Option<AccessToken>>;
}

/// Token namespace backed by a locked JSON file inside the replicated
/// container.
pub struct FileTokenNamespace {
  directory: PathBuf,
}

impl FileTokenNamespace {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    Self {
      directory: directory.into(),
    }
  }

  fn token_path(&self) -> PathBuf {
    self.directory.join(TOKEN_FILE_NAME)
  }

  fn with_namespace_lock<T>(&self, action: impl FnOnce() -> Result<T>) -> Result<T> {
    fs::create_dir_all(&self.directory)
      .map_err(|error| TideError::PathCreation(format!("{}: {error}", self.directory.display())))?;
    let lock_path = self.directory.join(TOKEN_LOCK_FILE_NAME);
    let lock_file = OpenOptions::new()
      .create(true)
      .truncate(false)
      .write(true)
      .open(&lock_path)?;
    lock_file.lock_exclusive()?;
    let result = action();
    let _ = fs2::FileExt::unlock(&lock_file);
    result
  }

  fn read_token(&self) -> Result<Option<AccessToken>> {
    let path = self.token_path();
    if !path.exists() {
      return Ok(None);
    }
    let bytes = fs::read(&path)?;
    let envelope: TokenEnvelope = serde_json::from_slice(&bytes)
      .map_err(|error| TideError::Serialization(format!("decode peer token: {error}")))?;
    if envelope.version != TOKEN_ENVELOPE_VERSION {
      return Err(TideError::Serialization(format!(
        "unsupported peer token version {}",
        envelope.version
      )));
    }
    Ok(envelope.token)
  }

  fn write_token(&self, token: Option<AccessToken>) -> Result<()> {
    let envelope = TokenEnvelope {
      version: TOKEN_ENVELOPE_VERSION,
      token,
    };
    let bytes = serde_json::to_vec(&envelope)
      .map_err(|error| TideError::Serialization(format!("encode peer token: {error}")))?;

    let path = self.token_path();
    let temp_path = path.with_extension("json.tmp");
    let mut temp_file = OpenOptions::new()
      .create(true)
      .truncate(true)
      .write(true)
      .open(&temp_path)?;
    temp_file.write_all(&bytes)?;
    temp_file.sync_all()?;
    fs::rename(&temp_path, &path)?;
    sync_parent_dir(path.parent())?;
    Ok(())
  }
}

impl TokenNamespace for FileTokenNamespace {
  fn acquire(&self, device: &DeviceIdentity, ttl: Duration) -> Result<Claim> {
    self.with_namespace_lock(|| {
      let now = now_ms();
      if let Some(existing) = self.read_token()? {
        if existing.device_id != device.device_id && !existing.is_expired(now) {
          return Ok(Claim::Denied {
            holder_id: existing.device_id,
            holder_name: existing.device_name,
          });
        }
      }
      self.write_token(Some(AccessToken {
        device_id: device.device_id.clone(),
        device_name: device.device_name.clone(),
        expires_at_ms: now.saturating_add(ttl.as_millis() as u64),
      }))?;
      Ok(Claim::Granted)
    })
  }

  fn refresh(&self, device: &DeviceIdentity, ttl: Duration) -> Result<Claim> {
    self.with_namespace_lock(|| {
      let now = now_ms();
      match self.read_token()? {
        Some(existing) if existing.device_id != device.device_id && !existing.is_expired(now) => {
          Ok(Claim::Denied {
            holder_id: existing.device_id,
            holder_name: existing.device_name,
          })
        }
        _ => {
          self.write_token(Some(AccessToken {
            device_id: device.device_id.clone(),
            device_name: device.device_name.clone(),
            expires_at_ms: now.saturating_add(ttl.as_millis() as u64),
          }))?;
          Ok(Claim::Granted)
        }
      }
    })
  }

  fn release(&self, device: &DeviceIdentity) -> Result<()> {
    self.with_namespace_lock(|| {
      match self.read_token()? {
        Some(existing) if existing.device_id == device.device_id => self.write_token(None),
        // Already overwritten or absent; nothing to clear.
        _ => Ok(()),
      }
    })
  }

  fn current_holder(&self) -> Result<Option<AccessToken>> {
    let now = now_ms();
    Ok(
      self
        .read_token()?
        .filter(|token| !token.is_expired(now)),
    )
  }
}

pub(crate) fn now_ms() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|elapsed| elapsed.as_millis() as u64)
    .unwrap_or(0)
}

fn sync_parent_dir(parent: Option<&Path>) -> Result<()> {
  #[cfg(unix)]
  {
    if let Some(parent) = parent {
      let directory = fs::File::open(parent)?;
      directory.sync_all()?;
    }
  }

  #[cfg(not(unix))]
  {
    let _ = parent;
  }

  Ok(())
}

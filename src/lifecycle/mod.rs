//! Store lifecycle manager: owns the active accessor, runs the load/switch/
//! recover state machine on a single execution queue, and drives the
//! migration engine on switchover.

pub mod state;
mod worker;

pub use state::StoreState;

use crate::error::{Result, TideError};
use crate::record::{Record, RecordId};
use crate::schema::Schema;
use crate::store::{StoreAccessor, StoreDescriptor, StoreKind, StoreOptions, StoreProvider, StoreSession};
use crate::token::DeviceIdentity;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// How the manager moves data across stores on switchover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStrategy {
  /// Drive the migration engine type-by-type over the whole schema.
  CopyEntities,
  /// Delegate to the store technology's own migration, where trusted.
  Platform,
  /// Delegate entirely to the consumer's `manual_migrate` callback.
  Manual,
  /// Discard the source; start the destination empty.
  None,
}

/// How the manager avoids multi-device write desyncs on the replicated
/// store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesyncStrategy {
  /// Fail the transition on token contention; stay on the local store.
  ExclusiveAccess,
  /// Proceed to the replicated store but reject writes until the token is
  /// free.
  ExclusiveWriteAccess,
  /// On contention, migrate replicated data down into the local store and
  /// proceed local with full read-write, sacrificing sync.
  ExclusiveOrMigrateToLocal,
  /// Skip the claim; desyncs surface only via later corruption detection.
  None,
}

/// What the manager does when corruption or desync goes unhandled by the
/// consumer. There is deliberately no default: the consumer always states a
/// policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPolicy {
  /// Take the replicated store out of service and reload the local store.
  FallBackToLocal,
  /// Recreate the replicated store from the surviving replicated data,
  /// falling back to local data when it is unusable.
  RebuildFromReplicated,
  /// Unload everything; only an explicit reload escapes.
  Degrade,
}

/// Failure categories surfaced to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
  NoAccount,
  DeleteStore,
  CreateStorePath,
  ClearStore,
  OpenLocalStore,
  OpenReplicatedStore,
  Migrate,
  ImportChanges,
  NoExclusiveAccess {
    holder_id: String,
    holder_name: String,
  },
}

/// One externally delivered batch of replicated changes.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
  pub upserts: Vec<Record>,
  pub deletes: Vec<RecordId>,
}

impl ChangeSet {
  pub fn len(&self) -> usize {
    self.upserts.len() + self.deletes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Observable manager events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
  /// The active accessor was swapped.
  StoreChanged { is_replicated: bool },
  /// An external change batch was merged into the active store.
  ImportedChanges { applied: usize },
}

/// Consumer callback surface. Every member has a default, so consumers
/// implement only what they care about; `manual_migrate` must be overridden
/// when the `Manual` migration strategy is configured.
///
/// Callbacks run on the manager's execution queue; do not call back into
/// blocking manager methods from them.
pub trait StoreDelegate: Send + Sync {
  fn will_load(&self, is_replicated: bool) {
    let _ = is_replicated;
  }

  fn did_load(&self, accessor: &Arc<dyn StoreAccessor>, is_replicated: bool) {
    let _ = (accessor, is_replicated);
  }

  fn failed_loading(&self, cause: &FailureCause, context: Option<&str>, was_replicated: bool) {
    let _ = (cause, context, was_replicated);
  }

  /// Return true to disable the manager's configured recovery policy for
  /// this corruption report.
  fn handle_corruption(&self, is_replicated: bool) -> bool {
    let _ = is_replicated;
    false
  }

  /// Merges an incoming change batch into the session the manager is about
  /// to save. The default applies upserts then deletes verbatim.
  fn merge_incoming_changes(
    &self,
    session: &mut dyn StoreSession,
    changes: &ChangeSet,
  ) -> Result<()> {
    for record in &changes.upserts {
      session.put(record.clone())?;
    }
    for id in &changes.deletes {
      session.delete(id)?;
    }
    Ok(())
  }

  fn manual_migrate(&self, old: &StoreDescriptor, new: &StoreDescriptor) -> Result<()> {
    let _ = (old, new);
    Err(TideError::Internal(
      "manual migration strategy configured without a manual_migrate delegate".to_string(),
    ))
  }

  fn log_message(&self, message: &str) {
    log::info!("{message}");
  }
}

/// No-op delegate for consumers that only watch the event stream.
pub struct DefaultDelegate;

impl StoreDelegate for DefaultDelegate {}

/// Configuration fixed at manager construction.
#[derive(Clone)]
pub struct ManagerConfig {
  pub content_name: String,
  pub schema: Arc<Schema>,
  pub local_dir: PathBuf,
  /// Shared container holding the replicated store and the peer-token
  /// namespace. `None` means no replicated account is available.
  pub replicated_container: Option<PathBuf>,
  pub store_options: StoreOptions,
  pub migration_strategy: MigrationStrategy,
  pub desync_strategy: DesyncStrategy,
  pub recovery_policy: RecoveryPolicy,
  pub seed_batch_size: usize,
  pub token_ttl: Duration,
  pub token_acquire_deadline: Duration,
  pub token_refresh_interval: Duration,
  pub device: DeviceIdentity,
}

impl ManagerConfig {
  pub fn new(
    content_name: impl Into<String>,
    schema: Arc<Schema>,
    local_dir: impl Into<PathBuf>,
    device: DeviceIdentity,
    recovery_policy: RecoveryPolicy,
  ) -> Self {
    Self {
      content_name: content_name.into(),
      schema,
      local_dir: local_dir.into(),
      replicated_container: None,
      store_options: StoreOptions::default(),
      migration_strategy: MigrationStrategy::CopyEntities,
      desync_strategy: DesyncStrategy::ExclusiveAccess,
      recovery_policy,
      seed_batch_size: 50,
      token_ttl: Duration::from_secs(60),
      token_acquire_deadline: Duration::from_secs(2),
      token_refresh_interval: Duration::from_secs(20),
      device,
    }
  }

  pub fn replicated_container(mut self, container: impl Into<PathBuf>) -> Self {
    self.replicated_container = Some(container.into());
    self
  }

  pub fn migration_strategy(mut self, strategy: MigrationStrategy) -> Self {
    self.migration_strategy = strategy;
    self
  }

  pub fn desync_strategy(mut self, strategy: DesyncStrategy) -> Self {
    self.desync_strategy = strategy;
    self
  }

  pub fn seed_batch_size(mut self, batch_size: usize) -> Self {
    self.seed_batch_size = batch_size;
    self
  }

  pub fn store_options(mut self, options: StoreOptions) -> Self {
    self.store_options = options;
    self
  }

  pub fn token_ttl(mut self, ttl: Duration) -> Self {
    self.token_ttl = ttl;
    self
  }

  pub fn token_acquire_deadline(mut self, deadline: Duration) -> Self {
    self.token_acquire_deadline = deadline;
    self
  }

  pub fn token_refresh_interval(mut self, interval: Duration) -> Self {
    self.token_refresh_interval = interval;
    self
  }

  pub fn local_descriptor(&self) -> StoreDescriptor {
    StoreDescriptor::new(
      self.local_dir.join(format!("{}.tide", self.content_name)),
      StoreKind::Local,
    )
    .with_options(self.store_options.clone())
  }

  pub fn replicated_descriptor(&self) -> Option<StoreDescriptor> {
    self.replicated_container.as_ref().map(|container| {
      StoreDescriptor::new(
        container.join(format!("{}.tide", self.content_name)),
        StoreKind::Replicated,
      )
      .with_options(self.store_options.clone())
    })
  }

  pub fn sidecar_path(&self) -> PathBuf {
    self.local_dir.join(format!("{}.state.json", self.content_name))
  }
}

#[derive(Debug)]
pub(crate) enum Command {
  SetReplicationEnabled(bool),
  Reload,
  ImportChanges(ChangeSet),
  SignalCorruption { is_replicated: bool },
  DeleteLocalStore,
  DeleteReplicatedStore,
  DeleteReplicatedContainer,
  MigrateReplicatedToLocal,
  RebuildReplicated { allow_from_local: bool },
  RefreshToken,
  Shutdown,
}

pub(crate) struct Envelope {
  pub command: Command,
  pub reply: Option<Sender<Result<()>>>,
}

pub(crate) struct SharedStatus {
  pub state: Mutex<StoreState>,
  pub active: Mutex<Option<Arc<dyn StoreAccessor>>>,
  pub replication_enabled: AtomicBool,
}

impl SharedStatus {
  fn new() -> Self {
    Self {
      state: Mutex::new(StoreState::Unloaded),
      active: Mutex::new(None),
      replication_enabled: AtomicBool::new(false),
    }
  }
}

/// Handle on the lifecycle worker. All operations are serialized onto the
/// worker's queue; the blocking variants wait for the transition (including
/// any seeding migration) to finish.
pub struct StoreManager {
  commands: Sender<Envelope>,
  status: Arc<SharedStatus>,
  events: Receiver<StoreEvent>,
  config: ManagerConfig,
  worker: Mutex<Option<JoinHandle<()>>>,
  ticker_stop: Sender<()>,
  ticker: Mutex<Option<JoinHandle<()>>>,
}

impl StoreManager {
  /// Spawns the execution queue and performs the initial load per the
  /// persisted replication-enabled flag.
  pub fn start(
    config: ManagerConfig,
    provider: Arc<dyn StoreProvider>,
    delegate: Arc<dyn StoreDelegate>,
  ) -> Result<Self> {
    if config.seed_batch_size == 0 {
      return Err(TideError::Internal("seed batch size must be at least 1".to_string()));
    }

    let (command_tx, command_rx) = unbounded::<Envelope>();
    let (event_tx, event_rx) = unbounded::<StoreEvent>();
    let status = Arc::new(SharedStatus::new());

    let worker = worker::Worker::new(
      config.clone(),
      provider,
      delegate,
      Arc::clone(&status),
      event_tx,
      command_rx,
    );
    let worker_handle = std::thread::Builder::new()
      .name("tidestore-lifecycle".to_string())
      .spawn(move || worker.run())
      .map_err(|error| TideError::Internal(format!("spawn lifecycle worker: {error}")))?;

    // Periodic token refresh, serialized through the same queue.
    let (ticker_stop_tx, ticker_stop_rx) = unbounded::<()>();
    let ticker_commands = command_tx.clone();
    let refresh_interval = config.token_refresh_interval;
    let ticker_handle = std::thread::Builder::new()
      .name("tidestore-token-refresh".to_string())
      .spawn(move || loop {
        match ticker_stop_rx.recv_timeout(refresh_interval) {
          Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
          Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
            let envelope = Envelope {
              command: Command::RefreshToken,
              reply: None,
            };
            if ticker_commands.send(envelope).is_err() {
              break;
            }
          }
        }
      })
      .map_err(|error| TideError::Internal(format!("spawn token refresh ticker: {error}")))?;

    Ok(Self {
      commands: command_tx,
      status,
      events: event_rx,
      config,
      worker: Mutex::new(Some(worker_handle)),
      ticker_stop: ticker_stop_tx,
      ticker: Mutex::new(Some(ticker_handle)),
    })
  }

  pub fn state(&self) -> StoreState {
    *self.status.state.lock()
  }

  /// The accessor the consumer may currently read and write, if any.
  pub fn active_store(&self) -> Option<Arc<dyn StoreAccessor>> {
    self.status.active.lock().clone()
  }

  pub fn replication_enabled(&self) -> bool {
    self.status.replication_enabled.load(Ordering::SeqCst)
  }

  /// Observable event stream; drain with `try_recv` or `recv_timeout`.
  pub fn events(&self) -> &Receiver<StoreEvent> {
    &self.events
  }

  pub fn local_descriptor(&self) -> StoreDescriptor {
    self.config.local_descriptor()
  }

  pub fn replicated_descriptor(&self) -> Option<StoreDescriptor> {
    self.config.replicated_descriptor()
  }

  /// Toggles replication and waits for the transition to settle. A failed
  /// switch to the replicated store falls back to the local store and still
  /// returns `Ok`; the delegate sees the failure cause.
  pub fn set_replication_enabled(&self, enabled: bool) -> Result<()> {
    self.execute(Command::SetReplicationEnabled(enabled))
  }

  /// Queues the toggle without waiting. A toggle queued while a seeding
  /// migration is in flight cancels it after the current batch commits.
  pub fn request_replication_enabled(&self, enabled: bool) {
    let _ = self.commands.send(Envelope {
      command: Command::SetReplicationEnabled(enabled),
      reply: None,
    });
  }

  /// Clears and re-opens the active store. The only way out of `Degraded`.
  pub fn reload(&self) -> Result<()> {
    self.execute(Command::Reload)
  }

  /// Merges an externally delivered replicated change batch into the active
  /// replicated store.
  pub fn import_changes(&self, changes: ChangeSet) -> Result<()> {
    self.execute(Command::ImportChanges(changes))
  }

  /// Reports externally detected store corruption.
  pub fn signal_corruption(&self, is_replicated: bool) -> Result<()> {
    self.execute(Command::SignalCorruption { is_replicated })
  }

  pub fn delete_local_store(&self) -> Result<()> {
    self.execute(Command::DeleteLocalStore)
  }

  /// Destroys the replicated store; the next enable reseeds it from local
  /// data.
  pub fn delete_replicated_store(&self) -> Result<()> {
    self.execute(Command::DeleteReplicatedStore)
  }

  /// Destroys the whole replicated container, including the peer-token
  /// namespace. Everything is recreated (and reseeded from local data) on
  /// the next enable.
  pub fn delete_replicated_container(&self) -> Result<()> {
    self.execute(Command::DeleteReplicatedContainer)
  }

  /// Brings replicated data down into a fresh local store, destroys the
  /// replicated copy and disables replication.
  pub fn migrate_replicated_to_local(&self) -> Result<()> {
    self.execute(Command::MigrateReplicatedToLocal)
  }

  /// Recreates the replicated store from the surviving replicated data;
  /// falls back to seeding from local data when allowed.
  pub fn rebuild_replicated(&self, allow_from_local: bool) -> Result<()> {
    self.execute(Command::RebuildReplicated { allow_from_local })
  }

  pub fn shutdown(&self) -> Result<()> {
    let result = self.execute(Command::Shutdown);
    let _ = self.ticker_stop.send(());
    if let Some(handle) = self.worker.lock().take() {
      let _ = handle.join();
    }
    if let Some(handle) = self.ticker.lock().take() {
      let _ = handle.join();
    }
    result
  }

  fn execute(&self, command: Command) -> Result<()> {
    let (reply_tx, reply_rx) = unbounded();
    self
      .commands
      .send(Envelope {
        command,
        reply: Some(reply_tx),
      })
      .map_err(|_| TideError::Internal("lifecycle worker is gone".to_string()))?;
    reply_rx
      .recv()
      .map_err(|_| TideError::Internal("lifecycle worker dropped the reply".to_string()))?
  }
}

impl Drop for StoreManager {
  fn drop(&mut self) {
    let _ = self.commands.send(Envelope {
      command: Command::Shutdown,
      reply: None,
    });
    let _ = self.ticker_stop.send(());
    if let Some(handle) = self.worker.lock().take() {
      let _ = handle.join();
    }
    if let Some(handle) = self.ticker.lock().take() {
      let _ = handle.join();
    }
  }
}

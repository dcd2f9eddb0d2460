use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tidestore::{
  ChangeSet, DefaultDelegate, DesyncStrategy, FailureCause, FileStore, FileStoreProvider,
  ManagerConfig, MigrationStrategy, Record, RecordId, RecoveryPolicy, Schema, StoreAccessor,
  StoreDelegate, StoreDescriptor, StoreEvent, StoreManager, StoreState, TideError, TypeDef, Value,
};
use tidestore::token::{DeviceIdentity, FileTokenNamespace, TokenNamespace};

fn item_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![TypeDef::new("Item").attribute("label")]).expect("schema"))
}

fn config(root: &Path, policy: RecoveryPolicy) -> ManagerConfig {
  ManagerConfig::new(
    "journal",
    item_schema(),
    root.join("local"),
    DeviceIdentity::new("a", "device a"),
    policy,
  )
  .replicated_container(root.join("container"))
  .seed_batch_size(10)
  .token_acquire_deadline(Duration::from_millis(100))
}

fn start_manager(config: &ManagerConfig, delegate: Arc<dyn StoreDelegate>) -> StoreManager {
  let provider = Arc::new(FileStoreProvider::new(Arc::clone(&config.schema)));
  StoreManager::start(config.clone(), provider, delegate).expect("start manager")
}

/// Writes `count` items into the (not yet managed) local store.
fn seed_local(config: &ManagerConfig, count: usize) {
  let store = FileStore::open(config.local_descriptor(), Arc::clone(&config.schema))
    .expect("open local store");
  let mut session = store.session().expect("session");
  for index in 0..count {
    session
      .put(
        Record::new(format!("item-{index:03}"), "Item")
          .with_attribute("label", Value::Text(format!("item {index}"))),
      )
      .expect("put");
  }
  session.save().expect("save");
}

fn put_active(manager: &StoreManager, id: &str) {
  let accessor = manager.active_store().expect("active store");
  let mut session = accessor.session().expect("session");
  session.put(Record::new(id, "Item")).expect("put");
  session.save().expect("save");
}

fn active_contains(manager: &StoreManager, id: &str) -> bool {
  let accessor = manager.active_store().expect("active store");
  let session = accessor.session().expect("session");
  session.contains(&RecordId::new(id))
}

fn wait_until(label: &str, mut predicate: impl FnMut() -> bool) {
  let deadline = Instant::now() + Duration::from_secs(5);
  while !predicate() {
    assert!(Instant::now() < deadline, "timed out waiting for {label}");
    thread::sleep(Duration::from_millis(10));
  }
}

/// Keeps the failure causes the manager reported.
struct RecordingDelegate {
  failures: Mutex<Vec<FailureCause>>,
}

impl RecordingDelegate {
  fn new() -> Arc<Self> {
    Arc::new(Self {
      failures: Mutex::new(Vec::new()),
    })
  }
}

impl StoreDelegate for RecordingDelegate {
  fn failed_loading(&self, cause: &FailureCause, _context: Option<&str>, _was_replicated: bool) {
    self.failures.lock().push(cause.clone());
  }

  fn log_message(&self, _message: &str) {}
}

#[test]
fn enabling_replication_seeds_from_local_in_batches() {
  let root = tempfile::tempdir().expect("tempdir");
  let config = config(root.path(), RecoveryPolicy::FallBackToLocal);
  seed_local(&config, 100);

  let manager = start_manager(&config, Arc::new(DefaultDelegate));
  manager.set_replication_enabled(true).expect("enable");

  assert_eq!(manager.state(), StoreState::ActiveReplicated);
  assert!(manager.replication_enabled());

  let active = manager.active_store().expect("active store");
  assert!(active.descriptor().is_replicated());
  assert_eq!(active.record_count("Item"), 100);
  // 100 records at a seed batch size of 10: one commit per batch.
  assert_eq!(active.commit_count(), 10);

  let events = manager.events();
  assert_eq!(
    events.recv_timeout(Duration::from_secs(5)).expect("first event"),
    StoreEvent::StoreChanged {
      is_replicated: false
    }
  );
  assert_eq!(
    events.recv_timeout(Duration::from_secs(5)).expect("second event"),
    StoreEvent::StoreChanged { is_replicated: true }
  );

  // Seeding reads the local store without touching it.
  let local = FileStore::open(config.local_descriptor(), Arc::clone(&config.schema))
    .expect("reopen local");
  assert_eq!(local.record_count("Item"), 100);
  manager.shutdown().expect("shutdown");
}

#[test]
fn enabling_with_no_local_data_activates_empty_replicated() {
  let root = tempfile::tempdir().expect("tempdir");
  let config = config(root.path(), RecoveryPolicy::FallBackToLocal);

  let manager = start_manager(&config, Arc::new(DefaultDelegate));
  manager.set_replication_enabled(true).expect("enable");

  assert_eq!(manager.state(), StoreState::ActiveReplicated);
  let active = manager.active_store().expect("active store");
  assert!(active.is_empty());
  assert_eq!(active.commit_count(), 0);
  manager.shutdown().expect("shutdown");
}

#[test]
fn replication_flag_survives_restart() {
  let root = tempfile::tempdir().expect("tempdir");
  let config = config(root.path(), RecoveryPolicy::FallBackToLocal);
  seed_local(&config, 5);

  {
    let manager = start_manager(&config, Arc::new(DefaultDelegate));
    manager.set_replication_enabled(true).expect("enable");
    put_active(&manager, "written-before-restart");
    manager.shutdown().expect("shutdown");
  }

  let manager = start_manager(&config, Arc::new(DefaultDelegate));
  wait_until("replicated store after restart", || {
    manager.state() == StoreState::ActiveReplicated
  });
  assert!(manager.replication_enabled());
  assert!(active_contains(&manager, "written-before-restart"));
  manager.shutdown().expect("shutdown");
}

/// Blocks the replicated load until the test releases it, so commands queued
/// in the meantime are provably in the channel before the first seeding
/// batch runs.
struct GateDelegate {
  gate: crossbeam_channel::Receiver<()>,
}

impl StoreDelegate for GateDelegate {
  fn will_load(&self, is_replicated: bool) {
    if is_replicated {
      let _ = self.gate.recv();
    }
  }

  fn log_message(&self, _message: &str) {}
}

#[test]
fn queued_disable_cancels_seeding_after_current_batch() {
  let root = tempfile::tempdir().expect("tempdir");
  let config = config(root.path(), RecoveryPolicy::FallBackToLocal);
  seed_local(&config, 30);

  let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
  let manager = start_manager(&config, Arc::new(GateDelegate { gate: gate_rx }));

  manager.request_replication_enabled(true);
  manager.request_replication_enabled(false);
  gate_tx.send(()).expect("open gate");

  // Settle: a final no-op disable serialized behind the cancelled seeding.
  manager.set_replication_enabled(false).expect("settle");

  assert_eq!(manager.state(), StoreState::ActiveLocal);
  assert!(!manager.replication_enabled());

  // Exactly the batch in flight at cancellation time was committed.
  let replicated_descriptor = config.replicated_descriptor().expect("descriptor");
  let replicated = FileStore::open(replicated_descriptor, Arc::clone(&config.schema))
    .expect("open replicated");
  assert_eq!(replicated.record_count("Item"), 10);
  manager.shutdown().expect("shutdown");
}

#[test]
fn contested_token_keeps_local_under_exclusive_access() {
  let root = tempfile::tempdir().expect("tempdir");
  let config = config(root.path(), RecoveryPolicy::FallBackToLocal);
  seed_local(&config, 3);

  let peer = DeviceIdentity::new("b", "device b");
  let namespace = FileTokenNamespace::new(root.path().join("container").join("peers"));
  namespace
    .acquire(&peer, Duration::from_secs(60))
    .expect("peer claim");

  let delegate = RecordingDelegate::new();
  let manager = start_manager(&config, delegate.clone());
  manager.set_replication_enabled(true).expect("enable");

  assert_eq!(manager.state(), StoreState::ActiveLocal);
  assert!(manager.replication_enabled(), "the intent to replicate is kept");
  assert_eq!(manager.active_store().expect("active").record_count("Item"), 3);

  let failures = delegate.failures.lock();
  assert!(
    failures.iter().any(|cause| matches!(
      cause,
      FailureCause::NoExclusiveAccess { holder_id, holder_name }
        if holder_id == "b" && holder_name == "device b"
    )),
    "expected a contention failure, got {failures:?}"
  );
  drop(failures);

  // The replicated store was never created, let alone seeded.
  let replicated_descriptor = config.replicated_descriptor().expect("descriptor");
  assert!(!replicated_descriptor.location.exists());
  manager.shutdown().expect("shutdown");
}

#[test]
fn contested_token_blocks_writes_under_exclusive_write_access() {
  let root = tempfile::tempdir().expect("tempdir");
  let config = config(root.path(), RecoveryPolicy::FallBackToLocal)
    .desync_strategy(DesyncStrategy::ExclusiveWriteAccess)
    .token_refresh_interval(Duration::from_millis(50));

  // A non-empty replicated store: no seeding is needed, only access.
  let replicated_descriptor = config.replicated_descriptor().expect("descriptor");
  {
    let store = FileStore::open(replicated_descriptor, Arc::clone(&config.schema))
      .expect("open replicated");
    let mut session = store.session().expect("session");
    session.put(Record::new("shared-item", "Item")).expect("put");
    session.save().expect("save");
  }

  let peer = DeviceIdentity::new("b", "device b");
  let namespace = FileTokenNamespace::new(root.path().join("container").join("peers"));
  namespace
    .acquire(&peer, Duration::from_secs(60))
    .expect("peer claim");

  let manager = start_manager(&config, Arc::new(DefaultDelegate));
  manager.set_replication_enabled(true).expect("enable");
  assert_eq!(manager.state(), StoreState::ActiveReplicated);

  // Local writes are rejected while the peer holds the token.
  {
    let accessor = manager.active_store().expect("active");
    let mut session = accessor.session().expect("session");
    let err = session
      .put(Record::new("local-write", "Item"))
      .expect_err("write must be rejected");
    assert!(matches!(err, TideError::ReadOnly), "got {err}");
  }

  // Incoming replicated changes are not local writes; they still apply.
  manager
    .import_changes(ChangeSet {
      upserts: vec![Record::new("incoming", "Item")],
      deletes: Vec::new(),
    })
    .expect("import");
  assert!(active_contains(&manager, "incoming"));

  namespace.release(&peer).expect("peer release");
  wait_until("writes to unblock after the peer released", || {
    let accessor = manager.active_store().expect("active");
    let mut session = accessor.session().expect("session");
    session.put(Record::new("local-write", "Item")).is_ok()
  });
  put_active(&manager, "local-write");
  assert!(active_contains(&manager, "local-write"));
  manager.shutdown().expect("shutdown");
}

#[test]
fn replicated_corruption_falls_back_to_local() {
  let root = tempfile::tempdir().expect("tempdir");
  let config = config(root.path(), RecoveryPolicy::FallBackToLocal);
  seed_local(&config, 5);

  let manager = start_manager(&config, Arc::new(DefaultDelegate));
  manager.set_replication_enabled(true).expect("enable");
  assert_eq!(manager.state(), StoreState::ActiveReplicated);

  manager.signal_corruption(true).expect("signal");
  assert_eq!(manager.state(), StoreState::ActiveLocal);
  assert!(!manager.replication_enabled());
  manager.shutdown().expect("shutdown");

  // The fallback is durable.
  let manager = start_manager(&config, Arc::new(DefaultDelegate));
  manager.reload().expect("reload");
  assert_eq!(manager.state(), StoreState::ActiveLocal);
  assert!(!manager.replication_enabled());
  manager.shutdown().expect("shutdown");
}

#[test]
fn degrade_policy_requires_explicit_reload() {
  let root = tempfile::tempdir().expect("tempdir");
  let config = config(root.path(), RecoveryPolicy::Degrade);
  seed_local(&config, 5);

  let manager = start_manager(&config, Arc::new(DefaultDelegate));
  manager.set_replication_enabled(true).expect("enable");

  manager.signal_corruption(true).expect("signal");
  assert_eq!(manager.state(), StoreState::Degraded);
  assert!(manager.active_store().is_none());

  manager.reload().expect("reload");
  assert_eq!(manager.state(), StoreState::ActiveReplicated);
  assert_eq!(manager.active_store().expect("active").record_count("Item"), 5);
  manager.shutdown().expect("shutdown");
}

#[test]
fn local_corruption_degrades_until_reload() {
  let root = tempfile::tempdir().expect("tempdir");
  let config = config(root.path(), RecoveryPolicy::FallBackToLocal);
  seed_local(&config, 2);

  let manager = start_manager(&config, Arc::new(DefaultDelegate));
  manager.reload().expect("settle");
  assert_eq!(manager.state(), StoreState::ActiveLocal);

  manager.signal_corruption(false).expect("signal");
  assert_eq!(manager.state(), StoreState::Degraded);

  manager.reload().expect("reload");
  assert_eq!(manager.state(), StoreState::ActiveLocal);
  manager.shutdown().expect("shutdown");
}

#[test]
fn replication_toggle_does_not_escape_degraded() {
  let root = tempfile::tempdir().expect("tempdir");
  let config = config(root.path(), RecoveryPolicy::FallBackToLocal);
  seed_local(&config, 2);

  let manager = start_manager(&config, Arc::new(DefaultDelegate));
  manager.reload().expect("settle");
  manager.signal_corruption(false).expect("signal");
  assert_eq!(manager.state(), StoreState::Degraded);

  // The flag is persisted, but only a reload leaves Degraded.
  manager.set_replication_enabled(false).expect("disable");
  assert_eq!(manager.state(), StoreState::Degraded);
  manager.set_replication_enabled(true).expect("enable");
  assert_eq!(manager.state(), StoreState::Degraded);
  assert!(manager.replication_enabled());

  manager.reload().expect("reload");
  assert_eq!(manager.state(), StoreState::ActiveReplicated);
  manager.shutdown().expect("shutdown");
}

#[test]
fn contention_migrates_replicated_data_down_when_configured() {
  let root = tempfile::tempdir().expect("tempdir");
  let config = config(root.path(), RecoveryPolicy::FallBackToLocal)
    .desync_strategy(DesyncStrategy::ExclusiveOrMigrateToLocal);
  seed_local(&config, 2);

  // The replicated store carries data another device wrote.
  {
    let store = FileStore::open(
      config.replicated_descriptor().expect("descriptor"),
      Arc::clone(&config.schema),
    )
    .expect("open replicated");
    let mut session = store.session().expect("session");
    session.put(Record::new("shared-item", "Item")).expect("put");
    session.save().expect("save");
  }

  let peer = DeviceIdentity::new("b", "device b");
  let namespace = FileTokenNamespace::new(root.path().join("container").join("peers"));
  namespace
    .acquire(&peer, Duration::from_secs(60))
    .expect("peer claim");

  let manager = start_manager(&config, Arc::new(DefaultDelegate));
  manager.set_replication_enabled(true).expect("enable");

  // Sync is sacrificed; the shared data is not.
  assert_eq!(manager.state(), StoreState::ActiveLocal);
  assert!(!manager.replication_enabled());
  let active = manager.active_store().expect("active");
  assert_eq!(active.record_count("Item"), 3);
  assert!(active_contains(&manager, "shared-item"));
  manager.shutdown().expect("shutdown");
}

/// Seeds by file copy and remembers that it ran.
struct ManualMigrateDelegate {
  ran: AtomicBool,
}

impl StoreDelegate for ManualMigrateDelegate {
  fn manual_migrate(
    &self,
    old: &StoreDescriptor,
    new: &StoreDescriptor,
  ) -> tidestore::Result<()> {
    std::fs::copy(&old.location, &new.location)?;
    self.ran.store(true, Ordering::SeqCst);
    Ok(())
  }

  fn log_message(&self, _message: &str) {}
}

#[test]
fn manual_strategy_seeds_through_the_delegate() {
  let root = tempfile::tempdir().expect("tempdir");
  let config = config(root.path(), RecoveryPolicy::FallBackToLocal)
    .migration_strategy(MigrationStrategy::Manual);
  seed_local(&config, 4);

  let delegate = Arc::new(ManualMigrateDelegate {
    ran: AtomicBool::new(false),
  });
  let manager = start_manager(&config, delegate.clone());
  manager.set_replication_enabled(true).expect("enable");

  assert_eq!(manager.state(), StoreState::ActiveReplicated);
  assert!(delegate.ran.load(Ordering::SeqCst));
  assert_eq!(manager.active_store().expect("active").record_count("Item"), 4);
  manager.shutdown().expect("shutdown");
}

#[test]
fn platform_strategy_seeds_through_the_provider() {
  let root = tempfile::tempdir().expect("tempdir");
  let config = config(root.path(), RecoveryPolicy::FallBackToLocal)
    .migration_strategy(MigrationStrategy::Platform);
  seed_local(&config, 4);

  let manager = start_manager(&config, Arc::new(DefaultDelegate));
  manager.set_replication_enabled(true).expect("enable");

  assert_eq!(manager.state(), StoreState::ActiveReplicated);
  assert_eq!(manager.active_store().expect("active").record_count("Item"), 4);
  manager.shutdown().expect("shutdown");
}

#[test]
fn delete_replicated_container_removes_token_namespace_too() {
  let root = tempfile::tempdir().expect("tempdir");
  let config = config(root.path(), RecoveryPolicy::FallBackToLocal);
  seed_local(&config, 3);

  let manager = start_manager(&config, Arc::new(DefaultDelegate));
  manager.set_replication_enabled(true).expect("enable");
  let container = root.path().join("container");
  assert!(container.join("peers").exists(), "token namespace lives in the container");

  manager.set_replication_enabled(false).expect("disable");
  manager.delete_replicated_container().expect("delete container");

  assert!(!container.exists());
  assert_eq!(manager.state(), StoreState::ActiveLocal);

  // The next enable recreates and reseeds everything.
  manager.set_replication_enabled(true).expect("re-enable");
  assert_eq!(manager.state(), StoreState::ActiveReplicated);
  assert_eq!(manager.active_store().expect("active").record_count("Item"), 3);
  assert!(container.join("peers").exists());
  manager.shutdown().expect("shutdown");
}

#[test]
fn delete_replicated_store_reseeds_from_local() {
  let root = tempfile::tempdir().expect("tempdir");
  let config = config(root.path(), RecoveryPolicy::FallBackToLocal);
  seed_local(&config, 5);

  let manager = start_manager(&config, Arc::new(DefaultDelegate));
  manager.set_replication_enabled(true).expect("enable");
  put_active(&manager, "only-replicated");

  manager.delete_replicated_store().expect("delete");

  assert_eq!(manager.state(), StoreState::ActiveReplicated);
  let active = manager.active_store().expect("active");
  assert_eq!(active.record_count("Item"), 5);
  assert!(!active_contains(&manager, "only-replicated"));
  manager.shutdown().expect("shutdown");
}

#[test]
fn migrate_replicated_to_local_brings_data_down() {
  let root = tempfile::tempdir().expect("tempdir");
  let config = config(root.path(), RecoveryPolicy::FallBackToLocal);
  seed_local(&config, 3);

  let manager = start_manager(&config, Arc::new(DefaultDelegate));
  manager.set_replication_enabled(true).expect("enable");
  put_active(&manager, "from-replica");

  manager.migrate_replicated_to_local().expect("migrate down");

  assert_eq!(manager.state(), StoreState::ActiveLocal);
  assert!(!manager.replication_enabled());
  let active = manager.active_store().expect("active");
  assert_eq!(active.record_count("Item"), 4);
  assert!(active_contains(&manager, "from-replica"));

  let replicated_descriptor = config.replicated_descriptor().expect("descriptor");
  assert!(!replicated_descriptor.location.exists());
  manager.shutdown().expect("shutdown");
}

#[test]
fn rebuild_preserves_surviving_replicated_data() {
  let root = tempfile::tempdir().expect("tempdir");
  let config = config(root.path(), RecoveryPolicy::RebuildFromReplicated);
  seed_local(&config, 5);

  let manager = start_manager(&config, Arc::new(DefaultDelegate));
  manager.set_replication_enabled(true).expect("enable");
  put_active(&manager, "replica-extra");

  manager.rebuild_replicated(false).expect("rebuild");

  assert_eq!(manager.state(), StoreState::ActiveReplicated);
  assert!(manager.replication_enabled());
  let active = manager.active_store().expect("active");
  assert_eq!(active.record_count("Item"), 6);
  assert!(active_contains(&manager, "replica-extra"));

  // The merge landed in the local store too.
  let local = FileStore::open(config.local_descriptor(), Arc::clone(&config.schema))
    .expect("open local");
  assert_eq!(local.record_count("Item"), 6);
  manager.shutdown().expect("shutdown");
}

#[test]
fn import_requires_an_active_replicated_store() {
  let root = tempfile::tempdir().expect("tempdir");
  let config = config(root.path(), RecoveryPolicy::FallBackToLocal);

  let manager = start_manager(&config, Arc::new(DefaultDelegate));
  manager.reload().expect("settle");
  assert_eq!(manager.state(), StoreState::ActiveLocal);

  let err = manager
    .import_changes(ChangeSet {
      upserts: vec![Record::new("incoming", "Item")],
      deletes: Vec::new(),
    })
    .expect_err("import must fail on the local store");
  assert!(matches!(err, TideError::Import(_)), "got {err}");
  manager.shutdown().expect("shutdown");
}

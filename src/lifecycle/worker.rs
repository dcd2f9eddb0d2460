//! Lifecycle execution queue.
//!
//! One thread owns every transition, migration batch and change import.
//! Commands arrive over a channel; while a seeding migration is in flight
//! the queue is drained between batches so a disable/switch request cancels
//! the migration after the current batch commits.

use super::state::StoreState;
use super::{
  ChangeSet, Command, DesyncStrategy, Envelope, FailureCause, ManagerConfig, MigrationStrategy,
  RecoveryPolicy, SharedStatus, StoreDelegate, StoreEvent,
};
use crate::error::{Result, TideError};
use crate::migrate::MigrationEngine;
use crate::sidecar::{ControlSidecar, ControlState};
use crate::store::{StoreAccessor, StoreDescriptor, StoreProvider};
use crate::token::{Claim, FileTokenNamespace, TokenNamespace};
use crossbeam_channel::{Receiver, Sender};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

enum ReplicatedLoad {
  Replicated,
  FellBackToLocal,
}

pub(crate) struct Worker {
  config: ManagerConfig,
  provider: Arc<dyn StoreProvider>,
  delegate: Arc<dyn StoreDelegate>,
  status: Arc<SharedStatus>,
  events: Sender<StoreEvent>,
  rx: Receiver<Envelope>,
  pending: VecDeque<Envelope>,
  sidecar: ControlSidecar,
  control: ControlState,
  token_namespace: Option<FileTokenNamespace>,
  token_held: bool,
  writes_blocked: bool,
}

impl Worker {
  pub(crate) fn new(
    config: ManagerConfig,
    provider: Arc<dyn StoreProvider>,
    delegate: Arc<dyn StoreDelegate>,
    status: Arc<SharedStatus>,
    events: Sender<StoreEvent>,
    rx: Receiver<Envelope>,
  ) -> Self {
    let sidecar = ControlSidecar::new(config.sidecar_path());
    let token_namespace = config
      .replicated_container
      .as_ref()
      .map(|container| FileTokenNamespace::new(container.join("peers")));
    Self {
      config,
      provider,
      delegate,
      status,
      events,
      rx,
      pending: VecDeque::new(),
      sidecar,
      control: ControlState::default(),
      token_namespace,
      token_held: false,
      writes_blocked: false,
    }
  }

  pub(crate) fn run(mut self) {
    self.startup();
    loop {
      let envelope = match self.pending.pop_front() {
        Some(envelope) => envelope,
        None => match self.rx.recv() {
          Ok(envelope) => envelope,
          Err(_) => {
            self.shutdown_worker();
            return;
          }
        },
      };

      let is_shutdown = matches!(envelope.command, Command::Shutdown);
      let result = self.handle(envelope.command);
      if let Some(reply) = envelope.reply {
        let _ = reply.send(result);
      }

      if is_shutdown {
        while let Some(stale) = self.pending.pop_front() {
          if let Some(reply) = stale.reply {
            let _ = reply.send(Err(TideError::Internal("manager is shut down".to_string())));
          }
        }
        while let Ok(stale) = self.rx.try_recv() {
          if let Some(reply) = stale.reply {
            let _ = reply.send(Err(TideError::Internal("manager is shut down".to_string())));
          }
        }
        return;
      }
    }
  }

  fn startup(&mut self) {
    match self.sidecar.load() {
      Ok(state) => self.control = state,
      Err(error) => {
        self.log(&format!("control sidecar unreadable, using defaults: {error}"));
      }
    }
    self
      .status
      .replication_enabled
      .store(self.control.replication_enabled, Ordering::SeqCst);

    if self.control.replication_enabled {
      self.load_replicated();
    } else {
      self.load_local();
    }
  }

  fn handle(&mut self, command: Command) -> Result<()> {
    match command {
      Command::SetReplicationEnabled(enabled) => self.set_replication_enabled(enabled),
      Command::Reload => {
        if self.control.replication_enabled {
          self.load_replicated();
        } else {
          self.load_local();
        }
        Ok(())
      }
      Command::ImportChanges(changes) => self.import_changes(changes),
      Command::SignalCorruption { is_replicated } => {
        self.corruption_reported(is_replicated);
        Ok(())
      }
      Command::DeleteLocalStore => self.delete_local(),
      Command::DeleteReplicatedStore => self.delete_replicated(),
      Command::DeleteReplicatedContainer => self.delete_replicated_container(),
      Command::MigrateReplicatedToLocal => self.migrate_replicated_to_local(),
      Command::RebuildReplicated { allow_from_local } => self.rebuild_replicated(allow_from_local),
      Command::RefreshToken => {
        self.refresh_token();
        Ok(())
      }
      Command::Shutdown => {
        self.shutdown_worker();
        Ok(())
      }
    }
  }

  // ==========================================================================
  // Transitions
  // ==========================================================================

  fn set_replication_enabled(&mut self, enabled: bool) -> Result<()> {
    self.control.replication_enabled = enabled;
    self.persist_control();
    self
      .status
      .replication_enabled
      .store(enabled, Ordering::SeqCst);

    let state = self.state();
    if state == StoreState::Degraded {
      // Only an explicit reload leaves Degraded; the persisted flag steers
      // that reload.
      self.log("replication toggled while degraded; reload required");
      return Ok(());
    }
    if enabled {
      if state != StoreState::ActiveReplicated {
        self.load_replicated();
      }
    } else if state != StoreState::ActiveLocal {
      self.release_token();
      self.load_local();
    }
    Ok(())
  }

  fn load_local(&mut self) {
    self.set_state(StoreState::LoadingLocal);
    self.delegate.will_load(false);
    self.clear_active();
    self.writes_blocked = false;

    match self.open_local() {
      Ok(accessor) => {
        accessor.set_read_only(false);
        *self.status.active.lock() = Some(Arc::clone(&accessor));
        self.set_state(StoreState::ActiveLocal);
        self.log("loaded local store");
        self.delegate.did_load(&accessor, false);
        self.send_event(StoreEvent::StoreChanged {
          is_replicated: false,
        });
      }
      Err(error) => {
        let cause = match &error {
          TideError::PathCreation(_) => FailureCause::CreateStorePath,
          _ => FailureCause::OpenLocalStore,
        };
        self
          .delegate
          .failed_loading(&cause, Some(&error.to_string()), false);
        self.log(&format!("failed to load local store: {error}"));
        self.set_state(StoreState::Degraded);
      }
    }
  }

  fn open_local(&mut self) -> Result<Arc<dyn StoreAccessor>> {
    let descriptor = self.config.local_descriptor();
    let local_dir = self.config.local_dir.clone();
    retry_once(|| {
      std::fs::create_dir_all(&local_dir)
        .map_err(|error| TideError::PathCreation(format!("{}: {error}", local_dir.display())))
    })?;
    retry_once(|| self.provider.open(&descriptor))
      .map_err(|error| TideError::StoreOpen(error.to_string()))
  }

  fn load_replicated(&mut self) {
    self.set_state(StoreState::LoadingReplicated);
    self.delegate.will_load(true);
    self.clear_active();

    match self.try_load_replicated() {
      Ok(ReplicatedLoad::Replicated) | Ok(ReplicatedLoad::FellBackToLocal) => {}
      Err((cause, error)) => {
        self
          .delegate
          .failed_loading(&cause, Some(&error.to_string()), true);
        self.log(&format!("failed to load replicated store: {error}"));
        self.release_token();
        // Replication failures never fail the application.
        self.load_local();
      }
    }
  }

  fn try_load_replicated(&mut self) -> std::result::Result<ReplicatedLoad, (FailureCause, TideError)> {
    let (descriptor, container) = match (
      self.config.replicated_descriptor(),
      self.config.replicated_container.clone(),
    ) {
      (Some(descriptor), Some(container)) => (descriptor, container),
      _ => return Err((FailureCause::NoAccount, TideError::NoAccount)),
    };
    retry_once(|| {
      std::fs::create_dir_all(&container)
        .map_err(|error| TideError::PathCreation(format!("{}: {error}", container.display())))
    })
    .map_err(|error| (FailureCause::CreateStorePath, error))?;

    self.writes_blocked = false;
    if self.config.desync_strategy != DesyncStrategy::None {
      let claim = self
        .acquire_token_bounded()
        .map_err(|error| (FailureCause::OpenReplicatedStore, error))?;
      match claim {
        Claim::Granted => {
          self.token_held = true;
        }
        Claim::Denied {
          holder_id,
          holder_name,
        } => {
          self.token_held = false;
          match self.config.desync_strategy {
            DesyncStrategy::ExclusiveAccess => {
              self.delegate.failed_loading(
                &FailureCause::NoExclusiveAccess {
                  holder_id: holder_id.clone(),
                  holder_name: holder_name.clone(),
                },
                None,
                true,
              );
              self.log(&format!(
                "exclusive access denied, held by {holder_id} ({holder_name}); staying local"
              ));
              self.load_local();
              return Ok(ReplicatedLoad::FellBackToLocal);
            }
            DesyncStrategy::ExclusiveWriteAccess => {
              self.writes_blocked = true;
            }
            DesyncStrategy::ExclusiveOrMigrateToLocal => {
              self
                .migrate_replicated_down(&descriptor)
                .map_err(|error| (FailureCause::Migrate, error))?;
              self.load_local();
              return Ok(ReplicatedLoad::FellBackToLocal);
            }
            DesyncStrategy::None => unreachable!("claim skipped under DesyncStrategy::None"),
          }
        }
      }
    }

    let mut replicated = self
      .provider
      .open(&descriptor)
      .map_err(|error| (FailureCause::OpenReplicatedStore, error))?;

    let local_descriptor = self.config.local_descriptor();
    let needs_seed = replicated.is_empty()
      && self.provider.exists(&local_descriptor)
      && self.config.migration_strategy != MigrationStrategy::None;

    if needs_seed {
      if self.writes_blocked {
        // An apparent grant could not be confirmed; seeding would write to
        // the shared store without exclusive access.
        let holder = self.current_holder_label();
        self.delegate.failed_loading(
          &FailureCause::NoExclusiveAccess {
            holder_id: holder.0,
            holder_name: holder.1,
          },
          Some("seeding requires exclusive access"),
          true,
        );
        let _ = replicated.close();
        self.load_local();
        return Ok(ReplicatedLoad::FellBackToLocal);
      }

      let local = self
        .provider
        .open(&local_descriptor)
        .map_err(|error| (FailureCause::Migrate, error))?;

      if !local.is_empty() {
        self.set_state(StoreState::SeedingReplicated);
        self.log("seeding replicated store from local data");

        let seeded = match self.config.migration_strategy {
          MigrationStrategy::CopyEntities => self
            .copy_entities(&*local, &*replicated)
            .map_err(|error| (FailureCause::Migrate, error))?,
          MigrationStrategy::Platform => {
            let _ = replicated.close();
            self
              .provider
              .migrate(&local_descriptor, &descriptor)
              .map_err(|error| (FailureCause::Migrate, error))?;
            replicated = self
              .provider
              .open(&descriptor)
              .map_err(|error| (FailureCause::OpenReplicatedStore, error))?;
            true
          }
          MigrationStrategy::Manual => {
            let _ = replicated.close();
            self
              .delegate
              .manual_migrate(&local_descriptor, &descriptor)
              .map_err(|error| (FailureCause::Migrate, error))?;
            replicated = self
              .provider
              .open(&descriptor)
              .map_err(|error| (FailureCause::OpenReplicatedStore, error))?;
            true
          }
          MigrationStrategy::None => true,
        };
        let _ = local.close();

        if !seeded {
          self.log("seeding cancelled; staying local");
          let _ = replicated.close();
          self.release_token();
          self.load_local();
          return Ok(ReplicatedLoad::FellBackToLocal);
        }

        self.control.replicated_seeded = true;
        self.persist_control();
      } else {
        let _ = local.close();
      }
    }

    replicated.set_read_only(self.writes_blocked);
    *self.status.active.lock() = Some(Arc::clone(&replicated));
    self.set_state(StoreState::ActiveReplicated);
    self.log(if self.writes_blocked {
      "loaded replicated store (writes blocked until exclusive access is free)"
    } else {
      "loaded replicated store"
    });
    self.delegate.did_load(&replicated, true);
    self.send_event(StoreEvent::StoreChanged {
      is_replicated: true,
    });
    Ok(ReplicatedLoad::Replicated)
  }

  /// Drives the migration engine over every schema type, draining the
  /// command queue between batches. Returns false when a queued
  /// disable/switch cancelled the remainder.
  fn copy_entities(
    &mut self,
    source: &dyn StoreAccessor,
    destination: &dyn StoreAccessor,
  ) -> Result<bool> {
    let type_names: Vec<String> = self
      .config
      .schema
      .type_names()
      .map(str::to_string)
      .collect();
    let batch_size = self.config.seed_batch_size;
    let rx = self.rx.clone();

    let mut deferred: Vec<Envelope> = Vec::new();
    let mut cancelled = false;
    let mut failure = None;

    let mut engine = MigrationEngine::begin(source, destination)?;
    for type_name in &type_names {
      let mut keep_going = || {
        while let Ok(envelope) = rx.try_recv() {
          if is_switch_command(&envelope.command) {
            cancelled = true;
          }
          deferred.push(envelope);
        }
        !cancelled
      };
      if let Err(error) = engine.migrate_type_with(type_name, batch_size, true, &mut keep_going) {
        failure = Some(error);
        break;
      }
      if cancelled {
        break;
      }
    }
    engine.end();

    self.pending.extend(deferred);
    match failure {
      Some(error) => Err(error),
      None => Ok(!cancelled),
    }
  }

  /// Contention fallback: merge replicated data down into the local store
  /// and give up on sync.
  fn migrate_replicated_down(&mut self, replicated_descriptor: &StoreDescriptor) -> Result<()> {
    self.log("exclusive access denied; migrating replicated data into local store");
    if self.provider.exists(replicated_descriptor) {
      let source = self.provider.open(replicated_descriptor)?;
      let destination = self.open_local()?;
      let result = self.copy_all_types(&*source, &*destination);
      let _ = source.close();
      let _ = destination.close();
      result?;
    }
    self.control.replication_enabled = false;
    self.persist_control();
    self
      .status
      .replication_enabled
      .store(false, Ordering::SeqCst);
    Ok(())
  }

  /// Uncancellable full copy used by down-migrations and rebuilds.
  fn copy_all_types(
    &self,
    source: &dyn StoreAccessor,
    destination: &dyn StoreAccessor,
  ) -> Result<()> {
    let mut engine = MigrationEngine::begin(source, destination)?;
    let type_names: Vec<String> = self
      .config
      .schema
      .type_names()
      .map(str::to_string)
      .collect();
    let mut result = Ok(());
    for type_name in &type_names {
      if let Err(error) = engine.migrate_type(type_name, self.config.seed_batch_size, true) {
        result = Err(error);
        break;
      }
    }
    engine.end();
    result
  }

  // ==========================================================================
  // Imports and corruption
  // ==========================================================================

  fn import_changes(&mut self, changes: ChangeSet) -> Result<()> {
    let state = self.state();
    let accessor = self.status.active.lock().clone();
    let Some(accessor) = accessor else {
      return Err(TideError::Import("no active store".to_string()));
    };
    if state != StoreState::ActiveReplicated {
      return Err(TideError::Import(
        "replicated store is not active".to_string(),
      ));
    }

    // Incoming replicated changes are not local writes; lift a contention
    // write block for the duration of the merge.
    if self.writes_blocked {
      accessor.set_read_only(false);
    }
    let applied = changes.len();
    let result = (|| -> Result<()> {
      let mut session = accessor.session()?;
      self.delegate.merge_incoming_changes(&mut *session, &changes)?;
      session.save()
    })();
    if self.writes_blocked {
      accessor.set_read_only(true);
    }

    match result {
      Ok(()) => {
        self.log(&format!("imported {applied} replicated changes"));
        self.send_event(StoreEvent::ImportedChanges { applied });
        Ok(())
      }
      Err(error) => {
        self
          .delegate
          .failed_loading(&FailureCause::ImportChanges, Some(&error.to_string()), true);
        self.log(&format!("failed to import replicated changes: {error}"));
        self.corruption_reported(true);
        Err(TideError::Import(error.to_string()))
      }
    }
  }

  fn corruption_reported(&mut self, is_replicated: bool) {
    self.log(&format!(
      "corruption reported on {} store",
      if is_replicated { "replicated" } else { "local" }
    ));
    self.control.last_corruption = Some(format!(
      "{} store corruption at {} ms",
      if is_replicated { "replicated" } else { "local" },
      crate::token::now_ms()
    ));
    self.persist_control();

    if self.delegate.handle_corruption(is_replicated) {
      self.log("corruption handled by consumer");
      return;
    }

    if !is_replicated {
      self.clear_active();
      self.set_state(StoreState::Degraded);
      return;
    }
    if !self.state().is_replicated() {
      return;
    }

    match self.config.recovery_policy {
      RecoveryPolicy::FallBackToLocal => {
        self.control.replication_enabled = false;
        self.persist_control();
        self
          .status
          .replication_enabled
          .store(false, Ordering::SeqCst);
        self.release_token();
        self.load_local();
      }
      RecoveryPolicy::RebuildFromReplicated => {
        if let Err(error) = self.rebuild_replicated(true) {
          self.log(&format!("rebuild after corruption failed: {error}"));
          self.release_token();
          self.load_local();
        }
      }
      RecoveryPolicy::Degrade => {
        self.clear_active();
        self.release_token();
        self.set_state(StoreState::Degraded);
      }
    }
  }

  // ==========================================================================
  // Maintenance
  // ==========================================================================

  fn delete_local(&mut self) -> Result<()> {
    let was_active = self.state() == StoreState::ActiveLocal;
    if was_active {
      self.clear_active();
    }
    let descriptor = self.config.local_descriptor();
    if let Err(error) = retry_once(|| self.provider.destroy(&descriptor)) {
      self
        .delegate
        .failed_loading(&FailureCause::DeleteStore, Some(&error.to_string()), false);
      return Err(error);
    }
    self.log("deleted local store");
    if was_active {
      self.load_local();
    }
    Ok(())
  }

  fn delete_replicated(&mut self) -> Result<()> {
    let Some(descriptor) = self.config.replicated_descriptor() else {
      return Err(TideError::NoAccount);
    };
    let was_active = self.state().is_replicated();
    if was_active {
      self.clear_active();
    }
    if let Err(error) = retry_once(|| self.provider.destroy(&descriptor)) {
      self
        .delegate
        .failed_loading(&FailureCause::DeleteStore, Some(&error.to_string()), true);
      return Err(error);
    }
    self.control.replicated_seeded = false;
    self.persist_control();
    self.log("deleted replicated store");

    if self.control.replication_enabled {
      // Recreated and reseeded from local data.
      self.load_replicated();
    } else if was_active {
      self.load_local();
    }
    Ok(())
  }

  fn delete_replicated_container(&mut self) -> Result<()> {
    let Some(container) = self.config.replicated_container.clone() else {
      return Err(TideError::NoAccount);
    };
    let was_active = self.state().is_replicated();
    if was_active {
      self.clear_active();
    }
    // The token namespace lives inside the container; it goes with it.
    self.token_held = false;

    if container.exists() {
      if let Err(error) = retry_once(|| {
        std::fs::remove_dir_all(&container)
          .map_err(|error| TideError::StoreClear(format!("{}: {error}", container.display())))
      }) {
        self
          .delegate
          .failed_loading(&FailureCause::DeleteStore, Some(&error.to_string()), true);
        return Err(error);
      }
    }
    self.control.replicated_seeded = false;
    self.persist_control();
    self.log("deleted replicated container");

    if self.control.replication_enabled {
      self.load_replicated();
    } else if was_active {
      self.load_local();
    }
    Ok(())
  }

  fn migrate_replicated_to_local(&mut self) -> Result<()> {
    let Some(replicated_descriptor) = self.config.replicated_descriptor() else {
      return Err(TideError::NoAccount);
    };
    self.clear_active();

    let local_descriptor = self.config.local_descriptor();
    if let Err(error) = retry_once(|| self.provider.destroy(&local_descriptor)) {
      self
        .delegate
        .failed_loading(&FailureCause::DeleteStore, Some(&error.to_string()), false);
      return Err(error);
    }

    let copy_result = (|| -> Result<()> {
      if !self.provider.exists(&replicated_descriptor) {
        return Ok(());
      }
      let source = self.provider.open(&replicated_descriptor)?;
      let destination = self.open_local()?;
      let result = self.copy_all_types(&*source, &*destination);
      let _ = source.close();
      let _ = destination.close();
      result
    })();
    if let Err(error) = copy_result {
      self
        .delegate
        .failed_loading(&FailureCause::Migrate, Some(&error.to_string()), true);
      self.log(&format!("replicated-to-local migration failed: {error}"));
      self.load_local();
      return Err(error);
    }

    if let Err(error) = retry_once(|| self.provider.destroy(&replicated_descriptor)) {
      self
        .delegate
        .failed_loading(&FailureCause::DeleteStore, Some(&error.to_string()), true);
    }

    self.control.replication_enabled = false;
    self.control.replicated_seeded = false;
    self.persist_control();
    self
      .status
      .replication_enabled
      .store(false, Ordering::SeqCst);
    self.release_token();
    self.load_local();
    Ok(())
  }

  fn rebuild_replicated(&mut self, allow_from_local: bool) -> Result<()> {
    let Some(replicated_descriptor) = self.config.replicated_descriptor() else {
      return Err(TideError::NoAccount);
    };
    self.clear_active();
    self.log("rebuilding replicated store");

    // Preserve the surviving replicated data by merging it into the local
    // store, then recreate the replicated store seeded from that data.
    let merge_result = (|| -> Result<()> {
      if !self.provider.exists(&replicated_descriptor) {
        return Ok(());
      }
      let source = self.provider.open(&replicated_descriptor)?;
      if source.is_empty() {
        let _ = source.close();
        return Ok(());
      }
      let destination = self.open_local()?;
      let result = self.copy_all_types(&*source, &*destination);
      let _ = source.close();
      let _ = destination.close();
      result
    })();

    if let Err(error) = merge_result {
      if allow_from_local {
        self.log(&format!(
          "replicated data unusable ({error}); rebuilding from local data"
        ));
      } else {
        self
          .delegate
          .failed_loading(&FailureCause::Migrate, Some(&error.to_string()), true);
        self.load_local();
        return Err(error);
      }
    }

    if let Err(error) = retry_once(|| self.provider.destroy(&replicated_descriptor)) {
      self
        .delegate
        .failed_loading(&FailureCause::DeleteStore, Some(&error.to_string()), true);
      self.load_local();
      return Err(error);
    }

    self.control.replicated_seeded = false;
    self.control.replication_enabled = true;
    self.persist_control();
    self
      .status
      .replication_enabled
      .store(true, Ordering::SeqCst);
    self.load_replicated();
    Ok(())
  }

  // ==========================================================================
  // Token upkeep
  // ==========================================================================

  fn acquire_token_bounded(&self) -> Result<Claim> {
    let namespace = self
      .token_namespace
      .as_ref()
      .ok_or(TideError::NoAccount)?;
    let deadline = Instant::now() + self.config.token_acquire_deadline;
    let mut last = Claim::Denied {
      holder_id: "unknown".to_string(),
      holder_name: "unknown".to_string(),
    };

    loop {
      match namespace.acquire(&self.config.device, self.config.token_ttl)? {
        Claim::Granted => {
          // The namespace is eventually consistent; re-validate ownership
          // before trusting the grant.
          match namespace.current_holder()? {
            Some(holder) if holder.device_id == self.config.device.device_id => {
              return Ok(Claim::Granted);
            }
            Some(holder) => {
              last = Claim::Denied {
                holder_id: holder.device_id,
                holder_name: holder.device_name,
              };
            }
            None => {}
          }
        }
        denied => last = denied,
      }

      if Instant::now() >= deadline {
        return Ok(last);
      }
      std::thread::sleep(std::time::Duration::from_millis(25));
    }
  }

  fn refresh_token(&mut self) {
    if !self.state().is_replicated() {
      return;
    }
    let Some(namespace) = self.token_namespace.as_ref() else {
      return;
    };
    if self.config.desync_strategy == DesyncStrategy::None {
      return;
    }

    let attempt = if self.token_held {
      namespace.refresh(&self.config.device, self.config.token_ttl)
    } else {
      namespace.acquire(&self.config.device, self.config.token_ttl)
    };

    match attempt {
      Ok(Claim::Granted) => {
        self.token_held = true;
        if self.writes_blocked {
          self.writes_blocked = false;
          if let Some(accessor) = self.status.active.lock().clone() {
            accessor.set_read_only(false);
          }
          self.log("exclusive access acquired; local writes unblocked");
        }
      }
      Ok(Claim::Denied {
        holder_id,
        holder_name,
      }) => {
        self.token_held = false;
        match self.config.desync_strategy {
          DesyncStrategy::ExclusiveWriteAccess => {
            if !self.writes_blocked {
              self.writes_blocked = true;
              if let Some(accessor) = self.status.active.lock().clone() {
                accessor.set_read_only(true);
              }
              self.log(&format!(
                "exclusive access lost to {holder_id} ({holder_name}); blocking local writes"
              ));
            }
          }
          DesyncStrategy::ExclusiveAccess | DesyncStrategy::ExclusiveOrMigrateToLocal => {
            self.delegate.failed_loading(
              &FailureCause::NoExclusiveAccess {
                holder_id: holder_id.clone(),
                holder_name: holder_name.clone(),
              },
              None,
              true,
            );
            self.log(&format!(
              "exclusive access lost to {holder_id} ({holder_name}); falling back to local"
            ));
            self.load_local();
          }
          DesyncStrategy::None => {}
        }
      }
      Err(error) => {
        self.log(&format!("token refresh failed: {error}"));
      }
    }
  }

  fn release_token(&mut self) {
    if !self.token_held {
      return;
    }
    if let Some(namespace) = self.token_namespace.as_ref() {
      if let Err(error) = namespace.release(&self.config.device) {
        self.log(&format!("token release failed: {error}"));
      }
    }
    self.token_held = false;
  }

  fn current_holder_label(&self) -> (String, String) {
    self
      .token_namespace
      .as_ref()
      .and_then(|namespace| namespace.current_holder().ok().flatten())
      .map(|token| (token.device_id, token.device_name))
      .unwrap_or_else(|| ("unknown".to_string(), "unknown".to_string()))
  }

  // ==========================================================================
  // Shared-state plumbing
  // ==========================================================================

  fn shutdown_worker(&mut self) {
    self.release_token();
    self.clear_active();
    self.set_state(StoreState::Unloaded);
    self.log("lifecycle worker stopped");
  }

  fn clear_active(&mut self) {
    let accessor = self.status.active.lock().take();
    if let Some(accessor) = accessor {
      let was_replicated = accessor.descriptor().is_replicated();
      if let Err(error) = retry_once(|| accessor.close()) {
        self.delegate.failed_loading(
          &FailureCause::ClearStore,
          Some(&error.to_string()),
          was_replicated,
        );
        self.log(&format!("failed to clear active store: {error}"));
      }
    }
  }

  fn state(&self) -> StoreState {
    *self.status.state.lock()
  }

  fn set_state(&self, state: StoreState) {
    *self.status.state.lock() = state;
    log::debug!("lifecycle state: {state}");
  }

  fn persist_control(&mut self) {
    if let Err(error) = self.sidecar.store(&self.control) {
      self.log(&format!("failed to persist control state: {error}"));
    }
  }

  fn send_event(&self, event: StoreEvent) {
    let _ = self.events.send(event);
  }

  fn log(&self, message: &str) {
    self.delegate.log_message(message);
  }
}

fn is_switch_command(command: &Command) -> bool {
  matches!(
    command,
    Command::SetReplicationEnabled(false)
      | Command::Reload
      | Command::Shutdown
      | Command::DeleteReplicatedStore
      | Command::DeleteReplicatedContainer
      | Command::MigrateReplicatedToLocal
  )
}

fn retry_once<T>(mut operation: impl FnMut() -> Result<T>) -> Result<T> {
  match operation() {
    Ok(value) => Ok(value),
    Err(first) if first.is_transient() => operation(),
    Err(error) => Err(error),
  }
}

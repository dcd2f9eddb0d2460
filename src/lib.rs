//! tidestore: managed dual-store persistence for record graphs.
//!
//! The lifecycle manager owns an application's durable record-graph store in
//! two possible locations, a private local copy and an optionally available
//! replicated copy, and switches between them on demand. Switchover seeds
//! the target store through the migration engine, which copies an arbitrary
//! record graph in bounded-memory batches with per-relationship snip/stitch
//! control. A peer coordination token serializes write access to the shared
//! replicated store across devices.

pub mod error;
pub mod lifecycle;
pub mod migrate;
pub mod record;
pub mod schema;
pub mod sidecar;
pub mod store;
pub mod token;

pub use error::{Result, TideError};
pub use lifecycle::{
  ChangeSet, DefaultDelegate, DesyncStrategy, FailureCause, ManagerConfig, MigrationStrategy,
  RecoveryPolicy, StoreDelegate, StoreEvent, StoreManager, StoreState,
};
pub use migrate::{MigrationEngine, MigrationReport};
pub use record::{Record, RecordId, RelationshipValue, Value};
pub use schema::{RelationshipDef, Schema, TypeDef};
pub use store::{
  FileStore, FileStoreProvider, StoreAccessor, StoreDescriptor, StoreKind, StoreOptions,
  StoreProvider, StoreSession,
};
pub use token::{AccessToken, Claim, DeviceIdentity, FileTokenNamespace, TokenNamespace};

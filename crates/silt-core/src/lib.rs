//! silt-core - Offline-first sync engine for multi-tenant clients
//!
//! This crate contains the durable local store, the typed repository
//! with its append-ordered mutation log, the push/pull sync engine
//! with pluggable conflict resolution, the optional realtime channel,
//! and the interaction classifier that picks a delivery path per
//! operation class. It is embedded by surrounding tooling; there is no
//! user-facing binary here.

pub mod classify;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod events;
pub mod models;
pub mod outbox;
pub mod realtime;
pub mod repository;
pub mod resolver;
pub mod store;
pub mod sync;
pub mod tenant;
pub mod util;

pub use classify::{Dispatch, InteractionRouter, RoutedPath};
pub use config::EngineConfig;
pub use connectivity::{ConnectivityMonitor, HttpProbe, ReachabilityProbe};
pub use error::{Error, Result};
pub use events::{EngineEvent, EventBus};
pub use models::{
    DeliveryClass, Envelope, MutationKind, PendingMutation, Record, RecordDraft, SyncCursor,
    SyncStatus, VectorClock,
};
pub use outbox::MutationLog;
pub use realtime::{ChannelState, RealtimeChannel, RealtimeHub};
pub use repository::Repository;
pub use resolver::{ManualOutcome, ResolverStrategy};
pub use store::{BatchOp, LocalStore};
pub use sync::{HttpReplicationTransport, ReplicationTransport, SyncEngine, SyncOutcome};
pub use tenant::TenantContext;

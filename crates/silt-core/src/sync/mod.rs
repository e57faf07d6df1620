//! Push/pull replication with causal conflict detection.

mod engine;
pub mod transport;

pub use engine::{SyncEngine, SyncOutcome};
pub use transport::{
    HttpReplicationTransport, PullResponse, PushAck, PushError, ReplicationTransport,
};

//! Optional tenant-scoped realtime transport.
//!
//! The hub is the engine's counterpart: it owns connections, rooms,
//! presence, and per-recipient offline queues. The channel is the
//! client side: lifecycle state machine, heartbeat, and idempotent
//! receive. Availability is explicitly optional; every class of
//! traffic has a degraded path chosen by the classifier.

mod channel;
mod hub;

pub use channel::RealtimeChannel;
pub use hub::{AllowAllRooms, ConnectionId, Delivery, RealtimeHub, RoomAuthorizer};

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Reconnecting,
}

//! Data model shared by all engine components.

mod clock;
mod cursor;
mod message;
mod mutation;
mod record;
mod snapshot;

pub use clock::{Causality, VectorClock};
pub use cursor::{SyncCursor, SyncStatus};
pub use message::{DeliveryClass, Envelope, PresenceEntry, PresenceStatus};
pub use mutation::{MutationKind, MutationState, PendingMutation};
pub use record::{Record, RecordDraft, RecordMeta};
pub use snapshot::{checksum, Snapshot};

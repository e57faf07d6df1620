//! Engine event stream.
//!
//! Component failures never cross boundaries as panics or errors; they
//! are captured, tagged with the offending identifiers, and reported
//! here for the embedding application (status banners, operator
//! tooling) to consume.

use tokio::sync::broadcast;

/// Everything the core reports to the outside world.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Effective connectivity transitions.
    Online,
    Offline,
    SyncStarted {
        tenant_id: String,
        collection: String,
    },
    SyncCompleted {
        tenant_id: String,
        collection: String,
        pushed: usize,
        pulled: usize,
    },
    SyncFailed {
        tenant_id: String,
        collection: String,
        error: String,
    },
    /// A concurrent edit pair was handed to the resolver.
    ConflictDetected {
        conflict_id: String,
        tenant_id: String,
        collection: String,
        record_id: String,
    },
    ConflictResolved {
        conflict_id: String,
        tenant_id: String,
        record_id: String,
    },
    /// Permanent push failure; the mutation moved to the quarantine
    /// sub-queue.
    MutationQuarantined {
        tenant_id: String,
        mutation_id: String,
        error: String,
    },
    /// Retry budget spent; mutation parked until operator re-arm.
    RetryExhausted {
        tenant_id: String,
        mutation_id: String,
    },
    /// Pending mutations older than the configured TTL.
    MutationsStuck {
        tenant_id: String,
        count: usize,
    },
    StorageExhausted {
        tenant_id: String,
    },
    /// A durable queue is at or near its cap.
    QueuePressure {
        tenant_id: String,
        pending: usize,
    },
    /// A durably queued message expired before delivery.
    QueuedMessageExpired {
        tenant_id: String,
        recipient_id: String,
        message_id: String,
    },
    /// Audit record for a refused cross-tenant operation.
    TenantRefused {
        authenticated: String,
        declared: String,
    },
    /// Realtime channel health transitions, consumed by the classifier.
    ChannelDegraded {
        tenant_id: String,
    },
    ChannelRecovered {
        tenant_id: String,
    },
}

/// Broadcast fan-out for engine events.
///
/// Cloning shares the underlying channel. Emission never blocks and
/// never fails; with no subscribers the event is dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        tracing::debug!(?event, "engine event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

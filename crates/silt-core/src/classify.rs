//! Interaction classifier: routes every operation down the path its
//! declared class demands, given the current channel health.
//!
//! Transactional operations never touch the realtime channel; presence
//! traffic never touches durable storage. The routing table itself is a
//! pure function so the degradation matrix is testable in isolation.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};
use crate::models::{DeliveryClass, Envelope, Record, RecordDraft};
use crate::realtime::{Delivery, RealtimeChannel};
use crate::repository::Repository;
use crate::store::LocalStore;
use crate::sync::SyncEngine;
use crate::util::now_ms;

/// Where an operation of a given class goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutedPath {
    /// Direct fan-out over the realtime channel.
    Realtime,
    /// Durable per-recipient queue, drained by later polling.
    DurableQueue,
    /// Delayed reconciliation through the sync engine.
    DeferredSync,
    /// Durable request/response with async confirmation.
    RequestResponse,
    /// Dropped by contract.
    Drop,
}

/// The degradation matrix.
pub const fn route(class: DeliveryClass, channel_healthy: bool) -> RoutedPath {
    match (class, channel_healthy) {
        (DeliveryClass::Presence, true) => RoutedPath::Realtime,
        (DeliveryClass::Presence, false) => RoutedPath::Drop,
        (DeliveryClass::Event, true) => RoutedPath::Realtime,
        (DeliveryClass::Event, false) => RoutedPath::DurableQueue,
        (DeliveryClass::Interactive, true) => RoutedPath::Realtime,
        (DeliveryClass::Interactive, false) => RoutedPath::DeferredSync,
        (DeliveryClass::Transactional, _) => RoutedPath::RequestResponse,
    }
}

/// What happened to a dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Fanned out to this many connections (or queued server-side for
    /// an offline recipient).
    Sent(usize),
    /// Parked in a durable queue for later delivery.
    Queued,
    Dropped,
    /// Handed to the sync engine for delayed reconciliation.
    Deferred,
}

pub struct InteractionRouter {
    channel: Arc<RealtimeChannel>,
    engine: Arc<SyncEngine>,
    store: Arc<Mutex<LocalStore>>,
    queue_cap: usize,
    queue_ttl_ms: u64,
    events: EventBus,
}

impl InteractionRouter {
    pub fn new(
        channel: Arc<RealtimeChannel>,
        engine: Arc<SyncEngine>,
        store: Arc<Mutex<LocalStore>>,
        queue_cap: usize,
        queue_ttl_ms: u64,
        events: EventBus,
    ) -> Self {
        Self {
            channel,
            engine,
            store,
            queue_cap,
            queue_ttl_ms,
            events,
        }
    }

    /// Dispatch a message down the path its class demands.
    pub async fn dispatch(&self, env: Envelope) -> Result<Dispatch> {
        let ctx = self.channel.context().clone();
        if env.tenant_id != ctx.tenant_id {
            self.events.emit(EngineEvent::TenantRefused {
                authenticated: ctx.tenant_id.clone(),
                declared: env.tenant_id.clone(),
            });
            return Err(Error::TenantMismatch {
                expected: ctx.tenant_id,
                actual: env.tenant_id,
            });
        }

        match route(env.class, self.channel.is_healthy()) {
            RoutedPath::RequestResponse => {
                // transactional envelopes have no realtime shape at all
                Err(Error::RealtimeNotAllowed)
            }
            RoutedPath::Realtime => match self.channel.send(&env)? {
                Delivery::Delivered(n) => Ok(Dispatch::Sent(n)),
                Delivery::Queued => Ok(Dispatch::Queued),
                Delivery::Dropped => Ok(Dispatch::Dropped),
                Delivery::Degraded => self.degrade(env).await,
            },
            RoutedPath::Drop => Ok(Dispatch::Dropped),
            RoutedPath::DurableQueue => self.queue_durable(env).await,
            RoutedPath::DeferredSync => {
                self.engine.request_sync();
                Ok(Dispatch::Deferred)
            }
        }
    }

    /// Degraded fallback for a message the healthy path could not take.
    async fn degrade(&self, env: Envelope) -> Result<Dispatch> {
        match env.class {
            DeliveryClass::Presence => Ok(Dispatch::Dropped),
            DeliveryClass::Event => self.queue_durable(env).await,
            _ => {
                self.engine.request_sync();
                Ok(Dispatch::Deferred)
            }
        }
    }

    async fn queue_durable(&self, env: Envelope) -> Result<Dispatch> {
        let recipient = env
            .recipient_id
            .clone()
            .ok_or_else(|| Error::InvalidInput("durable queue needs a recipient".to_string()))?;
        let expires_at = now_ms() + self.queue_ttl_ms as i64;

        let store = self.store.lock().await;
        match store.enqueue_message(&env, &recipient, expires_at, self.queue_cap) {
            Ok(()) => Ok(Dispatch::Queued),
            Err(Error::QueueFull(recipient)) => {
                let pending = store.queued_message_count(&env.tenant_id).unwrap_or(0);
                self.events.emit(EngineEvent::QueuePressure {
                    tenant_id: env.tenant_id.clone(),
                    pending,
                });
                Err(Error::QueueFull(recipient))
            }
            Err(e) => Err(e),
        }
    }

    /// Drain the durable queue back onto a recovered channel. Expired
    /// entries are reported, never silently lost.
    pub async fn flush_durable(&self) -> Result<usize> {
        if !self.channel.is_healthy() {
            return Err(Error::ChannelUnavailable);
        }
        let ctx = self.channel.context().clone();
        let (live, expired) = {
            let mut store = self.store.lock().await;
            store.drain_messages(&ctx.tenant_id, now_ms())?
        };
        for env in &expired {
            self.events.emit(EngineEvent::QueuedMessageExpired {
                tenant_id: ctx.tenant_id.clone(),
                recipient_id: env.recipient_id.clone().unwrap_or_default(),
                message_id: env.message_id.clone(),
            });
        }

        let mut sent = 0;
        for env in live {
            match self.channel.send(&env) {
                Ok(_) => sent += 1,
                Err(error) => {
                    // channel dropped mid-flush; requeue the remainder
                    tracing::warn!(%error, "durable flush interrupted, requeuing");
                    let store = self.store.lock().await;
                    let recipient = env.recipient_id.clone().unwrap_or_default();
                    let expires_at = now_ms() + self.queue_ttl_ms as i64;
                    store.enqueue_message(&env, &recipient, expires_at, self.queue_cap)?;
                    return Err(error);
                }
            }
        }
        Ok(sent)
    }

    /// The transactional path: durable local write, replication queued,
    /// confirmation arrives asynchronously through engine events.
    pub async fn transactional_write(
        &self,
        repository: &Repository,
        draft: RecordDraft,
    ) -> Result<Record> {
        let record = repository.put(draft).await?;
        self.engine.request_sync();
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degradation_matrix_matches_contract() {
        assert_eq!(route(DeliveryClass::Presence, true), RoutedPath::Realtime);
        assert_eq!(route(DeliveryClass::Presence, false), RoutedPath::Drop);
        assert_eq!(route(DeliveryClass::Event, true), RoutedPath::Realtime);
        assert_eq!(route(DeliveryClass::Event, false), RoutedPath::DurableQueue);
        assert_eq!(route(DeliveryClass::Interactive, true), RoutedPath::Realtime);
        assert_eq!(
            route(DeliveryClass::Interactive, false),
            RoutedPath::DeferredSync
        );
        // transactional never routes to the channel, healthy or not
        assert_eq!(
            route(DeliveryClass::Transactional, true),
            RoutedPath::RequestResponse
        );
        assert_eq!(
            route(DeliveryClass::Transactional, false),
            RoutedPath::RequestResponse
        );
    }
}

//! Client side of the realtime channel.
//!
//! Owns the connection lifecycle, heartbeats, and idempotent receive:
//! deliveries across connections carry no global order, so consumers
//! dedupe by message id before applying side effects.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};
use crate::models::{Envelope, PresenceStatus};
use crate::realtime::hub::{ConnectionId, Delivery, RealtimeHub};
use crate::realtime::ChannelState;
use crate::tenant::TenantContext;

/// Message ids remembered for duplicate suppression.
const DEDUPE_CAPACITY: usize = 1024;

struct SeenIds {
    set: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenIds {
    fn new() -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns true the first time an id is seen.
    fn insert(&mut self, id: &str) -> bool {
        if !self.set.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > DEDUPE_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }
}

pub struct RealtimeChannel {
    hub: Arc<RealtimeHub>,
    ctx: TenantContext,
    state_tx: watch::Sender<ChannelState>,
    connection: Mutex<Option<ConnectionId>>,
    seen: Mutex<SeenIds>,
    events: EventBus,
}

impl RealtimeChannel {
    pub fn new(hub: Arc<RealtimeHub>, ctx: TenantContext, events: EventBus) -> Self {
        let (state_tx, _rx) = watch::channel(ChannelState::Disconnected);
        Self {
            hub,
            ctx,
            state_tx,
            connection: Mutex::new(None),
            seen: Mutex::new(SeenIds::new()),
            events,
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    /// Whether the healthy realtime path is available.
    pub fn is_healthy(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    pub fn context(&self) -> &TenantContext {
        &self.ctx
    }

    /// Establish the connection and hand back the inbox.
    pub fn connect(&self) -> Result<mpsc::UnboundedReceiver<Envelope>> {
        let reconnecting = self.state() == ChannelState::Disconnected
            && self.connection_id().is_some();
        let _ = self.state_tx.send(if reconnecting {
            ChannelState::Reconnecting
        } else {
            ChannelState::Connecting
        });

        let (id, rx) = self.hub.connect(self.ctx.clone());
        *self.lock_connection() = Some(id);
        let _ = self.state_tx.send(ChannelState::Connected);
        self.events.emit(EngineEvent::ChannelRecovered {
            tenant_id: self.ctx.tenant_id.clone(),
        });
        Ok(rx)
    }

    pub fn disconnect(&self) {
        let _ = self.state_tx.send(ChannelState::Disconnecting);
        if let Some(id) = self.lock_connection().take() {
            self.hub.disconnect(id);
        }
        let _ = self.state_tx.send(ChannelState::Disconnected);
    }

    /// Publish through the hub; requires a live connection.
    pub fn send(&self, env: &Envelope) -> Result<Delivery> {
        let id = self.require_connection()?;
        match self.hub.publish(id, env) {
            Ok(delivery) => Ok(delivery),
            Err(error) => {
                // a rate-limit escalation may have cut the connection
                if !self.hub.is_connected(id) {
                    self.mark_degraded();
                }
                Err(error)
            }
        }
    }

    pub fn presence_update(&self, status: PresenceStatus) -> Result<()> {
        let id = self.require_connection()?;
        self.hub.presence_update(id, status)
    }

    pub fn join_room(&self, room_id: &str) -> Result<()> {
        let id = self.require_connection()?;
        self.hub.join_room(id, room_id)
    }

    pub fn leave_room(&self, room_id: &str) -> Result<()> {
        let id = self.require_connection()?;
        self.hub.leave_room(id, room_id)
    }

    /// Drain this user's offline queue (event-class degraded delivery).
    pub fn poll_offline(&self) -> Vec<Envelope> {
        self.hub.poll_offline(&self.ctx)
    }

    /// Idempotent receive gate: true the first time a message id is
    /// seen, false for replays.
    pub fn accept(&self, env: &Envelope) -> bool {
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        seen.insert(&env.message_id)
    }

    /// Heartbeat tick: probe the hub and degrade if the connection is
    /// gone (reaped, or cut for abuse).
    pub fn heartbeat(&self) {
        let Some(id) = self.connection_id() else {
            return;
        };
        if !self.hub.heartbeat(id) {
            self.mark_degraded();
        }
    }

    fn mark_degraded(&self) {
        let was_connected = self.state() == ChannelState::Connected;
        let _ = self.state_tx.send(ChannelState::Disconnected);
        if was_connected {
            tracing::info!(tenant = %self.ctx.tenant_id, "realtime channel degraded");
            self.events.emit(EngineEvent::ChannelDegraded {
                tenant_id: self.ctx.tenant_id.clone(),
            });
        }
    }

    fn connection_id(&self) -> Option<ConnectionId> {
        *self.lock_connection()
    }

    fn require_connection(&self) -> Result<ConnectionId> {
        if self.state() != ChannelState::Connected {
            return Err(Error::ChannelUnavailable);
        }
        self.connection_id().ok_or(Error::ChannelUnavailable)
    }

    fn lock_connection(&self) -> std::sync::MutexGuard<'_, Option<ConnectionId>> {
        match self.connection.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::models::DeliveryClass;
    use crate::realtime::hub::AllowAllRooms;
    use serde_json::json;

    fn channel_pair() -> (Arc<RealtimeHub>, RealtimeChannel, RealtimeChannel) {
        let hub = Arc::new(RealtimeHub::new(
            &EngineConfig::default(),
            Box::new(AllowAllRooms),
            EventBus::default(),
        ));
        let a = RealtimeChannel::new(
            hub.clone(),
            TenantContext::new("t1", "u1", "c1"),
            EventBus::default(),
        );
        let b = RealtimeChannel::new(
            hub.clone(),
            TenantContext::new("t1", "u2", "c2"),
            EventBus::default(),
        );
        (hub, a, b)
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let (_hub, a, _b) = channel_pair();
        assert_eq!(a.state(), ChannelState::Disconnected);
        let _rx = a.connect().unwrap();
        assert_eq!(a.state(), ChannelState::Connected);
        a.disconnect();
        assert_eq!(a.state(), ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn send_requires_connection() {
        let (_hub, a, _b) = channel_pair();
        let env = Envelope::direct(DeliveryClass::Event, "chat", "t1", "u1", "u2", json!({}));
        assert!(matches!(
            a.send(&env).unwrap_err(),
            Error::ChannelUnavailable
        ));
    }

    #[tokio::test]
    async fn delivered_messages_dedupe_by_id() {
        let (_hub, a, b) = channel_pair();
        let _rx_a = a.connect().unwrap();
        let mut rx_b = b.connect().unwrap();

        let env = Envelope::direct(DeliveryClass::Event, "chat", "t1", "u1", "u2", json!({}));
        a.send(&env).unwrap();
        let received = rx_b.try_recv().unwrap();
        assert!(b.accept(&received));
        // a replay with the same id has no further effect
        assert!(!b.accept(&received));
    }

    #[tokio::test]
    async fn heartbeat_detects_lost_connection() {
        let (hub, a, _b) = channel_pair();
        let _rx = a.connect().unwrap();
        let id = a.connection_id().unwrap();
        hub.disconnect(id);

        a.heartbeat();
        assert_eq!(a.state(), ChannelState::Disconnected);
    }
}

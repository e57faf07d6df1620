//! Tenant-scoped message hub: connections, rooms, presence, offline
//! queues, and per-connection rate limiting.
//!
//! Tenant segregation is structural: rooms, presence, and queues are
//! keyed by `(tenant, …)`, and every envelope's declared tenant is
//! checked against the sending connection's authenticated context.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};
use crate::models::{DeliveryClass, Envelope, PresenceEntry, PresenceStatus};
use crate::tenant::TenantContext;
use crate::util::now_ms;

pub type ConnectionId = u64;

/// Breaches tolerated inside one window before the connection is cut.
const RATE_STRIKE_LIMIT: u32 = 3;

/// Authorization hook consulted on every room join.
pub trait RoomAuthorizer: Send + Sync {
    fn can_join(&self, ctx: &TenantContext, room_id: &str) -> bool;
}

/// Default hook: any authenticated member of the tenant may join.
pub struct AllowAllRooms;

impl RoomAuthorizer for AllowAllRooms {
    fn can_join(&self, _ctx: &TenantContext, _room_id: &str) -> bool {
        true
    }
}

/// How the hub disposed of a published envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Fanned out to this many live connections.
    Delivered(usize),
    /// Recipient offline; parked in their bounded queue.
    Queued,
    /// Presence-grade with nobody listening; dropped by contract.
    Dropped,
    /// No realtime path available; caller falls back through the
    /// classifier.
    Degraded,
}

struct HubConnection {
    ctx: TenantContext,
    tx: mpsc::UnboundedSender<Envelope>,
    last_seen: i64,
    window_started: i64,
    window_count: u32,
    strikes: u32,
}

struct QueuedMessage {
    env: Envelope,
    expires_at: i64,
}

#[derive(Default)]
struct HubState {
    next_id: ConnectionId,
    connections: HashMap<ConnectionId, HubConnection>,
    rooms: HashMap<(String, String), HashSet<ConnectionId>>,
    presence: HashMap<(String, String), PresenceEntry>,
    offline: HashMap<(String, String), VecDeque<QueuedMessage>>,
}

pub struct RealtimeHub {
    state: Mutex<HubState>,
    authorizer: Box<dyn RoomAuthorizer>,
    events: EventBus,
    rate_limit: u32,
    rate_window_ms: u64,
    queue_cap: usize,
    queue_ttl_ms: u64,
    heartbeat_timeout_ms: u64,
}

impl RealtimeHub {
    pub fn new(config: &EngineConfig, authorizer: Box<dyn RoomAuthorizer>, events: EventBus) -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            authorizer,
            events,
            rate_limit: config.rate_limit_per_window,
            rate_window_ms: config.rate_window_ms,
            queue_cap: config.queue_size_limit,
            queue_ttl_ms: config.mutation_ttl_ms,
            heartbeat_timeout_ms: config.heartbeat_timeout_ms,
        }
    }

    /// Register an authenticated connection and hand back its inbox.
    pub fn connect(&self, ctx: TenantContext) -> (ConnectionId, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        let now = now_ms();
        state.connections.insert(
            id,
            HubConnection {
                ctx,
                tx,
                last_seen: now,
                window_started: now,
                window_count: 0,
                strikes: 0,
            },
        );
        (id, rx)
    }

    pub fn disconnect(&self, id: ConnectionId) {
        let mut state = self.lock();
        state.connections.remove(&id);
        for members in state.rooms.values_mut() {
            members.remove(&id);
        }
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.lock().connections.contains_key(&id)
    }

    /// Publish an envelope from a connection.
    ///
    /// Refusals happen in contract order: unknown connection, class
    /// exclusion, tenant mismatch, rate limit. All checks run before
    /// any routing side effect.
    pub fn publish(&self, id: ConnectionId, env: &Envelope) -> Result<Delivery> {
        let mut state = self.lock();

        if env.class == DeliveryClass::Transactional {
            return Err(Error::RealtimeNotAllowed);
        }

        let sender_ctx = {
            let conn = state
                .connections
                .get(&id)
                .ok_or(Error::ChannelUnavailable)?;
            conn.ctx.clone()
        };

        if env.tenant_id != sender_ctx.tenant_id {
            tracing::warn!(
                connection = id,
                authenticated = %sender_ctx.tenant_id,
                declared = %env.tenant_id,
                "refused cross-tenant realtime message"
            );
            self.events.emit(EngineEvent::TenantRefused {
                authenticated: sender_ctx.tenant_id.clone(),
                declared: env.tenant_id.clone(),
            });
            return Err(Error::TenantMismatch {
                expected: sender_ctx.tenant_id,
                actual: env.tenant_id.clone(),
            });
        }

        if let Err(refused) = self.check_rate(&mut state, id) {
            return Err(refused);
        }

        if let Some(room_id) = &env.room_id {
            return Ok(self.broadcast_room(&state, id, &sender_ctx.tenant_id, room_id, env));
        }
        if let Some(recipient) = env.recipient_id.clone() {
            return self.send_direct(&mut state, id, &sender_ctx.tenant_id, &recipient, env);
        }
        if env.class == DeliveryClass::Presence {
            return Ok(self.broadcast_tenant(&state, id, &sender_ctx.tenant_id, env));
        }
        Err(Error::InvalidInput(
            "message needs a recipient or a room".to_string(),
        ))
    }

    fn check_rate(&self, state: &mut HubState, id: ConnectionId) -> Result<()> {
        let now = now_ms();
        let cut_connection;
        {
            let Some(conn) = state.connections.get_mut(&id) else {
                return Err(Error::ChannelUnavailable);
            };
            if now - conn.window_started >= self.rate_window_ms as i64 {
                conn.window_started = now;
                conn.window_count = 0;
            }
            if conn.window_count >= self.rate_limit {
                conn.strikes += 1;
                cut_connection = conn.strikes >= RATE_STRIKE_LIMIT;
                let retry_after =
                    (conn.window_started + self.rate_window_ms as i64 - now).max(0) as u64;
                if !cut_connection {
                    return Err(Error::RateLimited {
                        retry_after_ms: retry_after,
                    });
                }
            } else {
                conn.window_count += 1;
                return Ok(());
            }
        }
        // sustained abuse: drop the connection entirely
        let tenant_id = state
            .connections
            .get(&id)
            .map(|c| c.ctx.tenant_id.clone());
        state.connections.remove(&id);
        for members in state.rooms.values_mut() {
            members.remove(&id);
        }
        if let Some(tenant_id) = tenant_id {
            tracing::warn!(connection = id, %tenant_id, "connection cut for sustained rate abuse");
            self.events.emit(EngineEvent::ChannelDegraded { tenant_id });
        }
        Err(Error::RateLimited { retry_after_ms: 0 })
    }

    fn broadcast_room(
        &self,
        state: &HubState,
        sender: ConnectionId,
        tenant_id: &str,
        room_id: &str,
        env: &Envelope,
    ) -> Delivery {
        let key = (tenant_id.to_string(), room_id.to_string());
        let Some(members) = state.rooms.get(&key) else {
            return Delivery::Delivered(0);
        };
        let mut delivered = 0;
        for member in members {
            if *member == sender {
                continue;
            }
            if let Some(conn) = state.connections.get(member) {
                if conn.tx.send(env.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        Delivery::Delivered(delivered)
    }

    fn broadcast_tenant(
        &self,
        state: &HubState,
        sender: ConnectionId,
        tenant_id: &str,
        env: &Envelope,
    ) -> Delivery {
        let mut delivered = 0;
        for (id, conn) in &state.connections {
            if *id == sender || conn.ctx.tenant_id != tenant_id {
                continue;
            }
            if conn.tx.send(env.clone()).is_ok() {
                delivered += 1;
            }
        }
        Delivery::Delivered(delivered)
    }

    fn send_direct(
        &self,
        state: &mut HubState,
        sender: ConnectionId,
        tenant_id: &str,
        recipient: &str,
        env: &Envelope,
    ) -> Result<Delivery> {
        let mut delivered = 0;
        for (id, conn) in &state.connections {
            if *id == sender {
                continue;
            }
            if conn.ctx.tenant_id == tenant_id && conn.ctx.user_id == recipient {
                if conn.tx.send(env.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        if delivered > 0 {
            return Ok(Delivery::Delivered(delivered));
        }

        match env.class {
            DeliveryClass::Presence => Ok(Delivery::Dropped),
            DeliveryClass::Event => {
                let key = (tenant_id.to_string(), recipient.to_string());
                let queue = state.offline.entry(key).or_default();
                if queue.len() >= self.queue_cap {
                    self.events.emit(EngineEvent::QueuePressure {
                        tenant_id: tenant_id.to_string(),
                        pending: queue.len(),
                    });
                    return Err(Error::QueueFull(recipient.to_string()));
                }
                queue.push_back(QueuedMessage {
                    env: env.clone(),
                    expires_at: now_ms() + self.queue_ttl_ms as i64,
                });
                Ok(Delivery::Queued)
            }
            DeliveryClass::Interactive => Ok(Delivery::Degraded),
            DeliveryClass::Transactional => Err(Error::RealtimeNotAllowed),
        }
    }

    /// Update presence (best effort) and fan it out to the tenant.
    pub fn presence_update(&self, id: ConnectionId, status: PresenceStatus) -> Result<()> {
        let state = self.lock();
        let conn = state.connections.get(&id).ok_or(Error::ChannelUnavailable)?;
        let ctx = conn.ctx.clone();
        drop(state);

        let entry = PresenceEntry {
            user_id: ctx.user_id.clone(),
            status,
            last_active: now_ms(),
        };
        let env = Envelope {
            message_id: crate::util::new_id(),
            kind: "presence_update".to_string(),
            class: DeliveryClass::Presence,
            tenant_id: ctx.tenant_id.clone(),
            sender_id: ctx.user_id.clone(),
            recipient_id: None,
            room_id: None,
            payload: serde_json::to_value(&entry)?,
            timestamp: entry.last_active,
        };

        let mut state = self.lock();
        state
            .presence
            .insert((ctx.tenant_id.clone(), ctx.user_id.clone()), entry);
        self.broadcast_tenant(&state, id, &ctx.tenant_id, &env);
        Ok(())
    }

    pub fn presence(&self, tenant_id: &str) -> Vec<PresenceEntry> {
        self.lock()
            .presence
            .iter()
            .filter(|((tenant, _), _)| tenant == tenant_id)
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    pub fn join_room(&self, id: ConnectionId, room_id: &str) -> Result<()> {
        let mut state = self.lock();
        let ctx = state
            .connections
            .get(&id)
            .ok_or(Error::ChannelUnavailable)?
            .ctx
            .clone();
        if !self.authorizer.can_join(&ctx, room_id) {
            return Err(Error::Unauthorized(format!(
                "join refused for room {room_id}"
            )));
        }
        state
            .rooms
            .entry((ctx.tenant_id, room_id.to_string()))
            .or_default()
            .insert(id);
        Ok(())
    }

    pub fn leave_room(&self, id: ConnectionId, room_id: &str) -> Result<()> {
        let mut state = self.lock();
        let ctx = state
            .connections
            .get(&id)
            .ok_or(Error::ChannelUnavailable)?
            .ctx
            .clone();
        if let Some(members) = state.rooms.get_mut(&(ctx.tenant_id, room_id.to_string())) {
            members.remove(&id);
        }
        Ok(())
    }

    pub fn room_size(&self, tenant_id: &str, room_id: &str) -> usize {
        self.lock()
            .rooms
            .get(&(tenant_id.to_string(), room_id.to_string()))
            .map_or(0, HashSet::len)
    }

    /// Drain the caller's offline queue. Expired entries are reported,
    /// never silently lost.
    pub fn poll_offline(&self, ctx: &TenantContext) -> Vec<Envelope> {
        let mut state = self.lock();
        let key = (ctx.tenant_id.clone(), ctx.user_id.clone());
        let Some(queue) = state.offline.remove(&key) else {
            return Vec::new();
        };
        let now = now_ms();
        let mut live = Vec::new();
        for queued in queue {
            if queued.expires_at <= now {
                self.events.emit(EngineEvent::QueuedMessageExpired {
                    tenant_id: ctx.tenant_id.clone(),
                    recipient_id: ctx.user_id.clone(),
                    message_id: queued.env.message_id.clone(),
                });
            } else {
                live.push(queued.env);
            }
        }
        live
    }

    pub fn offline_depth(&self, tenant_id: &str, recipient: &str) -> usize {
        self.lock()
            .offline
            .get(&(tenant_id.to_string(), recipient.to_string()))
            .map_or(0, VecDeque::len)
    }

    /// Liveness probe from a connection.
    pub fn heartbeat(&self, id: ConnectionId) -> bool {
        let mut state = self.lock();
        match state.connections.get_mut(&id) {
            Some(conn) => {
                conn.last_seen = now_ms();
                true
            }
            None => false,
        }
    }

    /// Disconnect connections silent beyond the heartbeat timeout.
    pub fn reap_idle(&self) -> Vec<ConnectionId> {
        let cutoff = now_ms() - self.heartbeat_timeout_ms as i64;
        let mut state = self.lock();
        let reaped: Vec<ConnectionId> = state
            .connections
            .iter()
            .filter(|(_, conn)| conn.last_seen <= cutoff)
            .map(|(id, _)| *id)
            .collect();
        for id in &reaped {
            state.connections.remove(id);
            for members in state.rooms.values_mut() {
                members.remove(id);
            }
        }
        reaped
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hub() -> RealtimeHub {
        let config = EngineConfig {
            rate_limit_per_window: 100,
            queue_size_limit: 2,
            mutation_ttl_ms: 60_000,
            ..Default::default()
        };
        RealtimeHub::new(&config, Box::new(AllowAllRooms), EventBus::default())
    }

    fn ctx(tenant: &str, user: &str) -> TenantContext {
        TenantContext::new(tenant, user, format!("client-{user}"))
    }

    #[test]
    fn direct_send_reaches_recipient_connections() {
        let hub = hub();
        let (sender, _rx_s) = hub.connect(ctx("t1", "u1"));
        let (_recipient, mut rx_r) = hub.connect(ctx("t1", "u2"));

        let env = Envelope::direct(DeliveryClass::Event, "chat", "t1", "u1", "u2", json!({}));
        let delivery = hub.publish(sender, &env).unwrap();
        assert_eq!(delivery, Delivery::Delivered(1));
        assert_eq!(rx_r.try_recv().unwrap().message_id, env.message_id);
    }

    #[test]
    fn direct_send_queues_for_offline_event_class() {
        let hub = hub();
        let (sender, _rx) = hub.connect(ctx("t1", "u1"));
        let env = Envelope::direct(DeliveryClass::Event, "chat", "t1", "u1", "u2", json!({}));

        assert_eq!(hub.publish(sender, &env).unwrap(), Delivery::Queued);
        assert_eq!(hub.offline_depth("t1", "u2"), 1);

        // bounded queue refuses at cap
        let env2 = Envelope::direct(DeliveryClass::Event, "chat", "t1", "u1", "u2", json!({}));
        let env3 = Envelope::direct(DeliveryClass::Event, "chat", "t1", "u1", "u2", json!({}));
        hub.publish(sender, &env2).unwrap();
        assert!(matches!(
            hub.publish(sender, &env3).unwrap_err(),
            Error::QueueFull(_)
        ));
    }

    #[test]
    fn presence_class_drops_when_recipient_offline() {
        let hub = hub();
        let (sender, _rx) = hub.connect(ctx("t1", "u1"));
        let env = Envelope::direct(DeliveryClass::Presence, "ping", "t1", "u1", "u2", json!({}));
        assert_eq!(hub.publish(sender, &env).unwrap(), Delivery::Dropped);
        assert_eq!(hub.offline_depth("t1", "u2"), 0);
    }

    #[test]
    fn transactional_class_is_refused_outright() {
        let hub = hub();
        let (sender, _rx) = hub.connect(ctx("t1", "u1"));
        let env = Envelope::direct(
            DeliveryClass::Transactional,
            "payment",
            "t1",
            "u1",
            "u2",
            json!({}),
        );
        assert!(matches!(
            hub.publish(sender, &env).unwrap_err(),
            Error::RealtimeNotAllowed
        ));
        assert_eq!(hub.offline_depth("t1", "u2"), 0);
    }

    #[test]
    fn cross_tenant_message_is_refused_and_audited() {
        let hub = hub();
        let mut events = hub.events.subscribe();
        let (sender, _rx) = hub.connect(ctx("t1", "u1"));
        let env = Envelope::direct(DeliveryClass::Event, "chat", "t2", "u1", "u2", json!({}));

        assert!(matches!(
            hub.publish(sender, &env).unwrap_err(),
            Error::TenantMismatch { .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            EngineEvent::TenantRefused { .. }
        ));
    }

    #[test]
    fn rooms_are_tenant_scoped() {
        let hub = hub();
        let (a, _rx_a) = hub.connect(ctx("t1", "u1"));
        let (b, mut rx_b) = hub.connect(ctx("t1", "u2"));
        let (c, mut rx_c) = hub.connect(ctx("t2", "u3"));

        hub.join_room(a, "general").unwrap();
        hub.join_room(b, "general").unwrap();
        // same room name in another tenant is another room
        hub.join_room(c, "general").unwrap();

        let env = Envelope::room(DeliveryClass::Event, "chat", "t1", "u1", "general", json!({}));
        assert_eq!(hub.publish(a, &env).unwrap(), Delivery::Delivered(1));
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn rate_limit_refuses_then_escalates() {
        let config = EngineConfig {
            rate_limit_per_window: 2,
            rate_window_ms: 60_000,
            ..Default::default()
        };
        let hub = RealtimeHub::new(&config, Box::new(AllowAllRooms), EventBus::default());
        let (sender, _rx) = hub.connect(ctx("t1", "u1"));
        let (_other, _rx2) = hub.connect(ctx("t1", "u2"));

        let env = Envelope::direct(DeliveryClass::Event, "chat", "t1", "u1", "u2", json!({}));
        hub.publish(sender, &env).unwrap();
        hub.publish(sender, &env).unwrap();

        for _ in 0..RATE_STRIKE_LIMIT - 1 {
            assert!(matches!(
                hub.publish(sender, &env).unwrap_err(),
                Error::RateLimited { .. }
            ));
            assert!(hub.is_connected(sender));
        }
        assert!(matches!(
            hub.publish(sender, &env).unwrap_err(),
            Error::RateLimited { .. }
        ));
        assert!(!hub.is_connected(sender));
    }

    #[test]
    fn presence_updates_are_tracked_per_tenant() {
        let hub = hub();
        let (a, _rx) = hub.connect(ctx("t1", "u1"));
        hub.presence_update(a, PresenceStatus::Away).unwrap();

        let presence = hub.presence("t1");
        assert_eq!(presence.len(), 1);
        assert_eq!(presence[0].status, PresenceStatus::Away);
        assert!(hub.presence("t2").is_empty());
    }

    #[test]
    fn heartbeat_reaping_disconnects_silent_connections() {
        let config = EngineConfig {
            heartbeat_timeout_ms: 0,
            ..Default::default()
        };
        let hub = RealtimeHub::new(&config, Box::new(AllowAllRooms), EventBus::default());
        let (id, _rx) = hub.connect(ctx("t1", "u1"));

        // timeout of zero means any connection is immediately stale
        let reaped = hub.reap_idle();
        assert_eq!(reaped, vec![id]);
        assert!(!hub.is_connected(id));
    }
}

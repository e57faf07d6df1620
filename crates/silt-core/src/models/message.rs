//! Realtime message envelope, delivery classes, and presence.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::{new_id, now_ms};

/// Delivery/durability contract attached to every realtime operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryClass {
    /// Presence-grade: best-effort, no durability, dropped when the
    /// channel is unavailable.
    Presence,
    /// Event-streaming: at-least-once; falls back to a durable queue
    /// drained by later polling.
    Event,
    /// Low-latency interactive: realtime preferred; degrades to delayed
    /// reconciliation through the sync engine.
    Interactive,
    /// Critical transactional: never uses the realtime path.
    Transactional,
}

/// Wire envelope for the realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: String,
    /// Application-level message type.
    pub kind: String,
    pub class: DeliveryClass,
    pub tenant_id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    pub payload: Value,
    pub timestamp: i64,
}

impl Envelope {
    pub fn direct(
        class: DeliveryClass,
        kind: impl Into<String>,
        tenant_id: impl Into<String>,
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            message_id: new_id(),
            kind: kind.into(),
            class,
            tenant_id: tenant_id.into(),
            sender_id: sender_id.into(),
            recipient_id: Some(recipient_id.into()),
            room_id: None,
            payload,
            timestamp: now_ms(),
        }
    }

    pub fn room(
        class: DeliveryClass,
        kind: impl Into<String>,
        tenant_id: impl Into<String>,
        sender_id: impl Into<String>,
        room_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            message_id: new_id(),
            kind: kind.into(),
            class,
            tenant_id: tenant_id.into(),
            sender_id: sender_id.into(),
            recipient_id: None,
            room_id: Some(room_id.into()),
            payload,
            timestamp: now_ms(),
        }
    }
}

/// Presence status for a user within a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

/// Best-effort presence entry; never queued, never durable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: String,
    pub status: PresenceStatus,
    pub last_active: i64,
}

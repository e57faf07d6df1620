//! Pending mutations: locally captured intents awaiting server acceptance.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::clock::VectorClock;
use crate::util::{new_id, now_ms};

/// What a mutation does to its target record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Queue state of a pending mutation.
///
/// `Pending` mutations are pushed in append order. `Exhausted` ones have
/// spent their retry budget and wait for operator re-arm. `Quarantined`
/// ones failed permanently and are kept for inspection, never re-pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationState {
    Pending,
    Exhausted,
    Quarantined,
}

impl MutationState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Exhausted => "exhausted",
            Self::Quarantined => "quarantined",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "exhausted" => Some(Self::Exhausted),
            "quarantined" => Some(Self::Quarantined),
            _ => None,
        }
    }
}

/// A locally captured change, durably queued until the server
/// acknowledges durable acceptance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    /// Local append order; assigned by the store on append.
    #[serde(default)]
    pub seq: i64,
    /// Client-generated unique id (UUID v7, time-sortable).
    pub mutation_id: String,
    pub tenant_id: String,
    pub kind: MutationKind,
    pub collection: String,
    pub record_id: String,
    /// Captured record payload; `Null` for deletes.
    pub payload: Value,
    /// Capture timestamp (Unix ms).
    pub timestamp: i64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub clock: VectorClock,
    #[serde(default = "default_state")]
    pub state: MutationState,
}

fn default_state() -> MutationState {
    MutationState::Pending
}

impl PendingMutation {
    pub fn capture(
        tenant_id: &str,
        kind: MutationKind,
        collection: &str,
        record_id: &str,
        payload: Value,
        clock: VectorClock,
    ) -> Self {
        Self {
            seq: 0,
            mutation_id: new_id(),
            tenant_id: tenant_id.to_string(),
            kind,
            collection: collection.to_string(),
            record_id: record_id.to_string(),
            payload,
            timestamp: now_ms(),
            retry_count: 0,
            last_error: None,
            clock,
            state: MutationState::Pending,
        }
    }
}

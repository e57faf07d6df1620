//! Per-collection replication cursors.

use serde::{Deserialize, Serialize};

/// Outcome of the most recent sync pass for a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStatus {
    Idle,
    Success,
    Error,
    InProgress,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Success => "success",
            Self::Error => "error",
            Self::InProgress => "in-progress",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(Self::Idle),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            "in-progress" => Some(Self::InProgress),
            _ => None,
        }
    }
}

/// How far a (tenant, collection) pair has replicated from the server.
///
/// `last_pulled_at` is monotonically non-decreasing and never advances
/// past an unresolved change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub tenant_id: String,
    pub collection: String,
    pub last_pulled_at: i64,
    pub last_pushed_mutation_id: Option<String>,
    pub last_status: SyncStatus,
    pub last_error: Option<String>,
}

impl SyncCursor {
    /// Lazily created cursor for a collection never synced before.
    pub fn initial(tenant_id: &str, collection: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            collection: collection.to_string(),
            last_pulled_at: 0,
            last_pushed_mutation_id: None,
            last_status: SyncStatus::Idle,
            last_error: None,
        }
    }

    /// Advance the pull watermark, refusing regression.
    pub fn advance(&mut self, server_timestamp: i64) {
        if server_timestamp > self.last_pulled_at {
            self.last_pulled_at = server_timestamp;
        }
    }
}

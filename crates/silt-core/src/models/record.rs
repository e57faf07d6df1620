//! Generic domain record and its system-managed metadata.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::clock::VectorClock;
use crate::util::now_ms;

/// System-managed metadata block carried by every record.
///
/// Stamping is centralized in the repository; callers cannot forge
/// `version`, `updated_at`, or `deleted`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordMeta {
    /// Creation timestamp (Unix ms), preserved across updates.
    pub created_at: i64,
    /// Last update timestamp (Unix ms), non-decreasing per record.
    pub updated_at: i64,
    /// Monotonically increasing version local to the (tenant, id) pair.
    pub version: i64,
    /// Soft-delete flag; tombstones are retained until sync confirms
    /// propagation.
    pub deleted: bool,
    /// Server timestamp of the last successful sync touching this record.
    pub last_synced_at: Option<i64>,
    /// Per-client counters for causal conflict detection.
    #[serde(default)]
    pub clock: VectorClock,
    /// Mutation id of the local divergence, if one is pending. Lets a
    /// resolution that elects the remote side subsume the queued mutation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_mutation: Option<String>,
}

/// A domain record scoped to a tenant and a named collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub tenant_id: String,
    /// Domain type; doubles as the collection name in the local store.
    pub collection: String,
    /// Opaque application payload.
    pub payload: Value,
    pub meta: RecordMeta,
}

impl Record {
    /// Build the first version of a record from a caller-supplied draft.
    pub fn first_version(draft: RecordDraft, collection: &str, client_id: &str) -> Self {
        let now = now_ms();
        let mut clock = VectorClock::new();
        clock.increment(client_id);
        Self {
            id: draft.id,
            tenant_id: draft.tenant_id,
            collection: collection.to_string(),
            payload: draft.payload,
            meta: RecordMeta {
                created_at: now,
                updated_at: now,
                version: 1,
                deleted: false,
                last_synced_at: None,
                clock,
                origin_mutation: None,
            },
        }
    }
}

/// What callers hand to `Repository::put`: identity plus payload.
///
/// The declared tenant is checked against the caller's context; all other
/// metadata is stamped by the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDraft {
    pub id: String,
    pub tenant_id: String,
    pub payload: Value,
}

impl RecordDraft {
    pub fn new(id: impl Into<String>, tenant_id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_version_stamps_metadata() {
        let draft = RecordDraft::new("d1", "t1", json!({"title": "A"}));
        let record = Record::first_version(draft, "documents", "c1");

        assert_eq!(record.meta.version, 1);
        assert!(!record.meta.deleted);
        assert_eq!(record.meta.created_at, record.meta.updated_at);
        assert_eq!(record.meta.clock.get("c1"), 1);
        assert_eq!(record.collection, "documents");
    }
}

//! In-memory replication state, one partition per tenant.
//!
//! Stands in behind the replication endpoints for development and
//! integration testing; a production deployment swaps in a durable
//! backend behind the same route handlers. Versions are assigned
//! monotonically per record, pushes are idempotent by mutation id, and
//! a bounded change log drives incremental pulls; clients whose
//! cursor predates the retained window are told to snapshot.

use std::collections::{HashMap, VecDeque};

use serde_json::Value;
use tokio::sync::Mutex;

use silt_core::models::{
    checksum, Causality, MutationKind, PendingMutation, Record, RecordMeta, Snapshot, VectorClock,
};
use silt_core::util::{new_id, now_ms};

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct PushOutcome {
    pub server_version: i64,
    pub server_timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct PullOutcome {
    pub changes: Vec<Record>,
    pub server_timestamp: i64,
    pub cursor_lost: bool,
}

struct StoredRecord {
    payload: Value,
    version: i64,
    created_at: i64,
    updated_at: i64,
    deleted: bool,
    clock: VectorClock,
    /// Server timestamp of the last accepted change.
    changed_at: i64,
}

struct ChangeEntry {
    server_ts: i64,
    collection: String,
    id: String,
}

#[derive(Default)]
struct TenantState {
    records: HashMap<(String, String), StoredRecord>,
    changes: VecDeque<ChangeEntry>,
    /// Change-log entries at or below this watermark were pruned.
    pruned_through: i64,
    /// Strictly increasing server clock for this tenant.
    last_ts: i64,
    /// Previously accepted mutation ids and their acks.
    acked: HashMap<String, PushOutcome>,
}

impl TenantState {
    fn next_ts(&mut self) -> i64 {
        self.last_ts = (self.last_ts + 1).max(now_ms());
        self.last_ts
    }
}

pub struct ReplicationState {
    tenants: Mutex<HashMap<String, TenantState>>,
    retention: usize,
}

impl ReplicationState {
    pub fn new(retention: usize) -> Self {
        Self {
            tenants: Mutex::new(HashMap::new()),
            retention,
        }
    }

    /// Apply one pushed mutation. Idempotent by mutation id.
    pub async fn apply_push(
        &self,
        tenant_id: &str,
        mutation: &PendingMutation,
    ) -> Result<PushOutcome, AppError> {
        if mutation.record_id.trim().is_empty() || mutation.collection.trim().is_empty() {
            return Err(AppError::validation(
                "mutation must name a collection and a record id",
            ));
        }
        if !matches!(mutation.kind, MutationKind::Delete) && !mutation.payload.is_object() {
            return Err(AppError::validation("mutation payload must be a JSON object"));
        }

        let mut tenants = self.tenants.lock().await;
        let state = tenants.entry(tenant_id.to_string()).or_default();

        if let Some(previous) = state.acked.get(&mutation.mutation_id) {
            return Ok(previous.clone());
        }

        let key = (mutation.collection.clone(), mutation.record_id.clone());
        if let Some(existing) = state.records.get(&key) {
            let concurrent = if !existing.clock.is_empty() && !mutation.clock.is_empty() {
                matches!(
                    existing.clock.compare(&mutation.clock),
                    Causality::Concurrent | Causality::After
                )
            } else {
                existing.updated_at > mutation.timestamp
            };
            if concurrent {
                return Err(AppError::conflict(format!(
                    "record {} has a concurrent write; pull and reconcile first",
                    mutation.record_id
                )));
            }
        }

        let server_ts = state.next_ts();
        let entry = state.records.entry(key.clone()).or_insert(StoredRecord {
            payload: Value::Null,
            version: 0,
            created_at: mutation.timestamp,
            updated_at: 0,
            deleted: false,
            clock: VectorClock::new(),
            changed_at: 0,
        });
        entry.version += 1;
        entry.updated_at = mutation.timestamp;
        entry.changed_at = server_ts;
        entry.clock.merge(&mutation.clock);
        match mutation.kind {
            MutationKind::Delete => entry.deleted = true,
            _ => {
                entry.deleted = false;
                entry.payload = mutation.payload.clone();
            }
        }
        let outcome = PushOutcome {
            server_version: entry.version,
            server_timestamp: server_ts,
        };

        state.changes.push_back(ChangeEntry {
            server_ts,
            collection: key.0,
            id: key.1,
        });
        while state.changes.len() > self.retention {
            if let Some(pruned) = state.changes.pop_front() {
                state.pruned_through = pruned.server_ts;
            }
        }
        state
            .acked
            .insert(mutation.mutation_id.clone(), outcome.clone());

        Ok(outcome)
    }

    /// Changes for a collection since a client watermark.
    pub async fn changes_since(
        &self,
        tenant_id: &str,
        collection: &str,
        since: i64,
        limit: usize,
    ) -> PullOutcome {
        let tenants = self.tenants.lock().await;
        let Some(state) = tenants.get(tenant_id) else {
            return PullOutcome {
                changes: Vec::new(),
                server_timestamp: since,
                cursor_lost: false,
            };
        };

        if since < state.pruned_through {
            return PullOutcome {
                changes: Vec::new(),
                server_timestamp: state.last_ts,
                cursor_lost: true,
            };
        }

        // latest change wins per record id
        let mut latest: HashMap<&str, i64> = HashMap::new();
        for change in &state.changes {
            if change.server_ts > since && change.collection == collection {
                latest.insert(change.id.as_str(), change.server_ts);
            }
        }
        let mut ordered: Vec<(&str, i64)> = latest.into_iter().collect();
        ordered.sort_by_key(|(_, ts)| *ts);
        ordered.truncate(limit);

        let changes = ordered
            .into_iter()
            .filter_map(|(id, ts)| {
                let key = (collection.to_string(), id.to_string());
                state.records.get(&key).map(|stored| Record {
                    id: id.to_string(),
                    tenant_id: tenant_id.to_string(),
                    collection: collection.to_string(),
                    payload: stored.payload.clone(),
                    meta: RecordMeta {
                        created_at: stored.created_at,
                        updated_at: stored.updated_at,
                        version: stored.version,
                        deleted: stored.deleted,
                        last_synced_at: Some(ts),
                        clock: stored.clock.clone(),
                        origin_mutation: None,
                    },
                })
            })
            .collect();

        PullOutcome {
            changes,
            server_timestamp: state.last_ts.max(since),
            cursor_lost: false,
        }
    }

    /// Authoritative full state for an entity type.
    pub async fn snapshot(&self, tenant_id: &str, entity_type: &str) -> Snapshot {
        let tenants = self.tenants.lock().await;
        let (records, created_at) = match tenants.get(tenant_id) {
            Some(state) => {
                let records: Vec<Record> = state
                    .records
                    .iter()
                    .filter(|((collection, _), stored)| {
                        collection == entity_type && !stored.deleted
                    })
                    .map(|((collection, id), stored)| Record {
                        id: id.clone(),
                        tenant_id: tenant_id.to_string(),
                        collection: collection.clone(),
                        payload: stored.payload.clone(),
                        meta: RecordMeta {
                            created_at: stored.created_at,
                            updated_at: stored.updated_at,
                            version: stored.version,
                            deleted: false,
                            last_synced_at: Some(stored.changed_at),
                            clock: stored.clock.clone(),
                            origin_mutation: None,
                        },
                    })
                    .collect();
                let created_at = if state.last_ts > 0 {
                    state.last_ts
                } else {
                    now_ms()
                };
                (records, created_at)
            }
            None => (Vec::new(), now_ms()),
        };

        let payload = serde_json::to_value(&records).unwrap_or(Value::Array(Vec::new()));
        Snapshot {
            snapshot_id: new_id(),
            tenant_id: tenant_id.to_string(),
            entity_type: entity_type.to_string(),
            version: created_at,
            checksum: checksum(&payload),
            payload,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mutation(id: &str, record_id: &str, kind: MutationKind, timestamp: i64) -> PendingMutation {
        PendingMutation {
            seq: 0,
            mutation_id: id.to_string(),
            tenant_id: "t1".to_string(),
            kind,
            collection: "documents".to_string(),
            record_id: record_id.to_string(),
            payload: json!({"title": record_id}),
            timestamp,
            retry_count: 0,
            last_error: None,
            clock: VectorClock::new(),
            state: silt_core::models::MutationState::Pending,
        }
    }

    #[tokio::test]
    async fn push_assigns_monotonic_versions() {
        let state = ReplicationState::new(100);
        let first = state
            .apply_push("t1", &mutation("m1", "d1", MutationKind::Create, 1_000))
            .await
            .unwrap();
        let second = state
            .apply_push("t1", &mutation("m2", "d1", MutationKind::Update, 2_000))
            .await
            .unwrap();
        assert_eq!(first.server_version, 1);
        assert_eq!(second.server_version, 2);
        assert!(second.server_timestamp > first.server_timestamp);
    }

    #[tokio::test]
    async fn push_is_idempotent_by_mutation_id() {
        let state = ReplicationState::new(100);
        let m = mutation("m1", "d1", MutationKind::Create, 1_000);
        let first = state.apply_push("t1", &m).await.unwrap();
        let replay = state.apply_push("t1", &m).await.unwrap();
        assert_eq!(first.server_version, replay.server_version);
        assert_eq!(first.server_timestamp, replay.server_timestamp);
    }

    #[tokio::test]
    async fn stale_push_gets_conflict_advisory() {
        let state = ReplicationState::new(100);
        state
            .apply_push("t1", &mutation("m1", "d1", MutationKind::Create, 5_000))
            .await
            .unwrap();

        let err = state
            .apply_push("t1", &mutation("m2", "d1", MutationKind::Update, 1_000))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn pull_returns_changes_after_cursor() {
        let state = ReplicationState::new(100);
        state
            .apply_push("t1", &mutation("m1", "d1", MutationKind::Create, 1_000))
            .await
            .unwrap();
        let first = state.changes_since("t1", "documents", 0, 100).await;
        assert_eq!(first.changes.len(), 1);
        assert!(!first.cursor_lost);

        // nothing new after the returned watermark
        let second = state
            .changes_since("t1", "documents", first.server_timestamp, 100)
            .await;
        assert!(second.changes.is_empty());
    }

    #[tokio::test]
    async fn pruned_changelog_reports_cursor_lost() {
        let state = ReplicationState::new(100);
        for i in 0..150 {
            state
                .apply_push(
                    "t1",
                    &mutation(&format!("m{i}"), &format!("d{i}"), MutationKind::Create, 1_000 + i),
                )
                .await
                .unwrap();
        }
        let outcome = state.changes_since("t1", "documents", 1, 100).await;
        assert!(outcome.cursor_lost);
    }

    #[tokio::test]
    async fn snapshot_carries_verifiable_checksum() {
        let state = ReplicationState::new(100);
        state
            .apply_push("t1", &mutation("m1", "d1", MutationKind::Create, 1_000))
            .await
            .unwrap();
        state
            .apply_push("t1", &mutation("m2", "d2", MutationKind::Create, 2_000))
            .await
            .unwrap();
        state
            .apply_push("t1", &mutation("m3", "d2", MutationKind::Delete, 3_000))
            .await
            .unwrap();

        let snapshot = state.snapshot("t1", "documents").await;
        assert!(snapshot.verify().is_ok());
        let records: Vec<Record> = serde_json::from_value(snapshot.payload.clone()).unwrap();
        // tombstoned d2 is excluded from full state
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "d1");
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let state = ReplicationState::new(100);
        state
            .apply_push("t1", &mutation("m1", "d1", MutationKind::Create, 1_000))
            .await
            .unwrap();

        let other = state.changes_since("t2", "documents", 0, 100).await;
        assert!(other.changes.is_empty());
    }
}

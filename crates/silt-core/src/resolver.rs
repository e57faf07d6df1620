//! Pluggable conflict resolution.
//!
//! A strategy takes the two sides of a concurrent edit and yields one
//! complete record body, or suspends into the deferred-conflict
//! registry for manual resolution. Strategies are pure with respect to
//! their inputs plus clock-derived fields and perform no I/O; the sync
//! engine stamps the final metadata.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use crate::config::ResolverChoice;
use crate::models::Record;
use crate::util::new_id;

/// Opaque merge over selected fields. Must be pure, commutative on
/// concurrent inputs, and the identity on equal inputs.
pub type MergeFn = Arc<dyn Fn(&Record, &Record) -> Value + Send + Sync>;

/// Resolution strategy, selected per collection or per call.
#[derive(Clone)]
pub enum ResolverStrategy {
    /// Higher `updated_at` wins; ties broken deterministically by the
    /// dominant writer's client id.
    LastWriteWins,
    /// Mirror of last-write-wins.
    FirstWriteWins,
    /// Per-field union taking the later timestamp per field, read from
    /// the payload's `versionedPerField` map.
    FieldMerge,
    OperationalMerge(MergeFn),
    /// Suspend and hand both sides to the application.
    Manual,
}

impl std::fmt::Debug for ResolverStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::LastWriteWins => "last-write-wins",
            Self::FirstWriteWins => "first-write-wins",
            Self::FieldMerge => "field-merge",
            Self::OperationalMerge(_) => "operational-merge",
            Self::Manual => "manual",
        };
        f.write_str(name)
    }
}

impl From<ResolverChoice> for ResolverStrategy {
    fn from(choice: ResolverChoice) -> Self {
        match choice {
            ResolverChoice::LastWriteWins => Self::LastWriteWins,
            ResolverChoice::FirstWriteWins => Self::FirstWriteWins,
            ResolverChoice::FieldMerge => Self::FieldMerge,
            ResolverChoice::Manual => Self::Manual,
        }
    }
}

/// Which side supplied the resolved body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
    Merged,
}

/// Outcome of running a strategy over a conflicting pair.
#[derive(Debug, Clone)]
pub enum Resolution {
    Resolved {
        payload: Value,
        deleted: bool,
        winner: Winner,
    },
    /// Manual strategy: resolution is suspended; the engine registers
    /// the pair and waits for an explicit resume.
    Deferred,
}

/// Run `strategy` over a concurrent pair. Never returns partial state.
pub fn resolve(strategy: &ResolverStrategy, local: &Record, incoming: &Record) -> Resolution {
    match strategy {
        ResolverStrategy::LastWriteWins => pick_by_time(local, incoming, true),
        ResolverStrategy::FirstWriteWins => pick_by_time(local, incoming, false),
        ResolverStrategy::FieldMerge => field_merge(local, incoming),
        ResolverStrategy::OperationalMerge(merge) => Resolution::Resolved {
            payload: merge(local, incoming),
            deleted: local.meta.deleted && incoming.meta.deleted,
            winner: Winner::Merged,
        },
        ResolverStrategy::Manual => Resolution::Deferred,
    }
}

fn pick_by_time(local: &Record, incoming: &Record, later_wins: bool) -> Resolution {
    let local_wins = match local.meta.updated_at.cmp(&incoming.meta.updated_at) {
        std::cmp::Ordering::Greater => later_wins,
        std::cmp::Ordering::Less => !later_wins,
        std::cmp::Ordering::Equal => {
            // deterministic tie-break on the dominant writer id
            let local_writer = local.meta.clock.dominant_writer().unwrap_or("");
            let incoming_writer = incoming.meta.clock.dominant_writer().unwrap_or("");
            local_writer > incoming_writer
        }
    };

    let side = if local_wins { local } else { incoming };
    Resolution::Resolved {
        payload: side.payload.clone(),
        deleted: side.meta.deleted,
        winner: if local_wins { Winner::Local } else { Winner::Remote },
    }
}

const FIELD_VERSIONS_KEY: &str = "versionedPerField";

/// Per-field union. Each field is taken from the side with the later
/// per-field timestamp; fields without a timestamp on either side defer
/// to the side with the earlier overall `updated_at`.
fn field_merge(local: &Record, incoming: &Record) -> Resolution {
    let (Some(local_obj), Some(incoming_obj)) =
        (local.payload.as_object(), incoming.payload.as_object())
    else {
        // non-object payloads cannot be merged field-wise
        return pick_by_time(local, incoming, true);
    };

    let local_versions = field_versions(local_obj);
    let incoming_versions = field_versions(incoming_obj);
    let earlier_is_local = local.meta.updated_at <= incoming.meta.updated_at;

    let mut keys: BTreeSet<&str> = local_obj.keys().map(String::as_str).collect();
    keys.extend(incoming_obj.keys().map(String::as_str));
    keys.remove(FIELD_VERSIONS_KEY);

    let mut merged = Map::new();
    let mut merged_versions = Map::new();
    for key in keys {
        let local_ts = local_versions.get(key).copied();
        let incoming_ts = incoming_versions.get(key).copied();
        let take_local = match (local_ts, incoming_ts) {
            (Some(l), Some(r)) => l >= r,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => earlier_is_local,
        };

        let value = if take_local {
            local_obj.get(key).or_else(|| incoming_obj.get(key))
        } else {
            incoming_obj.get(key).or_else(|| local_obj.get(key))
        };
        if let Some(value) = value {
            merged.insert(key.to_string(), value.clone());
        }
        if let Some(ts) = match (local_ts, incoming_ts) {
            (Some(l), Some(r)) => Some(l.max(r)),
            (one, other) => one.or(other),
        } {
            merged_versions.insert(key.to_string(), Value::from(ts));
        }
    }
    if !merged_versions.is_empty() {
        merged.insert(FIELD_VERSIONS_KEY.to_string(), Value::Object(merged_versions));
    }

    Resolution::Resolved {
        payload: Value::Object(merged),
        deleted: local.meta.deleted && incoming.meta.deleted,
        winner: Winner::Merged,
    }
}

fn field_versions(obj: &Map<String, Value>) -> HashMap<&str, i64> {
    obj.get(FIELD_VERSIONS_KEY)
        .and_then(Value::as_object)
        .map(|versions| {
            versions
                .iter()
                .filter_map(|(k, v)| v.as_i64().map(|ts| (k.as_str(), ts)))
                .collect()
        })
        .unwrap_or_default()
}

/// One suspended conflict awaiting manual resolution.
#[derive(Debug, Clone)]
pub struct DeferredConflict {
    pub conflict_id: String,
    pub tenant_id: String,
    pub collection: String,
    pub record_id: String,
    pub local: Record,
    pub incoming: Record,
}

/// How the application resumes a suspended conflict.
#[derive(Debug, Clone)]
pub enum ManualOutcome {
    KeepLocal,
    AcceptRemote,
    Merge(Value),
}

/// Registry of suspended conflicts, keyed by conflict id.
///
/// The cursor for the affected collection is held until each entry is
/// resumed, so unresolved changes are re-offered on the next pull.
#[derive(Default)]
pub struct DeferredConflictRegistry {
    inner: Mutex<HashMap<String, DeferredConflict>>,
}

impl DeferredConflictRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a suspended pair; returns the resume handle id.
    pub fn register(&self, tenant_id: &str, local: Record, incoming: Record) -> String {
        let conflict_id = new_id();
        let conflict = DeferredConflict {
            conflict_id: conflict_id.clone(),
            tenant_id: tenant_id.to_string(),
            collection: local.collection.clone(),
            record_id: local.id.clone(),
            local,
            incoming,
        };
        let mut inner = self.lock();
        inner.insert(conflict_id.clone(), conflict);
        conflict_id
    }

    /// Remove and return a suspended conflict for resumption.
    pub fn take(&self, conflict_id: &str) -> Option<DeferredConflict> {
        self.lock().remove(conflict_id)
    }

    pub fn get(&self, conflict_id: &str) -> Option<DeferredConflict> {
        self.lock().get(conflict_id).cloned()
    }

    pub fn list(&self, tenant_id: &str) -> Vec<DeferredConflict> {
        self.lock()
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    /// Record ids with a suspended conflict in the given collection.
    pub fn held_records(&self, tenant_id: &str, collection: &str) -> Vec<String> {
        self.lock()
            .values()
            .filter(|c| c.tenant_id == tenant_id && c.collection == collection)
            .map(|c| c.record_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DeferredConflict>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RecordDraft, RecordMeta, VectorClock};
    use serde_json::json;

    fn record(id: &str, payload: Value, updated_at: i64, version: i64, writer: &str) -> Record {
        let mut clock = VectorClock::new();
        clock.increment(writer);
        Record {
            id: id.to_string(),
            tenant_id: "t1".to_string(),
            collection: "documents".to_string(),
            payload,
            meta: RecordMeta {
                created_at: 0,
                updated_at,
                version,
                deleted: false,
                last_synced_at: None,
                clock,
                origin_mutation: None,
            },
        }
    }

    #[test]
    fn last_write_wins_takes_later_side() {
        let local = record("d2", json!({"title": "L"}), 1_000, 3, "c1");
        let incoming = record("d2", json!({"title": "R"}), 2_000, 4, "c2");

        match resolve(&ResolverStrategy::LastWriteWins, &local, &incoming) {
            Resolution::Resolved { payload, winner, .. } => {
                assert_eq!(payload["title"], "R");
                assert_eq!(winner, Winner::Remote);
            }
            Resolution::Deferred => panic!("expected resolution"),
        }
    }

    #[test]
    fn last_write_wins_keeps_local_when_newer() {
        let local = record("d2", json!({"title": "L"}), 1_000, 3, "c1");
        let incoming = record("d2", json!({"title": "R"}), 500, 4, "c2");

        match resolve(&ResolverStrategy::LastWriteWins, &local, &incoming) {
            Resolution::Resolved { payload, winner, .. } => {
                assert_eq!(payload["title"], "L");
                assert_eq!(winner, Winner::Local);
            }
            Resolution::Deferred => panic!("expected resolution"),
        }
    }

    #[test]
    fn first_write_wins_mirrors() {
        let local = record("d2", json!({"title": "L"}), 1_000, 3, "c1");
        let incoming = record("d2", json!({"title": "R"}), 2_000, 4, "c2");

        match resolve(&ResolverStrategy::FirstWriteWins, &local, &incoming) {
            Resolution::Resolved { payload, winner, .. } => {
                assert_eq!(payload["title"], "L");
                assert_eq!(winner, Winner::Local);
            }
            Resolution::Deferred => panic!("expected resolution"),
        }
    }

    #[test]
    fn time_ties_break_on_writer_id() {
        let local = record("d2", json!({"title": "L"}), 1_000, 3, "zz");
        let incoming = record("d2", json!({"title": "R"}), 1_000, 4, "aa");

        match resolve(&ResolverStrategy::LastWriteWins, &local, &incoming) {
            Resolution::Resolved { winner, .. } => assert_eq!(winner, Winner::Local),
            Resolution::Deferred => panic!("expected resolution"),
        }
    }

    #[test]
    fn field_merge_takes_later_timestamp_per_field() {
        let local = record(
            "d3",
            json!({"a": 1, "b": 2, "versionedPerField": {"a": 3000, "b": 1000}}),
            3_000,
            2,
            "c1",
        );
        let incoming = record(
            "d3",
            json!({"a": 9, "b": 7, "versionedPerField": {"a": 1500, "b": 2500}}),
            2_500,
            2,
            "c2",
        );

        match resolve(&ResolverStrategy::FieldMerge, &local, &incoming) {
            Resolution::Resolved { payload, winner, .. } => {
                assert_eq!(payload["a"], 1);
                assert_eq!(payload["b"], 7);
                assert_eq!(payload["versionedPerField"]["a"], 3000);
                assert_eq!(payload["versionedPerField"]["b"], 2500);
                assert_eq!(winner, Winner::Merged);
            }
            Resolution::Deferred => panic!("expected resolution"),
        }
    }

    #[test]
    fn field_merge_unversioned_fields_defer_to_earlier_side() {
        let local = record("d3", json!({"title": "early"}), 1_000, 2, "c1");
        let incoming = record("d3", json!({"title": "late"}), 2_000, 2, "c2");

        match resolve(&ResolverStrategy::FieldMerge, &local, &incoming) {
            Resolution::Resolved { payload, .. } => assert_eq!(payload["title"], "early"),
            Resolution::Deferred => panic!("expected resolution"),
        }
    }

    #[test]
    fn operational_merge_runs_caller_function() {
        let merge: MergeFn = Arc::new(|local, incoming| {
            json!({
                "text": format!(
                    "{}|{}",
                    local.payload["text"].as_str().unwrap_or(""),
                    incoming.payload["text"].as_str().unwrap_or("")
                )
            })
        });
        let local = record("d4", json!({"text": "abc"}), 1_000, 2, "c1");
        let incoming = record("d4", json!({"text": "xyz"}), 2_000, 2, "c2");

        match resolve(&ResolverStrategy::OperationalMerge(merge), &local, &incoming) {
            Resolution::Resolved { payload, winner, .. } => {
                assert_eq!(payload["text"], "abc|xyz");
                assert_eq!(winner, Winner::Merged);
            }
            Resolution::Deferred => panic!("expected resolution"),
        }
    }

    #[test]
    fn manual_strategy_defers() {
        let local = record("d5", json!({}), 1_000, 2, "c1");
        let incoming = record("d5", json!({}), 2_000, 2, "c2");
        assert!(matches!(
            resolve(&ResolverStrategy::Manual, &local, &incoming),
            Resolution::Deferred
        ));
    }

    #[test]
    fn registry_registers_and_resumes() {
        let registry = DeferredConflictRegistry::new();
        let local = Record::first_version(
            RecordDraft::new("d5", "t1", json!({"v": 1})),
            "documents",
            "c1",
        );
        let incoming = Record::first_version(
            RecordDraft::new("d5", "t1", json!({"v": 2})),
            "documents",
            "c2",
        );

        let id = registry.register("t1", local, incoming);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.held_records("t1", "documents"), vec!["d5"]);
        assert!(registry.held_records("t2", "documents").is_empty());

        let conflict = registry.take(&id).unwrap();
        assert_eq!(conflict.record_id, "d5");
        assert!(registry.is_empty());
    }
}

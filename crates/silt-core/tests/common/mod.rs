//! Shared fixtures: a scripted replication transport and record
//! builders used across the integration suites.

// not every suite uses every helper
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use silt_core::error::{Error, Result};
use silt_core::models::{PendingMutation, Record, RecordMeta, Snapshot, VectorClock};
use silt_core::sync::{PullResponse, PushAck, PushError, ReplicationTransport};
use silt_core::tenant::TenantContext;

/// Scripted in-memory transport. Unscripted pushes are accepted with
/// monotonically increasing server versions and timestamps; unscripted
/// pulls return no changes.
#[derive(Default)]
pub struct MockTransport {
    pub attempted: Mutex<Vec<PendingMutation>>,
    push_script: Mutex<VecDeque<std::result::Result<PushAck, PushError>>>,
    pull_script: Mutex<VecDeque<PullResponse>>,
    snapshot_script: Mutex<VecDeque<Snapshot>>,
    clock: AtomicI64,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clock: AtomicI64::new(10_000),
            ..Self::default()
        })
    }

    pub fn script_push(&self, result: std::result::Result<PushAck, PushError>) {
        self.push_script.lock().unwrap().push_back(result);
    }

    pub fn script_pull(&self, response: PullResponse) {
        self.pull_script.lock().unwrap().push_back(response);
    }

    pub fn script_snapshot(&self, snapshot: Snapshot) {
        self.snapshot_script.lock().unwrap().push_back(snapshot);
    }

    pub fn attempted_record_ids(&self) -> Vec<String> {
        self.attempted
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.record_id.clone())
            .collect()
    }

    pub fn accepted_kinds(&self) -> Vec<silt_core::models::MutationKind> {
        self.attempted.lock().unwrap().iter().map(|m| m.kind).collect()
    }
}

#[async_trait]
impl ReplicationTransport for MockTransport {
    async fn push(
        &self,
        _ctx: &TenantContext,
        mutation: &PendingMutation,
    ) -> std::result::Result<PushAck, PushError> {
        self.attempted.lock().unwrap().push(mutation.clone());
        if let Some(scripted) = self.push_script.lock().unwrap().pop_front() {
            return scripted;
        }
        let ts = self.clock.fetch_add(1, Ordering::SeqCst);
        Ok(PushAck {
            server_version: 1,
            server_timestamp: ts,
        })
    }

    async fn pull(
        &self,
        _ctx: &TenantContext,
        _collection: &str,
        since: i64,
        _limit: usize,
    ) -> Result<PullResponse> {
        if let Some(scripted) = self.pull_script.lock().unwrap().pop_front() {
            return Ok(scripted);
        }
        Ok(PullResponse {
            changes: Vec::new(),
            server_timestamp: since.max(self.clock.load(Ordering::SeqCst)),
            cursor_lost: false,
        })
    }

    async fn snapshot(&self, _ctx: &TenantContext, entity_type: &str) -> Result<Snapshot> {
        self.snapshot_script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Transport(format!("no snapshot scripted for {entity_type}")))
    }
}

/// A server-side record as it would arrive from a pull.
pub fn remote_record(
    id: &str,
    tenant: &str,
    payload: Value,
    version: i64,
    updated_at: i64,
    clock: VectorClock,
    change_ts: i64,
) -> Record {
    Record {
        id: id.to_string(),
        tenant_id: tenant.to_string(),
        collection: "documents".to_string(),
        payload,
        meta: RecordMeta {
            created_at: updated_at,
            updated_at,
            version,
            deleted: false,
            last_synced_at: Some(change_ts),
            clock,
            origin_mutation: None,
        },
    }
}

pub fn clock_of(entries: &[(&str, u64)]) -> VectorClock {
    let mut clock = VectorClock::new();
    for (client, count) in entries {
        for _ in 0..*count {
            clock.increment(client);
        }
    }
    clock
}

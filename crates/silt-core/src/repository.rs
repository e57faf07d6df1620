//! Typed read/write surface over the local store.
//!
//! Metadata stamping is centralized here: callers supply identity and
//! payload, the repository assigns `version`, `updated_at`, `deleted`,
//! and the vector clock, and appends exactly one pending mutation per
//! successful write in the same transaction. A separate server-change
//! path writes without queuing a mutation.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};
use crate::models::{MutationKind, PendingMutation, Record, RecordDraft, RecordMeta};
use crate::store::LocalStore;
use crate::tenant::TenantContext;
use crate::util::now_ms;

/// Tenant-scoped repository for one named collection.
#[derive(Clone)]
pub struct Repository {
    store: Arc<Mutex<LocalStore>>,
    ctx: TenantContext,
    collection: String,
    events: EventBus,
}

impl Repository {
    pub fn new(
        store: Arc<Mutex<LocalStore>>,
        ctx: TenantContext,
        collection: impl Into<String>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            ctx,
            collection: collection.into(),
            events,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn context(&self) -> &TenantContext {
        &self.ctx
    }

    /// Current local view of a record, tombstones included (callers
    /// filter on `meta.deleted`).
    pub async fn get(&self, id: &str) -> Result<Option<Record>> {
        let store = self.store.lock().await;
        store.get_record(&self.ctx.tenant_id, &self.collection, id)
    }

    /// All records in the collection, most recently updated first.
    pub async fn get_all(&self) -> Result<Vec<Record>> {
        let store = self.store.lock().await;
        store.get_records(&self.ctx.tenant_id, &self.collection)
    }

    /// Records matching a caller predicate over the payload.
    pub async fn get_where<F>(&self, predicate: F) -> Result<Vec<Record>>
    where
        F: Fn(&Record) -> bool,
    {
        let records = self.get_all().await?;
        Ok(records.into_iter().filter(|r| predicate(r)).collect())
    }

    /// Write a record and queue its replication in one transaction.
    pub async fn put(&self, draft: RecordDraft) -> Result<Record> {
        self.ctx.ensure_tenant(&draft.tenant_id)?;

        let mut store = self.store.lock().await;
        let previous = store.get_record(&self.ctx.tenant_id, &self.collection, &draft.id)?;

        let now = now_ms();
        let (record, kind) = match previous {
            Some(prev) => {
                let mut clock = prev.meta.clock.clone();
                clock.increment(&self.ctx.client_id);
                let record = Record {
                    id: draft.id,
                    tenant_id: draft.tenant_id,
                    collection: self.collection.clone(),
                    payload: draft.payload,
                    meta: RecordMeta {
                        created_at: prev.meta.created_at,
                        updated_at: now.max(prev.meta.updated_at),
                        version: prev.meta.version + 1,
                        deleted: false,
                        last_synced_at: prev.meta.last_synced_at,
                        clock,
                        origin_mutation: None,
                    },
                };
                (record, MutationKind::Update)
            }
            None => {
                let record =
                    Record::first_version(draft, &self.collection, &self.ctx.client_id);
                (record, MutationKind::Create)
            }
        };

        self.commit_write(&mut store, record, kind).await
    }

    /// Soft delete: rewrite as a tombstone and queue a delete mutation.
    pub async fn delete(&self, id: &str) -> Result<Record> {
        let mut store = self.store.lock().await;
        let prev = store
            .get_record(&self.ctx.tenant_id, &self.collection, id)?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let now = now_ms();
        let mut clock = prev.meta.clock.clone();
        clock.increment(&self.ctx.client_id);
        let record = Record {
            id: prev.id,
            tenant_id: prev.tenant_id,
            collection: self.collection.clone(),
            payload: prev.payload,
            meta: RecordMeta {
                created_at: prev.meta.created_at,
                updated_at: now.max(prev.meta.updated_at),
                version: prev.meta.version + 1,
                deleted: true,
                last_synced_at: prev.meta.last_synced_at,
                clock,
                origin_mutation: None,
            },
        };

        self.commit_write(&mut store, record, MutationKind::Delete)
            .await
    }

    /// Administrative wipe of this collection within the caller's
    /// tenant: records and pending mutations both.
    pub async fn clear(&self) -> Result<()> {
        let mut store = self.store.lock().await;
        store.clear_collection(&self.ctx.tenant_id, &self.collection)
    }

    /// Server-change apply path: stamps `last_synced_at` but appends no
    /// mutation. Used by the sync engine for pulled changes and
    /// resolution outputs.
    pub async fn put_from_server(&self, mut record: Record, server_timestamp: i64) -> Result<()> {
        self.ctx.ensure_tenant(&record.tenant_id)?;
        record.meta.last_synced_at = Some(server_timestamp);
        let store = self.store.lock().await;
        store.put_record(&record)
    }

    async fn commit_write(
        &self,
        store: &mut LocalStore,
        mut record: Record,
        kind: MutationKind,
    ) -> Result<Record> {
        let payload = match kind {
            MutationKind::Delete => serde_json::Value::Null,
            _ => record.payload.clone(),
        };
        let mutation = PendingMutation::capture(
            &self.ctx.tenant_id,
            kind,
            &self.collection,
            &record.id,
            payload,
            record.meta.clock.clone(),
        );
        record.meta.origin_mutation = Some(mutation.mutation_id.clone());

        match store.put_record_with_mutation(&record, &mutation) {
            Ok(_seq) => Ok(record),
            Err(Error::StorageExhausted) => {
                self.events.emit(EngineEvent::StorageExhausted {
                    tenant_id: self.ctx.tenant_id.clone(),
                });
                Err(Error::StorageExhausted)
            }
            Err(e) => Err(e),
        }
    }
}

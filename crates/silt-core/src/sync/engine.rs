//! The sync engine: drains the mutation log, advances pull cursors,
//! and reconciles concurrent histories through the resolver.
//!
//! At most one sync pass per tenant runs at a time; reentrant triggers
//! coalesce into a single pending rerun. Conflict detection uses vector
//! clocks when both sides carry them and falls back to the version
//! delta otherwise; a record with a queued local mutation is always
//! treated as diverged in fallback mode.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, Notify};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};
use crate::models::{
    Causality, MutationKind, PendingMutation, Record, RecordMeta, SyncStatus,
};
use crate::outbox::MutationLog;
use crate::resolver::{
    resolve, DeferredConflictRegistry, ManualOutcome, Resolution, ResolverStrategy, Winner,
};
use crate::store::LocalStore;
use crate::sync::transport::{PushError, ReplicationTransport};
use crate::tenant::TenantContext;
use crate::util::{new_id, now_ms};

/// Independent timeout applied to each network operation.
const NETWORK_TIMEOUT: Duration = Duration::from_secs(30);

/// Counters for one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub pushed: usize,
    pub pulled: usize,
    pub conflicts: usize,
    pub deferred: usize,
    /// The pull was replaced by a snapshot catch-up.
    pub snapshot: bool,
    /// The trigger coalesced into an already-running pass.
    pub coalesced: bool,
}

impl SyncOutcome {
    fn coalesced() -> Self {
        Self {
            coalesced: true,
            ..Self::default()
        }
    }
}

enum RemoteAction {
    Ignore,
    FastForward,
    Conflict,
}

pub struct SyncEngine {
    store: Arc<Mutex<LocalStore>>,
    log: MutationLog,
    transport: Arc<dyn ReplicationTransport>,
    default_strategy: ResolverStrategy,
    collection_strategies: HashMap<String, ResolverStrategy>,
    conflicts: Arc<DeferredConflictRegistry>,
    config: EngineConfig,
    ctx: TenantContext,
    events: EventBus,
    flight: Mutex<()>,
    rerun: AtomicBool,
    wake: Notify,
    consecutive_failures: AtomicU32,
}

impl SyncEngine {
    pub fn new(
        store: Arc<Mutex<LocalStore>>,
        transport: Arc<dyn ReplicationTransport>,
        ctx: TenantContext,
        config: EngineConfig,
        events: EventBus,
    ) -> Self {
        let log = MutationLog::new(store.clone(), ctx.tenant_id.clone(), events.clone());
        let default_strategy = ResolverStrategy::from(config.resolver_strategy);
        Self {
            store,
            log,
            transport,
            default_strategy,
            collection_strategies: HashMap::new(),
            conflicts: Arc::new(DeferredConflictRegistry::new()),
            config,
            ctx,
            events,
            flight: Mutex::new(()),
            rerun: AtomicBool::new(false),
            wake: Notify::new(),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Override the resolver for one collection.
    pub fn with_collection_strategy(
        mut self,
        collection: impl Into<String>,
        strategy: ResolverStrategy,
    ) -> Self {
        self.collection_strategies
            .insert(collection.into(), strategy);
        self
    }

    pub fn mutation_log(&self) -> &MutationLog {
        &self.log
    }

    pub fn deferred_conflicts(&self) -> &Arc<DeferredConflictRegistry> {
        &self.conflicts
    }

    /// Non-blocking sync request; the background loop picks it up.
    /// Used by the classifier's interactive-class degradation path.
    pub fn request_sync(&self) {
        self.rerun.store(true, Ordering::Relaxed);
        self.wake.notify_one();
    }

    /// Run one coalesced sync pass for a collection.
    ///
    /// If a pass is already in flight the trigger is recorded and the
    /// running pass repeats once more before releasing the guard.
    pub async fn sync_collection(&self, collection: &str) -> Result<SyncOutcome> {
        let Ok(_guard) = self.flight.try_lock() else {
            self.rerun.store(true, Ordering::Relaxed);
            return Ok(SyncOutcome::coalesced());
        };

        let mut outcome = self.run_pass(collection).await?;
        while self.rerun.swap(false, Ordering::Relaxed) {
            let next = self.run_pass(collection).await?;
            outcome.pushed += next.pushed;
            outcome.pulled += next.pulled;
            outcome.conflicts += next.conflicts;
            outcome.deferred += next.deferred;
            outcome.snapshot |= next.snapshot;
        }
        Ok(outcome)
    }

    async fn run_pass(&self, collection: &str) -> Result<SyncOutcome> {
        self.events.emit(EngineEvent::SyncStarted {
            tenant_id: self.ctx.tenant_id.clone(),
            collection: collection.to_string(),
        });
        self.set_cursor_status(collection, SyncStatus::InProgress, None)
            .await?;

        let result = self.run_phases(collection).await;
        match &result {
            Ok(outcome) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.events.emit(EngineEvent::SyncCompleted {
                    tenant_id: self.ctx.tenant_id.clone(),
                    collection: collection.to_string(),
                    pushed: outcome.pushed,
                    pulled: outcome.pulled,
                });
            }
            Err(error) => {
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                let message = error.to_string();
                self.set_cursor_status(collection, SyncStatus::Error, Some(&message))
                    .await
                    .ok();
                self.events.emit(EngineEvent::SyncFailed {
                    tenant_id: self.ctx.tenant_id.clone(),
                    collection: collection.to_string(),
                    error: message,
                });
            }
        }
        result
    }

    async fn run_phases(&self, collection: &str) -> Result<SyncOutcome> {
        let (pushed, advisories) = self.push_phase(collection).await?;
        let mut outcome = self.pull_phase(collection).await?;
        outcome.pushed = pushed;

        if !advisories.is_empty() {
            self.rebuild_advised(&advisories).await?;
        }

        self.log.report_stuck(self.config.mutation_ttl_ms).await?;
        Ok(outcome)
    }

    // ----- push ----------------------------------------------------------

    async fn push_phase(&self, collection: &str) -> Result<(usize, Vec<PendingMutation>)> {
        let batch = self.log.peek_batch(self.config.push_batch_size).await?;
        let mut blocked: HashSet<(String, String)> = HashSet::new();
        let mut prefix_clean = true;
        let mut pushed = 0;
        let mut advisories = Vec::new();
        let mut last_acked = None;

        for mutation in batch {
            let key = (mutation.collection.clone(), mutation.record_id.clone());
            if blocked.contains(&key) {
                // a causally earlier mutation for this record failed;
                // pushing this one would reorder
                prefix_clean = false;
                continue;
            }

            let result = tokio::time::timeout(
                NETWORK_TIMEOUT,
                self.transport.push(&self.ctx, &mutation),
            )
            .await
            .unwrap_or_else(|_| Err(PushError::Retryable("push timed out".to_string())));

            match result {
                Ok(ack) => {
                    if prefix_clean {
                        self.log.ack_up_to(&mutation.mutation_id).await?;
                    } else {
                        self.log.ack_single(&mutation.mutation_id).await?;
                    }
                    self.stamp_pushed(&mutation, ack.server_timestamp).await?;
                    last_acked = Some(mutation.mutation_id.clone());
                    pushed += 1;
                }
                Err(PushError::Retryable(message)) => {
                    let retries = self.log.requeue(&mutation.mutation_id, &message).await?;
                    if retries >= self.config.max_retries {
                        self.log.mark_exhausted(&mutation.mutation_id).await?;
                    }
                    blocked.insert(key);
                    prefix_clean = false;
                }
                Err(PushError::Conflict(message)) => {
                    self.log.requeue(&mutation.mutation_id, &message).await?;
                    advisories.push(mutation.clone());
                    blocked.insert(key);
                    prefix_clean = false;
                }
                Err(PushError::Permanent(message)) | Err(PushError::Unauthorized(message)) => {
                    self.log.quarantine(&mutation.mutation_id, &message).await?;
                    blocked.insert(key);
                    prefix_clean = false;
                }
            }
        }

        if let Some(mutation_id) = last_acked {
            let store = self.store.lock().await;
            let mut cursor = store.get_cursor(&self.ctx.tenant_id, collection)?;
            cursor.last_pushed_mutation_id = Some(mutation_id);
            store.put_cursor(&cursor)?;
        }

        Ok((pushed, advisories))
    }

    /// Stamp the pushed record as synced and drop its divergence marker.
    async fn stamp_pushed(&self, mutation: &PendingMutation, server_timestamp: i64) -> Result<()> {
        let store = self.store.lock().await;
        let Some(mut record) =
            store.get_record(&self.ctx.tenant_id, &mutation.collection, &mutation.record_id)?
        else {
            return Ok(());
        };
        if record.meta.origin_mutation.as_deref() == Some(&mutation.mutation_id) {
            record.meta.origin_mutation = None;
        }
        record.meta.last_synced_at = Some(server_timestamp);
        store.put_record(&record)
    }

    /// Rebuild mutations that hit a conflict advisory: after the pull
    /// has reconciled local state, the surviving divergence is captured
    /// again under a fresh mutation id.
    async fn rebuild_advised(&self, advisories: &[PendingMutation]) -> Result<()> {
        let store = self.store.lock().await;
        for old in advisories {
            let still_pending = store
                .mutations_in_state(&self.ctx.tenant_id, crate::models::MutationState::Pending)?
                .iter()
                .any(|m| m.mutation_id == old.mutation_id);
            if !still_pending {
                // the resolver elected the remote side and subsumed it
                continue;
            }
            store.remove_mutation(&old.mutation_id)?;

            let Some(mut record) =
                store.get_record(&self.ctx.tenant_id, &old.collection, &old.record_id)?
            else {
                continue;
            };
            let kind = if record.meta.deleted {
                MutationKind::Delete
            } else {
                MutationKind::Update
            };
            let payload = match kind {
                MutationKind::Delete => serde_json::Value::Null,
                _ => record.payload.clone(),
            };
            let rebuilt = PendingMutation::capture(
                &self.ctx.tenant_id,
                kind,
                &old.collection,
                &old.record_id,
                payload,
                record.meta.clock.clone(),
            );
            record.meta.origin_mutation = Some(rebuilt.mutation_id.clone());
            store.put_record(&record)?;
            store.append_mutation(&rebuilt)?;
        }
        Ok(())
    }

    // ----- pull ----------------------------------------------------------

    async fn pull_phase(&self, collection: &str) -> Result<SyncOutcome> {
        let since = {
            let store = self.store.lock().await;
            store.get_cursor(&self.ctx.tenant_id, collection)?.last_pulled_at
        };

        let response = tokio::time::timeout(
            NETWORK_TIMEOUT,
            self.transport
                .pull(&self.ctx, collection, since, self.config.pull_max_changes),
        )
        .await
        .map_err(|_| Error::Transport("pull timed out".to_string()))??;

        if response.cursor_lost
            || response.changes.len() >= self.config.snapshot_divergence_threshold
        {
            return self.snapshot_catchup(collection).await;
        }

        let held: HashSet<String> = self
            .conflicts
            .held_records(&self.ctx.tenant_id, collection)
            .into_iter()
            .collect();

        let mut outcome = SyncOutcome::default();
        let mut floor = response.server_timestamp;
        for incoming in response.changes {
            if incoming.tenant_id != self.ctx.tenant_id {
                self.events.emit(EngineEvent::TenantRefused {
                    authenticated: self.ctx.tenant_id.clone(),
                    declared: incoming.tenant_id.clone(),
                });
                tracing::warn!(
                    tenant = %self.ctx.tenant_id,
                    declared = %incoming.tenant_id,
                    "refused cross-tenant change from pull"
                );
                continue;
            }

            let origin = incoming.meta.last_synced_at.unwrap_or(response.server_timestamp);
            if held.contains(&incoming.id) {
                // still suspended from an earlier pass; keep re-offering
                outcome.deferred += 1;
                floor = floor.min(origin - 1);
                continue;
            }

            match self
                .apply_remote_change(collection, incoming, response.server_timestamp)
                .await?
            {
                Applied::Ignored => {}
                Applied::Written => outcome.pulled += 1,
                Applied::Resolved => {
                    outcome.pulled += 1;
                    outcome.conflicts += 1;
                }
                Applied::Deferred => {
                    outcome.deferred += 1;
                    floor = floor.min(origin - 1);
                }
            }
        }

        {
            let store = self.store.lock().await;
            let mut cursor = store.get_cursor(&self.ctx.tenant_id, collection)?;
            cursor.advance(floor);
            cursor.last_status = SyncStatus::Success;
            cursor.last_error = None;
            store.put_cursor(&cursor)?;
        }
        Ok(outcome)
    }

    async fn apply_remote_change(
        &self,
        collection: &str,
        incoming: Record,
        server_timestamp: i64,
    ) -> Result<Applied> {
        let local = {
            let store = self.store.lock().await;
            store.get_record(&self.ctx.tenant_id, collection, &incoming.id)?
        };

        let Some(local) = local else {
            // unseen record: write through the server-change path
            let mut record = incoming;
            record.meta.last_synced_at = Some(server_timestamp);
            record.meta.origin_mutation = None;
            let store = self.store.lock().await;
            if record.meta.deleted {
                // a tombstone for a record we never had needs no body
                store.remove_record(&self.ctx.tenant_id, collection, &record.id)?;
            } else {
                store.put_record(&record)?;
            }
            return Ok(Applied::Written);
        };

        let has_pending = local.meta.origin_mutation.is_some();
        match classify_remote(&local, &incoming, has_pending) {
            RemoteAction::Ignore => Ok(Applied::Ignored),
            RemoteAction::FastForward => {
                let mut record = incoming;
                record.meta.clock.merge(&local.meta.clock);
                record.meta.updated_at = record.meta.updated_at.max(local.meta.updated_at);
                record.meta.last_synced_at = Some(server_timestamp);
                record.meta.origin_mutation = None;
                let store = self.store.lock().await;
                if record.meta.deleted && !has_pending {
                    // deletion propagated; the tombstone can go
                    store.remove_record(&self.ctx.tenant_id, collection, &record.id)?;
                } else {
                    store.put_record(&record)?;
                }
                Ok(Applied::Written)
            }
            RemoteAction::Conflict => self
                .resolve_remote_conflict(collection, local, incoming, server_timestamp)
                .await,
        }
    }

    async fn resolve_remote_conflict(
        &self,
        collection: &str,
        local: Record,
        incoming: Record,
        server_timestamp: i64,
    ) -> Result<Applied> {
        let strategy = self
            .collection_strategies
            .get(collection)
            .unwrap_or(&self.default_strategy);

        match resolve(strategy, &local, &incoming) {
            Resolution::Resolved {
                payload,
                deleted,
                winner,
            } => {
                let conflict_id = new_id();
                self.events.emit(EngineEvent::ConflictDetected {
                    conflict_id: conflict_id.clone(),
                    tenant_id: self.ctx.tenant_id.clone(),
                    collection: collection.to_string(),
                    record_id: local.id.clone(),
                });
                self.write_resolution(
                    &local,
                    &incoming,
                    payload,
                    deleted,
                    winner,
                    server_timestamp,
                )
                .await?;
                self.events.emit(EngineEvent::ConflictResolved {
                    conflict_id,
                    tenant_id: self.ctx.tenant_id.clone(),
                    record_id: local.id.clone(),
                });
                Ok(Applied::Resolved)
            }
            Resolution::Deferred => {
                let conflict_id =
                    self.conflicts
                        .register(&self.ctx.tenant_id, local.clone(), incoming);
                self.events.emit(EngineEvent::ConflictDetected {
                    conflict_id,
                    tenant_id: self.ctx.tenant_id.clone(),
                    collection: collection.to_string(),
                    record_id: local.id,
                });
                Ok(Applied::Deferred)
            }
        }
    }

    /// Write a resolver output with the post-resolution metadata rules:
    /// version jumps past both sides, clocks merge, and a divergence
    /// the resolver rejected is subsumed out of the mutation log.
    async fn write_resolution(
        &self,
        local: &Record,
        incoming: &Record,
        payload: serde_json::Value,
        deleted: bool,
        winner: Winner,
        server_timestamp: i64,
    ) -> Result<()> {
        let updated_at = match winner {
            Winner::Local => local.meta.updated_at,
            Winner::Remote => incoming.meta.updated_at,
            Winner::Merged => local.meta.updated_at.max(incoming.meta.updated_at),
        }
        .max(local.meta.updated_at);

        let mut clock = local.meta.clock.clone();
        clock.merge(&incoming.meta.clock);
        clock.increment(&self.ctx.client_id);

        let origin_mutation = match winner {
            // the divergence is still queued and will be re-pushed
            Winner::Local => local.meta.origin_mutation.clone(),
            _ => None,
        };

        let record = Record {
            id: local.id.clone(),
            tenant_id: local.tenant_id.clone(),
            collection: local.collection.clone(),
            payload,
            meta: RecordMeta {
                created_at: local.meta.created_at.min(incoming.meta.created_at),
                updated_at,
                version: local.meta.version.max(incoming.meta.version) + 1,
                deleted,
                last_synced_at: Some(server_timestamp),
                clock,
                origin_mutation,
            },
        };

        let store = self.store.lock().await;
        store.put_record(&record)?;
        if !matches!(winner, Winner::Local) {
            store.remove_mutations_for_record(&self.ctx.tenant_id, &local.collection, &local.id)?;
        }
        Ok(())
    }

    /// Resume a suspended conflict with the application's decision.
    pub async fn resolve_deferred(
        &self,
        conflict_id: &str,
        outcome: ManualOutcome,
    ) -> Result<Record> {
        let conflict = self
            .conflicts
            .take(conflict_id)
            .ok_or_else(|| Error::NotFound(conflict_id.to_string()))?;

        let (payload, deleted, winner) = match outcome {
            ManualOutcome::KeepLocal => (
                conflict.local.payload.clone(),
                conflict.local.meta.deleted,
                Winner::Local,
            ),
            ManualOutcome::AcceptRemote => (
                conflict.incoming.payload.clone(),
                conflict.incoming.meta.deleted,
                Winner::Remote,
            ),
            ManualOutcome::Merge(value) => (value, false, Winner::Merged),
        };

        let server_timestamp = conflict
            .incoming
            .meta
            .last_synced_at
            .unwrap_or_else(now_ms);
        self.write_resolution(
            &conflict.local,
            &conflict.incoming,
            payload,
            deleted,
            winner,
            server_timestamp,
        )
        .await?;
        self.events.emit(EngineEvent::ConflictResolved {
            conflict_id: conflict_id.to_string(),
            tenant_id: self.ctx.tenant_id.clone(),
            record_id: conflict.record_id.clone(),
        });

        let store = self.store.lock().await;
        let record = store
            .get_record(&self.ctx.tenant_id, &conflict.collection, &conflict.record_id)?
            .ok_or_else(|| Error::NotFound(conflict.record_id))?;
        Ok(record)
    }

    // ----- snapshot fallback ---------------------------------------------

    async fn snapshot_catchup(&self, collection: &str) -> Result<SyncOutcome> {
        tracing::info!(
            tenant = %self.ctx.tenant_id,
            collection,
            "delta catch-up infeasible, requesting snapshot"
        );
        let snapshot = tokio::time::timeout(
            NETWORK_TIMEOUT,
            self.transport.snapshot(&self.ctx, collection),
        )
        .await
        .map_err(|_| Error::Transport("snapshot timed out".to_string()))??;

        self.ctx.ensure_tenant(&snapshot.tenant_id)?;
        snapshot.verify()?;

        let mut records: Vec<Record> = serde_json::from_value(snapshot.payload.clone())?;
        for record in &mut records {
            record.meta.last_synced_at = Some(snapshot.created_at);
            record.meta.origin_mutation = None;
        }

        let pulled = records.len();
        {
            let mut store = self.store.lock().await;
            store.replace_collection(
                &self.ctx.tenant_id,
                collection,
                &records,
                snapshot.created_at,
            )?;
            store.put_snapshot(&snapshot)?;
        }

        Ok(SyncOutcome {
            pulled,
            snapshot: true,
            ..SyncOutcome::default()
        })
    }

    // ----- cursors & background loop -------------------------------------

    async fn set_cursor_status(
        &self,
        collection: &str,
        status: SyncStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let store = self.store.lock().await;
        let mut cursor = store.get_cursor(&self.ctx.tenant_id, collection)?;
        cursor.last_status = status;
        cursor.last_error = error.map(str::to_string);
        store.put_cursor(&cursor)
    }

    /// Background loop: periodic timer while online, online transitions,
    /// and explicit wake-ups all trigger a pass; failures back off
    /// exponentially.
    pub async fn run(
        self: Arc<Self>,
        collections: Vec<String>,
        mut online: watch::Receiver<bool>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.config.sync_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *online.borrow() {
                        self.sync_all(&collections).await;
                    }
                }
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *online.borrow() {
                        self.sync_all(&collections).await;
                    }
                }
                _ = self.wake.notified() => {
                    if *online.borrow() {
                        self.rerun.store(false, Ordering::Relaxed);
                        self.sync_all(&collections).await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn sync_all(&self, collections: &[String]) {
        for collection in collections {
            if let Err(error) = self.sync_collection(collection).await {
                tracing::warn!(
                    tenant = %self.ctx.tenant_id,
                    collection = %collection,
                    %error,
                    "sync pass failed"
                );
                let failures = self.consecutive_failures.load(Ordering::Relaxed);
                tokio::time::sleep(self.config.backoff_delay(failures)).await;
            }
        }
    }
}

enum Applied {
    Ignored,
    Written,
    Resolved,
    Deferred,
}

/// The conflict rule. Vector clocks are authoritative when both sides
/// carry them; the version delta is the fallback, with any queued local
/// divergence treated as concurrent.
fn classify_remote(local: &Record, incoming: &Record, has_pending: bool) -> RemoteAction {
    if !local.meta.clock.is_empty() && !incoming.meta.clock.is_empty() {
        return match local.meta.clock.compare(&incoming.meta.clock) {
            Causality::Equal | Causality::After => RemoteAction::Ignore,
            Causality::Before => RemoteAction::FastForward,
            Causality::Concurrent => RemoteAction::Conflict,
        };
    }

    if incoming.meta.version < local.meta.version
        || (incoming.meta.version == local.meta.version && !has_pending)
    {
        // already applied or surpassed; at-most-once
        RemoteAction::Ignore
    } else if incoming.meta.version == local.meta.version + 1 && !has_pending {
        RemoteAction::FastForward
    } else {
        RemoteAction::Conflict
    }
}

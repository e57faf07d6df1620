//! Append-ordered mutation log per tenant.
//!
//! The server sees mutations in the order they were appended on the
//! client; reordering is permitted only once the server has
//! acknowledged the earlier one. A mutation leaves the log only on
//! durable server acceptance, or by moving to the quarantine/exhausted
//! sub-queues where it waits for the operator.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::Result;
use crate::events::{EngineEvent, EventBus};
use crate::models::{MutationState, PendingMutation};
use crate::store::LocalStore;
use crate::util::now_ms;

#[derive(Clone)]
pub struct MutationLog {
    store: Arc<Mutex<LocalStore>>,
    tenant_id: String,
    events: EventBus,
}

impl MutationLog {
    pub fn new(store: Arc<Mutex<LocalStore>>, tenant_id: impl Into<String>, events: EventBus) -> Self {
        Self {
            store,
            tenant_id: tenant_id.into(),
            events,
        }
    }

    pub async fn append(&self, mutation: &PendingMutation) -> Result<i64> {
        let store = self.store.lock().await;
        store.append_mutation(mutation)
    }

    /// Oldest pending mutations in append order.
    pub async fn peek_batch(&self, n: usize) -> Result<Vec<PendingMutation>> {
        let store = self.store.lock().await;
        store.pending_mutations(&self.tenant_id, n)
    }

    /// Remove the contiguous acknowledged prefix ending at `mutation_id`.
    pub async fn ack_up_to(&self, mutation_id: &str) -> Result<usize> {
        let store = self.store.lock().await;
        store.ack_up_to(&self.tenant_id, mutation_id)
    }

    /// Remove one acknowledged mutation that sits behind an earlier
    /// unacknowledged one for a different record.
    pub async fn ack_single(&self, mutation_id: &str) -> Result<()> {
        let store = self.store.lock().await;
        store.remove_mutation(mutation_id)
    }

    /// Retryable failure: bump the retry count, keep queue position.
    /// Returns the new retry count.
    pub async fn requeue(&self, mutation_id: &str, error: &str) -> Result<u32> {
        let store = self.store.lock().await;
        store.requeue_mutation(mutation_id, error)
    }

    /// Move a permanently failed mutation to the quarantine sub-queue.
    pub async fn quarantine(&self, mutation_id: &str, error: &str) -> Result<()> {
        {
            let store = self.store.lock().await;
            store.set_mutation_state(mutation_id, MutationState::Quarantined, Some(error))?;
        }
        tracing::warn!(
            tenant = %self.tenant_id,
            mutation = %mutation_id,
            error,
            "mutation quarantined"
        );
        self.events.emit(EngineEvent::MutationQuarantined {
            tenant_id: self.tenant_id.clone(),
            mutation_id: mutation_id.to_string(),
            error: error.to_string(),
        });
        Ok(())
    }

    /// Park a mutation whose retry budget is spent.
    pub async fn mark_exhausted(&self, mutation_id: &str) -> Result<()> {
        {
            let store = self.store.lock().await;
            store.set_mutation_state(mutation_id, MutationState::Exhausted, None)?;
        }
        self.events.emit(EngineEvent::RetryExhausted {
            tenant_id: self.tenant_id.clone(),
            mutation_id: mutation_id.to_string(),
        });
        Ok(())
    }

    /// Operator re-arm of exhausted mutations; resets retry counters.
    pub async fn retry_exhausted(&self) -> Result<usize> {
        let store = self.store.lock().await;
        store.reset_exhausted(&self.tenant_id)
    }

    pub async fn quarantined(&self) -> Result<Vec<PendingMutation>> {
        let store = self.store.lock().await;
        store.mutations_in_state(&self.tenant_id, MutationState::Quarantined)
    }

    pub async fn len(&self) -> Result<usize> {
        let store = self.store.lock().await;
        store.pending_count(&self.tenant_id)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Report pending mutations older than `ttl_ms` as stuck.
    pub async fn report_stuck(&self, ttl_ms: u64) -> Result<usize> {
        let cutoff = now_ms() - ttl_ms as i64;
        let stuck = {
            let store = self.store.lock().await;
            store.stuck_mutations(&self.tenant_id, cutoff)?
        };
        if !stuck.is_empty() {
            self.events.emit(EngineEvent::MutationsStuck {
                tenant_id: self.tenant_id.clone(),
                count: stuck.len(),
            });
        }
        Ok(stuck.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MutationKind, VectorClock};
    use serde_json::json;

    fn mutation(tenant: &str, id: &str) -> PendingMutation {
        PendingMutation::capture(
            tenant,
            MutationKind::Update,
            "documents",
            id,
            json!({"title": id}),
            VectorClock::new(),
        )
    }

    async fn setup() -> MutationLog {
        let store = Arc::new(Mutex::new(LocalStore::open_in_memory().unwrap()));
        MutationLog::new(store, "t1", EventBus::default())
    }

    #[tokio::test]
    async fn append_then_peek_preserves_order() {
        let log = setup().await;
        let first = mutation("t1", "d1");
        let second = mutation("t1", "d2");
        log.append(&first).await.unwrap();
        log.append(&second).await.unwrap();

        let batch = log.peek_batch(10).await.unwrap();
        assert_eq!(batch[0].mutation_id, first.mutation_id);
        assert_eq!(batch[1].mutation_id, second.mutation_id);
    }

    #[tokio::test]
    async fn quarantine_emits_event_and_leaves_queue() {
        let log = setup().await;
        let mut bus_rx = log.events.subscribe();
        let m = mutation("t1", "d1");
        log.append(&m).await.unwrap();

        log.quarantine(&m.mutation_id, "authorization denied")
            .await
            .unwrap();

        assert!(log.is_empty().await.unwrap());
        assert_eq!(log.quarantined().await.unwrap().len(), 1);
        match bus_rx.recv().await.unwrap() {
            EngineEvent::MutationQuarantined { mutation_id, .. } => {
                assert_eq!(mutation_id, m.mutation_id);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhausted_mutations_can_be_rearmed() {
        let log = setup().await;
        let m = mutation("t1", "d1");
        log.append(&m).await.unwrap();
        log.mark_exhausted(&m.mutation_id).await.unwrap();
        assert!(log.is_empty().await.unwrap());

        let rearmed = log.retry_exhausted().await.unwrap();
        assert_eq!(rearmed, 1);
        assert_eq!(log.len().await.unwrap(), 1);
        assert_eq!(log.peek_batch(1).await.unwrap()[0].retry_count, 0);
    }

    #[tokio::test]
    async fn stuck_reporting_counts_old_mutations() {
        let log = setup().await;
        let mut old = mutation("t1", "d1");
        old.timestamp = now_ms() - 10_000;
        log.append(&old).await.unwrap();
        log.append(&mutation("t1", "d2")).await.unwrap();

        assert_eq!(log.report_stuck(5_000).await.unwrap(), 1);
        assert_eq!(log.report_stuck(60_000).await.unwrap(), 0);
    }
}

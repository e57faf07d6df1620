//! Realtime channel and classifier scenarios: degradation paths,
//! class exclusions, tenant refusal, and idempotent delivery.

mod common;

use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;

use common::MockTransport;
use silt_core::classify::{Dispatch, InteractionRouter};
use silt_core::config::EngineConfig;
use silt_core::error::Error;
use silt_core::events::{EngineEvent, EventBus};
use silt_core::models::{DeliveryClass, Envelope, RecordDraft};
use silt_core::realtime::{AllowAllRooms, RealtimeChannel, RealtimeHub};
use silt_core::repository::Repository;
use silt_core::store::LocalStore;
use silt_core::sync::SyncEngine;
use silt_core::tenant::TenantContext;

struct Fixture {
    store: Arc<Mutex<LocalStore>>,
    hub: Arc<RealtimeHub>,
    sender: Arc<RealtimeChannel>,
    recipient: Arc<RealtimeChannel>,
    router: InteractionRouter,
    repo: Repository,
    events: EventBus,
}

fn fixture_with(config: EngineConfig) -> Fixture {
    let store = Arc::new(Mutex::new(LocalStore::open_in_memory().unwrap()));
    let events = EventBus::default();
    let ctx = TenantContext::new("t1", "u1", "c1");
    let hub = Arc::new(RealtimeHub::new(
        &config,
        Box::new(AllowAllRooms),
        events.clone(),
    ));
    let sender = Arc::new(RealtimeChannel::new(
        hub.clone(),
        ctx.clone(),
        events.clone(),
    ));
    let recipient = Arc::new(RealtimeChannel::new(
        hub.clone(),
        TenantContext::new("t1", "u2", "c2"),
        events.clone(),
    ));
    let engine = Arc::new(SyncEngine::new(
        store.clone(),
        MockTransport::new(),
        ctx.clone(),
        config.clone(),
        events.clone(),
    ));
    let repo = Repository::new(store.clone(), ctx, "documents", events.clone());
    let router = InteractionRouter::new(
        sender.clone(),
        engine,
        store.clone(),
        config.queue_size_limit,
        config.mutation_ttl_ms,
        events.clone(),
    );
    Fixture {
        store,
        hub,
        sender,
        recipient,
        router,
        repo,
        events,
    }
}

fn fixture() -> Fixture {
    fixture_with(EngineConfig::default())
}

fn event_msg(n: u32) -> Envelope {
    Envelope::direct(
        DeliveryClass::Event,
        "chat",
        "t1",
        "u1",
        "u2",
        json!({"n": n}),
    )
}

// Event-class traffic degrades to the durable queue, then drains
// exactly once on recovery.
#[tokio::test(flavor = "multi_thread")]
async fn event_class_degrades_to_durable_queue_then_delivers_once() {
    let f = fixture();
    // channel down: message must be durably queued
    let dispatch = f.router.dispatch(event_msg(1)).await.unwrap();
    assert_eq!(dispatch, Dispatch::Queued);
    {
        let store = f.store.lock().await;
        assert_eq!(store.queued_message_count("t1").unwrap(), 1);
    }

    // recovery: sender reconnects, recipient is listening
    let _sender_rx = f.sender.connect().unwrap();
    let mut recipient_rx = f.recipient.connect().unwrap();

    let flushed = f.router.flush_durable().await.unwrap();
    assert_eq!(flushed, 1);
    {
        let store = f.store.lock().await;
        assert_eq!(store.queued_message_count("t1").unwrap(), 0);
    }

    let delivered = recipient_rx.try_recv().unwrap();
    assert!(f.recipient.accept(&delivered));
    // no second copy anywhere
    assert!(recipient_rx.try_recv().is_err());
    assert!(!f.recipient.accept(&delivered));
}

// The transactional class never touches the realtime path.
#[tokio::test(flavor = "multi_thread")]
async fn transactional_class_is_refused_with_no_side_effects() {
    let f = fixture();
    let _rx = f.sender.connect().unwrap();

    let env = Envelope::direct(
        DeliveryClass::Transactional,
        "payment",
        "t1",
        "u1",
        "u2",
        json!({"amount": 100}),
    );
    let err = f.router.dispatch(env.clone()).await.unwrap_err();
    assert!(matches!(err, Error::RealtimeNotAllowed));

    // no queue, presence, or room side effects
    {
        let store = f.store.lock().await;
        assert_eq!(store.queued_message_count("t1").unwrap(), 0);
    }
    assert_eq!(f.hub.offline_depth("t1", "u2"), 0);
    assert!(f.hub.presence("t1").is_empty());

    // the channel itself refuses too, connected or not
    let err = f.sender.send(&env).unwrap_err();
    assert!(matches!(err, Error::RealtimeNotAllowed));
}

// The transactional path goes through the repository and outbox.
#[tokio::test(flavor = "multi_thread")]
async fn transactional_writes_take_the_durable_path() {
    let f = fixture();
    let record = f
        .router
        .transactional_write(&f.repo, RecordDraft::new("inv-1", "t1", json!({"total": 40})))
        .await
        .unwrap();
    assert_eq!(record.meta.version, 1);

    let store = f.store.lock().await;
    assert_eq!(store.pending_count("t1").unwrap(), 1);
}

// A message declaring a foreign tenant is refused and audited.
#[tokio::test(flavor = "multi_thread")]
async fn cross_tenant_message_is_refused_and_audited() {
    let f = fixture();
    let mut events = f.events.subscribe();
    let _rx = f.sender.connect().unwrap();

    let env = Envelope::direct(DeliveryClass::Event, "chat", "t2", "u1", "u2", json!({}));
    let err = f.router.dispatch(env).await.unwrap_err();
    assert!(matches!(err, Error::TenantMismatch { .. }));

    let mut saw_audit = false;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::TenantRefused {
            authenticated,
            declared,
        } = event
        {
            assert_eq!(authenticated, "t1");
            assert_eq!(declared, "t2");
            saw_audit = true;
        }
    }
    assert!(saw_audit);

    // nothing was queued under either tenant
    let store = f.store.lock().await;
    assert_eq!(store.queued_message_count("t1").unwrap(), 0);
    assert_eq!(store.queued_message_count("t2").unwrap(), 0);
}

// Presence-grade traffic is dropped, never queued, when degraded.
#[tokio::test(flavor = "multi_thread")]
async fn presence_class_drops_when_degraded() {
    let f = fixture();
    let env = Envelope::direct(DeliveryClass::Presence, "status", "t1", "u1", "u2", json!({}));
    let dispatch = f.router.dispatch(env).await.unwrap();
    assert_eq!(dispatch, Dispatch::Dropped);

    let store = f.store.lock().await;
    assert_eq!(store.queued_message_count("t1").unwrap(), 0);
}

// Interactive traffic falls back to deferred reconciliation.
#[tokio::test(flavor = "multi_thread")]
async fn interactive_class_defers_to_sync_when_degraded() {
    let f = fixture();
    let env = Envelope::direct(DeliveryClass::Interactive, "cursor", "t1", "u1", "u2", json!({}));
    let dispatch = f.router.dispatch(env).await.unwrap();
    assert_eq!(dispatch, Dispatch::Deferred);
}

// Queued messages expire within their TTL and are
// reported, never silently lost.
#[tokio::test(flavor = "multi_thread")]
async fn queued_messages_expire_with_report() {
    let config = EngineConfig {
        mutation_ttl_ms: 0,
        ..Default::default()
    };
    let f = fixture_with(config);
    let mut events = f.events.subscribe();

    f.router.dispatch(event_msg(1)).await.unwrap();

    let _sender_rx = f.sender.connect().unwrap();
    let mut recipient_rx = f.recipient.connect().unwrap();

    // a zero TTL expires the message before the flush
    let flushed = f.router.flush_durable().await.unwrap();
    assert_eq!(flushed, 0);
    assert!(recipient_rx.try_recv().is_err());

    let mut saw_expiry = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, EngineEvent::QueuedMessageExpired { .. }) {
            saw_expiry = true;
        }
    }
    assert!(saw_expiry);
}

// The durable fallback queue is bounded per tenant.
#[tokio::test(flavor = "multi_thread")]
async fn durable_queue_is_bounded() {
    let config = EngineConfig {
        queue_size_limit: 2,
        ..Default::default()
    };
    let f = fixture_with(config);

    f.router.dispatch(event_msg(1)).await.unwrap();
    f.router.dispatch(event_msg(2)).await.unwrap();
    let err = f.router.dispatch(event_msg(3)).await.unwrap_err();
    assert!(matches!(err, Error::QueueFull(_)));
}

// Offline recipients of direct sends poll their server-side queue.
#[tokio::test(flavor = "multi_thread")]
async fn hub_offline_queue_delivers_on_poll() {
    let f = fixture();
    let _sender_rx = f.sender.connect().unwrap();

    // recipient has no connection: event-class messages park in the
    // hub's per-recipient queue
    f.sender.send(&event_msg(7)).unwrap();
    assert_eq!(f.hub.offline_depth("t1", "u2"), 1);

    let polled = f.recipient.poll_offline();
    assert_eq!(polled.len(), 1);
    assert_eq!(polled[0].payload["n"], 7);
    assert_eq!(f.hub.offline_depth("t1", "u2"), 0);
}

//! Effective-online derivation.
//!
//! Combines the host's advertised reachability with an active probe
//! against a known server endpoint. Transitions are debounced with a
//! minimum dwell time so a flapping link cannot drive sync storms.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventBus};

/// Active reachability check against a known endpoint.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn check(&self) -> bool;
}

/// `HEAD /ping` probe against the replication backend.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}/ping", crate::util::trim_trailing(base_url)),
        }
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn check(&self) -> bool {
        match self.client.head(&self.url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

struct MonitorState {
    online: bool,
    /// `None` until the first transition, which is never held back.
    last_transition: Option<Instant>,
}

/// Single effective-online signal with an event stream.
pub struct ConnectivityMonitor {
    probe: Arc<dyn ReachabilityProbe>,
    host_reachable: AtomicBool,
    state: Mutex<MonitorState>,
    tx: watch::Sender<bool>,
    dwell: Duration,
    events: EventBus,
}

impl ConnectivityMonitor {
    pub fn new(probe: Arc<dyn ReachabilityProbe>, config: &EngineConfig, events: EventBus) -> Self {
        let (tx, _rx) = watch::channel(false);
        let dwell = config.dwell();
        Self {
            probe,
            // assume reachable until the host says otherwise
            host_reachable: AtomicBool::new(true),
            state: Mutex::new(MonitorState {
                online: false,
                last_transition: None,
            }),
            tx,
            dwell,
            events,
        }
    }

    /// Stream of effective-online values; emits only on change.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Feed the host's advertised reachability (OS network events).
    pub fn set_host_reachability(&self, reachable: bool) {
        self.host_reachable.store(reachable, Ordering::Relaxed);
    }

    /// Run one probe round and apply the debounced transition rule.
    /// Returns the effective state after the round.
    pub async fn tick(&self) -> bool {
        let probe_ok = self.probe.check().await;
        let candidate = self.host_reachable.load(Ordering::Relaxed) || probe_ok;
        self.apply(candidate)
    }

    fn apply(&self, candidate: bool) -> bool {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if candidate == state.online {
            return state.online;
        }
        // refuse to flip again inside the dwell window
        if let Some(last) = state.last_transition {
            if last.elapsed() < self.dwell {
                return state.online;
            }
        }

        state.online = candidate;
        state.last_transition = Some(Instant::now());
        let _ = self.tx.send(candidate);
        if candidate {
            tracing::info!("connectivity: online");
            self.events.emit(EngineEvent::Online);
        } else {
            tracing::info!("connectivity: offline");
            self.events.emit(EngineEvent::Offline);
        }
        state.online
    }

    /// Probe loop; runs until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::AppConfig;
use crate::error::AppError;

/// One pull-budget unit buys this many requested changes.
const PULL_PAGE_UNIT: usize = 100;
/// Snapshots rebuild full collection state; charge them a fixed heavy
/// slice of the pull budget.
const SNAPSHOT_COST: u32 = 25;
/// Escalation doubles stop here.
const MAX_BREACH_DOUBLINGS: u32 = 5;
/// Ceiling on the retry-after hint.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(900);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Op {
    Push,
    Pull,
}

impl Op {
    const fn label(self) -> &'static str {
        match self {
            Self::Push => "sync_push",
            Self::Pull => "sync_pull",
        }
    }
}

struct Bucket {
    window_started: Instant,
    spent: u32,
    /// Consecutive refusals; cleared when a fresh window opens.
    breaches: u32,
}

#[derive(Default)]
struct LimiterMetrics {
    push_units: AtomicU64,
    pull_units: AtomicU64,
    refusals: AtomicU64,
    escalations: AtomicU64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct LimiterSnapshot {
    pub push_units_spent: u64,
    pub pull_units_spent: u64,
    pub refusals: u64,
    pub escalations: u64,
}

/// Unit-cost limiter for the replication endpoints.
///
/// Push and pull draw from separate per-user budgets that refill each
/// window. A push costs one unit per mutation. A pull is charged by its
/// requested page size, so a client cannot dodge the cap by asking for
/// many small pages, and a snapshot draws a fixed heavy cost from the
/// pull budget. The retry-after hint doubles on every consecutive
/// refusal: sync clients treat 429 as a retryable failure, so the
/// growing hint lands them on the same exponential backoff they already
/// apply to transport faults instead of hammering the next window edge.
#[derive(Clone)]
pub struct SyncRateLimiter {
    buckets: Arc<Mutex<HashMap<(Op, u64), Bucket>>>,
    window: Duration,
    push_budget: u32,
    pull_budget: u32,
    metrics: Arc<LimiterMetrics>,
}

impl SyncRateLimiter {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            window: config.rate_limit_window,
            push_budget: config.push_rate_limit_per_window,
            pull_budget: config.pull_rate_limit_per_window,
            metrics: Arc::new(LimiterMetrics::default()),
        }
    }

    /// One pushed mutation, one unit.
    pub async fn check_push(&self, user_id: &str) -> Result<(), AppError> {
        self.charge(Op::Push, user_id, 1).await
    }

    /// Charged by requested page size.
    pub async fn check_pull(&self, user_id: &str, requested_changes: usize) -> Result<(), AppError> {
        let pages = (requested_changes / PULL_PAGE_UNIT) as u32;
        self.charge(Op::Pull, user_id, 1 + pages).await
    }

    pub async fn check_snapshot(&self, user_id: &str) -> Result<(), AppError> {
        self.charge(Op::Pull, user_id, SNAPSHOT_COST).await
    }

    async fn charge(&self, op: Op, user_id: &str, cost: u32) -> Result<(), AppError> {
        let budget = match op {
            Op::Push => self.push_budget,
            Op::Pull => self.pull_budget,
        };
        let fingerprint = user_fingerprint(user_id);
        let now = Instant::now();

        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry((op, fingerprint)).or_insert(Bucket {
            window_started: now,
            spent: 0,
            breaches: 0,
        });

        if now.duration_since(bucket.window_started) >= self.window {
            bucket.window_started = now;
            bucket.spent = 0;
            bucket.breaches = 0;
        }

        if bucket.spent.saturating_add(cost) > budget {
            bucket.breaches = bucket.breaches.saturating_add(1);
            let window_left = self
                .window
                .saturating_sub(now.duration_since(bucket.window_started));
            let hold = escalated_hold(window_left, bucket.breaches);

            self.metrics.refusals.fetch_add(1, Ordering::Relaxed);
            if bucket.breaches > 1 {
                self.metrics.escalations.fetch_add(1, Ordering::Relaxed);
            }
            let user = format!("{fingerprint:016x}");
            tracing::warn!(
                op = op.label(),
                user = %user,
                cost,
                breaches = bucket.breaches,
                retry_after_secs = hold.as_secs(),
                "replication budget exceeded"
            );
            return Err(AppError::too_many_requests(
                "Replication budget exceeded for this window",
                hold.as_secs(),
            ));
        }

        bucket.spent += cost;
        match op {
            Op::Push => self
                .metrics
                .push_units
                .fetch_add(u64::from(cost), Ordering::Relaxed),
            Op::Pull => self
                .metrics
                .pull_units
                .fetch_add(u64::from(cost), Ordering::Relaxed),
        };
        Ok(())
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        LimiterSnapshot {
            push_units_spent: self.metrics.push_units.load(Ordering::Relaxed),
            pull_units_spent: self.metrics.pull_units.load(Ordering::Relaxed),
            refusals: self.metrics.refusals.load(Ordering::Relaxed),
            escalations: self.metrics.escalations.load(Ordering::Relaxed),
        }
    }
}

/// Retry-after for the n-th consecutive refusal: the remaining window,
/// doubled per breach past the first, bounded above.
fn escalated_hold(window_left: Duration, breaches: u32) -> Duration {
    let doublings = breaches.saturating_sub(1).min(MAX_BREACH_DOUBLINGS);
    let hold = window_left.max(Duration::from_secs(1)) * (1u32 << doublings);
    hold.min(MAX_RETRY_AFTER)
}

/// Non-reversible identifier for audit logs; raw user ids stay out of
/// the log stream.
pub(crate) fn user_fingerprint(user_id: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    user_id.hash(&mut hasher);
    hasher.finish()
}

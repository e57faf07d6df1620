//! Engine configuration.
//!
//! All fields have defaults tuned for interactive clients; embedders
//! override what they need:
//!
//! ```
//! use silt_core::config::EngineConfig;
//!
//! let config = EngineConfig {
//!     sync_interval_ms: 15_000,
//!     push_batch_size: 25,
//!     ..Default::default()
//! };
//! assert_eq!(config.max_retries, 5);
//! ```

use std::time::Duration;

use serde::Deserialize;

/// Default resolver choice, selectable per collection at engine build
/// time. The function-valued operational-merge strategy is configured
/// programmatically, not by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolverChoice {
    LastWriteWins,
    FirstWriteWins,
    FieldMerge,
    Manual,
}

/// Configuration for the sync engine and its collaborators.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Connectivity probe cadence.
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// Minimum dwell between connectivity transitions (debounce).
    #[serde(default = "default_dwell_ms")]
    pub dwell_ms: u64,
    /// Background sync cadence while online.
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    /// Push retry budget before a mutation is parked for the operator.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Mutations pushed per sync pass.
    #[serde(default = "default_push_batch_size")]
    pub push_batch_size: usize,
    /// Changes requested per pull.
    #[serde(default = "default_pull_max_changes")]
    pub pull_max_changes: usize,
    /// Age at which a pending mutation is reported as stuck; also the
    /// TTL for durably queued event-class messages.
    #[serde(default = "default_mutation_ttl_ms")]
    pub mutation_ttl_ms: u64,
    /// Per-recipient durable-queue cap for event-class fallback.
    #[serde(default = "default_queue_size_limit")]
    pub queue_size_limit: usize,
    /// Default conflict resolution strategy.
    #[serde(default = "default_resolver_strategy")]
    pub resolver_strategy: ResolverChoice,
    /// Pull sizes at or above this prefer a snapshot over deltas.
    #[serde(default = "default_snapshot_divergence_threshold")]
    pub snapshot_divergence_threshold: usize,
    /// Realtime messages allowed per connection per window.
    #[serde(default = "default_rate_limit_per_window")]
    pub rate_limit_per_window: u32,
    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,
    /// Realtime heartbeat cadence.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Silence beyond this transitions a connection to disconnected.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
}

fn default_probe_interval_ms() -> u64 {
    10_000
}
fn default_dwell_ms() -> u64 {
    2_000
}
fn default_sync_interval_ms() -> u64 {
    30_000
}
fn default_max_retries() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    60_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_push_batch_size() -> usize {
    50
}
fn default_pull_max_changes() -> usize {
    200
}
fn default_mutation_ttl_ms() -> u64 {
    24 * 60 * 60 * 1_000
}
fn default_queue_size_limit() -> usize {
    500
}
fn default_resolver_strategy() -> ResolverChoice {
    ResolverChoice::LastWriteWins
}
fn default_snapshot_divergence_threshold() -> usize {
    1_000
}
fn default_rate_limit_per_window() -> u32 {
    120
}
fn default_rate_window_ms() -> u64 {
    10_000
}
fn default_heartbeat_interval_ms() -> u64 {
    15_000
}
fn default_heartbeat_timeout_ms() -> u64 {
    45_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
            dwell_ms: default_dwell_ms(),
            sync_interval_ms: default_sync_interval_ms(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            push_batch_size: default_push_batch_size(),
            pull_max_changes: default_pull_max_changes(),
            mutation_ttl_ms: default_mutation_ttl_ms(),
            queue_size_limit: default_queue_size_limit(),
            resolver_strategy: default_resolver_strategy(),
            snapshot_divergence_threshold: default_snapshot_divergence_threshold(),
            rate_limit_per_window: default_rate_limit_per_window(),
            rate_window_ms: default_rate_window_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
        }
    }
}

impl EngineConfig {
    /// Exponential backoff delay for the given retry count, capped at
    /// `max_backoff_ms`.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let mut delay = self.initial_backoff_ms as f64;
        for _ in 0..retry_count {
            delay *= self.backoff_multiplier;
            if delay >= self.max_backoff_ms as f64 {
                return Duration::from_millis(self.max_backoff_ms);
            }
        }
        Duration::from_millis(delay.min(self.max_backoff_ms as f64) as u64)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn dwell(&self) -> Duration {
        Duration::from_millis(self.dwell_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

//! Error types for silt-core

use thiserror::Error;

/// Result type alias using silt-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in silt-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Storage(rusqlite::Error),

    /// Local store is out of space; writes fail fast until space is freed
    #[error("Local storage exhausted")]
    StorageExhausted,

    /// Operation declared a tenant that differs from the caller's context
    #[error("Tenant mismatch: context is '{expected}', operation declared '{actual}'")]
    TenantMismatch { expected: String, actual: String },

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Transport-level replication failure (retryable)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Caller is not authorized for the requested operation
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Permanent validation rejection from the server
    #[error("Validation rejected: {0}")]
    Validation(String),

    /// Message refused by the per-connection rate limiter
    #[error("Rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Transactional-class operations must never use the realtime channel
    #[error("Transactional operations are not allowed on the realtime channel")]
    RealtimeNotAllowed,

    /// The realtime channel is not connected
    #[error("Realtime channel unavailable")]
    ChannelUnavailable,

    /// A bounded durable queue is at capacity
    #[error("Durable queue is full for recipient {0}")]
    QueueFull(String),

    /// Resolution was suspended; resume via the deferred-conflict registry
    #[error("Conflict deferred for manual resolution: {0}")]
    ConflictDeferred(String),

    /// Snapshot checksum did not match its payload
    #[error("Snapshot checksum mismatch for {0}")]
    ChecksumMismatch(String),
}

impl From<rusqlite::Error> for Error {
    fn from(error: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(code, _) = &error {
            if code.code == rusqlite::ErrorCode::DiskFull {
                return Self::StorageExhausted;
            }
        }
        Self::Storage(error)
    }
}

impl Error {
    /// Whether a sync-phase failure should be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Http(_))
    }
}

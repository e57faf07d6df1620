//! Replication transport: the engine's view of the server of record.
//!
//! Implementations handle the wire; the engine only sees the structured
//! outcomes. Push failures carry a classification so the engine can
//! decide between retry, quarantine, and conflict-triggered pull.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Error, Result};
use crate::models::{PendingMutation, Record, Snapshot};
use crate::tenant::TenantContext;
use crate::util::{compact_text, is_http_url, trim_trailing};

/// Durable acceptance of one pushed mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushAck {
    pub server_version: i64,
    pub server_timestamp: i64,
}

/// Changes since a cursor, plus the watermark to advance it to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub changes: Vec<Record>,
    pub server_timestamp: i64,
    #[serde(default)]
    pub cursor_lost: bool,
}

/// Structured push rejection, classified for the retry policy.
#[derive(Debug, Clone, Error)]
pub enum PushError {
    /// Transport fault or 5xx; retried with backoff.
    #[error("retryable push failure: {0}")]
    Retryable(String),
    /// The server saw a concurrent write; pull first, then rebuild.
    #[error("push conflict advisory: {0}")]
    Conflict(String),
    /// Permanent validation rejection; quarantined.
    #[error("permanent push rejection: {0}")]
    Permanent(String),
    /// Authorization or tenant failure; quarantined and surfaced.
    #[error("unauthorized push: {0}")]
    Unauthorized(String),
}

#[async_trait]
pub trait ReplicationTransport: Send + Sync {
    /// Push a single pending mutation durably.
    async fn push(
        &self,
        ctx: &TenantContext,
        mutation: &PendingMutation,
    ) -> std::result::Result<PushAck, PushError>;

    /// Changes for a collection since the given watermark.
    async fn pull(
        &self,
        ctx: &TenantContext,
        collection: &str,
        since: i64,
        limit: usize,
    ) -> Result<PullResponse>;

    /// Authoritative full state for an entity type.
    async fn snapshot(&self, ctx: &TenantContext, entity_type: &str) -> Result<Snapshot>;
}

/// Wire body for push errors returned by the backend.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    classification: Option<String>,
}

/// HTTP implementation against the replication surface.
///
/// Every request carries the bearer token and an `X-Tenant-Id` header
/// that the server checks against the token's tenant claim.
pub struct HttpReplicationTransport {
    client: reqwest::Client,
    base_url: String,
    bearer_token: String,
}

impl HttpReplicationTransport {
    pub fn new(base_url: impl Into<String>, bearer_token: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();
        if !is_http_url(&base_url) {
            return Err(Error::InvalidInput(
                "replication base URL must include http:// or https://".to_string(),
            ));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: trim_trailing(&base_url).to_string(),
            bearer_token: bearer_token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl ReplicationTransport for HttpReplicationTransport {
    async fn push(
        &self,
        ctx: &TenantContext,
        mutation: &PendingMutation,
    ) -> std::result::Result<PushAck, PushError> {
        let response = self
            .client
            .post(self.url("/v1/sync/push"))
            .bearer_auth(&self.bearer_token)
            .header("X-Tenant-Id", &ctx.tenant_id)
            .json(mutation)
            .send()
            .await
            .map_err(|e| PushError::Retryable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<PushAck>()
                .await
                .map_err(|e| PushError::Retryable(e.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or_else(|_| compact_text(&body));

        match status.as_u16() {
            401 | 403 => Err(PushError::Unauthorized(message)),
            409 => Err(PushError::Conflict(message)),
            400 | 404 | 422 => Err(PushError::Permanent(message)),
            _ => Err(PushError::Retryable(format!("HTTP {status}: {message}"))),
        }
    }

    async fn pull(
        &self,
        ctx: &TenantContext,
        collection: &str,
        since: i64,
        limit: usize,
    ) -> Result<PullResponse> {
        let response = self
            .client
            .get(self.url("/v1/sync/pull"))
            .bearer_auth(&self.bearer_token)
            .header("X-Tenant-Id", &ctx.tenant_id)
            .query(&[
                ("collection", collection),
                ("since", &since.to_string()),
                ("limit", &limit.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_pull_failure(status.as_u16(), &body));
        }

        Ok(response.json::<PullResponse>().await?)
    }

    async fn snapshot(&self, ctx: &TenantContext, entity_type: &str) -> Result<Snapshot> {
        let response = self
            .client
            .get(self.url(&format!("/v1/sync/snapshot/{entity_type}")))
            .bearer_auth(&self.bearer_token)
            .header("X-Tenant-Id", &ctx.tenant_id)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_pull_failure(status.as_u16(), &body));
        }

        Ok(response.json::<Snapshot>().await?)
    }
}

fn classify_pull_failure(status: u16, body: &str) -> Error {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| compact_text(body));
    match status {
        401 | 403 => Error::Unauthorized(message),
        400 | 404 | 422 => Error::Validation(message),
        _ => Error::Transport(format!("HTTP {status}: {message}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_rejects_non_http_base_url() {
        assert!(HttpReplicationTransport::new("example.com", "token").is_err());
        assert!(HttpReplicationTransport::new("https://example.com/", "token").is_ok());
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let transport =
            HttpReplicationTransport::new("https://sync.example.com/", "token").unwrap();
        assert_eq!(
            transport.url("/v1/sync/pull"),
            "https://sync.example.com/v1/sync/pull"
        );
    }

    #[test]
    fn pull_failures_classify_by_status() {
        assert!(matches!(
            classify_pull_failure(401, r#"{"error": "expired"}"#),
            Error::Unauthorized(_)
        ));
        assert!(matches!(
            classify_pull_failure(422, r#"{"error": "bad"}"#),
            Error::Validation(_)
        ));
        assert!(matches!(
            classify_pull_failure(503, "unavailable"),
            Error::Transport(_)
        ));
    }
}

use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, head, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use silt_core::models::{PendingMutation, Record, Snapshot};

use crate::auth::{check_tenant_header, extract_bearer_token, verify_token, AuthenticatedClient};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::rate_limit::SyncRateLimiter;
use crate::state::ReplicationState;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    store: Arc<ReplicationState>,
    limiter: SyncRateLimiter,
}

impl AppState {
    pub fn from_config(config: Arc<AppConfig>) -> Self {
        Self {
            store: Arc::new(ReplicationState::new(config.changelog_retention)),
            limiter: SyncRateLimiter::from_config(&config),
            config,
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/sync/push", post(sync_push))
        .route("/sync/pull", get(sync_pull))
        .route("/sync/snapshot/:entity_type", get(sync_snapshot))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/ping", head(ping).get(ping))
        .nest("/v1", protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    rate_limits: crate::rate_limit::LimiterSnapshot,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        rate_limits: state.limiter.snapshot(),
    })
}

async fn ping() -> &'static str {
    ""
}

async fn require_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(&headers)?;
    let client = verify_token(token, &state.config)?;
    check_tenant_header(&headers, &client)?;
    request.extensions_mut().insert(client);
    Ok(next.run(request).await)
}

#[derive(Debug, Serialize)]
struct PushResponse {
    accepted: bool,
    server_version: i64,
    server_timestamp: i64,
}

async fn sync_push(
    State(state): State<AppState>,
    Extension(client): Extension<AuthenticatedClient>,
    Json(mutation): Json<PendingMutation>,
) -> Result<Json<PushResponse>, AppError> {
    state.limiter.check_push(&client.user_id).await?;
    // push is the only handler that accepts a body-declared tenant;
    // pull and snapshot scope strictly by the token's tenant claim.
    // Any future body-carrying variant of those must add this check.
    if mutation.tenant_id != client.tenant_id {
        tracing::warn!(
            authenticated = %client.tenant_id,
            declared = %mutation.tenant_id,
            "audit: mutation tenant mismatch refused"
        );
        return Err(AppError::forbidden(
            "mutation tenant does not match the token's tenant",
        ));
    }

    let outcome = state.store.apply_push(&client.tenant_id, &mutation).await?;
    Ok(Json(PushResponse {
        accepted: true,
        server_version: outcome.server_version,
        server_timestamp: outcome.server_timestamp,
    }))
}

#[derive(Debug, Deserialize)]
struct PullQuery {
    collection: String,
    #[serde(default)]
    since: i64,
    #[serde(default = "default_pull_limit")]
    limit: usize,
}

fn default_pull_limit() -> usize {
    200
}

#[derive(Debug, Serialize)]
struct PullResponseBody {
    changes: Vec<Record>,
    server_timestamp: i64,
    cursor_lost: bool,
}

async fn sync_pull(
    State(state): State<AppState>,
    Extension(client): Extension<AuthenticatedClient>,
    Query(query): Query<PullQuery>,
) -> Result<Json<PullResponseBody>, AppError> {
    state
        .limiter
        .check_pull(&client.user_id, query.limit)
        .await?;
    if query.collection.trim().is_empty() {
        return Err(AppError::bad_request("collection must not be empty"));
    }

    let outcome = state
        .store
        .changes_since(&client.tenant_id, &query.collection, query.since, query.limit)
        .await;
    Ok(Json(PullResponseBody {
        changes: outcome.changes,
        server_timestamp: outcome.server_timestamp,
        cursor_lost: outcome.cursor_lost,
    }))
}

async fn sync_snapshot(
    State(state): State<AppState>,
    Extension(client): Extension<AuthenticatedClient>,
    Path(entity_type): Path<String>,
) -> Result<Json<Snapshot>, AppError> {
    state.limiter.check_snapshot(&client.user_id).await?;
    let snapshot = state.store.snapshot(&client.tenant_id, &entity_type).await;
    Ok(Json(snapshot))
}

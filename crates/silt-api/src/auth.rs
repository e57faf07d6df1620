use axum::http::HeaderMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::error::AppError;

/// Verified identity attached to every replication request.
#[derive(Debug, Clone)]
pub struct AuthenticatedClient {
    pub tenant_id: String,
    pub user_id: String,
    pub client_id: Option<String>,
    pub roles: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    /// Tenant the token is scoped to.
    tid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cid: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
    iss: String,
    iat: i64,
    exp: i64,
}

/// Verify an HS256 access token against the configured issuer.
pub fn verify_token(token: &str, config: &AppConfig) -> Result<AuthenticatedClient, AppError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[config.jwt_issuer.as_str()]);
    validation.leeway = config.auth_clock_skew.as_secs();

    let decoded = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &validation,
    )
    .map_err(|error| AppError::unauthorized(format!("Token validation failed: {error}")))?;

    let claims = decoded.claims;
    if claims.sub.trim().is_empty() {
        return Err(AppError::unauthorized("Token subject is missing"));
    }
    if claims.tid.trim().is_empty() {
        return Err(AppError::unauthorized("Token tenant is missing"));
    }

    Ok(AuthenticatedClient {
        tenant_id: claims.tid,
        user_id: claims.sub,
        client_id: claims.cid,
        roles: claims.roles,
    })
}

/// Mint an access token; used by provisioning tooling and tests.
pub fn mint_token(
    config: &AppConfig,
    tenant_id: &str,
    user_id: &str,
    client_id: Option<&str>,
    ttl_secs: i64,
) -> Result<String, AppError> {
    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        tid: tenant_id.to_string(),
        cid: client_id.map(str::to_string),
        roles: Vec::new(),
        iss: config.jwt_issuer.clone(),
        iat: now,
        exp: now + ttl_secs,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
    .map_err(|error| AppError::internal(format!("Token encoding failed: {error}")))
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let header = headers
        .get("authorization")
        .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("Authorization header is not valid UTF-8"))?;

    let (scheme, token) = header
        .split_once(' ')
        .ok_or_else(|| AppError::unauthorized("Authorization header must be `Bearer <token>`"))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::unauthorized(
            "Authorization scheme must be `Bearer`",
        ));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::unauthorized("Bearer token is empty"));
    }

    Ok(token)
}

/// Enforce that the declared `X-Tenant-Id` header matches the token's
/// tenant claim. Mismatches are audit-logged.
pub fn check_tenant_header(
    headers: &HeaderMap,
    client: &AuthenticatedClient,
) -> Result<(), AppError> {
    let declared = headers
        .get("x-tenant-id")
        .ok_or_else(|| AppError::bad_request("Missing X-Tenant-Id header"))?
        .to_str()
        .map_err(|_| AppError::bad_request("X-Tenant-Id header is not valid UTF-8"))?;

    if declared != client.tenant_id {
        let user = format!(
            "{:016x}",
            crate::rate_limit::user_fingerprint(&client.user_id)
        );
        tracing::warn!(
            authenticated = %client.tenant_id,
            declared,
            user = %user,
            "audit: tenant header mismatch refused"
        );
        return Err(AppError::forbidden(
            "X-Tenant-Id does not match the token's tenant",
        ));
    }
    Ok(())
}

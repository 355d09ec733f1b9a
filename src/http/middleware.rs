//! Tenant resolution and request authentication (spec.md §4.C, §4.K).
//!
//! Not an axum `tower::Layer`: opening a [`Session`] commits to a DB
//! transaction, so handlers call [`open_session`] explicitly and are
//! responsible for disposing it (commit on success, abort on error) rather
//! than a middleware layer doing it implicitly behind their back.

use axum::http::HeaderMap;
use serde_json::Value;

use crate::auth::{self, Claims, VerifyingKey};
use crate::db::broker::Session;
use crate::error::{GatewayError, Result};
use crate::http::state::AppState;
use crate::tenant::TenantConfig;

pub fn forwarded_host(headers: &HeaderMap) -> Option<&str> {
    headers.get("x-forwarded-host").and_then(|v| v.to_str().ok())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Resolves the tenant id, verifies the bearer token against the tenant's
/// key material, and opens a transaction-scoped [`Session`] bound to the
/// token's role and claims. A missing token is treated as the `anon` role
/// with empty claims, matching row-level-policy conventions the broker's
/// `SET LOCAL ROLE` relies on.
#[tracing::instrument(skip(state, headers))]
pub async fn open_session(state: &AppState, headers: &HeaderMap) -> Result<(Session, TenantConfig, Option<String>)> {
    let forwarded = forwarded_host(headers);
    let tenant_id = state.broker.resolve_tenant_id(forwarded)?;
    let config = state.registry.get_config(&tenant_id).await?;

    let (claims, role, owner) = match bearer_token(headers) {
        Some(token) => {
            let key = match &config.jwks {
                Some(jwks) => VerifyingKey::Jwks(jwks),
                None => VerifyingKey::Secret(&config.jwt_secret),
            };
            let claims: Claims = auth::verify_jwt(token, key)?;
            let role = claims.role.clone().unwrap_or_else(|| "authenticated".to_owned());
            let owner = Some(claims.sub.clone());
            (serde_json::to_value(&claims).unwrap_or(Value::Null), role, owner)
        }
        None => (Value::Object(Default::default()), "anon".to_owned(), None),
    };

    let session = state.broker.acquire(&tenant_id, forwarded, &claims, Some(&role)).await?;
    Ok((session, config, owner))
}

/// Verifies the `apikey` header against the configured admin API keys
/// (spec.md §6 "Admin surface").
pub fn verify_admin_key(state: &AppState, headers: &HeaderMap) -> Result<()> {
    let key = headers
        .get("apikey")
        .and_then(|v| v.to_str().ok())
        .ok_or(GatewayError::Unauthorized)?;

    if state.settings.admin_api_keys.iter().any(|k| k == key) {
        Ok(())
    } else {
        Err(GatewayError::Forbidden)
    }
}

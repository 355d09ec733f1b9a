//! Admin surface (spec.md §6 "Admin surface (separate port)").
//!
//! Every handler here is gated by [`verify_admin_key`] rather than a tenant
//! session: the admin surface manages the `tenants` table directly on the
//! registry's own pool, bypassing the broker entirely.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use sqlx::{Connection, Row};

use crate::http::error_response::ApiError;
use crate::http::middleware::verify_admin_key;
use crate::http::state::AppState;
use crate::error::{GatewayError, Result};
use crate::tenant::{MigrationStatus, TenantFeatures};

#[derive(Serialize)]
pub struct TenantSummary {
    #[serde(rename = "tenantId")]
    tenant_id: String,
    #[serde(rename = "databaseUrl")]
    database_url: String,
    #[serde(rename = "fileSizeLimit")]
    file_size_limit: i64,
    features: TenantFeatures,
    #[serde(rename = "migrationVersion")]
    migration_version: Option<String>,
    #[serde(rename = "migrationStatus")]
    migration_status: Option<MigrationStatus>,
}

async fn fetch_summary(state: &AppState, tenant_id: &str) -> Result<TenantSummary> {
    let row = sqlx::query(
        r#"SELECT tenant_id, database_url, file_size_limit,
                  feature_image_transformation, feature_s3_protocol, feature_purge_cache,
                  migration_version, migration_status
           FROM tenants WHERE tenant_id = $1"#,
    )
    .bind(tenant_id)
    .fetch_optional(&state.registry_pool)
    .await?;

    let Some(row) = row else {
        return Err(GatewayError::NotFound);
    };

    let migration_status: Option<String> = row.try_get("migration_status")?;
    let migration_status = migration_status.and_then(|s| match s.as_str() {
        "COMPLETED" => Some(MigrationStatus::Completed),
        "FAILED" => Some(MigrationStatus::Failed),
        "FAILED_STALE" => Some(MigrationStatus::FailedStale),
        _ => None,
    });

    Ok(TenantSummary {
        tenant_id: row.try_get("tenant_id")?,
        database_url: row.try_get("database_url")?,
        file_size_limit: row.try_get("file_size_limit")?,
        features: TenantFeatures {
            image_transformation: crate::tenant::ImageTransformationFeature {
                enabled: row.try_get("feature_image_transformation")?,
                max_resolution: None,
            },
            s3_protocol: crate::tenant::S3ProtocolFeature { enabled: row.try_get("feature_s3_protocol")? },
            purge_cache: crate::tenant::PurgeCacheFeature { enabled: row.try_get("feature_purge_cache")? },
            iceberg_catalog: Default::default(),
            vector_buckets: Default::default(),
        },
        migration_version: row.try_get("migration_version")?,
        migration_status,
    })
}

#[tracing::instrument(skip(state, headers))]
pub async fn list_tenants(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Vec<TenantSummary>>, ApiError> {
    verify_admin_key(&state, &headers)?;

    let rows = sqlx::query("SELECT tenant_id FROM tenants ORDER BY tenant_id")
        .fetch_all(&state.registry_pool)
        .await
        .map_err(GatewayError::from)?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let tenant_id: String = row.try_get("tenant_id").map_err(GatewayError::from)?;
        out.push(fetch_summary(&state, &tenant_id).await?);
    }
    Ok(Json(out))
}

#[tracing::instrument(skip(state, headers))]
pub async fn get_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TenantSummary>, ApiError> {
    verify_admin_key(&state, &headers)?;
    Ok(Json(fetch_summary(&state, &tenant_id).await?))
}

#[derive(Deserialize)]
pub struct CreateTenantRequest {
    #[serde(rename = "tenantId")]
    tenant_id: String,
    #[serde(rename = "databaseUrl")]
    database_url: String,
    #[serde(rename = "databasePoolUrl")]
    database_pool_url: Option<String>,
    #[serde(rename = "maxConnections")]
    max_connections: Option<i32>,
    #[serde(rename = "fileSizeLimit")]
    file_size_limit: i64,
    #[serde(rename = "jwtSecret")]
    jwt_secret: String,
    #[serde(rename = "serviceKey")]
    service_key: String,
    jwks: Option<String>,
    #[serde(default)]
    features: TenantFeatures,
}

#[tracing::instrument(skip(state, headers, body))]
pub async fn create_tenant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateTenantRequest>,
) -> Result<Json<TenantSummary>, ApiError> {
    verify_admin_key(&state, &headers)?;

    let key = crate::crypto::derive_key(&state.settings.encryption_key);
    let encrypted_jwt_secret = crate::crypto::encrypt(&key, &body.jwt_secret)?;
    let encrypted_service_key = crate::crypto::encrypt(&key, &body.service_key)?;

    sqlx::query(
        r#"INSERT INTO tenants (
               tenant_id, database_url, database_pool_url, max_connections, file_size_limit,
               jwt_secret, service_key, jwks,
               feature_image_transformation, feature_s3_protocol, feature_purge_cache
           ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
    )
    .bind(&body.tenant_id)
    .bind(&body.database_url)
    .bind(&body.database_pool_url)
    .bind(body.max_connections)
    .bind(body.file_size_limit)
    .bind(&encrypted_jwt_secret)
    .bind(&encrypted_service_key)
    .bind(&body.jwks)
    .bind(body.features.image_transformation.enabled)
    .bind(body.features.s3_protocol.enabled)
    .bind(body.features.purge_cache.enabled)
    .execute(&state.registry_pool)
    .await
    .map_err(GatewayError::from)?;

    crate::pubsub::notify_tenant_updated(&state.registry_pool, &body.tenant_id).await?;
    Ok(Json(fetch_summary(&state, &body.tenant_id).await?))
}

/// Present-but-null clears, absent leaves untouched — matches
/// [`crate::tenant::TenantPatch`]'s explicit-null semantics.
#[derive(Deserialize, Default)]
pub struct PatchTenantRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    database_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_size_limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    jwt_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    service_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    features: Option<TenantFeatures>,
}

#[tracing::instrument(skip(state, headers, body))]
pub async fn patch_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PatchTenantRequest>,
) -> Result<Json<TenantSummary>, ApiError> {
    verify_admin_key(&state, &headers)?;

    let key = crate::crypto::derive_key(&state.settings.encryption_key);
    let encrypted_jwt_secret = body.jwt_secret.as_deref().map(|s| crate::crypto::encrypt(&key, s)).transpose()?;
    let encrypted_service_key = body.service_key.as_deref().map(|s| crate::crypto::encrypt(&key, s)).transpose()?;

    sqlx::query(
        r#"UPDATE tenants SET
               database_url = COALESCE($1, database_url),
               file_size_limit = COALESCE($2, file_size_limit),
               jwt_secret = COALESCE($3, jwt_secret),
               service_key = COALESCE($4, service_key),
               feature_image_transformation = COALESCE($5, feature_image_transformation),
               feature_s3_protocol = COALESCE($6, feature_s3_protocol),
               feature_purge_cache = COALESCE($7, feature_purge_cache)
           WHERE tenant_id = $8"#,
    )
    .bind(&body.database_url)
    .bind(body.file_size_limit)
    .bind(&encrypted_jwt_secret)
    .bind(&encrypted_service_key)
    .bind(body.features.as_ref().map(|f| f.image_transformation.enabled))
    .bind(body.features.as_ref().map(|f| f.s3_protocol.enabled))
    .bind(body.features.as_ref().map(|f| f.purge_cache.enabled))
    .bind(&tenant_id)
    .execute(&state.registry_pool)
    .await
    .map_err(GatewayError::from)?;

    state.registry.invalidate(&tenant_id).await;
    crate::pubsub::notify_tenant_updated(&state.registry_pool, &tenant_id).await?;
    Ok(Json(fetch_summary(&state, &tenant_id).await?))
}

#[tracing::instrument(skip(state, headers))]
pub async fn delete_tenant(State(state): State<AppState>, Path(tenant_id): Path<String>, headers: HeaderMap) -> Result<(), ApiError> {
    verify_admin_key(&state, &headers)?;

    let result = sqlx::query("DELETE FROM tenants WHERE tenant_id = $1")
        .bind(&tenant_id)
        .execute(&state.registry_pool)
        .await
        .map_err(GatewayError::from)?;

    if result.rows_affected() == 0 {
        return Err(GatewayError::NotFound.into());
    }

    state.registry.invalidate(&tenant_id).await;
    crate::pubsub::notify_tenant_updated(&state.registry_pool, &tenant_id).await?;
    Ok(())
}

#[derive(Serialize)]
pub struct TenantHealth {
    #[serde(rename = "tenantId")]
    tenant_id: String,
    healthy: bool,
    #[serde(rename = "migrationStatus")]
    migration_status: Option<MigrationStatus>,
}

/// Resolves the tenant's configuration (decrypting its secrets) and opens a
/// standalone connection to run `SELECT 1` as a bare connectivity probe —
/// bypassing the broker, since its `acquire` path requires a forwarded-host
/// header that an admin health check has no reason to carry.
#[tracing::instrument(skip(state, headers))]
pub async fn tenant_health(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TenantHealth>, ApiError> {
    verify_admin_key(&state, &headers)?;

    let config = state.registry.get_config(&tenant_id).await?;
    let healthy = match sqlx::postgres::PgConnection::connect(&config.database_url).await {
        Ok(mut conn) => sqlx::query("SELECT 1").execute(&mut conn).await.is_ok(),
        Err(_) => false,
    };

    Ok(Json(TenantHealth {
        tenant_id,
        healthy,
        migration_status: config.migration_status,
    }))
}

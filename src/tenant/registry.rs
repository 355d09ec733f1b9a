//! Tenant Registry implementation (spec.md §4.B).
//!
//! `getConfig` is single-flight per `tenantId`: concurrent callers for the
//! same id share one DB round trip and one JWT verification, backed by
//! [`crate::keyed_mutex::KeyedMutex`]. Cache entries never expire
//! implicitly; they are evicted by explicit `invalidate`, a pub/sub
//! notification, or admin mutation.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::{PgPool, Row};
use tokio::sync::{mpsc, RwLock};

use crate::auth;
use crate::config::Settings;
use crate::error::{GatewayError, Result};
use crate::keyed_mutex::KeyedMutex;
use crate::tenant::{MigrationStatus, TenantConfig, TenantFeatures};

pub struct TenantRegistry {
    pool: PgPool,
    settings: Arc<Settings>,
    cache: RwLock<HashMap<String, TenantConfig>>,
    single_flight: KeyedMutex<String>,
}

/// A bounded batch of tenant ids pending migration, as returned by
/// `listTenantsToMigrate`.
pub struct MigrationBatch {
    pub tenant_ids: Vec<String>,
}

impl TenantRegistry {
    pub fn new(pool: PgPool, settings: Arc<Settings>) -> Self {
        Self {
            pool,
            settings,
            cache: RwLock::new(HashMap::new()),
            single_flight: KeyedMutex::new(),
        }
    }

    /// Start a background task evicting cache entries on
    /// [`crate::pubsub`] notifications. Fire-and-forget: failures to
    /// (re)subscribe are logged, not surfaced, since this is best-effort
    /// cache freshness, not a correctness requirement.
    pub async fn spawn_invalidation_listener(self: &Arc<Self>) -> Result<()> {
        let mut rx: mpsc::UnboundedReceiver<String> =
            crate::pubsub::subscribe_tenant_updates(&self.pool).await?;
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(tenant_id) = rx.recv().await {
                this.invalidate(&tenant_id).await;
            }
        });
        Ok(())
    }

    /// Evict a cache entry. Idempotent: evicting an absent tenant is a no-op.
    pub async fn invalidate(&self, tenant_id: &str) {
        self.cache.write().await.remove(tenant_id);
    }

    /// Resolve a tenant's configuration, populating the cache on miss.
    #[tracing::instrument(skip(self))]
    pub async fn get_config(&self, tenant_id: &str) -> Result<TenantConfig> {
        if tenant_id.is_empty() {
            return Err(GatewayError::InvalidTenant("tenant id must not be empty".into()));
        }

        if let Some(cfg) = self.cache.read().await.get(tenant_id) {
            return Ok(cfg.clone());
        }

        let _guard = self.single_flight.lock(tenant_id.to_owned()).await;

        if let Some(cfg) = self.cache.read().await.get(tenant_id) {
            return Ok(cfg.clone());
        }

        let cfg = self.fetch_and_compose(tenant_id).await?;
        self.cache
            .write()
            .await
            .insert(tenant_id.to_owned(), cfg.clone());
        Ok(cfg)
    }

    async fn fetch_and_compose(&self, tenant_id: &str) -> Result<TenantConfig> {
        let row = sqlx::query(
            r#"SELECT tenant_id, database_url, database_pool_url, max_connections,
                      file_size_limit, jwt_secret, jwks, anon_key, service_key,
                      feature_image_transformation, feature_s3_protocol, feature_purge_cache,
                      migration_version, migration_status
               FROM tenants WHERE tenant_id = $1"#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(GatewayError::InvalidTenant(format!("tenant not found: {tenant_id}")));
        };

        let encrypted_jwt_secret: String = row.try_get("jwt_secret")?;
        let encrypted_service_key: String = row.try_get("service_key")?;

        let jwt_secret = crate::crypto::decrypt(&self.settings.encryption_key, &encrypted_jwt_secret)
            .map_err(|_| GatewayError::Internal("failed to decrypt tenant jwt_secret".into()))?;
        let service_key = crate::crypto::decrypt(&self.settings.encryption_key, &encrypted_service_key)
            .map_err(|_| GatewayError::Internal("failed to decrypt tenant service_key".into()))?;

        let service_key_payload: serde_json::Value = auth::verify_jwt(&service_key, auth::VerifyingKey::Secret(&jwt_secret))
            .map_err(|_| GatewayError::Unauthorized)?;

        let jwks_raw: Option<String> = row.try_get("jwks")?;
        let jwks = jwks_raw
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|e| GatewayError::Internal(format!("invalid stored jwks: {e}")))?;

        let migration_status: Option<String> = row.try_get("migration_status")?;
        let migration_status = migration_status.and_then(|s| match s.as_str() {
            "COMPLETED" => Some(MigrationStatus::Completed),
            "FAILED" => Some(MigrationStatus::Failed),
            "FAILED_STALE" => Some(MigrationStatus::FailedStale),
            _ => None,
        });

        Ok(TenantConfig {
            tenant_id: tenant_id.to_owned(),
            database_url: row.try_get("database_url")?,
            database_pool_url: row.try_get("database_pool_url")?,
            max_connections: row
                .try_get::<Option<i32>, _>("max_connections")?
                .map(|v| v as u32),
            file_size_limit: row.try_get("file_size_limit")?,
            jwt_secret,
            jwks,
            service_key,
            service_key_payload,
            features: TenantFeatures {
                image_transformation: crate::tenant::ImageTransformationFeature {
                    enabled: row.try_get("feature_image_transformation")?,
                    max_resolution: None,
                },
                s3_protocol: crate::tenant::S3ProtocolFeature {
                    enabled: row.try_get("feature_s3_protocol")?,
                },
                purge_cache: crate::tenant::PurgeCacheFeature {
                    enabled: row.try_get("feature_purge_cache")?,
                },
                iceberg_catalog: Default::default(),
                vector_buckets: Default::default(),
            },
            migration_version: row.try_get("migration_version")?,
            migration_status,
        })
    }

    /// Stream tenants whose `migration_version` is behind the target, in
    /// bounded batches (spec.md §4.H `ProgressiveMigrations`).
    #[tracing::instrument(skip(self))]
    pub async fn list_tenants_to_migrate(&self, batch_size: i64) -> Result<MigrationBatch> {
        let rows = sqlx::query(
            "SELECT tenant_id FROM tenants WHERE migration_status IS DISTINCT FROM 'COMPLETED' \
             ORDER BY tenant_id LIMIT $1",
        )
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await?;

        let tenant_ids = rows
            .into_iter()
            .map(|r| r.try_get::<String, _>("tenant_id"))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(MigrationBatch { tenant_ids })
    }

    /// Persist a tenant's migration outcome and evict its cache entry so
    /// the next `getConfig` reflects the updated status.
    #[tracing::instrument(skip(self))]
    pub async fn update_migration_state(
        &self,
        tenant_id: &str,
        status: MigrationStatus,
        version: Option<&str>,
    ) -> Result<()> {
        let status_str = match status {
            MigrationStatus::Completed => "COMPLETED",
            MigrationStatus::Failed => "FAILED",
            MigrationStatus::FailedStale => "FAILED_STALE",
        };

        sqlx::query("UPDATE tenants SET migration_status = $1, migration_version = COALESCE($2, migration_version) WHERE tenant_id = $3")
            .bind(status_str)
            .bind(version)
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;

        self.invalidate(tenant_id).await;
        Ok(())
    }
}

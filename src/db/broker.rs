//! Connection Broker (spec.md §4.C).
//!
//! Maps one HTTP request to one authenticated DB session: validates
//! `X-Forwarded-Host` against the configured regex, selects a per-tenant
//! pool (created lazily, bounded in size), and opens a transaction-scoped
//! session that binds the request role and JWT claims the way PostgREST-style
//! row-level policies expect to read them.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::RwLock;

use crate::config::Settings;
use crate::error::{GatewayError, Result};
use crate::keyed_mutex::KeyedMutex;
use crate::tenant::registry::TenantRegistry;

const DEFAULT_POOL_SIZE: u32 = 10;

pub struct ConnectionBroker {
    settings: Arc<Settings>,
    registry: Arc<TenantRegistry>,
    pools: RwLock<HashMap<String, PgPool>>,
    pool_creation: KeyedMutex<String>,
}

/// A leased, transaction-scoped DB session. The orchestrator issues all of
/// its queries against `tx` for the request's duration, then calls
/// [`ConnectionBroker::dispose`] exactly once.
pub struct Session {
    pub tenant_id: String,
    pub tx: Transaction<'static, Postgres>,
}

impl ConnectionBroker {
    pub fn new(settings: Arc<Settings>, registry: Arc<TenantRegistry>) -> Self {
        Self {
            settings,
            registry,
            pools: RwLock::new(HashMap::new()),
            pool_creation: KeyedMutex::new(),
        }
    }

    /// Validate an inbound `X-Forwarded-Host` header against the configured
    /// regex and derive the tenant id from its first capture group. In
    /// single-tenant mode this is skipped entirely; the configured
    /// `TENANT_ID` is authoritative.
    pub fn resolve_tenant_id(&self, forwarded_host: Option<&str>) -> Result<String> {
        if !self.settings.is_multitenant {
            return self
                .settings
                .tenant_id
                .clone()
                .ok_or_else(|| GatewayError::Internal("TENANT_ID missing in single-tenant mode".into()));
        }

        let regex = self
            .settings
            .x_forwarded_host_regexp
            .as_ref()
            .ok_or_else(|| GatewayError::Internal("X_FORWARDED_HOST_REGEXP missing in multi-tenant mode".into()))?;

        let host = forwarded_host.ok_or(GatewayError::InvalidHostHeader)?;
        let captures = regex.captures(host).ok_or(GatewayError::InvalidHostHeader)?;
        let tenant_id = captures
            .get(1)
            .map(|m| m.as_str().to_owned())
            .unwrap_or_else(|| host.to_owned());
        Ok(tenant_id)
    }

    /// Acquire a session for `tenant_id`, validating `forwarded_host` and
    /// binding `claims`/`role` into the transaction-scoped session settings.
    #[tracing::instrument(skip(self, claims))]
    pub async fn acquire(
        &self,
        tenant_id: &str,
        forwarded_host: Option<&str>,
        claims: &Value,
        role: Option<&str>,
    ) -> Result<Session> {
        if self.settings.is_multitenant {
            let resolved = self.resolve_tenant_id(forwarded_host)?;
            if resolved != tenant_id {
                return Err(GatewayError::InvalidHostHeader);
            }
        }

        let config = self.registry.get_config(tenant_id).await?;
        let dsn = config.database_pool_url.as_deref().unwrap_or(&config.database_url);
        let pool = self.pool_for(tenant_id, dsn, config.max_connections).await?;

        let mut tx = pool.begin().await?;

        sqlx::query("SET LOCAL search_path = storage, public")
            .execute(&mut *tx)
            .await?;

        let role = role.unwrap_or("authenticated");
        sqlx::query(&format!("SET LOCAL ROLE {role}"))
            .execute(&mut *tx)
            .await?;

        let claims_json = serde_json::to_string(claims)
            .map_err(|e| GatewayError::Internal(format!("failed to serialize claims: {e}")))?;
        sqlx::query("SELECT set_config('request.jwt.claims', $1, true)")
            .bind(&claims_json)
            .execute(&mut *tx)
            .await?;

        Ok(Session {
            tenant_id: tenant_id.to_owned(),
            tx,
        })
    }

    /// Commit the session's transaction. `dispose` on a client-abort instead
    /// calls [`Self::abort`], which rolls back.
    #[tracing::instrument(skip(self, session))]
    pub async fn dispose(&self, session: Session) -> Result<()> {
        session.tx.commit().await?;
        Ok(())
    }

    /// Roll back the session's transaction without committing.
    #[tracing::instrument(skip(self, session))]
    pub async fn abort(&self, session: Session) -> Result<()> {
        session.tx.rollback().await?;
        Ok(())
    }

    async fn pool_for(&self, tenant_id: &str, dsn: &str, max_connections: Option<u32>) -> Result<PgPool> {
        if let Some(pool) = self.pools.read().await.get(tenant_id) {
            return Ok(pool.clone());
        }

        let _guard = self.pool_creation.lock(tenant_id.to_owned()).await;

        if let Some(pool) = self.pools.read().await.get(tenant_id) {
            return Ok(pool.clone());
        }

        let connect_options: PgConnectOptions = dsn
            .parse()
            .map_err(|e| GatewayError::Internal(format!("invalid tenant DSN: {e}")))?;
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.unwrap_or(DEFAULT_POOL_SIZE))
            .connect_with(connect_options)
            .await?;

        self.pools.write().await.insert(tenant_id.to_owned(), pool.clone());
        Ok(pool)
    }
}

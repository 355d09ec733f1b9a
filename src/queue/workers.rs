//! Typed event handlers (spec.md §4.H), each bound to a queue name.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sqlx::PgPool;

use crate::blob::BlobBackend;
use crate::error::{GatewayError, Result};
use crate::queue::{
    self, JobHandler, JobOptions, WorkOptions, QUEUE_ADMIN_DELETE_OBJECT, QUEUE_BACKUP_OBJECT, QUEUE_OBJECT_CREATED,
    QUEUE_RUN_MIGRATIONS_ON_TENANTS, QUEUE_UPLOAD_COMPLETED, QUEUE_WEBHOOK,
};
use crate::tenant::registry::TenantRegistry;
use crate::tenant::MigrationStatus;

/// `{type, $version, applyTime, payload, sentAt, tenant}` — spec.md §4.H.
#[derive(Debug, serde::Serialize)]
struct WebhookEnvelope {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(rename = "$version")]
    version: u32,
    #[serde(rename = "applyTime")]
    apply_time: i64,
    payload: Value,
    #[serde(rename = "sentAt")]
    sent_at: i64,
    tenant: String,
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    url: String,
    bearer_token: Option<String>,
    event_type: String,
    tenant: String,
    payload: Value,
    apply_time: i64,
}

/// Posts a JSON envelope to a tenant-configured URL with bearer auth;
/// network failures retry via the queue's normal retry/backoff.
pub struct WebhookWorker {
    client: reqwest::Client,
}

impl WebhookWorker {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobHandler for WebhookWorker {
    fn queue_name(&self) -> &'static str {
        QUEUE_WEBHOOK
    }

    fn options(&self) -> WorkOptions {
        WorkOptions { team_size: 5, team_concurrency: 5, ..WorkOptions::default() }
    }

    fn slow_retry(&self) -> bool {
        true
    }

    #[tracing::instrument(skip(self, payload))]
    async fn handle(&self, payload: Value) -> Result<()> {
        let payload: WebhookPayload = serde_json::from_value(payload)
            .map_err(|e| GatewayError::Internal(format!("invalid webhook job payload: {e}")))?;

        let envelope = WebhookEnvelope {
            event_type: payload.event_type,
            version: 1,
            apply_time: payload.apply_time,
            payload: payload.payload,
            sent_at: chrono::Utc::now().timestamp(),
            tenant: payload.tenant,
        };

        let mut req = self.client.post(&payload.url).json(&envelope);
        if let Some(token) = &payload.bearer_token {
            req = req.bearer_auth(token);
        }

        req.send().await?.error_for_status().map_err(GatewayError::from)?;
        Ok(())
    }
}

/// Consumes `ObjectCreated` and, if a webhook endpoint is configured for
/// this process's tenant, translates it into a `webhook` job (spec.md §2
/// step G → H, §4.H). No-op when no `webhook_url` is configured.
pub struct ObjectCreatedWorker {
    pool: PgPool,
    webhook_url: Option<String>,
    webhook_api_key: Option<String>,
}

impl ObjectCreatedWorker {
    pub fn new(pool: PgPool, webhook_url: Option<String>, webhook_api_key: Option<String>) -> Self {
        Self { pool, webhook_url, webhook_api_key }
    }
}

#[async_trait]
impl JobHandler for ObjectCreatedWorker {
    fn queue_name(&self) -> &'static str {
        QUEUE_OBJECT_CREATED
    }

    #[tracing::instrument(skip(self, payload))]
    async fn handle(&self, payload: Value) -> Result<()> {
        let Some(url) = self.webhook_url.clone() else {
            return Ok(());
        };

        let tenant = payload.get("tenant").and_then(Value::as_str).unwrap_or_default().to_owned();
        let webhook_payload = serde_json::json!({
            "url": url,
            "bearer_token": self.webhook_api_key,
            "event_type": "ObjectCreated",
            "tenant": tenant,
            "payload": payload,
            "apply_time": chrono::Utc::now().timestamp(),
        });

        let mut tx = self.pool.begin().await?;
        queue::send(&mut tx, QUEUE_WEBHOOK, &webhook_payload, JobOptions::default()).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct AdminDeleteObjectPayload {
    tenant: String,
    bucket: String,
    version: String,
    name: String,
}

/// Deletes `${tenant}/${bucket}/${name}/${version}` from the blob backend;
/// 404 is treated as success (spec.md §4.H, §6 "Blob key layout").
pub struct AdminDeleteObjectWorker {
    blob: Arc<dyn BlobBackend>,
}

impl AdminDeleteObjectWorker {
    pub fn new(blob: Arc<dyn BlobBackend>) -> Self {
        Self { blob }
    }
}

#[async_trait]
impl JobHandler for AdminDeleteObjectWorker {
    fn queue_name(&self) -> &'static str {
        QUEUE_ADMIN_DELETE_OBJECT
    }

    fn options(&self) -> WorkOptions {
        WorkOptions { team_size: 10, team_concurrency: 10, batch_size: 20, ..WorkOptions::default() }
    }

    #[tracing::instrument(skip(self, payload))]
    async fn handle(&self, payload: Value) -> Result<()> {
        let payload: AdminDeleteObjectPayload = serde_json::from_value(payload)
            .map_err(|e| GatewayError::Internal(format!("invalid admin-delete job payload: {e}")))?;

        let key = format!("{}/{}/{}/{}", payload.tenant, payload.bucket, payload.name, payload.version);
        match self.blob.delete_object(&payload.bucket, &key).await {
            Ok(()) | Err(GatewayError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UploadCompletedPayload {
    bucket: String,
    key: String,
}

/// Invokes `updateObjectInfoMetadata` on the blob backend; 404 is success
/// (spec.md §4.H).
pub struct UploadCompletedWorker {
    blob: Arc<dyn BlobBackend>,
}

impl UploadCompletedWorker {
    pub fn new(blob: Arc<dyn BlobBackend>) -> Self {
        Self { blob }
    }
}

#[async_trait]
impl JobHandler for UploadCompletedWorker {
    fn queue_name(&self) -> &'static str {
        QUEUE_UPLOAD_COMPLETED
    }

    #[tracing::instrument(skip(self, payload))]
    async fn handle(&self, payload: Value) -> Result<()> {
        let payload: UploadCompletedPayload = serde_json::from_value(payload)
            .map_err(|e| GatewayError::Internal(format!("invalid upload-completed job payload: {e}")))?;

        match self.blob.update_object_info_metadata(&payload.bucket, &payload.key).await {
            Ok(()) | Err(GatewayError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BackupObjectPayload {
    bucket: String,
    key: String,
}

/// Moves an orphan blob to a cold-storage backend before the scanner's
/// deletion pass runs (spec.md §4.H, §4.I). The cold backend is just
/// another [`BlobBackend`] — typically a filesystem backend pointed at an
/// archival mount — so no new abstraction is needed.
pub struct BackupObjectWorker {
    source: Arc<dyn BlobBackend>,
    cold: Arc<dyn BlobBackend>,
}

impl BackupObjectWorker {
    pub fn new(source: Arc<dyn BlobBackend>, cold: Arc<dyn BlobBackend>) -> Self {
        Self { source, cold }
    }
}

#[async_trait]
impl JobHandler for BackupObjectWorker {
    fn queue_name(&self) -> &'static str {
        QUEUE_BACKUP_OBJECT
    }

    #[tracing::instrument(skip(self, payload))]
    async fn handle(&self, payload: Value) -> Result<()> {
        let payload: BackupObjectPayload = serde_json::from_value(payload)
            .map_err(|e| GatewayError::Internal(format!("invalid backup-object job payload: {e}")))?;

        let conditions = crate::blob::GetConditions::default();
        let outcome = match self.source.get_object(&payload.bucket, &payload.key, &conditions).await {
            Ok(outcome) => outcome,
            Err(GatewayError::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        };

        let crate::blob::GetOutcome::Body(object) = outcome else {
            return Ok(());
        };

        self.cold
            .upload_object(&payload.bucket, &payload.key, object.body, &object.metadata.content_type, &object.metadata.cache_control)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RunMigrationsPayload {
    tenant_id: String,
}

/// Runs pending SQL migrations against a tenant DSN from a file-based
/// migration directory, then records the outcome via
/// [`TenantRegistry::update_migration_state`]. Singleton-keyed on tenant id
/// by the enqueuer so at most one migration run is ever in flight per
/// tenant (spec.md §4.H).
pub struct RunMigrationsOnTenantsWorker {
    registry: Arc<TenantRegistry>,
    migrations_dir: PathBuf,
}

impl RunMigrationsOnTenantsWorker {
    pub fn new(registry: Arc<TenantRegistry>, migrations_dir: PathBuf) -> Self {
        Self { registry, migrations_dir }
    }
}

#[async_trait]
impl JobHandler for RunMigrationsOnTenantsWorker {
    fn queue_name(&self) -> &'static str {
        QUEUE_RUN_MIGRATIONS_ON_TENANTS
    }

    #[tracing::instrument(skip(self, payload))]
    async fn handle(&self, payload: Value) -> Result<()> {
        let payload: RunMigrationsPayload = serde_json::from_value(payload)
            .map_err(|e| GatewayError::Internal(format!("invalid migration job payload: {e}")))?;

        let config = self.registry.get_config(&payload.tenant_id).await?;
        let pool = PgPool::connect(&config.database_url).await?;

        let migrator = sqlx::migrate::Migrator::new(self.migrations_dir.as_path())
            .await
            .map_err(|e| GatewayError::Internal(format!("failed to load migrations: {e}")))?;

        let result = migrator.run(&pool).await;
        pool.close().await;

        match result {
            Ok(()) => {
                let version = migrator.migrations.last().map(|m| m.version.to_string());
                self.registry
                    .update_migration_state(&payload.tenant_id, MigrationStatus::Completed, version.as_deref())
                    .await
            }
            Err(err) => {
                crate::error::log(&err);
                self.registry
                    .update_migration_state(&payload.tenant_id, MigrationStatus::Failed, None)
                    .await?;
                Err(GatewayError::Internal(format!("tenant migration failed: {err}")))
            }
        }
    }
}

/// A scheduler, not a handler: batches tenants needing migration into
/// `RunMigrationsOnTenants` jobs at a bounded rate (spec.md §4.H). Driven by
/// a timer in the worker binary rather than registered against a queue name.
pub struct ProgressiveMigrationsScheduler {
    registry: Arc<TenantRegistry>,
    batch_size: i64,
}

impl ProgressiveMigrationsScheduler {
    pub fn new(registry: Arc<TenantRegistry>, batch_size: i64) -> Self {
        Self { registry, batch_size }
    }

    #[tracing::instrument(skip(self, tx))]
    pub async fn tick(&self, tx: &mut sqlx::Transaction<'_, sqlx::Postgres>) -> Result<usize> {
        let batch = self.registry.list_tenants_to_migrate(self.batch_size).await?;
        let jobs = batch
            .tenant_ids
            .iter()
            .map(|tenant_id| {
                (
                    QUEUE_RUN_MIGRATIONS_ON_TENANTS.to_owned(),
                    serde_json::json!({ "tenant_id": tenant_id }),
                    JobOptions {
                        singleton_key: Some(tenant_id.clone()),
                        ..JobOptions::default()
                    },
                )
            })
            .collect::<Vec<_>>();

        let count = jobs.len();
        queue::batch_send(tx, jobs).await?;
        Ok(count)
    }
}

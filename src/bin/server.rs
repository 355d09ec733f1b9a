//! `server` — the HTTP process (spec.md §6 "CLI / process surface").
//!
//! Binds the object/render router on `PORT` and the admin router on
//! `ADMIN_PORT`, both driving requests through one shared [`AppState`].
//! Exit codes: 0 normal, 1 startup failure, 130 `SIGINT`, 143 `SIGTERM`.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use sqlx::PgPool;
use storage_gateway::bootstrap;
use storage_gateway::config::Settings;
use storage_gateway::db::broker::ConnectionBroker;
use storage_gateway::http::state::AppState;
use storage_gateway::orchestrator::Orchestrator;
use storage_gateway::scanner::OrphanScanner;
use storage_gateway::tenant::registry::TenantRegistry;

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
        return run_migrate(&database_url, target).await.map(|()| 0);
    }

    let settings = Arc::new(settings);

    let registry_pool = PgPool::connect(&bootstrap::registry_dsn(&settings)?).await?;
    let registry = Arc::new(TenantRegistry::new(registry_pool.clone(), settings.clone()));
    registry.spawn_invalidation_listener().await?;

    let broker = Arc::new(ConnectionBroker::new(settings.clone(), registry.clone()));
    let blob = bootstrap::build_blob_backend(&settings).await?;
    let orchestrator = Arc::new(Orchestrator::new(blob.clone(), settings.file_size_limit));
    let scanner = Arc::new(OrphanScanner::new(registry_pool.clone(), blob.clone()));

    let state = AppState {
        settings: settings.clone(),
        broker,
        registry,
        orchestrator,
        scanner,
        registry_pool,
        http_client: reqwest::Client::new(),
    };

    let object_app = storage_gateway::http::object_router(state.clone());
    let admin_app = storage_gateway::http::admin_router(state);

    let object_listener = tokio::net::TcpListener::bind((settings.bind_host.as_str(), settings.port)).await?;
    let admin_listener = tokio::net::TcpListener::bind((settings.bind_host.as_str(), settings.admin_port)).await?;

    tracing::info!(addr = %object_listener.local_addr()?, "object surface listening");
    tracing::info!(addr = %admin_listener.local_addr()?, "admin surface listening");

    let (exit_tx, exit_rx) = tokio::sync::watch::channel(0i32);
    tokio::spawn(bootstrap::watch_signals(exit_tx));

    let object_server = axum::serve(object_listener, object_app).with_graceful_shutdown(wait_for_exit(exit_rx.clone()));
    let admin_server = axum::serve(admin_listener, admin_app).with_graceful_shutdown(wait_for_exit(exit_rx.clone()));

    let (object_result, admin_result) = tokio::join!(object_server, admin_server);
    object_result?;
    admin_result?;

    tracing::info!("server is stopped");
    Ok(*exit_rx.borrow())
}

async fn run_migrate(database_url: &str, target: Option<i64>) -> anyhow::Result<()> {
    let pool = PgPool::connect(database_url).await?;
    let migrator = sqlx::migrate::Migrator::new(std::path::Path::new("migrations")).await?;

    migrator.run(&pool).await?;
    if let Some(target) = target {
        tracing::info!(target, "migrated; target version is advisory for this driver");
    }

    pool.close().await;
    Ok(())
}

async fn wait_for_exit(mut exit_rx: tokio::sync::watch::Receiver<i32>) {
    let _ = exit_rx.changed().await;
}

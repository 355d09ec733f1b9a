//! Shared startup plumbing for the `server` and `worker` binaries.

use std::io::IsTerminal;
use std::sync::Arc;

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::blob::fs::FileBackend;
use crate::blob::s3::S3Backend;
use crate::blob::BlobBackend;
use crate::config::{Settings, StorageBackendKind};

/// Plain `fmt` layer filtered by `LOG_LEVEL`, matching the teacher's
/// non-OTLP `setup_tracing` branch; this crate has no OTLP endpoint option
/// of its own so it always takes that path.
pub fn init_tracing(settings: &Settings) {
    let env_filter = EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let enable_color = std::io::stdout().is_terminal();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_ansi(enable_color))
        .with(env_filter)
        .with(tracing_error::ErrorLayer::default())
        .init();
}

/// Constructs the configured [`BlobBackend`] (spec.md §4.E).
pub async fn build_blob_backend(settings: &Settings) -> anyhow::Result<Arc<dyn BlobBackend>> {
    match settings.storage_backend {
        StorageBackendKind::S3 => {
            let bucket = settings
                .storage_s3_bucket
                .clone()
                .ok_or_else(|| anyhow::anyhow!("STORAGE_S3_BUCKET is required"))?;
            let backend = S3Backend::new(bucket, settings.storage_s3_endpoint.clone(), settings.region.clone()).await;
            Ok(Arc::new(backend))
        }
        StorageBackendKind::File => {
            let root = settings
                .file_storage_backend_path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("FILE_STORAGE_BACKEND_PATH is required"))?;
            Ok(Arc::new(FileBackend::new(root.into())))
        }
    }
}

/// DSN for the tenant registry's own database: the dedicated multi-tenant
/// database in multi-tenant mode, or the single configured database
/// otherwise (spec.md §4.B — the registry always reads a `tenants` table;
/// single-tenant deployments simply have one row in it).
pub fn registry_dsn(settings: &Settings) -> anyhow::Result<String> {
    if settings.is_multitenant {
        settings
            .multitenant_database_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("MULTITENANT_DATABASE_URL is required when IS_MULTITENANT=true"))
    } else {
        settings
            .database_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required when IS_MULTITENANT=false"))
    }
}

/// Waits for `SIGINT`/`SIGTERM`, then publishes the matching exit code
/// (130/143) on `exit_tx` so every shutdown-aware future observes the same
/// value (spec.md §6 "CLI / process surface").
pub async fn watch_signals(exit_tx: tokio::sync::watch::Sender<i32>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let code = tokio::select! {
            _ = tokio::signal::ctrl_c() => 130,
            _ = sigterm.recv() => 143,
        };
        let _ = exit_tx.send(code);
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        let _ = exit_tx.send(130);
    }
}

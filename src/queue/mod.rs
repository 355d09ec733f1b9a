//! Job Queue (spec.md §4.G).
//!
//! Backed by the same Postgres database as the Metadata Store — one `jobs`
//! table per tenant namespace, claimed with `FOR UPDATE SKIP LOCKED` so
//! multiple worker processes can poll the same tenant without stepping on
//! each other. `send`/`batchSend` are thin wrappers around
//! [`crate::db::metadata::insert_job`] so enqueueing can happen inside the
//! same transaction as the metadata mutation that triggered it.

pub mod workers;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::watch;

use crate::db::metadata;
use crate::db::models::Job;
use crate::error::{GatewayError, Result};

pub const QUEUE_OBJECT_CREATED: &str = "object-created";
pub const QUEUE_WEBHOOK: &str = "webhook";
pub const QUEUE_ADMIN_DELETE_OBJECT: &str = "admin-delete-object";
pub const QUEUE_UPLOAD_COMPLETED: &str = "upload-completed";
pub const QUEUE_BACKUP_OBJECT: &str = "backup-object";
pub const QUEUE_RUN_MIGRATIONS_ON_TENANTS: &str = "run-migrations-on-tenants";
pub const QUEUE_PROGRESSIVE_MIGRATIONS: &str = "progressive-migrations";

/// Default delay of the `${name}-slow` sibling queue (spec.md §4.G).
pub const SLOW_RETRY_DELAY: Duration = Duration::from_secs(30 * 60);

fn slow_queue_name(name: &str) -> String {
    format!("{name}-slow")
}

#[derive(Debug, Clone)]
pub struct JobOptions {
    pub start_after: Option<chrono::DateTime<Utc>>,
    pub retry_limit: i32,
    pub retry_backoff: Duration,
    pub singleton_key: Option<String>,
    pub expire_in_hours: Option<i64>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            start_after: None,
            retry_limit: 5,
            retry_backoff: Duration::from_secs(10),
            singleton_key: None,
            expire_in_hours: None,
        }
    }
}

/// `send(name, payload, options)` — spec.md §4.G.
#[tracing::instrument(skip(tx, payload, options))]
pub async fn send(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    queue_name: &str,
    payload: &Value,
    options: JobOptions,
) -> Result<String> {
    let start_after = options.start_after.unwrap_or_else(Utc::now);
    metadata::insert_job(tx, queue_name, payload, start_after, options.retry_limit, options.singleton_key.as_deref()).await
}

/// `batchSend([{name, payload, options}])` — used for scatter fan-out
/// (spec.md §4.G), e.g. `ProgressiveMigrations` dispatching one
/// `RunMigrationsOnTenants` job per batched tenant.
#[tracing::instrument(skip(tx, jobs))]
pub async fn batch_send(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    jobs: Vec<(String, Value, JobOptions)>,
) -> Result<Vec<String>> {
    let mut ids = Vec::with_capacity(jobs.len());
    for (name, payload, options) in jobs {
        ids.push(send(tx, &name, &payload, options).await?);
    }
    Ok(ids)
}

#[derive(Debug, Clone, Copy)]
pub struct WorkOptions {
    pub team_size: usize,
    pub team_concurrency: usize,
    pub batch_size: i64,
    pub poll_interval: Duration,
}

impl Default for WorkOptions {
    fn default() -> Self {
        Self {
            team_size: 1,
            team_concurrency: 1,
            batch_size: 1,
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// A typed event handler bound to a queue name (spec.md §4.H).
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn queue_name(&self) -> &'static str;

    fn options(&self) -> WorkOptions {
        WorkOptions::default()
    }

    /// Whether a terminal failure is re-enqueued on the `${name}-slow` lane
    /// (spec.md §4.G `slowRetry`).
    fn slow_retry(&self) -> bool {
        false
    }

    async fn handle(&self, payload: Value) -> Result<()>;
}

/// Runs the registered handlers' poll loops against one tenant's pool until
/// [`JobQueueRunner::stop`] is called. One runner per tenant DSN; the worker
/// binary owns one runner per tenant it is responsible for.
pub struct JobQueueRunner {
    pool: PgPool,
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    in_flight: Arc<AtomicUsize>,
}

impl JobQueueRunner {
    pub fn new(pool: PgPool) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            pool,
            handlers: HashMap::new(),
            shutdown_tx,
            shutdown_rx,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// `work(name, options, handler)` — spec.md §4.G.
    pub fn work(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.queue_name(), handler);
    }

    /// `init()` — spec.md §4.G lifecycle: opens the queue and starts polling
    /// every registered handler's queue (and its `-slow` sibling) concurrently.
    #[tracing::instrument(skip(self))]
    pub async fn init(&self) -> Result<()> {
        tracing::info!(queues = self.handlers.len(), "job queue runner starting");

        for handler in self.handlers.values().cloned() {
            tokio::spawn(poll_loop(
                self.pool.clone(),
                handler.clone(),
                primary_queue_name,
                self.shutdown_rx.clone(),
                self.in_flight.clone(),
            ));
            tokio::spawn(poll_loop(
                self.pool.clone(),
                handler,
                slow_queue_name_fn,
                self.shutdown_rx.clone(),
                self.in_flight.clone(),
            ));
        }

        Ok(())
    }

    /// `stop()` on `SIGTERM` — spec.md §4.G: stop polling, wait for in-flight
    /// jobs up to `grace`, then return regardless.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        let deadline = tokio::time::Instant::now() + grace;
        while self.in_flight.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.pool.close().await;
    }
}

fn primary_queue_name(handler: &Arc<dyn JobHandler>) -> String {
    handler.queue_name().to_owned()
}

fn slow_queue_name_fn(handler: &Arc<dyn JobHandler>) -> String {
    slow_queue_name(handler.queue_name())
}

async fn poll_loop(
    pool: PgPool,
    handler: Arc<dyn JobHandler>,
    queue_name_of: fn(&Arc<dyn JobHandler>) -> String,
    mut shutdown: watch::Receiver<bool>,
    in_flight: Arc<AtomicUsize>,
) {
    let options = handler.options();
    let queue_name = queue_name_of(&handler);
    let mut ticker = tokio::time::interval(options.poll_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }

        if *shutdown.borrow() {
            return;
        }

        match claim_jobs(&pool, &queue_name, options.batch_size).await {
            Ok(jobs) => {
                for job in jobs {
                    in_flight.fetch_add(1, Ordering::SeqCst);
                    let pool = pool.clone();
                    let handler = handler.clone();
                    let in_flight = in_flight.clone();
                    tokio::spawn(async move {
                        dispatch_job(&pool, handler.as_ref(), job).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }
            Err(err) => {
                crate::error::log(&err);
            }
        }
    }
}

/// Claims up to `batch_size` due jobs from `queue_name`, moving them to
/// `active` atomically via `FOR UPDATE SKIP LOCKED` so concurrent pollers
/// (this worker's other tasks, or another worker process) never double-claim.
async fn claim_jobs(pool: &PgPool, queue_name: &str, batch_size: i64) -> Result<Vec<Job>> {
    let rows = sqlx::query(
        "UPDATE jobs SET state = 'active', updated_at = now() WHERE id IN ( \
            SELECT id FROM jobs \
            WHERE queue_name = $1 AND state IN ('created', 'retry') AND start_after <= now() \
            ORDER BY start_after \
            LIMIT $2 \
            FOR UPDATE SKIP LOCKED \
         ) RETURNING id, queue_name, payload, created_at, start_after, retry_count, retry_limit, state, singleton_key",
    )
    .bind(queue_name)
    .bind(batch_size)
    .fetch_all(pool)
    .await
    .map_err(GatewayError::from)?;

    rows.into_iter().map(metadata::row_to_job).collect()
}

async fn dispatch_job(pool: &PgPool, handler: &dyn JobHandler, job: Job) {
    let outcome = handler.handle(job.payload.clone()).await;

    match outcome {
        Ok(()) => {
            let _ = sqlx::query("UPDATE jobs SET state = 'completed', updated_at = now() WHERE id = $1")
                .bind(&job.id)
                .execute(pool)
                .await;
        }
        Err(err) => {
            crate::error::log(&err);
            let next_retry = job.retry_count + 1;
            if next_retry >= job.retry_limit {
                let _ = sqlx::query("UPDATE jobs SET state = 'failed', retry_count = $2, updated_at = now() WHERE id = $1")
                    .bind(&job.id)
                    .bind(next_retry)
                    .execute(pool)
                    .await;

                if handler.slow_retry() {
                    let slow_name = slow_queue_name(&job.queue_name);
                    let start_after = Utc::now() + chrono::Duration::from_std(SLOW_RETRY_DELAY).unwrap();
                    let _ = sqlx::query(
                        "INSERT INTO jobs (id, queue_name, payload, created_at, start_after, retry_count, retry_limit, state, singleton_key) \
                         VALUES ($1, $2, $3, now(), $4, 0, $5, 'created', $6)",
                    )
                    .bind(uuid::Uuid::new_v4().to_string())
                    .bind(&slow_name)
                    .bind(&job.payload)
                    .bind(start_after)
                    .bind(job.retry_limit)
                    .bind(&job.singleton_key)
                    .execute(pool)
                    .await;
                }
            } else {
                let backoff = Duration::from_secs(2u64.saturating_pow(next_retry as u32).min(300));
                let start_after = Utc::now() + chrono::Duration::from_std(backoff).unwrap();
                let _ = sqlx::query("UPDATE jobs SET state = 'retry', retry_count = $2, start_after = $3, updated_at = now() WHERE id = $1")
                    .bind(&job.id)
                    .bind(next_retry)
                    .bind(start_after)
                    .execute(pool)
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_queue_name_appends_suffix() {
        assert_eq!(slow_queue_name("webhook"), "webhook-slow");
    }

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        fn queue_name(&self) -> &'static str {
            "noop"
        }

        async fn handle(&self, _payload: Value) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn default_work_options_are_single_threaded() {
        let options = Noop.options();
        assert_eq!(options.team_size, 1);
        assert_eq!(options.batch_size, 1);
    }
}

//! Pub/Sub (spec.md §4.J).
//!
//! Topic `tenants_update` carries a tenant id; the registry subscribes and
//! evicts the matching cache entry on receipt. Implemented on Postgres
//! `LISTEN`/`NOTIFY`, which already gives at-least-once delivery to every
//! connected listener in the same database.

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::mpsc;

use crate::error::Result;

pub const TENANTS_UPDATE_TOPIC: &str = "tenants_update";

/// Publish a tenant-invalidation notification on the shared topic.
#[tracing::instrument(skip(pool))]
pub async fn notify_tenant_updated(pool: &PgPool, tenant_id: &str) -> Result<()> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(TENANTS_UPDATE_TOPIC)
        .bind(tenant_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Subscribe to the `tenants_update` topic. Returns a receiver yielding one
/// tenant id per notification; the background listener task runs until the
/// receiver is dropped.
#[tracing::instrument(skip(pool))]
pub async fn subscribe_tenant_updates(pool: &PgPool) -> Result<mpsc::UnboundedReceiver<String>> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(TENANTS_UPDATE_TOPIC).await?;

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            match listener.recv().await {
                Ok(notification) => {
                    if tx.send(notification.payload().to_owned()).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    crate::error::log(&err);
                    break;
                }
            }
        }
    });

    Ok(rx)
}

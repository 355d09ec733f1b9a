//! Orphan Scanner / Reconciler (spec.md §4.I).
//!
//! Compares the blob backend's listing against the metadata store's listing
//! in bounded memory via an unlogged temp table, yielding a finite stream of
//! orphan records. The temp table lives on one pooled connection for the
//! duration of the scan and is dropped explicitly when the scan ends or is
//! cancelled.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;
use sqlx::{PgPool, Row};
use tokio::sync::watch;
use tokio_stream::StreamExt;

use crate::blob::{BlobBackend, ListOptions};
use crate::db::metadata;
use crate::error::Result;
use crate::queue::{self, JobOptions, QUEUE_BACKUP_OBJECT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanKind {
    /// Exists in the blob backend, missing in the metadata store.
    BlobOnly,
    /// Exists in the metadata store, missing in the blob backend.
    DbOnly,
}

#[derive(Debug, Clone)]
pub struct OrphanRecord {
    pub kind: OrphanKind,
    pub bucket_id: String,
    pub name: String,
    pub version: String,
    pub size: Option<i64>,
}

pub struct OrphanScanner {
    pool: PgPool,
    blob: Arc<dyn BlobBackend>,
}

impl OrphanScanner {
    pub fn new(pool: PgPool, blob: Arc<dyn BlobBackend>) -> Self {
        Self { pool, blob }
    }

    /// Streams orphan records for `bucket_id`, optionally bounded to rows
    /// last updated before `before`. Cancellable via `cancel`: the scan
    /// checks it between pages and stops early, still dropping the temp
    /// table.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn scan(
        &self,
        tenant_id: &str,
        bucket_id: &str,
        before: Option<DateTime<Utc>>,
        cancel: watch::Receiver<bool>,
    ) -> Result<BoxStream<'static, Result<OrphanRecord>>> {
        let pool = self.pool.clone();
        let blob = self.blob.clone();
        let tenant_id = tenant_id.to_owned();
        let bucket_id = bucket_id.to_owned();

        let stream = async_stream::try_stream! {
            let mut conn = pool.acquire().await?;
            sqlx::query("CREATE TEMP TABLE IF NOT EXISTS tmp_keys (key TEXT PRIMARY KEY, size BIGINT)")
                .execute(&mut *conn)
                .await?;
            sqlx::query("TRUNCATE tmp_keys").execute(&mut *conn).await?;

            let prefix = format!("{tenant_id}/{bucket_id}/");
            let mut token: Option<String> = None;
            loop {
                if *cancel.borrow() {
                    break;
                }
                let page = blob
                    .list(&bucket_id, ListOptions { prefix: prefix.clone(), before, continuation_token: token.take() })
                    .await?;
                for key in &page.keys {
                    sqlx::query("INSERT INTO tmp_keys (key, size) VALUES ($1, $2) ON CONFLICT (key) DO NOTHING")
                        .bind(&key.name)
                        .bind(key.size as i64)
                        .execute(&mut *conn)
                        .await?;
                }
                token = page.next_token;
                if token.is_none() {
                    break;
                }
            }

            let mut blob_offset: i64 = 0;
            let mut db_cursor: Option<(String, String)> = None;
            let mut blob_done = false;
            let mut db_done = false;

            // Fair merge: alternates a page of blob-side lookups with a page
            // of DB-side lookups rather than draining one side first.
            while !(blob_done && db_done) {
                if *cancel.borrow() {
                    break;
                }

                if !blob_done {
                    let rows = sqlx::query("SELECT key, size FROM tmp_keys ORDER BY key LIMIT 1000 OFFSET $1")
                        .bind(blob_offset)
                        .fetch_all(&mut *conn)
                        .await?;

                    if rows.is_empty() {
                        blob_done = true;
                    } else {
                        let mut pairs = Vec::with_capacity(rows.len());
                        let mut sizes = HashMap::new();
                        for row in &rows {
                            let key: String = row.try_get("key")?;
                            let size: i64 = row.try_get("size")?;
                            if let Some((name, version)) = split_key(&tenant_id, &bucket_id, &key) {
                                sizes.insert((name.clone(), version.clone()), size);
                                pairs.push((name, version));
                            }
                        }

                        let mut lookup_tx = pool.begin().await?;
                        let present = metadata::find_object_versions(&mut lookup_tx, &bucket_id, &pairs).await?;
                        lookup_tx.rollback().await?;
                        let present: HashSet<_> = present.into_iter().collect();

                        for pair in &pairs {
                            if !present.contains(pair) {
                                let size = sizes.get(pair).copied();
                                yield OrphanRecord {
                                    kind: OrphanKind::BlobOnly,
                                    bucket_id: bucket_id.clone(),
                                    name: pair.0.clone(),
                                    version: pair.1.clone(),
                                    size,
                                };
                            }
                        }
                        blob_offset += rows.len() as i64;
                    }
                }

                if *cancel.borrow() {
                    break;
                }

                if !db_done {
                    let mut page_tx = pool.begin().await?;
                    let page = metadata::list_objects(&mut page_tx, &bucket_id, "", 1000, db_cursor.clone()).await?;
                    page_tx.rollback().await?;

                    if page.objects.is_empty() {
                        db_done = true;
                    } else {
                        for object in &page.objects {
                            if let Some(before) = before {
                                if object.updated_at >= before {
                                    continue;
                                }
                            }
                            let key = format!("{tenant_id}/{bucket_id}/{}/{}", object.name, object.version);
                            let exists: bool = sqlx::query("SELECT EXISTS(SELECT 1 FROM tmp_keys WHERE key = $1) AS e")
                                .bind(&key)
                                .fetch_one(&mut *conn)
                                .await?
                                .try_get("e")?;
                            if !exists {
                                yield OrphanRecord {
                                    kind: OrphanKind::DbOnly,
                                    bucket_id: bucket_id.clone(),
                                    name: object.name.clone(),
                                    version: object.version.clone(),
                                    size: Some(object.metadata.size),
                                };
                            }
                        }
                        db_cursor = page.cursor.clone();
                        if db_cursor.is_none() {
                            db_done = true;
                        }
                    }
                }
            }

            let _ = sqlx::query("DROP TABLE IF EXISTS tmp_keys").execute(&mut *conn).await;
        };

        Ok(Box::pin(stream))
    }

    /// Consumes a scan, backing up and deleting blob-only orphans and
    /// removing the row for DB-only orphans (the blob they pointed at is
    /// already gone, so the row is the only remaining obligation).
    #[tracing::instrument(skip(self, tx, cancel))]
    pub async fn delete_orphans(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tenant_id: &str,
        bucket_id: &str,
        before: Option<DateTime<Utc>>,
        cancel: watch::Receiver<bool>,
    ) -> Result<usize> {
        let mut stream = self.scan(tenant_id, bucket_id, before, cancel).await?;
        let mut deleted = 0usize;

        while let Some(orphan) = stream.next().await {
            let orphan = orphan?;
            match orphan.kind {
                OrphanKind::BlobOnly => {
                    let key = format!("{tenant_id}/{bucket_id}/{}/{}", orphan.name, orphan.version);
                    let payload = serde_json::json!({ "bucket": bucket_id, "key": key });
                    queue::send(tx, QUEUE_BACKUP_OBJECT, &payload, JobOptions::default()).await?;
                    self.blob.delete_object(bucket_id, &key).await?;
                }
                OrphanKind::DbOnly => {
                    metadata::delete_object_versions(tx, bucket_id, &[(orphan.name.clone(), orphan.version.clone())]).await?;
                }
            }
            deleted += 1;
        }

        Ok(deleted)
    }
}

/// Splits `${tenant}/${bucket}/${name}/${version}` into `(name, version)`.
fn split_key(tenant_id: &str, bucket_id: &str, key: &str) -> Option<(String, String)> {
    let prefix = format!("{tenant_id}/{bucket_id}/");
    let rest = key.strip_prefix(&prefix)?;
    let (name, version) = rest.rsplit_once('/')?;
    Some((name.to_owned(), version.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_key_strips_tenant_and_bucket_prefix() {
        let (name, version) = split_key("tenant-1", "bucket-a", "tenant-1/bucket-a/dir/file.png/01H").unwrap();
        assert_eq!(name, "dir/file.png");
        assert_eq!(version, "01H");
    }

    #[test]
    fn split_key_rejects_foreign_prefix() {
        assert!(split_key("tenant-1", "bucket-a", "tenant-2/bucket-a/file/01H").is_none());
    }
}

//! Storage Orchestrator — the object state machine (spec.md §4.F).
//!
//! Every write path is a two-phase action across the Metadata Store and the
//! Blob Backend, in a fixed order, with explicit compensation on partial
//! failure. All DB operations run inside the caller's `Session` transaction;
//! lifecycle jobs (`AdminDeleteObject`, webhooks) are enqueued in the same
//! transaction so job emission is never lost even if the HTTP response never
//! reaches the client.

use std::sync::Arc;

use bytes::Bytes;
use futures_core::stream::BoxStream;
use serde_json::json;

use crate::auth;
use crate::blob::{BlobBackend, GetConditions, GetOutcome};
use crate::db::broker::Session;
use crate::db::models::{Object, ObjectMetadata};
use crate::db::metadata;
use crate::error::{GatewayError, Result};
use crate::queue::{self, JobOptions, QUEUE_ADMIN_DELETE_OBJECT, QUEUE_OBJECT_CREATED, QUEUE_UPLOAD_COMPLETED};

pub struct Orchestrator {
    pub blob: Arc<dyn BlobBackend>,
    pub file_size_limit: i64,
}

pub struct UploadOutcome {
    pub object_id: String,
    pub version: String,
    pub metadata: ObjectMetadata,
    pub previous_version: Option<String>,
}

impl Orchestrator {
    pub fn new(blob: Arc<dyn BlobBackend>, file_size_limit: i64) -> Self {
        Self { blob, file_size_limit }
    }

    /// **Create (upload)** — spec.md §4.F.
    ///
    /// 1. Insert the pending row, reserving a version.
    /// 2. Stream the body to the blob backend, enforcing the size limit.
    /// 3. `HEAD` the uploaded blob, finalize the row.
    /// 4. Emit `ObjectCreated`-equivalent bookkeeping (previous-version GC job).
    ///
    /// On upload failure after (1), the row and any partial blob are both
    /// removed and the transport error (or `PayloadTooLarge`) surfaces.
    #[tracing::instrument(skip(self, session, body))]
    pub async fn create_object(
        &self,
        session: &mut Session,
        bucket_id: &str,
        name: &str,
        owner: Option<&str>,
        content_type: &str,
        cache_control: &str,
        body: BoxStream<'static, std::io::Result<Bytes>>,
        upsert: bool,
    ) -> Result<UploadOutcome> {
        let (object_id, version, previous_version) = if upsert {
            let (version, previous) = metadata::replace_object_version(&mut session.tx, bucket_id, name, owner).await?;
            (None, version, previous)
        } else {
            let (object_id, version) = metadata::insert_pending_object(&mut session.tx, bucket_id, name, owner).await?;
            (Some(object_id), version, None)
        };

        let key = format!("{}/{}/{}/{}", session.tenant_id, bucket_id, name, version);
        let limited_body = self.enforce_size_limit(body);

        let upload_result = self.blob.upload_object(bucket_id, &key, limited_body, content_type, cache_control).await;

        let blob_metadata = match upload_result {
            Ok(metadata) => metadata,
            Err(err) => {
                // Compensation: the row never became live; delete it outright
                // and best-effort clean any partial blob the backend wrote.
                let _ = metadata::delete_object_versions(&mut session.tx, bucket_id, &[(name.to_owned(), version.clone())]).await;
                let _ = self.blob.delete_object(bucket_id, &key).await;
                return Err(err);
            }
        };

        let object_metadata = ObjectMetadata {
            size: blob_metadata.size as i64,
            mimetype: blob_metadata.content_type,
            cache_control: blob_metadata.cache_control,
            etag: blob_metadata.etag,
            last_modified: Some(blob_metadata.last_modified),
        };

        if let Err(err) = metadata::finalize_object(&mut session.tx, &version, object_metadata.clone()).await {
            // The blob landed; reconcile `.info` metadata asynchronously
            // instead of leaving the row stuck pending (spec.md §4.F step 3).
            let upload_completed_payload = json!({ "bucket": bucket_id, "key": key });
            queue::send(&mut session.tx, QUEUE_UPLOAD_COMPLETED, &upload_completed_payload, JobOptions::default()).await?;
            return Err(err);
        }

        let created_payload = json!({
            "tenant": session.tenant_id,
            "bucket": bucket_id,
            "name": name,
            "version": version,
            "previousVersion": previous_version,
        });
        queue::send(&mut session.tx, QUEUE_OBJECT_CREATED, &created_payload, JobOptions::default()).await?;

        if let Some(previous) = &previous_version {
            self.schedule_admin_delete(session, bucket_id, name, previous).await?;
        }

        Ok(UploadOutcome {
            object_id: object_id.unwrap_or_default(),
            version,
            metadata: object_metadata,
            previous_version,
        })
    }

    /// **Copy** — spec.md §4.F: read source under the caller's session,
    /// insert the destination row, copy the blob; delete the destination
    /// row if the blob copy fails.
    #[tracing::instrument(skip(self, session))]
    pub async fn copy_object(
        &self,
        session: &mut Session,
        bucket_id: &str,
        source_name: &str,
        dest_name: &str,
        owner: Option<&str>,
    ) -> Result<Object> {
        let source = metadata::list_objects(&mut session.tx, bucket_id, source_name, 1, None)
            .await?
            .objects
            .into_iter()
            .find(|o| o.name == source_name)
            .ok_or(GatewayError::NotFound)?;

        let (_dest_id, dest_version) = metadata::insert_pending_object(&mut session.tx, bucket_id, dest_name, owner).await?;

        let src_key = format!("{}/{}/{}/{}", session.tenant_id, bucket_id, source_name, source.version);
        let dst_key = format!("{}/{}/{}/{}", session.tenant_id, bucket_id, dest_name, dest_version);

        match self.blob.copy_object(bucket_id, &src_key, &dst_key).await {
            Ok(blob_metadata) => {
                let object_metadata = ObjectMetadata {
                    size: blob_metadata.size as i64,
                    mimetype: blob_metadata.content_type,
                    cache_control: blob_metadata.cache_control,
                    etag: blob_metadata.etag,
                    last_modified: Some(blob_metadata.last_modified),
                };
                metadata::finalize_object(&mut session.tx, &dest_version, object_metadata).await?;
                metadata::list_objects(&mut session.tx, bucket_id, dest_name, 1, None)
                    .await?
                    .objects
                    .into_iter()
                    .find(|o| o.name == dest_name)
                    .ok_or(GatewayError::Internal("copied object vanished".into()))
            }
            Err(err) => {
                let _ = metadata::delete_object_versions(&mut session.tx, bucket_id, &[(dest_name.to_owned(), dest_version)]).await;
                Err(err)
            }
        }
    }

    /// **Move/Rename** — spec.md §4.F: the row moves atomically first; the
    /// blob copy+delete follows and is safely retryable since the new name
    /// still points at the old immutable version token until it succeeds.
    #[tracing::instrument(skip(self, session))]
    pub async fn move_object(&self, session: &mut Session, bucket_id: &str, old_name: &str, new_name: &str) -> Result<()> {
        let object = metadata::list_objects(&mut session.tx, bucket_id, old_name, 1, None)
            .await?
            .objects
            .into_iter()
            .find(|o| o.name == old_name)
            .ok_or(GatewayError::NotFound)?;

        metadata::rename_object(&mut session.tx, bucket_id, old_name, new_name).await?;

        let src_key = format!("{}/{}/{}/{}", session.tenant_id, bucket_id, old_name, object.version);
        let dst_key = format!("{}/{}/{}/{}", session.tenant_id, bucket_id, new_name, object.version);

        // Idempotent: if a prior attempt already copied the blob, the
        // backend's copy is a harmless overwrite; the row already moved.
        self.blob.copy_object(bucket_id, &src_key, &dst_key).await?;
        self.blob.delete_object(bucket_id, &src_key).await?;
        Ok(())
    }

    /// **Delete** — spec.md §4.F: delete the row under policy, schedule the
    /// async blob GC job. Reads see the row's absence immediately.
    #[tracing::instrument(skip(self, session))]
    pub async fn delete_object(&self, session: &mut Session, bucket_id: &str, name: &str) -> Result<()> {
        let object = metadata::delete_object(&mut session.tx, bucket_id, name).await?;
        self.schedule_admin_delete(session, bucket_id, name, &object.version).await?;
        Ok(())
    }

    /// **Read** — spec.md §4.F: verify existence/authorization via the
    /// session, then stream the blob with conditions passed through.
    #[tracing::instrument(skip(self, session))]
    pub async fn read_object(&self, session: &mut Session, bucket_id: &str, name: &str, conditions: GetConditions) -> Result<GetOutcome> {
        let object = metadata::list_objects(&mut session.tx, bucket_id, name, 1, None)
            .await?
            .objects
            .into_iter()
            .find(|o| o.name == name)
            .ok_or(GatewayError::NotFound)?;

        let key = format!("{}/{}/{}/{}", session.tenant_id, bucket_id, name, object.version);
        self.blob.get_object(bucket_id, &key, &conditions).await
    }

    /// **Signed URL** — spec.md §4.F: verify existence via D, then sign a
    /// short token; the verify path never touches the DB again.
    #[tracing::instrument(skip(self, session, secret))]
    pub async fn sign_url(
        &self,
        session: &mut Session,
        bucket_id: &str,
        name: &str,
        expires_in_secs: i64,
        secret: &str,
        transformations: Option<serde_json::Value>,
    ) -> Result<String> {
        metadata::list_objects(&mut session.tx, bucket_id, name, 1, None)
            .await?
            .objects
            .into_iter()
            .find(|o| o.name == name)
            .ok_or(GatewayError::NotFound)?;

        let url = format!("/object/sign/{bucket_id}/{name}");
        auth::sign_url_token(&url, expires_in_secs, transformations, secret)
    }

    async fn schedule_admin_delete(&self, session: &mut Session, bucket_id: &str, name: &str, version: &str) -> Result<()> {
        let payload = json!({
            "tenant": session.tenant_id,
            "bucket": bucket_id,
            "name": name,
            "version": version,
        });
        queue::send(&mut session.tx, QUEUE_ADMIN_DELETE_OBJECT, &payload, JobOptions::default()).await?;

        let info_payload = json!({
            "tenant": session.tenant_id,
            "bucket": bucket_id,
            "name": name,
            "version": format!("{version}.info"),
        });
        queue::send(&mut session.tx, QUEUE_ADMIN_DELETE_OBJECT, &info_payload, JobOptions::default()).await?;
        Ok(())
    }

    /// Wraps the upload stream with a counting guard that aborts once the
    /// tenant's file-size limit is exceeded (spec.md §4.F step 2).
    fn enforce_size_limit(&self, body: BoxStream<'static, std::io::Result<Bytes>>) -> BoxStream<'static, std::io::Result<Bytes>> {
        let limit = self.file_size_limit as u64;
        let stream = async_stream::stream! {
            let mut body = body;
            let mut seen: u64 = 0;
            use tokio_stream::StreamExt as _;
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(chunk) => {
                        seen += chunk.len() as u64;
                        if seen > limit {
                            yield Err(std::io::Error::other("payload too large"));
                            return;
                        }
                        yield Ok(chunk);
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        };
        Box::pin(stream)
    }
}

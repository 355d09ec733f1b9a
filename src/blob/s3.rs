//! S3-compatible blob backend (spec.md §4.E).
//!
//! A persistent HTTP client with keep-alive and bounded socket timeouts,
//! path-style addressing so S3-compatible (non-AWS) endpoints work, and
//! retry with exponential backoff for transient 5xx/throttling responses.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use futures_core::stream::BoxStream;
use tokio_stream::StreamExt;

use crate::blob::{BlobBackend, BlobMetadata, BlobObject, GetConditions, GetOutcome, ListOptions, ListOutcome, ListedKey};
use crate::config::RetryWindow;
use crate::error::{GatewayError, Result};

pub struct S3Backend {
    client: aws_sdk_s3::Client,
    bucket: String,
    retry: RetryWindow,
}

impl S3Backend {
    pub async fn new(bucket: String, endpoint: Option<String>, region: String) -> Self {
        let creds = Credentials::new(
            std::env::var("AWS_ACCESS_KEY_ID").unwrap_or_default(),
            std::env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default(),
            None,
            None,
            "storage-gateway",
        );

        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::v2023_11_09())
            .credentials_provider(creds)
            .region(Region::new(region))
            .force_path_style(true);

        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = aws_sdk_s3::Client::from_conf(builder.build());
        Self {
            client,
            bucket,
            retry: RetryWindow::default(),
        }
    }

    /// Object key within the single shared S3 bucket; the tenant/bucket/name
    /// path lives in `key` already (spec.md §6 "Blob key layout").
    async fn with_retry<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err @ GatewayError::Throttled) | Err(err @ GatewayError::Upstream(_)) => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        return Err(err);
                    }
                    tokio::time::sleep(self.retry.backoff_for(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl BlobBackend for S3Backend {
    #[tracing::instrument(skip(self))]
    async fn get_object(&self, _bucket: &str, key: &str, conditions: &GetConditions) -> Result<GetOutcome> {
        self.with_retry(|| async {
            let mut req = self.client.get_object().bucket(&self.bucket).key(key);
            if let Some(etag) = &conditions.if_none_match {
                req = req.if_none_match(etag);
            }
            if let Some((start, end)) = &conditions.range {
                let range = match end {
                    Some(end) => format!("bytes={start}-{end}"),
                    None => format!("bytes={start}-"),
                };
                req = req.range(range);
            }

            let resp = req.send().await;
            let resp = match resp {
                Ok(resp) => resp,
                Err(err) => return Err(classify_sdk_error(err)),
            };

            let metadata = BlobMetadata {
                size: resp.content_length().unwrap_or(0) as u64,
                content_type: resp.content_type().unwrap_or("application/octet-stream").to_owned(),
                cache_control: resp.cache_control().unwrap_or("").to_owned(),
                etag: resp.e_tag().unwrap_or("").trim_matches('"').to_owned(),
                last_modified: resp
                    .last_modified()
                    .and_then(|t| chrono::DateTime::from_timestamp(t.secs(), 0))
                    .unwrap_or_else(chrono::Utc::now),
            };

            let stream = resp
                .body
                .map(|chunk| chunk.map_err(|e| std::io::Error::other(e.to_string())));

            Ok(GetOutcome::Body(BlobObject {
                metadata,
                body: Box::pin(stream),
            }))
        })
        .await
    }

    #[tracing::instrument(skip(self, body))]
    async fn upload_object(
        &self,
        _bucket: &str,
        key: &str,
        body: BoxStream<'static, std::io::Result<Bytes>>,
        content_type: &str,
        cache_control: &str,
    ) -> Result<BlobMetadata> {
        let bytes = collect_stream(body).await?;
        let byte_stream = ByteStream::from(bytes);

        let resp = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .cache_control(cache_control)
            .body(byte_stream)
            .send()
            .await
            .map_err(classify_sdk_error)?;

        self.head_object("", key).await.map(|mut m| {
            if let Some(etag) = resp.e_tag() {
                m.etag = etag.trim_matches('"').to_owned();
            }
            m
        })
    }

    #[tracing::instrument(skip(self))]
    async fn copy_object(&self, _bucket: &str, src_key: &str, dst_key: &str) -> Result<BlobMetadata> {
        self.with_retry(|| async {
            self.client
                .copy_object()
                .bucket(&self.bucket)
                .copy_source(format!("{}/{}", self.bucket, src_key))
                .key(dst_key)
                .send()
                .await
                .map_err(classify_sdk_error)?;
            Ok(())
        })
        .await?;

        self.head_object("", dst_key).await
    }

    #[tracing::instrument(skip(self))]
    async fn delete_object(&self, _bucket: &str, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(classify_sdk_error)?;
        Ok(())
    }

    #[tracing::instrument(skip(self, keys))]
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<()> {
        for key in keys {
            self.delete_object(bucket, key).await?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn head_object(&self, _bucket: &str, key: &str) -> Result<BlobMetadata> {
        let resp = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(classify_sdk_error)?;

        Ok(BlobMetadata {
            size: resp.content_length().unwrap_or(0) as u64,
            content_type: resp.content_type().unwrap_or("application/octet-stream").to_owned(),
            cache_control: resp.cache_control().unwrap_or("").to_owned(),
            etag: resp.e_tag().unwrap_or("").trim_matches('"').to_owned(),
            last_modified: resp
                .last_modified()
                .and_then(|t| chrono::DateTime::from_timestamp(t.secs(), 0))
                .unwrap_or_else(chrono::Utc::now),
        })
    }

    #[tracing::instrument(skip(self))]
    async fn list(&self, _bucket: &str, options: ListOptions) -> Result<ListOutcome> {
        let mut req = self.client.list_objects_v2().bucket(&self.bucket).prefix(&options.prefix).max_keys(1000);
        if let Some(token) = &options.continuation_token {
            req = req.continuation_token(token);
        }

        let resp = req.send().await.map_err(classify_sdk_error)?;

        let keys = resp
            .contents()
            .iter()
            .filter(|o| !o.key().unwrap_or("").ends_with(".info"))
            .map(|o| ListedKey {
                name: o.key().unwrap_or_default().to_owned(),
                size: o.size().unwrap_or(0) as u64,
                last_modified: o
                    .last_modified()
                    .and_then(|t| chrono::DateTime::from_timestamp(t.secs(), 0))
                    .unwrap_or_else(chrono::Utc::now),
            })
            .collect();

        Ok(ListOutcome {
            keys,
            next_token: resp.next_continuation_token().map(str::to_owned),
        })
    }

    #[tracing::instrument(skip(self))]
    async fn update_object_info_metadata(&self, _bucket: &str, key: &str) -> Result<()> {
        let info_key = format!("{key}.info");
        match self.head_object("", &info_key).await {
            Ok(_) => Ok(()),
            Err(GatewayError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

async fn collect_stream(mut body: BoxStream<'static, std::io::Result<Bytes>>) -> Result<Bytes> {
    let mut buf = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| crate::blob::classify_stream_error(&e))?;
        buf.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buf))
}

fn classify_sdk_error<E: std::fmt::Debug + std::fmt::Display>(err: aws_sdk_s3::error::SdkError<E>) -> GatewayError {
    use aws_sdk_s3::error::SdkError;

    crate::error::log(&std::io::Error::other(err.to_string()));

    match &err {
        SdkError::ServiceError(service_err) => {
            let status = service_err.raw().status().as_u16();
            match status {
                404 => GatewayError::NotFound,
                304 => GatewayError::NotModified,
                412 => GatewayError::PreconditionFailed,
                429 => GatewayError::Throttled,
                500..=599 => GatewayError::Upstream(format!("{err}")),
                _ => GatewayError::Internal(format!("{err}")),
            }
        }
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => GatewayError::Upstream(format!("{err}")),
        _ => GatewayError::Internal(format!("{err}")),
    }
}

/// Socket timeouts per spec.md §5: short ops default to 3s, uploads to 300s.
pub fn default_timeouts() -> (Duration, Duration) {
    (Duration::from_secs(3), Duration::from_secs(300))
}

//! Blob Backend (spec.md §4.E, §9 "Polymorphism over backends").
//!
//! A capability-set interface the orchestrator consumes, rather than an
//! inheritance hierarchy: `get`, `put`, `copy`, `delete`, `deleteMany`,
//! `head`, `list`. Construction input is a tagged variant (`S3Params |
//! FileParams`); callers never need to know which backend they're talking
//! to beyond that boundary.

pub mod fs;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;

use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct GetConditions {
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<DateTime<Utc>>,
    pub range: Option<(u64, Option<u64>)>,
}

#[derive(Debug, Clone)]
pub struct BlobMetadata {
    pub size: u64,
    pub content_type: String,
    pub cache_control: String,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

pub struct BlobObject {
    pub metadata: BlobMetadata,
    pub body: BoxStream<'static, std::io::Result<Bytes>>,
}

/// Returned by [`BlobBackend::get`] when the request's conditions are
/// satisfied by the stored object, short-circuiting the body read.
pub enum GetOutcome {
    Body(BlobObject),
    NotModified,
}

#[derive(Debug, Clone)]
pub struct ListedKey {
    pub name: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub prefix: String,
    pub before: Option<DateTime<Utc>>,
    pub continuation_token: Option<String>,
}

pub struct ListOutcome {
    pub keys: Vec<ListedKey>,
    pub next_token: Option<String>,
}

/// Maps a body-stream error raised while consuming an upload to a surface
/// error, recognizing the sentinel the orchestrator's size-limit guard
/// raises (spec.md §4.F "enforcing size limit using a counting wrapper").
pub fn classify_stream_error(err: &std::io::Error) -> crate::error::GatewayError {
    if err.to_string() == "payload too large" {
        crate::error::GatewayError::PayloadTooLarge
    } else {
        crate::error::GatewayError::Internal(format!("upload stream error: {err}"))
    }
}

/// Construction input for a configured backend instance (spec.md §9).
pub enum BackendParams {
    S3 { bucket: String, endpoint: Option<String>, region: String },
    File { root: std::path::PathBuf },
}

#[async_trait]
pub trait BlobBackend: Send + Sync {
    async fn get_object(&self, bucket: &str, key: &str, conditions: &GetConditions) -> Result<GetOutcome>;

    async fn upload_object(
        &self,
        bucket: &str,
        key: &str,
        body: BoxStream<'static, std::io::Result<Bytes>>,
        content_type: &str,
        cache_control: &str,
    ) -> Result<BlobMetadata>;

    async fn copy_object(&self, bucket: &str, src_key: &str, dst_key: &str) -> Result<BlobMetadata>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<()>;

    async fn head_object(&self, bucket: &str, key: &str) -> Result<BlobMetadata>;

    async fn list(&self, bucket: &str, options: ListOptions) -> Result<ListOutcome>;

    /// Finalizes resumable-upload sidecar metadata at `${key}.info`
    /// (spec.md §4.E, §4.H `UploadCompleted`).
    async fn update_object_info_metadata(&self, bucket: &str, key: &str) -> Result<()>;
}

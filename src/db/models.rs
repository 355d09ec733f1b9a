//! Data model for the Metadata Store (spec.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
    pub id: String,
    pub name: String,
    pub owner: Option<String>,
    pub public: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub file_size_limit: Option<i64>,
}

/// Per-object metadata blob (spec.md §3 "metadata (size, mimetype, cache-control, etag, last-modified)").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub size: i64,
    pub mimetype: String,
    pub cache_control: String,
    pub etag: String,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectState {
    Pending,
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Object {
    pub id: String,
    pub bucket_id: String,
    pub name: String,
    pub owner: Option<String>,
    pub version: String,
    pub state: ObjectState,
    pub metadata: ObjectMetadata,
    pub user_metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Object {
    /// Blob key layout (spec.md §6): `${tenant_id}/${bucket_id}/${object_name}/${version}`.
    pub fn blob_key(&self, tenant_id: &str) -> String {
        format!("{}/{}/{}/{}", tenant_id, self.bucket_id, self.name, self.version)
    }

    pub fn info_key(&self, tenant_id: &str) -> String {
        format!("{}.info", self.blob_key(tenant_id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prefix {
    pub bucket_id: String,
    pub name: String,
    pub level: i32,
}

/// A job record (spec.md §3 and §4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Created,
    Retry,
    Active,
    Completed,
    Expired,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue_name: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub start_after: DateTime<Utc>,
    pub retry_count: i32,
    pub retry_limit: i32,
    pub state: JobState,
    pub singleton_key: Option<String>,
}

/// A page of `listObjects`, ordered by `(name, version)` (spec.md §4.D).
pub struct ObjectPage {
    pub objects: Vec<Object>,
    pub common_prefixes: Vec<String>,
    pub cursor: Option<(String, String)>,
}

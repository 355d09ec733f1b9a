//! Tenant Registry (spec.md §4.B) and its data model (spec.md §3, §9).

pub mod registry;

use serde::{Deserialize, Serialize};

/// Migration status tracked on the tenant record (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MigrationStatus {
    Completed,
    Failed,
    FailedStale,
}

/// Feature flags carried by a tenant record (spec.md §9 "Dynamic configuration").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageTransformationFeature {
    pub enabled: bool,
    pub max_resolution: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct S3ProtocolFeature {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PurgeCacheFeature {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IcebergCatalogFeature {
    pub enabled: bool,
    pub max_catalogs: Option<u32>,
    pub max_namespaces: Option<u32>,
    pub max_tables: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VectorBucketsFeature {
    pub enabled: bool,
    pub max_buckets: Option<u32>,
    pub max_indexes: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantFeatures {
    pub image_transformation: ImageTransformationFeature,
    pub s3_protocol: S3ProtocolFeature,
    pub purge_cache: PurgeCacheFeature,
    pub iceberg_catalog: IcebergCatalogFeature,
    pub vector_buckets: VectorBucketsFeature,
}

/// A decrypted, in-memory snapshot of one tenant's configuration, composed
/// once on cache miss and held until invalidated (spec.md §4.B).
#[derive(Debug, Clone)]
pub struct TenantConfig {
    pub tenant_id: String,
    pub database_url: String,
    pub database_pool_url: Option<String>,
    pub max_connections: Option<u32>,
    pub file_size_limit: i64,
    pub jwt_secret: String,
    pub jwks: Option<jsonwebtoken::jwk::JwkSet>,
    pub service_key: String,
    pub service_key_payload: serde_json::Value,
    pub features: TenantFeatures,
    pub migration_version: Option<String>,
    pub migration_status: Option<MigrationStatus>,
}

/// A partial-update patch where a present-but-null field clears the value
/// and an absent field leaves it untouched (spec.md §9 "explicit-null semantics").
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TenantPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    #[serde(default, deserialize_with = "deserialize_explicit_null", skip_serializing_if = "Option::is_none")]
    pub database_pool_url: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_explicit_null", skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<Option<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size_limit: Option<i64>,
}

fn deserialize_explicit_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

//! Config & Secrets (spec.md §4.A).
//!
//! A single immutable configuration snapshot, read once at startup from
//! environment variables, following the teacher's `config` crate usage
//! (`Config::builder().add_source(Environment::...)`), extended to cover
//! every variable in spec.md §6 and layered with at-rest secret decryption
//! via [`crate::crypto`].

use std::time::Duration;

use ::config::{Config as RawConfig, Environment};
use regex::Regex;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    S3,
    File,
}

/// Raw, serde-deserializable shape of the environment. Kept separate from
/// [`Settings`] so invalid regexes / missing combinations can be rejected in
/// a single validation pass instead of scattering `expect()`s through startup.
#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_admin_port")]
    admin_port: u16,
    #[serde(default = "default_request_id_header")]
    request_id_header: String,
    #[serde(default = "default_admin_request_id_header")]
    admin_request_id_header: String,

    #[serde(default)]
    is_multitenant: bool,
    tenant_id: Option<String>,
    x_forwarded_host_regexp: Option<String>,
    multitenant_database_url: Option<String>,

    storage_backend: StorageBackendKind,
    storage_s3_bucket: Option<String>,
    storage_s3_endpoint: Option<String>,
    region: Option<String>,
    file_storage_backend_path: Option<String>,
    #[serde(default = "default_file_size_limit")]
    file_size_limit: i64,

    #[serde(default)]
    pg_queue_enable: bool,
    pg_queue_connection_url: Option<String>,
    webhook_url: Option<String>,
    webhook_api_key: Option<String>,

    pgrst_jwt_secret: Option<String>,
    #[serde(default = "default_jwt_algorithm")]
    jwt_algorithm: String,
    encryption_key: String,
    anon_key: Option<String>,
    service_key: Option<String>,
    #[serde(default)]
    admin_api_keys: String,

    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    enable_default_metrics: bool,
    img_proxy_url: Option<String>,
    #[serde(default = "default_url_length_limit")]
    url_length_limit: u32,

    database_url: Option<String>,
}

fn default_port() -> u16 {
    5000
}
fn default_host() -> String {
    "0.0.0.0".to_owned()
}
fn default_admin_port() -> u16 {
    5001
}
fn default_request_id_header() -> String {
    "X-Request-Id".to_owned()
}
fn default_admin_request_id_header() -> String {
    "X-Request-Id".to_owned()
}
fn default_file_size_limit() -> i64 {
    50 * 1024 * 1024
}
fn default_jwt_algorithm() -> String {
    "HS256".to_owned()
}
fn default_log_level() -> String {
    "info".to_owned()
}
fn default_url_length_limit() -> u32 {
    7_500
}

/// The validated, immutable snapshot consumed by the rest of the gateway.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_host: String,
    pub port: u16,
    pub admin_port: u16,
    pub request_id_header: String,
    pub admin_request_id_header: String,

    pub is_multitenant: bool,
    pub tenant_id: Option<String>,
    pub x_forwarded_host_regexp: Option<Regex>,
    pub multitenant_database_url: Option<String>,

    pub storage_backend: StorageBackendKind,
    pub storage_s3_bucket: Option<String>,
    pub storage_s3_endpoint: Option<String>,
    pub region: String,
    pub file_storage_backend_path: Option<String>,
    pub file_size_limit: i64,

    pub pg_queue_enable: bool,
    pub pg_queue_connection_url: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_api_key: Option<String>,

    pub jwt_secret: Option<String>,
    pub jwt_algorithm: String,
    pub encryption_key: Vec<u8>,
    pub anon_key: Option<String>,
    pub service_key: Option<String>,
    pub admin_api_keys: Vec<String>,

    pub log_level: String,
    pub enable_default_metrics: bool,
    pub img_proxy_url: Option<String>,
    pub url_length_limit: u32,

    pub database_url: Option<String>,
}

impl Settings {
    /// Load configuration from the process environment, the way the
    /// teacher's `Settings::new` composes a `config::Config` from sources.
    pub fn from_env() -> anyhow::Result<Self> {
        let raw: RawSettings = RawConfig::builder()
            .add_source(Environment::default().try_parsing(true))
            .build()?
            .try_deserialize()?;

        raw.validate()
    }
}

impl RawSettings {
    fn validate(self) -> anyhow::Result<Settings> {
        if self.is_multitenant {
            if self.multitenant_database_url.is_none() {
                anyhow::bail!("MULTITENANT_DATABASE_URL is required when IS_MULTITENANT=true");
            }
            if self.x_forwarded_host_regexp.is_none() {
                anyhow::bail!("X_FORWARDED_HOST_REGEXP is required when IS_MULTITENANT=true");
            }
        } else if self.tenant_id.is_none() {
            anyhow::bail!("TENANT_ID is required when IS_MULTITENANT=false");
        }

        match self.storage_backend {
            StorageBackendKind::S3 => {
                if self.storage_s3_bucket.is_none() {
                    anyhow::bail!("STORAGE_S3_BUCKET is required when STORAGE_BACKEND=s3");
                }
            }
            StorageBackendKind::File => {
                if self.file_storage_backend_path.is_none() {
                    anyhow::bail!(
                        "FILE_STORAGE_BACKEND_PATH is required when STORAGE_BACKEND=file"
                    );
                }
            }
        }

        let x_forwarded_host_regexp = self
            .x_forwarded_host_regexp
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| anyhow::anyhow!("invalid X_FORWARDED_HOST_REGEXP: {e}"))?;

        let encryption_key = crate::crypto::derive_key(&self.encryption_key);

        let admin_api_keys = self
            .admin_api_keys
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();

        Ok(Settings {
            bind_host: self.host,
            port: self.port,
            admin_port: self.admin_port,
            request_id_header: self.request_id_header,
            admin_request_id_header: self.admin_request_id_header,
            is_multitenant: self.is_multitenant,
            tenant_id: self.tenant_id,
            x_forwarded_host_regexp,
            multitenant_database_url: self.multitenant_database_url,
            storage_backend: self.storage_backend,
            storage_s3_bucket: self.storage_s3_bucket,
            storage_s3_endpoint: self.storage_s3_endpoint,
            region: self.region.unwrap_or_else(|| "us-east-1".to_owned()),
            file_storage_backend_path: self.file_storage_backend_path,
            file_size_limit: self.file_size_limit,
            pg_queue_enable: self.pg_queue_enable,
            pg_queue_connection_url: self.pg_queue_connection_url,
            webhook_url: self.webhook_url,
            webhook_api_key: self.webhook_api_key,
            jwt_secret: self.pgrst_jwt_secret,
            jwt_algorithm: self.jwt_algorithm,
            encryption_key,
            anon_key: self.anon_key,
            service_key: self.service_key,
            admin_api_keys,
            log_level: self.log_level,
            enable_default_metrics: self.enable_default_metrics,
            img_proxy_url: self.img_proxy_url,
            url_length_limit: self.url_length_limit,
            database_url: self.database_url,
        })
    }
}

/// Bounded retry/backoff windows shared by the blob backend and the job
/// queue (spec.md §4.E, §4.G, §5).
#[derive(Debug, Clone, Copy)]
pub struct RetryWindow {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryWindow {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryWindow {
    /// Exponential backoff bounded at `max_delay` (spec.md §4.F "Failure semantics").
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1 << attempt.min(16));
        exp.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_bounded() {
        let w = RetryWindow::default();
        assert_eq!(w.backoff_for(0), w.base_delay);
        assert!(w.backoff_for(100) <= w.max_delay);
    }
}

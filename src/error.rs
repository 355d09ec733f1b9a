//! Error taxonomy and the `try_!` boundary macro.
//!
//! Every fallible call into the database, the blob backend, or an outbound
//! HTTP client is logged exactly once, at the point it crosses into a
//! surface-level [`GatewayError`]. Internal causes are never lost: `log`
//! captures a span trace the way the upstream `s3s-rados` error module did.

use std::panic::Location;

use tracing::error;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Surface error kinds, matching spec.md §7 one-for-one.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    /// A bucket exists but isn't public, on a public-read path. Reported with
    /// the same `NotFound` message/error code but a 400 status, so an
    /// unauthenticated caller can't distinguish "doesn't exist" from
    /// "exists but isn't public" (spec.md §8 scenario 2).
    #[error("not found")]
    BucketNotPublic,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("precondition failed")]
    PreconditionFailed,

    #[error("not modified")]
    NotModified,

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("invalid tenant: {0}")]
    InvalidTenant(String),

    #[error("X-Forwarded-Host header does not match regular expression")]
    InvalidHostHeader,

    #[error("throttled")]
    Throttled,

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("aborted")]
    Aborted,
}

impl GatewayError {
    /// HTTP status code for this error kind, per spec.md §7 propagation policy.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::InvalidInput(_) => 400,
            GatewayError::InvalidTenant(_) => 400,
            GatewayError::InvalidHostHeader => 400,
            GatewayError::Unauthorized => 401,
            GatewayError::Forbidden => 403,
            GatewayError::NotFound => 404,
            GatewayError::BucketNotPublic => 400,
            GatewayError::Conflict(_) => 409,
            GatewayError::PreconditionFailed => 412,
            GatewayError::PayloadTooLarge => 413,
            GatewayError::NotModified => 304,
            GatewayError::Throttled => 429,
            GatewayError::Upstream(_) => 502,
            GatewayError::Internal(_) => 500,
            GatewayError::Aborted => 499,
        }
    }

    /// Stable `error` field used in the `{statusCode, error, message}` envelope.
    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::InvalidInput(_) => "Invalid Input",
            GatewayError::InvalidTenant(_) => "Invalid Tenant",
            GatewayError::InvalidHostHeader => "Invalid Header",
            GatewayError::Unauthorized => "Unauthorized",
            GatewayError::Forbidden => "Forbidden",
            GatewayError::NotFound => "NotFound",
            GatewayError::BucketNotPublic => "NotFound",
            GatewayError::Conflict(_) => "Conflict",
            GatewayError::PreconditionFailed => "PreconditionFailed",
            GatewayError::PayloadTooLarge => "Payload too large",
            GatewayError::NotModified => "NotModified",
            GatewayError::Throttled => "Throttled",
            GatewayError::Upstream(_) => "Upstream",
            GatewayError::Internal(_) => "Internal",
            GatewayError::Aborted => "Aborted",
        }
    }

    /// `Aborted` is logged at info and never counted as an error metric (spec.md §7).
    pub fn is_client_abort(&self) -> bool {
        matches!(self, GatewayError::Aborted)
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => GatewayError::NotFound,
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                GatewayError::Conflict(db_err.message().to_owned())
            }
            _ => {
                log(&err);
                GatewayError::Internal(err.to_string())
            }
        }
    }
}

impl From<jsonwebtoken::errors::Error> for GatewayError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        log(&err);
        GatewayError::Unauthorized
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        log(&err);
        if err.is_timeout() || err.is_connect() {
            GatewayError::Upstream(err.to_string())
        } else {
            GatewayError::Internal(err.to_string())
        }
    }
}

/// Log an internal error with caller location and span trace, then let the
/// caller decide what surface error to return. Mirrors the teacher's
/// `error::log` + `try_!` pair.
#[track_caller]
pub fn log(source: &dyn std::error::Error) {
    let location = Location::caller();
    let span_trace = tracing_error::SpanTrace::capture();

    error!(
        target: "storage_gateway",
        %location,
        error = %source,
        "span trace:\n{span_trace}"
    );
}

/// Log-and-convert an internal error into `GatewayError::Internal` at the
/// service boundary, the way the teacher's `try_!` macro logs before mapping
/// into `S3Error::internal_error`.
#[macro_export]
macro_rules! try_internal {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(err) => {
                $crate::error::log(&err);
                return Err($crate::error::GatewayError::Internal(err.to_string()));
            }
        }
    };
}

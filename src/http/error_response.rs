//! Maps [`GatewayError`] onto the `{statusCode, error, message}` envelope
//! (spec.md §6 "HTTP responses", §7).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::GatewayError;

#[derive(Serialize)]
struct ErrorEnvelope {
    #[serde(rename = "statusCode")]
    status_code: String,
    error: &'static str,
    message: String,
}

/// Wraps [`GatewayError`] so it can be returned directly from an axum
/// handler. `Aborted` is logged at info, matching spec.md §7's "never
/// counted as an error metric".
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        if err.is_client_abort() {
            tracing::info!(target: "storage_gateway", "client aborted request");
        }

        let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorEnvelope {
            status_code: err.status_code().to_string(),
            error: err.error_code(),
            message: err.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

//! Image transformation pass-through (spec.md §6 `GET /render/...`, §9
//! "Dynamic configuration" `features.imageTransformation`).
//!
//! The gateway never transforms images itself: it resolves and reads the
//! object exactly like the object surface, then forwards the bytes to the
//! configured `IMG_PROXY_URL` with the requested transform parameters and
//! streams its response back unchanged.

use std::collections::HashMap;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use tokio_stream::StreamExt;

use crate::blob::GetOutcome;
use crate::db::metadata;
use crate::error::GatewayError;
use crate::http::error_response::ApiError;
use crate::http::middleware::open_session;
use crate::http::state::AppState;

#[tracing::instrument(skip(state, headers))]
pub async fn render_authenticated(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(transform): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (session, _config, _owner) = open_session(&state, &headers).await?;
    render(&state, session, &bucket, &key, transform).await
}

#[tracing::instrument(skip(state, headers))]
pub async fn render_public(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(transform): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (mut session, _config, _owner) = open_session(&state, &headers).await?;

    match metadata::get_bucket(&mut session.tx, &bucket).await {
        Ok(b) if b.public => {}
        Ok(_) => {
            let _ = state.broker.abort(session).await;
            return Err(GatewayError::BucketNotPublic.into());
        }
        Err(err) => {
            let _ = state.broker.abort(session).await;
            return Err(err.into());
        }
    }

    render(&state, session, &bucket, &key, transform).await
}

async fn render(
    state: &AppState,
    mut session: crate::db::broker::Session,
    bucket: &str,
    key: &str,
    transform: HashMap<String, String>,
) -> Result<Response, ApiError> {
    let Some(proxy_url) = state.settings.img_proxy_url.clone() else {
        let _ = state.broker.abort(session).await;
        return Err(GatewayError::Internal("IMG_PROXY_URL is not configured".into()).into());
    };

    let outcome = state.orchestrator.read_object(&mut session, bucket, key, Default::default()).await;
    let object = match outcome {
        Ok(GetOutcome::Body(object)) => {
            state.broker.dispose(session).await?;
            object
        }
        Ok(GetOutcome::NotModified) => {
            state.broker.dispose(session).await?;
            return Ok(axum::http::StatusCode::NOT_MODIFIED.into_response());
        }
        Err(err) => {
            let _ = state.broker.abort(session).await;
            return Err(err.into());
        }
    };

    let mut bytes = Vec::with_capacity(object.metadata.size as usize);
    let mut body = object.body;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| crate::blob::classify_stream_error(&e))?;
        bytes.extend_from_slice(&chunk);
    }

    let resp = state
        .http_client
        .post(&proxy_url)
        .query(&transform)
        .header(axum::http::header::CONTENT_TYPE, &object.metadata.content_type)
        .body(bytes)
        .send()
        .await
        .map_err(GatewayError::from)?
        .error_for_status()
        .map_err(GatewayError::from)?;

    let content_type = resp.headers().get(axum::http::header::CONTENT_TYPE).cloned();
    let stream = resp.bytes_stream();

    let mut builder = Response::builder();
    if let Some(content_type) = content_type {
        builder = builder.header(axum::http::header::CONTENT_TYPE, content_type);
    }
    Ok(builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

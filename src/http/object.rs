//! Object surface handlers (spec.md §6).
//!
//! Every handler opens its own [`Session`] via [`open_session`], drives one
//! orchestrator call, and disposes the session: commit on success, abort on
//! any error so the transaction never outlives the request.

use std::collections::HashMap;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_core::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;

use crate::blob::{GetConditions, GetOutcome};
use crate::db::metadata;
use crate::error::GatewayError;
use crate::http::error_response::ApiError;
use crate::http::middleware::open_session;
use crate::http::state::AppState;

fn body_to_stream(body: Body) -> BoxStream<'static, std::io::Result<Bytes>> {
    Box::pin(body.into_data_stream().map(|chunk| chunk.map_err(|e| std::io::Error::other(e.to_string()))))
}

fn parse_range(headers: &HeaderMap) -> Option<(u64, Option<u64>)> {
    let raw = headers.get(axum::http::header::RANGE)?.to_str().ok()?;
    let spec = raw.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end = if end.is_empty() { None } else { end.parse().ok() };
    Some((start, end))
}

fn conditions_from_headers(headers: &HeaderMap) -> GetConditions {
    GetConditions {
        if_none_match: headers.get(axum::http::header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()).map(str::to_owned),
        if_modified_since: headers
            .get(axum::http::header::IF_MODIFIED_SINCE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| chrono::DateTime::parse_from_rfc2822(v).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc)),
        range: parse_range(headers),
    }
}

fn blob_response(outcome: GetOutcome, download: Option<&str>) -> Response {
    match outcome {
        GetOutcome::NotModified => StatusCode::NOT_MODIFIED.into_response(),
        GetOutcome::Body(object) => {
            let mut builder = Response::builder()
                .header(axum::http::header::CONTENT_TYPE, object.metadata.content_type)
                .header(axum::http::header::CACHE_CONTROL, object.metadata.cache_control)
                .header(axum::http::header::ETAG, format!("\"{}\"", object.metadata.etag))
                .header(axum::http::header::LAST_MODIFIED, object.metadata.last_modified.to_rfc2822())
                .header(axum::http::header::CONTENT_LENGTH, object.metadata.size);

            if let Some(name) = download {
                builder = builder.header(axum::http::header::CONTENT_DISPOSITION, format!("attachment; filename=\"{name}\""));
            }

            let body = Body::from_stream(object.body);
            builder.body(body).unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    #[serde(default)]
    pub upsert: bool,
}

#[tracing::instrument(skip(state, headers, body))]
pub async fn upload_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    put_object(state, bucket, key, query.upsert, headers, body).await
}

#[tracing::instrument(skip(state, headers, body))]
pub async fn replace_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    put_object(state, bucket, key, true, headers, body).await
}

async fn put_object(
    state: AppState,
    bucket: String,
    key: String,
    upsert: bool,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let (mut session, _config, owner) = open_session(&state, &headers).await?;

    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_owned();
    let cache_control = headers
        .get(axum::http::header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_owned();

    let stream = body_to_stream(body);

    let result = state
        .orchestrator
        .create_object(&mut session, &bucket, &key, owner.as_deref(), &content_type, &cache_control, stream, upsert)
        .await;

    match result {
        Ok(outcome) => {
            state.broker.dispose(session).await?;
            Ok(Json(serde_json::json!({
                "Key": format!("{bucket}/{key}"),
                "Id": outcome.object_id,
                "version": outcome.version,
            }))
            .into_response())
        }
        Err(err) => {
            let _ = state.broker.abort(session).await;
            Err(err.into())
        }
    }
}

#[tracing::instrument(skip(state, headers))]
pub async fn read_authenticated(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (mut session, _config, _owner) = open_session(&state, &headers).await?;
    let conditions = conditions_from_headers(&headers);

    match state.orchestrator.read_object(&mut session, &bucket, &key, conditions).await {
        Ok(outcome) => {
            state.broker.dispose(session).await?;
            Ok(blob_response(outcome, query.get("download").map(String::as_str)))
        }
        Err(err) => {
            let _ = state.broker.abort(session).await;
            Err(err.into())
        }
    }
}

#[tracing::instrument(skip(state, headers))]
pub async fn read_public(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (mut session, _config, _owner) = open_session(&state, &headers).await?;

    let bucket_row = match metadata::get_bucket(&mut session.tx, &bucket).await {
        Ok(b) => b,
        Err(err) => {
            let _ = state.broker.abort(session).await;
            return Err(err.into());
        }
    };
    if !bucket_row.public {
        let _ = state.broker.abort(session).await;
        return Err(GatewayError::BucketNotPublic.into());
    }

    let conditions = conditions_from_headers(&headers);
    match state.orchestrator.read_object(&mut session, &bucket, &key, conditions).await {
        Ok(outcome) => {
            state.broker.dispose(session).await?;
            Ok(blob_response(outcome, query.get("download").map(String::as_str)))
        }
        Err(err) => {
            let _ = state.broker.abort(session).await;
            Err(err.into())
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SignedReadQuery {
    pub token: String,
}

/// Verifies the signed-URL token out-of-band, then performs the same
/// session-backed read as [`read_authenticated`] under the `anon` role —
/// the token substitutes for a bearer credential, it does not bypass the
/// metadata lookup (spec.md §4.F "Signed URL").
#[tracing::instrument(skip(state, headers))]
pub async fn read_signed(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<SignedReadQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let forwarded = crate::http::middleware::forwarded_host(&headers);
    let tenant_id = state.broker.resolve_tenant_id(forwarded)?;
    let config = state.registry.get_config(&tenant_id).await?;

    let claims = crate::auth::verify_url_token(&query.token, &config.jwt_secret)?;
    let expected_url = format!("/object/sign/{bucket}/{key}");
    if claims.url != expected_url {
        return Err(GatewayError::Unauthorized.into());
    }

    let mut session = state.broker.acquire(&tenant_id, forwarded, &serde_json::Value::Null, Some("anon")).await?;
    let conditions = conditions_from_headers(&headers);

    match state.orchestrator.read_object(&mut session, &bucket, &key, conditions).await {
        Ok(outcome) => {
            state.broker.dispose(session).await?;
            Ok(blob_response(outcome, None))
        }
        Err(err) => {
            let _ = state.broker.abort(session).await;
            Err(err.into())
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SignRequest {
    #[serde(rename = "expiresIn")]
    expires_in: i64,
    transformations: Option<serde_json::Value>,
}

#[tracing::instrument(skip(state, headers))]
pub async fn sign_single(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    Json(req): Json<SignRequest>,
) -> Result<Response, ApiError> {
    let (mut session, config, _owner) = open_session(&state, &headers).await?;

    match state
        .orchestrator
        .sign_url(&mut session, &bucket, &key, req.expires_in, &config.jwt_secret, req.transformations)
        .await
    {
        Ok(url) => {
            state.broker.dispose(session).await?;
            Ok(Json(serde_json::json!({ "signedURL": url })).into_response())
        }
        Err(err) => {
            let _ = state.broker.abort(session).await;
            Err(err.into())
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SignBatchRequest {
    #[serde(rename = "expiresIn")]
    expires_in: i64,
    paths: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SignedPath {
    path: String,
    #[serde(rename = "signedURL", skip_serializing_if = "Option::is_none")]
    signed_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tracing::instrument(skip(state, headers))]
pub async fn sign_batch(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SignBatchRequest>,
) -> Result<Response, ApiError> {
    let (mut session, config, _owner) = open_session(&state, &headers).await?;

    let mut results = Vec::with_capacity(req.paths.len());
    for path in &req.paths {
        match state
            .orchestrator
            .sign_url(&mut session, &bucket, path, req.expires_in, &config.jwt_secret, None)
            .await
        {
            Ok(url) => results.push(SignedPath { path: path.clone(), signed_url: Some(url), error: None }),
            Err(err) => results.push(SignedPath { path: path.clone(), signed_url: None, error: Some(err.to_string()) }),
        }
    }

    state.broker.dispose(session).await?;
    Ok(Json(results).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CopyMoveRequest {
    #[serde(rename = "bucketId")]
    bucket_id: String,
    #[serde(rename = "sourceKey")]
    source_key: String,
    #[serde(rename = "destinationKey")]
    destination_key: String,
}

#[tracing::instrument(skip(state, headers))]
pub async fn copy_object(State(state): State<AppState>, headers: HeaderMap, Json(req): Json<CopyMoveRequest>) -> Result<Response, ApiError> {
    let (mut session, _config, owner) = open_session(&state, &headers).await?;

    match state
        .orchestrator
        .copy_object(&mut session, &req.bucket_id, &req.source_key, &req.destination_key, owner.as_deref())
        .await
    {
        Ok(object) => {
            state.broker.dispose(session).await?;
            Ok(Json(serde_json::json!({ "Key": format!("{}/{}", req.bucket_id, object.name) })).into_response())
        }
        Err(err) => {
            let _ = state.broker.abort(session).await;
            Err(err.into())
        }
    }
}

#[tracing::instrument(skip(state, headers))]
pub async fn move_object(State(state): State<AppState>, headers: HeaderMap, Json(req): Json<CopyMoveRequest>) -> Result<Response, ApiError> {
    let (mut session, _config, _owner) = open_session(&state, &headers).await?;

    match state.orchestrator.move_object(&mut session, &req.bucket_id, &req.source_key, &req.destination_key).await {
        Ok(()) => {
            state.broker.dispose(session).await?;
            Ok(Json(serde_json::json!({ "message": "Successfully moved" })).into_response())
        }
        Err(err) => {
            let _ = state.broker.abort(session).await;
            Err(err.into())
        }
    }
}

#[tracing::instrument(skip(state, headers))]
pub async fn delete_object(State(state): State<AppState>, Path((bucket, key)): Path<(String, String)>, headers: HeaderMap) -> Result<Response, ApiError> {
    let (mut session, _config, _owner) = open_session(&state, &headers).await?;

    match state.orchestrator.delete_object(&mut session, &bucket, &key).await {
        Ok(()) => {
            state.broker.dispose(session).await?;
            Ok(StatusCode::OK.into_response())
        }
        Err(err) => {
            let _ = state.broker.abort(session).await;
            Err(err.into())
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeleteManyRequest {
    prefixes: Vec<String>,
}

#[tracing::instrument(skip(state, headers))]
pub async fn delete_many(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    headers: HeaderMap,
    Json(req): Json<DeleteManyRequest>,
) -> Result<Response, ApiError> {
    let (mut session, _config, _owner) = open_session(&state, &headers).await?;

    let mut deleted = Vec::new();
    for name in &req.prefixes {
        if state.orchestrator.delete_object(&mut session, &bucket, name).await.is_ok() {
            deleted.push(name.clone());
        }
    }

    state.broker.dispose(session).await?;
    Ok(Json(serde_json::json!({ "message": format!("Successfully deleted {} objects", deleted.len()) })).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ListRequest {
    #[serde(default)]
    prefix: String,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    search: Option<String>,
}

fn default_limit() -> i64 {
    100
}

#[tracing::instrument(skip(state, headers))]
pub async fn list_objects(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ListRequest>,
) -> Result<Response, ApiError> {
    let (mut session, _config, _owner) = open_session(&state, &headers).await?;

    let page = match metadata::list_objects(&mut session.tx, &bucket, &req.prefix, req.limit, None).await {
        Ok(page) => page,
        Err(err) => {
            let _ = state.broker.abort(session).await;
            return Err(err.into());
        }
    };
    state.broker.dispose(session).await?;

    let objects: Vec<_> = page
        .objects
        .into_iter()
        .filter(|o| match req.search.as_deref() {
            Some(s) => o.name.contains(s),
            None => true,
        })
        .map(|o| {
            serde_json::json!({
                "name": o.name,
                "id": o.id,
                "updated_at": o.updated_at,
                "created_at": o.created_at,
                "metadata": o.metadata,
            })
        })
        .collect();

    Ok(Json(objects).into_response())
}

#[tracing::instrument(skip(state, headers))]
pub async fn head_authenticated(State(state): State<AppState>, Path((bucket, key)): Path<(String, String)>, headers: HeaderMap) -> Result<Response, ApiError> {
    head_object(state, bucket, key, headers).await
}

#[tracing::instrument(skip(state, headers))]
pub async fn head_public(State(state): State<AppState>, Path((bucket, key)): Path<(String, String)>, headers: HeaderMap) -> Result<Response, ApiError> {
    head_object(state, bucket, key, headers).await
}

async fn head_object(state: AppState, bucket: String, key: String, headers: HeaderMap) -> Result<Response, ApiError> {
    let (mut session, _config, _owner) = open_session(&state, &headers).await?;
    let conditions = GetConditions::default();

    match state.orchestrator.read_object(&mut session, &bucket, &key, conditions).await {
        Ok(GetOutcome::Body(object)) => {
            state.broker.dispose(session).await?;
            Ok(Response::builder()
                .header(axum::http::header::CONTENT_TYPE, object.metadata.content_type)
                .header(axum::http::header::CONTENT_LENGTH, object.metadata.size)
                .header(axum::http::header::ETAG, format!("\"{}\"", object.metadata.etag))
                .body(Body::empty())
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
        }
        Ok(GetOutcome::NotModified) => {
            state.broker.dispose(session).await?;
            Ok(StatusCode::NOT_MODIFIED.into_response())
        }
        Err(err) => {
            let _ = state.broker.abort(session).await;
            Err(err.into())
        }
    }
}

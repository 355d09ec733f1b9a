//! Metadata Store (spec.md §4.D).
//!
//! Typed operations bound to a [`crate::db::broker::Session`]'s transaction.
//! Every function takes the transaction directly rather than wrapping it in
//! a stateful object, since the broker already owns the transaction's
//! lifetime for the duration of one request.

use chrono::Utc;
use serde_json::Value;
use sqlx::{Postgres, Row, Transaction};
use ulid::Ulid;

use crate::db::models::{Bucket, Job, JobState, Object, ObjectMetadata, ObjectPage, ObjectState};
use crate::error::{GatewayError, Result};

type Tx<'a> = Transaction<'a, Postgres>;

fn new_version() -> String {
    Ulid::new().to_string()
}

#[tracing::instrument(skip(tx))]
pub async fn create_bucket(
    tx: &mut Tx<'_>,
    id: &str,
    name: &str,
    owner: Option<&str>,
    public: bool,
    file_size_limit: Option<i64>,
) -> Result<Bucket> {
    let row = sqlx::query(
        "INSERT INTO buckets (id, name, owner, public, file_size_limit, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, now(), now()) \
         RETURNING id, name, owner, public, file_size_limit, created_at, updated_at",
    )
    .bind(id)
    .bind(name)
    .bind(owner)
    .bind(public)
    .bind(file_size_limit)
    .fetch_one(&mut **tx)
    .await?;

    row_to_bucket(row)
}

#[tracing::instrument(skip(tx))]
pub async fn get_bucket(tx: &mut Tx<'_>, id: &str) -> Result<Bucket> {
    let row = sqlx::query(
        "SELECT id, name, owner, public, file_size_limit, created_at, updated_at FROM buckets WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(GatewayError::NotFound)?;

    row_to_bucket(row)
}

#[tracing::instrument(skip(tx))]
pub async fn list_buckets(tx: &mut Tx<'_>, owner: Option<&str>) -> Result<Vec<Bucket>> {
    let rows = sqlx::query(
        "SELECT id, name, owner, public, file_size_limit, created_at, updated_at FROM buckets \
         WHERE $1::text IS NULL OR owner = $1 ORDER BY name",
    )
    .bind(owner)
    .fetch_all(&mut **tx)
    .await?;

    rows.into_iter().map(row_to_bucket).collect()
}

#[tracing::instrument(skip(tx))]
pub async fn update_bucket(tx: &mut Tx<'_>, id: &str, public: Option<bool>, file_size_limit: Option<i64>) -> Result<Bucket> {
    let row = sqlx::query(
        "UPDATE buckets SET public = COALESCE($2, public), \
         file_size_limit = COALESCE($3, file_size_limit), updated_at = now() \
         WHERE id = $1 \
         RETURNING id, name, owner, public, file_size_limit, created_at, updated_at",
    )
    .bind(id)
    .bind(public)
    .bind(file_size_limit)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(GatewayError::NotFound)?;

    row_to_bucket(row)
}

/// Deletes a bucket iff no object row references it (spec.md §3).
#[tracing::instrument(skip(tx))]
pub async fn delete_bucket_if_empty(tx: &mut Tx<'_>, id: &str) -> Result<()> {
    let remaining: i64 = sqlx::query("SELECT count(*) AS c FROM objects WHERE bucket_id = $1")
        .bind(id)
        .fetch_one(&mut **tx)
        .await?
        .try_get("c")?;

    if remaining > 0 {
        return Err(GatewayError::Conflict("bucket is not empty".into()));
    }

    let result = sqlx::query("DELETE FROM buckets WHERE id = $1").bind(id).execute(&mut **tx).await?;
    if result.rows_affected() == 0 {
        return Err(GatewayError::NotFound);
    }
    Ok(())
}

/// Inserts a pending object row with a freshly generated version token.
/// Fails with `Conflict` on a unique-constraint violation unless `upsert`.
#[tracing::instrument(skip(tx))]
pub async fn insert_pending_object(
    tx: &mut Tx<'_>,
    bucket_id: &str,
    name: &str,
    owner: Option<&str>,
) -> Result<(String, String)> {
    let object_id = uuid::Uuid::new_v4().to_string();
    let version = new_version();

    sqlx::query(
        "INSERT INTO objects (id, bucket_id, name, owner, version, state, metadata, user_metadata, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, 'pending', '{}'::jsonb, '{}'::jsonb, now(), now())",
    )
    .bind(&object_id)
    .bind(bucket_id)
    .bind(name)
    .bind(owner)
    .bind(&version)
    .execute(&mut **tx)
    .await?;

    add_prefixes(tx, bucket_id, name).await?;

    Ok((object_id, version))
}

/// Finalizes a pending object row with upload metadata, marking it live.
/// Looked up by `version` (a ULID) rather than `id`, since both
/// [`insert_pending_object`] and [`replace_object_version`] hand callers a
/// version token but not always the row id.
#[tracing::instrument(skip(tx, metadata))]
pub async fn finalize_object(tx: &mut Tx<'_>, version: &str, metadata: ObjectMetadata) -> Result<()> {
    let metadata_json = serde_json::to_value(&metadata)
        .map_err(|e| GatewayError::Internal(format!("failed to serialize object metadata: {e}")))?;

    let result = sqlx::query("UPDATE objects SET state = 'live', metadata = $2, updated_at = now() WHERE version = $1")
        .bind(version)
        .bind(metadata_json)
        .execute(&mut **tx)
        .await?;

    if result.rows_affected() == 0 {
        return Err(GatewayError::NotFound);
    }
    Ok(())
}

/// Atomically replaces the current version of `(bucket, name)`, returning
/// `(new_version, previous_version)`. Used by upsert and update paths.
#[tracing::instrument(skip(tx))]
pub async fn replace_object_version(
    tx: &mut Tx<'_>,
    bucket_id: &str,
    name: &str,
    owner: Option<&str>,
) -> Result<(String, Option<String>)> {
    let previous: Option<String> = sqlx::query("SELECT version FROM objects WHERE bucket_id = $1 AND name = $2 AND state = 'live'")
        .bind(bucket_id)
        .bind(name)
        .fetch_optional(&mut **tx)
        .await?
        .map(|r| r.try_get("version"))
        .transpose()?;

    let new_version = new_version();

    sqlx::query(
        "INSERT INTO objects (id, bucket_id, name, owner, version, state, metadata, user_metadata, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, 'pending', '{}'::jsonb, '{}'::jsonb, now(), now()) \
         ON CONFLICT (bucket_id, name) WHERE state = 'live' DO UPDATE SET \
            version = EXCLUDED.version, state = 'pending', updated_at = now()",
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(bucket_id)
    .bind(name)
    .bind(owner)
    .bind(&new_version)
    .execute(&mut **tx)
    .await?;

    add_prefixes(tx, bucket_id, name).await?;

    Ok((new_version, previous))
}

/// Deletes the current-version row, returning it for blob GC.
#[tracing::instrument(skip(tx))]
pub async fn delete_object(tx: &mut Tx<'_>, bucket_id: &str, name: &str) -> Result<Object> {
    let row = sqlx::query(
        "DELETE FROM objects WHERE bucket_id = $1 AND name = $2 AND state = 'live' \
         RETURNING id, bucket_id, name, owner, version, state, metadata, user_metadata, created_at, updated_at",
    )
    .bind(bucket_id)
    .bind(name)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(GatewayError::NotFound)?;

    let object = row_to_object(row)?;
    delete_leaf_prefixes(tx, bucket_id, &[name.to_owned()]).await?;
    Ok(object)
}

/// Atomically renames an object, updating ancestor prefixes.
#[tracing::instrument(skip(tx))]
pub async fn rename_object(tx: &mut Tx<'_>, bucket_id: &str, old_name: &str, new_name: &str) -> Result<()> {
    let result = sqlx::query("UPDATE objects SET name = $3, updated_at = now() WHERE bucket_id = $1 AND name = $2 AND state = 'live'")
        .bind(bucket_id)
        .bind(old_name)
        .bind(new_name)
        .execute(&mut **tx)
        .await?;

    if result.rows_affected() == 0 {
        return Err(GatewayError::NotFound);
    }

    add_prefixes(tx, bucket_id, new_name).await?;
    delete_leaf_prefixes(tx, bucket_id, &[old_name.to_owned()]).await?;
    Ok(())
}

/// Cursor-paginated object listing ordered by `(name, version)`.
#[tracing::instrument(skip(tx))]
pub async fn list_objects(
    tx: &mut Tx<'_>,
    bucket_id: &str,
    prefix: &str,
    limit: i64,
    cursor: Option<(String, String)>,
) -> Result<ObjectPage> {
    let (cursor_name, cursor_version) = cursor.unwrap_or_default();

    let rows = sqlx::query(
        "SELECT id, bucket_id, name, owner, version, state, metadata, user_metadata, created_at, updated_at \
         FROM objects \
         WHERE bucket_id = $1 AND state = 'live' AND name LIKE $2 \
           AND (name, version) > ($3, $4) \
         ORDER BY name, version \
         LIMIT $5",
    )
    .bind(bucket_id)
    .bind(format!("{prefix}%"))
    .bind(&cursor_name)
    .bind(&cursor_version)
    .bind(limit)
    .fetch_all(&mut **tx)
    .await?;

    let objects = rows.into_iter().map(row_to_object).collect::<Result<Vec<_>>>()?;
    let cursor = objects.last().map(|o| (o.name.clone(), o.version.clone()));

    Ok(ObjectPage {
        objects,
        common_prefixes: Vec::new(),
        cursor,
    })
}

/// Batched version-existence check used by the orphan scanner (spec.md §4.I).
#[tracing::instrument(skip(tx, pairs))]
pub async fn find_object_versions(tx: &mut Tx<'_>, bucket_id: &str, pairs: &[(String, String)]) -> Result<Vec<(String, String)>> {
    if pairs.is_empty() {
        return Ok(Vec::new());
    }

    let names: Vec<&str> = pairs.iter().map(|(n, _)| n.as_str()).collect();
    let versions: Vec<&str> = pairs.iter().map(|(_, v)| v.as_str()).collect();

    let rows = sqlx::query(
        "SELECT name, version FROM objects WHERE bucket_id = $1 \
         AND (name, version) IN (SELECT * FROM unnest($2::text[], $3::text[]))",
    )
    .bind(bucket_id)
    .bind(&names[..])
    .bind(&versions[..])
    .fetch_all(&mut **tx)
    .await?;

    rows.into_iter()
        .map(|r| Ok((r.try_get("name")?, r.try_get("version")?)))
        .collect()
}

#[tracing::instrument(skip(tx, pairs))]
pub async fn delete_object_versions(tx: &mut Tx<'_>, bucket_id: &str, pairs: &[(String, String)]) -> Result<()> {
    for (name, version) in pairs {
        sqlx::query("DELETE FROM objects WHERE bucket_id = $1 AND name = $2 AND version = $3")
            .bind(bucket_id)
            .bind(name)
            .bind(version)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

/// Inserts ancestor prefixes for `a/b/c/file` at levels 1..3, idempotently.
#[tracing::instrument(skip(tx))]
pub async fn add_prefixes(tx: &mut Tx<'_>, bucket_id: &str, name: &str) -> Result<()> {
    let segments: Vec<&str> = name.split('/').collect();
    if segments.len() <= 1 {
        return Ok(());
    }

    let mut acc = String::new();
    for (level, segment) in segments[..segments.len() - 1].iter().enumerate() {
        if !acc.is_empty() {
            acc.push('/');
        }
        acc.push_str(segment);

        sqlx::query(
            "INSERT INTO prefixes (bucket_id, name, level) VALUES ($1, $2, $3) \
             ON CONFLICT (bucket_id, name) DO NOTHING",
        )
        .bind(bucket_id)
        .bind(&acc)
        .bind((level + 1) as i32)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

/// Deletes ancestor prefixes of `names` that have no remaining direct
/// children (objects or sub-prefixes). Never walks the subtree.
#[tracing::instrument(skip(tx, names))]
pub async fn delete_leaf_prefixes(tx: &mut Tx<'_>, bucket_id: &str, names: &[String]) -> Result<()> {
    for name in names {
        let Some(parent) = name.rsplit_once('/').map(|(p, _)| p.to_owned()) else {
            continue;
        };

        let has_object_children: bool = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM objects WHERE bucket_id = $1 AND state = 'live' AND name LIKE $2) AS e",
        )
        .bind(bucket_id)
        .bind(format!("{parent}/%"))
        .fetch_one(&mut **tx)
        .await?
        .try_get("e")?;

        let has_prefix_children: bool = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM prefixes WHERE bucket_id = $1 AND name LIKE $2 AND name <> $2) AS e",
        )
        .bind(bucket_id)
        .bind(format!("{parent}/%"))
        .fetch_one(&mut **tx)
        .await?
        .try_get("e")?;

        if !has_object_children && !has_prefix_children {
            sqlx::query("DELETE FROM prefixes WHERE bucket_id = $1 AND name = $2")
                .bind(bucket_id)
                .bind(&parent)
                .execute(&mut **tx)
                .await?;
        }
    }
    Ok(())
}

fn row_to_bucket(row: sqlx::postgres::PgRow) -> Result<Bucket> {
    Ok(Bucket {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        owner: row.try_get("owner")?,
        public: row.try_get("public")?,
        file_size_limit: row.try_get("file_size_limit")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_object(row: sqlx::postgres::PgRow) -> Result<Object> {
    let state_str: String = row.try_get("state")?;
    let state = match state_str.as_str() {
        "live" => ObjectState::Live,
        _ => ObjectState::Pending,
    };

    let metadata_json: Value = row.try_get("metadata")?;
    let metadata = serde_json::from_value(metadata_json).unwrap_or_default();

    Ok(Object {
        id: row.try_get("id")?,
        bucket_id: row.try_get("bucket_id")?,
        name: row.try_get("name")?,
        owner: row.try_get("owner")?,
        version: row.try_get("version")?,
        state,
        metadata,
        user_metadata: row.try_get("user_metadata")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// A job-table row shaped query, used by [`crate::queue`] (spec.md §4.G).
#[tracing::instrument(skip(tx))]
pub async fn insert_job(
    tx: &mut Tx<'_>,
    queue_name: &str,
    payload: &Value,
    start_after: chrono::DateTime<Utc>,
    retry_limit: i32,
    singleton_key: Option<&str>,
) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO jobs (id, queue_name, payload, created_at, start_after, retry_count, retry_limit, state, singleton_key) \
         VALUES ($1, $2, $3, now(), $4, 0, $5, 'created', $6) \
         ON CONFLICT (queue_name, singleton_key) WHERE singleton_key IS NOT NULL AND state NOT IN ('completed', 'expired', 'cancelled', 'failed') \
         DO NOTHING",
    )
    .bind(&id)
    .bind(queue_name)
    .bind(payload)
    .bind(start_after)
    .bind(retry_limit)
    .bind(singleton_key)
    .execute(&mut **tx)
    .await?;

    Ok(id)
}

pub fn job_state_from_row(state: &str) -> JobState {
    match state {
        "retry" => JobState::Retry,
        "active" => JobState::Active,
        "completed" => JobState::Completed,
        "expired" => JobState::Expired,
        "cancelled" => JobState::Cancelled,
        "failed" => JobState::Failed,
        _ => JobState::Created,
    }
}

pub fn row_to_job(row: sqlx::postgres::PgRow) -> Result<Job> {
    let state_str: String = row.try_get("state")?;
    Ok(Job {
        id: row.try_get("id")?,
        queue_name: row.try_get("queue_name")?,
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
        start_after: row.try_get("start_after")?,
        retry_count: row.try_get("retry_count")?,
        retry_limit: row.try_get("retry_limit")?,
        state: job_state_from_row(&state_str),
        singleton_key: row.try_get("singleton_key")?,
    })
}

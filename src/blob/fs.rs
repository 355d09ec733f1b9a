//! Local filesystem blob backend (spec.md §4.E).
//!
//! Maps `bucket/key` to a directory hierarchy under a configured root.
//! Uploads are written to a sibling temp file and atomically renamed into
//! place on completion, so partial writes are never visible to readers.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;
use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;

use crate::blob::{BlobBackend, BlobMetadata, BlobObject, GetConditions, GetOutcome, ListOptions, ListOutcome, ListedKey};
use crate::error::{GatewayError, Result};

pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }

    async fn metadata_for(path: &Path) -> Result<BlobMetadata> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| map_io_error(e, "stat"))?;
        let modified = meta.modified().map_err(|e| GatewayError::Internal(e.to_string()))?;
        let last_modified: DateTime<Utc> = modified.into();

        Ok(BlobMetadata {
            size: meta.len(),
            content_type: "application/octet-stream".to_owned(),
            cache_control: "".to_owned(),
            etag: format!("{:x}", md5_digest(path).await?),
            last_modified,
        })
    }
}

async fn md5_digest(path: &Path) -> Result<[u8; 16]> {
    use md5::{Digest, Md5};
    let bytes = tokio::fs::read(path).await.map_err(|e| map_io_error(e, "read"))?;
    let mut hasher = Md5::new();
    hasher.update(&bytes);
    Ok(hasher.finalize().into())
}

fn map_io_error(err: std::io::Error, op: &'static str) -> GatewayError {
    if err.kind() == std::io::ErrorKind::NotFound {
        GatewayError::NotFound
    } else {
        crate::error::log(&err);
        GatewayError::Internal(format!("filesystem {op} failed: {err}"))
    }
}

#[async_trait]
impl BlobBackend for FileBackend {
    #[tracing::instrument(skip(self))]
    async fn get_object(&self, bucket: &str, key: &str, conditions: &GetConditions) -> Result<GetOutcome> {
        let path = self.path_for(bucket, key);
        let metadata = Self::metadata_for(&path).await?;

        if let Some(etag) = &conditions.if_none_match {
            if etag.trim_matches('"') == metadata.etag {
                return Ok(GetOutcome::NotModified);
            }
        }
        if let Some(since) = conditions.if_modified_since {
            if metadata.last_modified <= since {
                return Ok(GetOutcome::NotModified);
            }
        }

        let file = tokio::fs::File::open(&path).await.map_err(|e| map_io_error(e, "open"))?;
        let stream = tokio_util_stream(file, conditions.range);

        Ok(GetOutcome::Body(BlobObject {
            metadata,
            body: Box::pin(stream),
        }))
    }

    #[tracing::instrument(skip(self, body))]
    async fn upload_object(
        &self,
        bucket: &str,
        key: &str,
        mut body: BoxStream<'static, std::io::Result<Bytes>>,
        _content_type: &str,
        _cache_control: &str,
    ) -> Result<BlobMetadata> {
        let dest = self.path_for(bucket, key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| map_io_error(e, "mkdir"))?;
        }

        let tmp_path = dest.with_extension("tmp-upload");
        let mut tmp = tokio::fs::File::create(&tmp_path).await.map_err(|e| map_io_error(e, "create"))?;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| crate::blob::classify_stream_error(&e))?;
            tmp.write_all(&chunk).await.map_err(|e| map_io_error(e, "write"))?;
        }
        tmp.flush().await.map_err(|e| map_io_error(e, "flush"))?;
        drop(tmp);

        tokio::fs::rename(&tmp_path, &dest).await.map_err(|e| map_io_error(e, "rename"))?;

        Self::metadata_for(&dest).await
    }

    #[tracing::instrument(skip(self))]
    async fn copy_object(&self, bucket: &str, src_key: &str, dst_key: &str) -> Result<BlobMetadata> {
        let src = self.path_for(bucket, src_key);
        let dst = self.path_for(bucket, dst_key);
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| map_io_error(e, "mkdir"))?;
        }
        tokio::fs::copy(&src, &dst).await.map_err(|e| map_io_error(e, "copy"))?;
        Self::metadata_for(&dst).await
    }

    #[tracing::instrument(skip(self))]
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let path = self.path_for(bucket, key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io_error(e, "remove")),
        }
    }

    #[tracing::instrument(skip(self, keys))]
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<()> {
        for key in keys {
            self.delete_object(bucket, key).await?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn head_object(&self, bucket: &str, key: &str) -> Result<BlobMetadata> {
        Self::metadata_for(&self.path_for(bucket, key)).await
    }

    #[tracing::instrument(skip(self))]
    async fn list(&self, bucket: &str, options: ListOptions) -> Result<ListOutcome> {
        let base = self.root.join(bucket);
        let mut keys = Vec::new();
        let mut stack = vec![base.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(map_io_error(e, "readdir")),
            };

            while let Some(entry) = entries.next_entry().await.map_err(|e| map_io_error(e, "readdir"))? {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }

                let rel = path.strip_prefix(&base).unwrap_or(&path).to_string_lossy().replace('\\', "/");
                if rel.ends_with(".info") || !rel.starts_with(&options.prefix) {
                    continue;
                }

                let meta = Self::metadata_for(&path).await?;
                keys.push(ListedKey {
                    name: rel,
                    size: meta.size,
                    last_modified: meta.last_modified,
                });
            }
        }

        keys.truncate(1000);
        Ok(ListOutcome { keys, next_token: None })
    }

    #[tracing::instrument(skip(self))]
    async fn update_object_info_metadata(&self, bucket: &str, key: &str) -> Result<()> {
        let info_path = self.path_for(bucket, &format!("{key}.info"));
        match tokio::fs::metadata(&info_path).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io_error(e, "stat")),
        }
    }
}

fn tokio_util_stream(
    file: tokio::fs::File,
    range: Option<(u64, Option<u64>)>,
) -> impl futures_core::Stream<Item = std::io::Result<Bytes>> {
    use tokio::io::AsyncSeekExt;

    async_stream::stream! {
        let mut file = file;
        if let Some((start, _end)) = range {
            if let Err(e) = file.seek(std::io::SeekFrom::Start(start)).await {
                yield Err(e);
                return;
            }
        }

        let mut buf = vec![0u8; 64 * 1024];
        loop {
            use tokio::io::AsyncReadExt;
            match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => yield Ok(Bytes::copy_from_slice(&buf[..n])),
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    }
}

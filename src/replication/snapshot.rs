//! Durable homes for task store snapshots.

use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::backends::BackendError;
use crate::config::S3Config;
use crate::forward::Forwarder;
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("snapshot backend failed: {0}")]
    Backend(#[from] BackendError),

    #[error("snapshot store answered {status} for '{key}'")]
    Rejected { key: String, status: StatusCode },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type SnapshotFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, SnapshotError>> + Send + 'a>>;

/// Key/value object storage for snapshot documents.
pub trait SnapshotStore: Send + Sync {
    fn head<'a>(&'a self, key: &'a str) -> SnapshotFuture<'a, bool>;

    /// `None` when the key does not exist.
    fn get<'a>(&'a self, key: &'a str) -> SnapshotFuture<'a, Option<Bytes>>;

    fn put<'a>(&'a self, key: &'a str, body: Bytes) -> SnapshotFuture<'a, ()>;
}

// ── Local directory ─────────────────────────────────────────────────

/// Snapshots as files under a root directory.
///
/// Writes go to `.tmp/` first, are fsynced, then renamed into place, so a
/// crash never leaves a half-written snapshot behind.
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        let root = root.into();
        std::fs::create_dir_all(root.join(".tmp"))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, SnapshotError> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(anyhow::anyhow!("invalid snapshot key '{key}'").into());
        }
        Ok(self.root.join(relative))
    }

    fn temp_path(&self) -> PathBuf {
        self.root
            .join(".tmp")
            .join(format!("tmp-{}", uuid::Uuid::new_v4()))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn head<'a>(&'a self, key: &'a str) -> SnapshotFuture<'a, bool> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            Ok(tokio::fs::try_exists(&path).await?)
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> SnapshotFuture<'a, Option<Bytes>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            match tokio::fs::read(&path).await {
                Ok(data) => Ok(Some(Bytes::from(data))),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn put<'a>(&'a self, key: &'a str, body: Bytes) -> SnapshotFuture<'a, ()> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let tmp_path = self.temp_path();
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(&body).await?;
            file.sync_all().await?;
            drop(file);

            if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(e.into());
            }
            Ok(())
        })
    }
}

// ── Remote S3 ───────────────────────────────────────────────────────

/// Snapshots as objects in an S3 bucket, signed and retried like every
/// other backend call.
pub struct S3SnapshotStore {
    forwarder: Forwarder,
    config: S3Config,
}

impl S3SnapshotStore {
    /// `config` addresses the endpoint; `bucket` overrides its bucket.
    pub fn new(forwarder: Forwarder, mut config: S3Config, bucket: &str) -> Self {
        config.bucket = bucket.to_string();
        Self { forwarder, config }
    }

    async fn call(
        &self,
        method: Method,
        key: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<(StatusCode, Bytes), SnapshotError> {
        let resp = self
            .forwarder
            .forward_s3(
                &self.config,
                method,
                Some(key),
                &[],
                &headers,
                body,
                RetryPolicy::FORWARD,
            )
            .await?;
        Ok((resp.status, resp.body))
    }
}

impl SnapshotStore for S3SnapshotStore {
    fn head<'a>(&'a self, key: &'a str) -> SnapshotFuture<'a, bool> {
        Box::pin(async move {
            match self.call(Method::HEAD, key, HeaderMap::new(), Bytes::new()).await? {
                (status, _) if status.is_success() => Ok(true),
                (StatusCode::NOT_FOUND, _) => Ok(false),
                (status, _) => Err(SnapshotError::Rejected {
                    key: key.to_string(),
                    status,
                }),
            }
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> SnapshotFuture<'a, Option<Bytes>> {
        Box::pin(async move {
            match self.call(Method::GET, key, HeaderMap::new(), Bytes::new()).await? {
                (status, body) if status.is_success() => Ok(Some(body)),
                (StatusCode::NOT_FOUND, _) => Ok(None),
                (status, _) => Err(SnapshotError::Rejected {
                    key: key.to_string(),
                    status,
                }),
            }
        })
    }

    fn put<'a>(&'a self, key: &'a str, body: Bytes) -> SnapshotFuture<'a, ()> {
        Box::pin(async move {
            let mut headers = HeaderMap::new();
            headers.insert("content-type", HeaderValue::from_static("application/json"));
            match self.call(Method::PUT, key, headers, body).await? {
                (status, _) if status.is_success() => Ok(()),
                (status, _) => Err(SnapshotError::Rejected {
                    key: key.to_string(),
                    status,
                }),
            }
        })
    }
}

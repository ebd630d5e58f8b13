//! File uploads: bytes on disk plus a `FileUpload` record per file.
//!
//! Files land under `<uploads_dir>/YYYY/MM/<name>` and are served from
//! `/<api_prefix>/uploads/YYYY/MM/<name>`. A name that is already taken
//! for that month gets a unix-seconds prefix.
//!
//! The byte store sits behind [`UploadStore`] so the record bookkeeping in
//! [`Storage`] doesn't care where files live.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};

use content_engine_core::entity::downcast;
use content_engine_core::slug::normalize_filename;
use content_engine_core::target::Target;
use content_engine_core::upload::{FileUpload, FILE_UPLOAD_TYPE};

use crate::config::UploadsConfig;
use crate::error::{EngineError, Result};
use crate::repository::Repository;

// ═══════════════════════════════════════════════════════════════════════
// Byte store
// ═══════════════════════════════════════════════════════════════════════

/// Where upload bytes are kept. Paths are relative, `/`-separated.
#[async_trait]
pub trait UploadStore: Send + Sync {
    async fn exists(&self, rel: &Path) -> Result<bool>;
    async fn write(&self, rel: &Path, bytes: &[u8]) -> Result<()>;
    /// Returns `false` when nothing was there.
    async fn remove(&self, rel: &Path) -> Result<bool>;
}

/// Files on the local filesystem under one root directory.
pub struct LocalDiskStore {
    root: PathBuf,
}

impl LocalDiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, rel: &Path) -> Result<PathBuf> {
        let safe = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(EngineError::InvalidInput(format!(
                "upload path '{}' is not allowed",
                rel.display()
            )));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl UploadStore for LocalDiskStore {
    async fn exists(&self, rel: &Path) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.resolve(rel)?).await?)
    }

    async fn write(&self, rel: &Path, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn remove(&self, rel: &Path) -> Result<bool> {
        match tokio::fs::remove_file(self.resolve(rel)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Storage
// ═══════════════════════════════════════════════════════════════════════

/// Upload service. Cheap to clone.
#[derive(Clone)]
pub struct Storage {
    repo: Repository,
    store: Arc<dyn UploadStore>,
    api_prefix: String,
}

impl Storage {
    pub fn new(repo: Repository, store: Arc<dyn UploadStore>, api_prefix: &str) -> Self {
        Self {
            repo,
            store,
            api_prefix: api_prefix.trim_matches('/').to_string(),
        }
    }

    /// Storage on local disk, as configured.
    pub fn local(repo: Repository, config: &UploadsConfig) -> Self {
        Self::new(
            repo,
            Arc::new(LocalDiskStore::new(config.dir.clone())),
            &config.api_prefix,
        )
    }

    /// URL prefix every upload path starts with.
    pub fn url_prefix(&self) -> String {
        format!("/{}/uploads/", self.api_prefix)
    }

    /// Writes `bytes` under the month of `timestamp` and records a
    /// `FileUpload` for it.
    pub async fn store_file(
        &self,
        name: &str,
        content_type: &str,
        bytes: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Result<FileUpload> {
        let mut file_name = normalize_filename(name);
        if file_name.trim_matches('.').is_empty() {
            return Err(EngineError::InvalidInput(format!(
                "'{}' is not a usable file name",
                name
            )));
        }

        let month_dir = format!("{:04}/{:02}", timestamp.year(), timestamp.month());
        let mut rel = PathBuf::from(&month_dir).join(&file_name);
        if self.store.exists(&rel).await? {
            file_name = format!("{}-{}", timestamp.timestamp(), file_name);
            rel = PathBuf::from(&month_dir).join(&file_name);
        }
        self.store.write(&rel, bytes).await?;

        let mut upload = FileUpload {
            name: file_name.clone(),
            path: format!("{}{}/{}", self.url_prefix(), month_dir, file_name),
            content_length: bytes.len() as i64,
            content_type: content_type.to_string(),
            ..Default::default()
        };
        upload.item.timestamp = timestamp.timestamp_millis();

        if let Err(e) = self.repo.set_entity(FILE_UPLOAD_TYPE, &mut upload).await {
            if let Err(cleanup) = self.store.remove(&rel).await {
                tracing::warn!(path = %rel.display(), error = %cleanup, "orphaned upload left on disk");
            }
            return Err(e);
        }

        tracing::info!(path = %upload.path, bytes = bytes.len(), "file uploaded");
        Ok(upload)
    }

    /// Removes a `FileUpload` record and its file. A file that is already
    /// gone is logged, not an error.
    pub async fn delete_upload(&self, target: &str) -> Result<FileUpload> {
        let parsed: Target = target.parse()?;
        if parsed.bucket != FILE_UPLOAD_TYPE {
            return Err(EngineError::InvalidInput(format!(
                "{} is not a file upload",
                target
            )));
        }

        let record = self.repo.delete_entity(target).await?;
        let upload = downcast::<FileUpload>(record.as_ref())
            .cloned()
            .ok_or_else(|| EngineError::Programming("FileUpload record has the wrong type".into()))?;

        match self.relative_path(&upload.path) {
            Some(rel) => {
                if !self.store.remove(&rel).await? {
                    tracing::warn!(path = %upload.path, "upload file was already missing");
                }
            }
            None => tracing::warn!(path = %upload.path, "upload path outside the uploads prefix"),
        }
        Ok(upload)
    }

    pub async fn find_upload(&self, target: &str) -> Result<FileUpload> {
        let record = self.repo.find_one_by_target(target).await?;
        downcast::<FileUpload>(record.as_ref())
            .cloned()
            .ok_or_else(|| EngineError::InvalidInput(format!("{} is not a file upload", target)))
    }

    /// Maps a URL path back to the byte store.
    pub fn relative_path(&self, url_path: &str) -> Option<PathBuf> {
        url_path
            .strip_prefix(&self.url_prefix())
            .filter(|rest| !rest.is_empty())
            .map(PathBuf::from)
    }
}

//! Downloadable backups of the stores, uploads and search indexes.
//!
//! | Source | Archive contents |
//! |--------|------------------|
//! | `system` | `system.db`, a consistent snapshot of the content store |
//! | `analytics` | `analytics.db`, a snapshot of the analytics store |
//! | `uploads` | the uploads directory tree under `uploads/` |
//! | `search` | every `<Type>.index` directory under `search/` |
//!
//! Every backup is a gzip-compressed tarball named
//! `<source>-<unix seconds>.bak.tar.gz`. Database snapshots use
//! `VACUUM INTO`, so they are safe to take while the server is writing.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use flate2::write::GzEncoder;
use flate2::Compression;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::kv::KvStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupSource {
    System,
    Analytics,
    Uploads,
    Search,
}

impl BackupSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupSource::System => "system",
            BackupSource::Analytics => "analytics",
            BackupSource::Uploads => "uploads",
            BackupSource::Search => "search",
        }
    }

    /// Download name for a backup taken at `unix_secs`.
    pub fn file_name(&self, unix_secs: i64) -> String {
        format!("{}-{}.bak.tar.gz", self.as_str(), unix_secs)
    }
}

impl fmt::Display for BackupSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupSource {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "system" => Ok(BackupSource::System),
            "analytics" => Ok(BackupSource::Analytics),
            "uploads" => Ok(BackupSource::Uploads),
            "search" => Ok(BackupSource::Search),
            other => Err(EngineError::InvalidInput(format!(
                "unknown backup source '{}' (expected system, analytics, uploads or search)",
                other
            ))),
        }
    }
}

/// Builds backup archives. Cheap to clone.
#[derive(Clone)]
pub struct Backups {
    system: KvStore,
    analytics: KvStore,
    uploads_dir: PathBuf,
    search_dir: PathBuf,
}

impl Backups {
    pub fn new(
        system: KvStore,
        analytics: KvStore,
        uploads_dir: impl Into<PathBuf>,
        search_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            system,
            analytics,
            uploads_dir: uploads_dir.into(),
            search_dir: search_dir.into(),
        }
    }

    /// The `tar.gz` bytes for one source.
    pub async fn archive(&self, source: BackupSource) -> Result<Vec<u8>> {
        let bytes = match source {
            BackupSource::System => snapshot_archive(&self.system, "system.db").await?,
            BackupSource::Analytics => snapshot_archive(&self.analytics, "analytics.db").await?,
            BackupSource::Uploads => dir_archive(self.uploads_dir.clone(), "uploads").await?,
            BackupSource::Search => dir_archive(self.search_dir.clone(), "search").await?,
        };
        tracing::info!(source = %source, bytes = bytes.len(), "backup archived");
        Ok(bytes)
    }
}

async fn snapshot_archive(kv: &KvStore, entry: &'static str) -> Result<Vec<u8>> {
    let tmp = std::env::temp_dir().join(format!("cms-{}-{}", Uuid::new_v4().simple(), entry));
    let taken = kv.snapshot(&tmp).await;
    if let Err(e) = taken {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }

    let path = tmp.clone();
    let built = tokio::task::spawn_blocking(move || {
        tar_gz(|builder| builder.append_path_with_name(&path, entry))
    })
    .await;
    let _ = tokio::fs::remove_file(&tmp).await;
    Ok(built.map_err(io::Error::other)??)
}

async fn dir_archive(dir: PathBuf, root: &'static str) -> Result<Vec<u8>> {
    let built = tokio::task::spawn_blocking(move || {
        tar_gz(|builder| {
            if dir.is_dir() {
                builder.append_dir_all(root, &dir)
            } else {
                Ok(())
            }
        })
    })
    .await;
    Ok(built.map_err(io::Error::other)??)
}

fn tar_gz(
    fill: impl FnOnce(&mut tar::Builder<GzEncoder<Vec<u8>>>) -> io::Result<()>,
) -> io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    fill(&mut builder)?;
    builder.into_inner()?.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn entry_names(archive: &[u8]) -> io::Result<Vec<String>> {
        let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(archive));
        let mut names = Vec::new();
        for entry in tar.entries()? {
            let entry = entry?;
            names.push(entry.path()?.to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn unpack(archive: &[u8], dest: &Path) -> io::Result<()> {
        tar::Archive::new(flate2::read::GzDecoder::new(archive)).unpack(dest)
    }

    async fn backups(tmp: &TempDir) -> Backups {
        let system = KvStore::open(&tmp.path().join("data/system.db")).await.unwrap();
        let mut txn = system.begin_write().await.unwrap();
        txn.create_bucket_if_not_exists("Review").await.unwrap();
        txn.put("Review", b"1", br#"{"title":"kept"}"#).await.unwrap();
        txn.commit().await.unwrap();

        let analytics = KvStore::open(&tmp.path().join("data/analytics.db"))
            .await
            .unwrap();
        Backups::new(
            system,
            analytics,
            tmp.path().join("data/uploads"),
            tmp.path().join("data/search"),
        )
    }

    #[test]
    fn test_source_parsing() {
        assert_eq!("uploads".parse::<BackupSource>().unwrap(), BackupSource::Uploads);
        let err = "everything".parse::<BackupSource>().unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        assert_eq!(
            BackupSource::Search.file_name(1_700_000_000),
            "search-1700000000.bak.tar.gz"
        );
    }

    #[tokio::test]
    async fn test_system_snapshot_restores() {
        let tmp = TempDir::new().unwrap();
        let backups = backups(&tmp).await;

        let archive = backups.archive(BackupSource::System).await.unwrap();
        assert_eq!(entry_names(&archive).unwrap(), vec!["system.db"]);

        let restore = tmp.path().join("restore");
        unpack(&archive, &restore).unwrap();
        let restored = KvStore::open(&restore.join("system.db")).await.unwrap();
        let mut txn = restored.begin_read().await.unwrap();
        assert_eq!(
            txn.get("Review", b"1").await.unwrap(),
            Some(br#"{"title":"kept"}"#.to_vec())
        );
    }

    #[tokio::test]
    async fn test_directory_archive_keeps_tree() {
        let tmp = TempDir::new().unwrap();
        let backups = backups(&tmp).await;
        let month = tmp.path().join("data/uploads/2024/05");
        std::fs::create_dir_all(&month).unwrap();
        std::fs::write(month.join("cover.png"), b"png").unwrap();

        let archive = backups.archive(BackupSource::Uploads).await.unwrap();
        let names = entry_names(&archive).unwrap();
        assert!(names.iter().any(|n| n == "uploads/2024/05/cover.png"), "{:?}", names);

        let restore = tmp.path().join("restore");
        unpack(&archive, &restore).unwrap();
        assert_eq!(
            std::fs::read(restore.join("uploads/2024/05/cover.png")).unwrap(),
            b"png"
        );
    }

    #[tokio::test]
    async fn test_missing_directory_gives_empty_archive() {
        let tmp = TempDir::new().unwrap();
        let backups = backups(&tmp).await;
        let archive = backups.archive(BackupSource::Search).await.unwrap();
        assert!(entry_names(&archive).unwrap().is_empty());
    }
}

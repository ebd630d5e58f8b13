//! Embedded, ordered key-value store organized into named buckets.
//!
//! Backed by a single SQLite file (WAL mode) holding two tables:
//!
//! ```text
//! buckets(name TEXT PRIMARY KEY, sequence INTEGER)
//! entries(bucket TEXT, key BLOB, value BLOB, PRIMARY KEY (bucket, key))
//! ```
//!
//! Keys compare as raw bytes, so iteration order matches the byte order of
//! the keys. Each bucket carries a monotonic sequence used to allocate ids.
//!
//! # Transactions
//!
//! [`KvStore::begin_read`] opens a snapshot that may run alongside other
//! readers. [`KvStore::begin_write`] additionally takes the process-wide
//! writer lock, so at most one write transaction is open at a time.
//! Dropping a [`Txn`] without calling [`Txn::commit`] rolls it back.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("write attempted in a read-only transaction")]
    ReadOnly,

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

type Pair = (Vec<u8>, Vec<u8>);

/// Handle to one store file. Cheap to clone.
#[derive(Clone)]
pub struct KvStore {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
    path: PathBuf,
}

impl KvStore {
    /// Opens (creating if needed) the store at `path`.
    pub async fn open(path: &Path) -> Result<Self, KvError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS buckets (
                name TEXT PRIMARY KEY,
                sequence INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                bucket TEXT NOT NULL,
                key BLOB NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (bucket, key)
            ) WITHOUT ROWID
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            writer: Arc::new(Mutex::new(())),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn begin_read(&self) -> Result<Txn, KvError> {
        let tx = self.pool.begin().await?;
        Ok(Txn {
            tx,
            writable: false,
            _writer: None,
        })
    }

    pub async fn begin_write(&self) -> Result<Txn, KvError> {
        let guard = self.writer.clone().lock_owned().await;
        let tx = self.pool.begin().await?;
        Ok(Txn {
            tx,
            writable: true,
            _writer: Some(guard),
        })
    }

    /// Creates each bucket that doesn't exist yet, in one write transaction.
    pub async fn ensure_buckets(&self, names: &[&str]) -> Result<(), KvError> {
        let mut txn = self.begin_write().await?;
        for name in names {
            txn.create_bucket_if_not_exists(name).await?;
        }
        txn.commit().await
    }

    /// Writes a consistent copy of the database to `dest`, which must not
    /// exist yet.
    pub async fn snapshot(&self, dest: &Path) -> Result<(), KvError> {
        sqlx::query("VACUUM INTO ?")
            .bind(dest.to_string_lossy().into_owned())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// A read or read-write transaction.
pub struct Txn {
    tx: Transaction<'static, Sqlite>,
    writable: bool,
    // Dropped after `tx`, so the writer lock outlives the rollback.
    _writer: Option<OwnedMutexGuard<()>>,
}

impl Txn {
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub async fn commit(self) -> Result<(), KvError> {
        self.tx.commit().await?;
        Ok(())
    }

    /// Commits, then runs `publish` before the writer lock is released.
    /// In-memory copies of committed state are installed in commit order.
    pub async fn commit_and<T>(self, publish: impl FnOnce() -> T) -> Result<T, KvError> {
        let Txn { tx, _writer, .. } = self;
        tx.commit().await?;
        let out = publish();
        drop(_writer);
        Ok(out)
    }

    pub async fn rollback(self) -> Result<(), KvError> {
        self.tx.rollback().await?;
        Ok(())
    }

    fn ensure_writable(&self) -> Result<(), KvError> {
        if self.writable {
            Ok(())
        } else {
            Err(KvError::ReadOnly)
        }
    }

    async fn require_bucket(&mut self, bucket: &str) -> Result<(), KvError> {
        if self.bucket_exists(bucket).await? {
            Ok(())
        } else {
            Err(KvError::BucketNotFound(bucket.to_string()))
        }
    }

    // ============ Buckets ============

    pub async fn bucket_exists(&mut self, bucket: &str) -> Result<bool, KvError> {
        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM buckets WHERE name = ?")
            .bind(bucket)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(exists)
    }

    pub async fn create_bucket_if_not_exists(&mut self, bucket: &str) -> Result<(), KvError> {
        self.ensure_writable()?;
        sqlx::query("INSERT OR IGNORE INTO buckets (name, sequence) VALUES (?, 0)")
            .bind(bucket)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Removes a bucket and everything in it.
    pub async fn delete_bucket(&mut self, bucket: &str) -> Result<(), KvError> {
        self.ensure_writable()?;
        self.require_bucket(bucket).await?;
        sqlx::query("DELETE FROM entries WHERE bucket = ?")
            .bind(bucket)
            .execute(&mut *self.tx)
            .await?;
        sqlx::query("DELETE FROM buckets WHERE name = ?")
            .bind(bucket)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn bucket_names(&mut self) -> Result<Vec<String>, KvError> {
        let names: Vec<String> = sqlx::query_scalar("SELECT name FROM buckets ORDER BY name")
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(names)
    }

    /// Increments and returns the bucket's sequence. The first call yields 1.
    pub async fn next_sequence(&mut self, bucket: &str) -> Result<u64, KvError> {
        self.ensure_writable()?;
        self.require_bucket(bucket).await?;
        sqlx::query("UPDATE buckets SET sequence = sequence + 1 WHERE name = ?")
            .bind(bucket)
            .execute(&mut *self.tx)
            .await?;
        self.sequence(bucket).await
    }

    pub async fn sequence(&mut self, bucket: &str) -> Result<u64, KvError> {
        let seq: Option<i64> = sqlx::query_scalar("SELECT sequence FROM buckets WHERE name = ?")
            .bind(bucket)
            .fetch_optional(&mut *self.tx)
            .await?;
        seq.map(|s| s as u64)
            .ok_or_else(|| KvError::BucketNotFound(bucket.to_string()))
    }

    // ============ Entries ============

    pub async fn get(&mut self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        self.require_bucket(bucket).await?;
        let value: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT value FROM entries WHERE bucket = ? AND key = ?")
                .bind(bucket)
                .bind(key)
                .fetch_optional(&mut *self.tx)
                .await?;
        Ok(value)
    }

    pub async fn put(&mut self, bucket: &str, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        self.ensure_writable()?;
        self.require_bucket(bucket).await?;
        sqlx::query(
            r#"
            INSERT INTO entries (bucket, key, value) VALUES (?, ?, ?)
            ON CONFLICT(bucket, key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(bucket)
        .bind(key)
        .bind(value)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Deletes a key. Returns whether it existed.
    pub async fn delete(&mut self, bucket: &str, key: &[u8]) -> Result<bool, KvError> {
        self.ensure_writable()?;
        self.require_bucket(bucket).await?;
        let result = sqlx::query("DELETE FROM entries WHERE bucket = ? AND key = ?")
            .bind(bucket)
            .bind(key)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count(&mut self, bucket: &str) -> Result<u64, KvError> {
        self.require_bucket(bucket).await?;
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entries WHERE bucket = ?")
            .bind(bucket)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(n as u64)
    }

    /// Every entry in key order.
    pub async fn entries(&mut self, bucket: &str) -> Result<Vec<Pair>, KvError> {
        self.page(bucket, 0, -1, false).await
    }

    /// A window of entries: skip `offset`, take `limit` (`-1` for all),
    /// walking backwards from the last key when `reverse` is set.
    pub async fn page(
        &mut self,
        bucket: &str,
        offset: u64,
        limit: i64,
        reverse: bool,
    ) -> Result<Vec<Pair>, KvError> {
        self.require_bucket(bucket).await?;
        let sql = if reverse {
            "SELECT key, value FROM entries WHERE bucket = ? ORDER BY key DESC LIMIT ? OFFSET ?"
        } else {
            "SELECT key, value FROM entries WHERE bucket = ? ORDER BY key ASC LIMIT ? OFFSET ?"
        };
        let rows: Vec<Pair> = sqlx::query_as(sql)
            .bind(bucket)
            .bind(limit)
            .bind(offset as i64)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows)
    }

    // ============ Cursor ============

    pub async fn first(&mut self, bucket: &str) -> Result<Option<Pair>, KvError> {
        self.edge(bucket, "ASC").await
    }

    pub async fn last(&mut self, bucket: &str) -> Result<Option<Pair>, KvError> {
        self.edge(bucket, "DESC").await
    }

    /// The entry immediately after `key`.
    pub async fn next(&mut self, bucket: &str, key: &[u8]) -> Result<Option<Pair>, KvError> {
        self.neighbour(bucket, key, ">", "ASC").await
    }

    /// The entry immediately before `key`.
    pub async fn prev(&mut self, bucket: &str, key: &[u8]) -> Result<Option<Pair>, KvError> {
        self.neighbour(bucket, key, "<", "DESC").await
    }

    /// The first entry whose key is `>= key`.
    pub async fn seek(&mut self, bucket: &str, key: &[u8]) -> Result<Option<Pair>, KvError> {
        self.neighbour(bucket, key, ">=", "ASC").await
    }

    async fn edge(&mut self, bucket: &str, order: &str) -> Result<Option<Pair>, KvError> {
        self.require_bucket(bucket).await?;
        let sql = format!(
            "SELECT key, value FROM entries WHERE bucket = ? ORDER BY key {} LIMIT 1",
            order
        );
        let row: Option<Pair> = sqlx::query_as(&sql)
            .bind(bucket)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row)
    }

    async fn neighbour(
        &mut self,
        bucket: &str,
        key: &[u8],
        cmp: &str,
        order: &str,
    ) -> Result<Option<Pair>, KvError> {
        self.require_bucket(bucket).await?;
        let sql = format!(
            "SELECT key, value FROM entries WHERE bucket = ? AND key {} ? ORDER BY key {} LIMIT 1",
            cmp, order
        );
        let row: Option<Pair> = sqlx::query_as(&sql)
            .bind(bucket)
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (TempDir, KvStore) {
        let tmp = TempDir::new().unwrap();
        let kv = KvStore::open(&tmp.path().join("data/system.db"))
            .await
            .unwrap();
        (tmp, kv)
    }

    #[tokio::test]
    async fn test_commit_and_publishes_under_writer_lock() {
        let (_tmp, kv) = store().await;
        let mut txn = kv.begin_write().await.unwrap();
        txn.create_bucket_if_not_exists("b").await.unwrap();
        txn.put("b", b"k", b"v").await.unwrap();

        let held = txn
            .commit_and(|| kv.writer.try_lock().is_err())
            .await
            .unwrap();
        assert!(held);
        assert!(kv.writer.try_lock().is_ok());

        let mut read = kv.begin_read().await.unwrap();
        assert_eq!(read.get("b", b"k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_put_get_commit() {
        let (_tmp, kv) = store().await;
        let mut txn = kv.begin_write().await.unwrap();
        txn.create_bucket_if_not_exists("b").await.unwrap();
        txn.put("b", b"k", b"v").await.unwrap();
        txn.commit().await.unwrap();

        let mut read = kv.begin_read().await.unwrap();
        assert_eq!(read.get("b", b"k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(read.get("b", b"missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let (_tmp, kv) = store().await;
        kv.ensure_buckets(&["b"]).await.unwrap();
        {
            let mut txn = kv.begin_write().await.unwrap();
            txn.put("b", b"k", b"v").await.unwrap();
        }
        let mut read = kv.begin_read().await.unwrap();
        assert_eq!(read.get("b", b"k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_bucket_and_read_only() {
        let (_tmp, kv) = store().await;
        let mut read = kv.begin_read().await.unwrap();
        assert!(matches!(
            read.get("nope", b"k").await,
            Err(KvError::BucketNotFound(_))
        ));
        assert!(matches!(
            read.put("nope", b"k", b"v").await,
            Err(KvError::ReadOnly)
        ));
    }

    #[tokio::test]
    async fn test_sequence_is_monotonic() {
        let (_tmp, kv) = store().await;
        kv.ensure_buckets(&["b"]).await.unwrap();
        let mut txn = kv.begin_write().await.unwrap();
        assert_eq!(txn.next_sequence("b").await.unwrap(), 1);
        assert_eq!(txn.next_sequence("b").await.unwrap(), 2);
        txn.commit().await.unwrap();

        let mut txn = kv.begin_write().await.unwrap();
        assert_eq!(txn.next_sequence("b").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_cursor_walks_in_byte_order() {
        let (_tmp, kv) = store().await;
        kv.ensure_buckets(&["b"]).await.unwrap();
        let mut txn = kv.begin_write().await.unwrap();
        for k in ["b", "a", "c"] {
            txn.put("b", k.as_bytes(), k.as_bytes()).await.unwrap();
        }
        txn.commit().await.unwrap();

        let mut r = kv.begin_read().await.unwrap();
        assert_eq!(r.first("b").await.unwrap().unwrap().0, b"a");
        assert_eq!(r.last("b").await.unwrap().unwrap().0, b"c");
        assert_eq!(r.next("b", b"a").await.unwrap().unwrap().0, b"b");
        assert_eq!(r.prev("b", b"b").await.unwrap().unwrap().0, b"a");
        assert!(r.next("b", b"c").await.unwrap().is_none());
        assert_eq!(r.seek("b", b"bb").await.unwrap().unwrap().0, b"c");

        let page = r.page("b", 1, 1, true).await.unwrap();
        assert_eq!(page, vec![(b"b".to_vec(), b"b".to_vec())]);
        assert_eq!(r.count("b").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_delete_bucket() {
        let (_tmp, kv) = store().await;
        kv.ensure_buckets(&["b"]).await.unwrap();
        let mut txn = kv.begin_write().await.unwrap();
        txn.put("b", b"k", b"v").await.unwrap();
        txn.delete_bucket("b").await.unwrap();
        assert!(!txn.bucket_exists("b").await.unwrap());
        assert!(matches!(
            txn.delete_bucket("b").await,
            Err(KvError::BucketNotFound(_))
        ));
        txn.create_bucket_if_not_exists("b").await.unwrap();
        assert_eq!(txn.count("b").await.unwrap(), 0);
        txn.commit().await.unwrap();
    }
}

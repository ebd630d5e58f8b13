//! Settings store and its in-memory cache.
//!
//! The site settings live as one JSON record at `__config/settings`. Every
//! successful write replaces the cached map, so request handlers can read
//! the ETag and cache policy without touching the database.

use std::sync::Arc;

use base64::Engine as _;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use uuid::Uuid;

use content_engine_core::form::FormValues;
use content_engine_core::settings::Settings;

use crate::error::{EngineError, Result};
use crate::kv::{KvStore, Txn};

pub const CONFIG_BUCKET: &str = "__config";
pub const SETTINGS_KEY: &[u8] = b"settings";

/// Base64 of the current unix time in seconds.
pub fn new_etag() -> String {
    let now = chrono::Utc::now().timestamp().to_string();
    base64::engine::general_purpose::STANDARD.encode(now)
}

fn new_client_secret() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

#[derive(Clone)]
pub struct ConfigCache {
    kv: KvStore,
    cache: Arc<Mutex<Map<String, Value>>>,
}

impl ConfigCache {
    /// Loads the settings record into memory, creating it on first run.
    ///
    /// A missing `client_secret` is generated and persisted.
    pub async fn load(kv: KvStore) -> Result<Self> {
        let this = Self {
            kv,
            cache: Arc::new(Mutex::new(Map::new())),
        };

        let mut txn = this.kv.begin_write().await?;
        txn.create_bucket_if_not_exists(CONFIG_BUCKET).await?;
        let mut current = read_map(&mut txn).await?;
        let has_secret = current
            .get("client_secret")
            .and_then(|v| v.as_str())
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        if !has_secret {
            current.insert("client_secret".into(), Value::from(new_client_secret()));
        }
        let settings = decode(current)?;
        let map = write_settings(&mut txn, &settings).await?;
        txn.commit_and(|| *this.cache.lock() = map).await?;
        Ok(this)
    }

    /// Cached value for `key`.
    pub fn get_by_key(&self, key: &str) -> Option<Value> {
        self.cache.lock().get(key).cloned()
    }

    /// Cached value for `key` as a string; empty when absent.
    pub fn get_str(&self, key: &str) -> String {
        match self.get_by_key(key) {
            Some(Value::String(s)) => s,
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }

    /// Cached boolean option; absent or non-boolean reads as `false`.
    pub fn flag(&self, key: &str) -> bool {
        matches!(self.cache.lock().get(key), Some(Value::Bool(true)))
    }

    /// The cached record, decoded.
    pub fn settings(&self) -> Settings {
        let map = self.cache.lock().clone();
        serde_json::from_value(Value::Object(map)).unwrap_or_default()
    }

    /// Replaces the cache with a serialized settings record.
    pub fn warm(&self, blob: &[u8]) -> Result<()> {
        let map: Map<String, Value> = serde_json::from_slice(blob)?;
        *self.cache.lock() = map;
        Ok(())
    }

    /// Applies a settings form on top of the stored record.
    ///
    /// `cache_invalidate = ["invalidate"]` regenerates the ETag; the field is
    /// never persisted.
    pub async fn set_config(&self, form: &FormValues) -> Result<Settings> {
        let mut form = form.clone();
        form.normalize_indexed();
        let submitted = form.to_json_map(&Settings::fields())?;

        let mut txn = self.kv.begin_write().await?;
        let mut current = read_map(&mut txn).await?;
        current.extend(submitted);

        let mut settings = decode(current)?;
        if settings.wants_invalidate() {
            settings.etag = new_etag();
        }
        settings.cache_invalidate.clear();

        let map = write_settings(&mut txn, &settings).await?;
        txn.commit_and(|| *self.cache.lock() = map).await?;
        tracing::debug!(etag = %settings.etag, "settings updated");
        Ok(settings)
    }

    /// Stored value for `key`, read from the database.
    pub async fn get_config(&self, key: &str) -> Result<Option<Value>> {
        let mut txn = self.kv.begin_read().await?;
        let map = read_map(&mut txn).await?;
        Ok(map.get(key).cloned())
    }

    /// The raw stored record.
    pub async fn get_all(&self) -> Result<Option<Vec<u8>>> {
        let mut txn = self.kv.begin_read().await?;
        Ok(txn.get(CONFIG_BUCKET, SETTINGS_KEY).await?)
    }

    /// Sets one key, persists and refreshes the cache.
    pub async fn put_config(&self, key: &str, value: Value) -> Result<()> {
        let mut txn = self.kv.begin_write().await?;
        let mut current = read_map(&mut txn).await?;
        current.insert(key.to_string(), value);
        let settings = decode(current)?;
        let map = write_settings(&mut txn, &settings).await?;
        txn.commit_and(|| *self.cache.lock() = map).await?;
        Ok(())
    }

    /// Writes a fresh ETag so HTTP clients refetch. Returns the new tag.
    pub async fn invalidate_cache(&self) -> Result<String> {
        let etag = new_etag();
        self.put_config("etag", Value::from(etag.clone())).await?;
        Ok(etag)
    }
}

async fn read_map(txn: &mut Txn) -> Result<Map<String, Value>> {
    match txn.get(CONFIG_BUCKET, SETTINGS_KEY).await? {
        Some(bytes) if !bytes.is_empty() => Ok(serde_json::from_slice(&bytes)?),
        _ => Ok(Map::new()),
    }
}

fn decode(map: Map<String, Value>) -> Result<Settings> {
    serde_json::from_value(Value::Object(map))
        .map_err(|e| EngineError::InvalidInput(format!("settings: {}", e)))
}

async fn write_settings(txn: &mut Txn, settings: &Settings) -> Result<Map<String, Value>> {
    let value = serde_json::to_value(settings)?;
    let bytes = serde_json::to_vec(&value)?;
    txn.put(CONFIG_BUCKET, SETTINGS_KEY, &bytes).await?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn cache() -> (TempDir, ConfigCache) {
        let tmp = TempDir::new().unwrap();
        let kv = KvStore::open(&tmp.path().join("system.db")).await.unwrap();
        let cache = ConfigCache::load(kv).await.unwrap();
        (tmp, cache)
    }

    #[tokio::test]
    async fn test_load_generates_client_secret() {
        let (_tmp, cache) = cache().await;
        assert_eq!(cache.get_str("client_secret").len(), 64);
        assert_eq!(cache.get_str("etag"), "");
    }

    #[tokio::test]
    async fn test_invalidate_request_rewrites_etag() {
        let (_tmp, cache) = cache().await;
        cache
            .put_config("etag", Value::from("stale"))
            .await
            .unwrap();
        assert_eq!(cache.get_str("etag"), "stale");

        let form = FormValues::from_pairs([("cache_invalidate", "invalidate")]);
        let settings = cache.set_config(&form).await.unwrap();

        assert_ne!(settings.etag, "stale");
        assert_eq!(cache.get_str("etag"), settings.etag);
        assert_eq!(
            cache.get_by_key("cache_invalidate"),
            Some(serde_json::json!([]))
        );
        let stored = cache.get_config("etag").await.unwrap().unwrap();
        assert_eq!(stored, Value::from(settings.etag));
    }

    #[tokio::test]
    async fn test_set_config_merges_and_keeps_secret() {
        let (_tmp, cache) = cache().await;
        let secret = cache.get_str("client_secret");
        let form = FormValues::from_pairs([("name", "Site"), ("gzip_disabled", "on")]);
        cache.set_config(&form).await.unwrap();
        assert_eq!(cache.get_str("name"), "Site");
        assert_eq!(cache.get_str("client_secret"), secret);
        assert!(cache.settings().gzip_disabled);
        assert!(cache.flag("gzip_disabled"));
        assert!(!cache.flag("cors_disabled"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_leave_cache_matching_store() {
        let (_tmp, cache) = cache().await;
        for round in 0..20 {
            let mut tasks = Vec::new();
            for i in 0..8 {
                let cache = cache.clone();
                tasks.push(tokio::spawn(async move {
                    cache
                        .put_config("name", Value::from(format!("{}-{}", round, i)))
                        .await
                        .unwrap();
                }));
            }
            for task in tasks {
                task.await.unwrap();
            }
            let stored = cache.get_config("name").await.unwrap();
            assert_eq!(cache.get_by_key("name"), stored);
        }
    }

    #[tokio::test]
    async fn test_warm_and_get_all() {
        let (_tmp, cache) = cache().await;
        let blob = cache.get_all().await.unwrap().unwrap();
        cache.warm(br#"{"name":"other"}"#).unwrap();
        assert_eq!(cache.get_str("name"), "other");
        cache.warm(&blob).unwrap();
        assert_eq!(cache.get_str("name"), "");
    }

    #[tokio::test]
    async fn test_invalidate_cache_sets_base64_seconds() {
        let (_tmp, cache) = cache().await;
        let etag = cache.invalidate_cache().await.unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&etag)
            .unwrap();
        let secs: i64 = String::from_utf8(decoded).unwrap().parse().unwrap();
        assert!(secs > 1_600_000_000);
        assert_eq!(cache.get_str("etag"), etag);
    }
}

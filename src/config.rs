//! Process configuration, read from a TOML file.
//!
//! ```toml
//! [store]
//! system_db = "./data/system.db"
//! analytics_db = "./data/analytics.db"
//!
//! [search]
//! dir = "./data/search"
//!
//! [uploads]
//! dir = "./data/uploads"
//! api_prefix = "api"
//!
//! [server]
//! bind = "127.0.0.1:8080"
//!
//! [analytics]
//! insert_interval_secs = 30
//! retention_days = 14
//!
//! [content]
//! sort_debounce_ms = 2000
//!
//! [log]
//! filter = "info"
//! ```
//!
//! Every section is optional. Runtime settings that admins change while the
//! server runs (ETag, CORS, cache policy) live in the settings record, not
//! here.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub uploads: UploadsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_system_db")]
    pub system_db: PathBuf,
    /// May point at the same file as `system_db`.
    #[serde(default = "default_analytics_db")]
    pub analytics_db: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            system_db: default_system_db(),
            analytics_db: default_analytics_db(),
        }
    }
}

fn default_system_db() -> PathBuf {
    PathBuf::from("./data/system.db")
}
fn default_analytics_db() -> PathBuf {
    PathBuf::from("./data/analytics.db")
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_search_dir")]
    pub dir: PathBuf,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            dir: default_search_dir(),
        }
    }
}

fn default_search_dir() -> PathBuf {
    PathBuf::from("./data/search")
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadsConfig {
    #[serde(default = "default_uploads_dir")]
    pub dir: PathBuf,
    /// First segment of upload URLs: `/<api_prefix>/uploads/YYYY/MM/name`.
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            dir: default_uploads_dir(),
            api_prefix: default_api_prefix(),
        }
    }
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("./data/uploads")
}
fn default_api_prefix() -> String {
    "api".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalyticsConfig {
    #[serde(default = "default_insert_interval")]
    pub insert_interval_secs: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    /// Defaults to `1024 * 64 * cpu_count`.
    #[serde(default)]
    pub channel_capacity: Option<usize>,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            insert_interval_secs: default_insert_interval(),
            retention_days: default_retention_days(),
            channel_capacity: None,
        }
    }
}

impl AnalyticsConfig {
    pub fn capacity(&self) -> usize {
        self.channel_capacity.unwrap_or_else(|| {
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            1024 * 64 * cpus
        })
    }
}

fn default_insert_interval() -> u64 {
    30
}
fn default_retention_days() -> i64 {
    14
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContentConfig {
    #[serde(default = "default_sort_debounce")]
    pub sort_debounce_ms: u64,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            sort_debounce_ms: default_sort_debounce(),
        }
    }
}

fn default_sort_debounce() -> u64 {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

fn default_filter() -> String {
    "info".to_string()
}

impl Config {
    /// All defaults, with every data path placed under `root`.
    pub fn minimal(root: &Path) -> Self {
        let data = root.join("data");
        Self {
            store: StoreConfig {
                system_db: data.join("system.db"),
                analytics_db: data.join("analytics.db"),
            },
            search: SearchConfig {
                dir: data.join("search"),
            },
            uploads: UploadsConfig {
                dir: data.join("uploads"),
                api_prefix: default_api_prefix(),
            },
            ..Default::default()
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.server.bind.trim().is_empty() {
        anyhow::bail!("server.bind must not be empty");
    }

    if config.analytics.insert_interval_secs == 0 {
        anyhow::bail!("analytics.insert_interval_secs must be > 0");
    }

    if config.analytics.retention_days < 1 {
        anyhow::bail!("analytics.retention_days must be >= 1");
    }

    if config.analytics.channel_capacity == Some(0) {
        anyhow::bail!("analytics.channel_capacity must be > 0");
    }

    let prefix = config.uploads.api_prefix.trim_matches('/');
    if prefix.is_empty() || prefix.contains('/') {
        anyhow::bail!(
            "uploads.api_prefix must be a single path segment, got '{}'",
            config.uploads.api_prefix
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        validate(&config).unwrap();
        assert_eq!(config.analytics.insert_interval_secs, 30);
        assert_eq!(config.analytics.retention_days, 14);
        assert_eq!(config.content.sort_debounce_ms, 2000);
        assert_eq!(config.uploads.api_prefix, "api");
        assert!(config.analytics.capacity() >= 1024 * 64);
    }

    #[test]
    fn test_sections_override() {
        let config: Config = toml::from_str(
            r#"
            [store]
            system_db = "/tmp/x/system.db"

            [analytics]
            retention_days = 30
            channel_capacity = 16
            "#,
        )
        .unwrap();
        assert_eq!(config.store.system_db, PathBuf::from("/tmp/x/system.db"));
        assert_eq!(config.store.analytics_db, default_analytics_db());
        assert_eq!(config.analytics.retention_days, 30);
        assert_eq!(config.analytics.capacity(), 16);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.analytics.insert_interval_secs = 0;
        assert!(validate(&config).is_err());

        let mut config = Config::default();
        config.analytics.channel_capacity = Some(0);
        assert!(validate(&config).is_err());

        let mut config = Config::default();
        config.uploads.api_prefix = "a/b".into();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_minimal_roots_paths() {
        let config = Config::minimal(Path::new("/srv/site"));
        assert_eq!(
            config.store.system_db,
            PathBuf::from("/srv/site/data/system.db")
        );
        assert_eq!(config.search.dir, PathBuf::from("/srv/site/data/search"));
    }
}

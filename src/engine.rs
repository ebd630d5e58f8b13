//! Service wiring.
//!
//! [`Engine::open`] builds every service from a [`Config`] and a populated
//! [`Registry`], in dependency order:
//!
//! ```text
//! system store ──► settings cache ──► search indexes ──► repository
//!                                                          │
//!                       content service ◄──────────────────┤
//!                       upload storage  ◄──────────────────┤
//!                       users           ◄── system store + settings
//! analytics store ──► capture handle + recorder
//! both stores + uploads/search dirs ──► backups
//! ```
//!
//! Opening is idempotent: buckets and indexes that already exist are
//! reused, so the CLI and the server can open the same data directory.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use content_engine_core::Registry;

use crate::analytics::{self, Analytics, AnalyticsStore, Recorder};
use crate::backup::Backups;
use crate::config::Config;
use crate::content::ContentService;
use crate::error::Result;
use crate::kv::KvStore;
use crate::repository::Repository;
use crate::search::SearchIndexes;
use crate::settings::ConfigCache;
use crate::uploads::Storage;
use crate::users::Users;

pub struct Engine {
    config: Arc<Config>,
    system: KvStore,
    analytics_kv: Option<KvStore>,
    repo: Repository,
    content: ContentService,
    storage: Storage,
    users: Users,
    analytics: Analytics,
    recorder: Option<Recorder>,
    backups: Backups,
}

impl Engine {
    /// Opens stores and indexes and makes sure every registered type has
    /// its buckets. Rotates the ETag once, since content may have changed
    /// while the process was down.
    pub async fn open(config: Config, registry: Registry) -> Result<Self> {
        let config = Arc::new(config);
        let registry = Arc::new(registry);

        let system = KvStore::open(&config.store.system_db).await?;
        let analytics_kv = if config.store.analytics_db == config.store.system_db {
            None
        } else {
            Some(KvStore::open(&config.store.analytics_db).await?)
        };

        let settings = ConfigCache::load(system.clone()).await?;

        let search = SearchIndexes::new(&config.search.dir, registry.clone());
        let reopened = search.open_existing().await?;
        for ty in registry.types() {
            search.create_index(ty.name()).await?;
        }
        tracing::debug!(reopened, bound = search.indexes().len(), "search indexes open");

        let repo = Repository::new(
            system.clone(),
            registry.clone(),
            search,
            settings.clone(),
            Duration::from_millis(config.content.sort_debounce_ms),
        );
        for name in registry.names() {
            repo.create_entity_store(name).await?;
        }
        settings.invalidate_cache().await?;

        let users = Users::open(system.clone(), settings.clone()).await?;
        let storage = Storage::local(repo.clone(), &config.uploads);
        let content = ContentService::new(repo.clone());

        let analytics_store = analytics_kv.clone().unwrap_or_else(|| system.clone());
        let backups = Backups::new(
            system.clone(),
            analytics_store.clone(),
            &config.uploads.dir,
            &config.search.dir,
        );
        let store = AnalyticsStore::open(analytics_store).await?;
        let (analytics, recorder) = analytics::channel(store, &config.analytics);

        tracing::info!(types = registry.len(), db = %config.store.system_db.display(), "engine open");

        Ok(Self {
            config,
            system,
            analytics_kv,
            repo,
            content,
            storage,
            users,
            analytics,
            recorder: Some(recorder),
            backups,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    pub fn content(&self) -> &ContentService {
        &self.content
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn users(&self) -> &Users {
        &self.users
    }

    pub fn settings(&self) -> &ConfigCache {
        self.repo.config()
    }

    pub fn analytics(&self) -> &Analytics {
        &self.analytics
    }

    pub fn backups(&self) -> &Backups {
        &self.backups
    }

    /// Spawns the analytics recorder. Only the first call starts one.
    pub fn start_recorder(&mut self) -> Option<JoinHandle<()>> {
        self.recorder.take().map(Recorder::start)
    }

    /// Closes search indexes and database pools.
    pub async fn close(self) {
        self.repo.search_indexes().close().await;
        if let Some(kv) = &self.analytics_kv {
            kv.close().await;
        }
        self.system.close().await;
    }
}

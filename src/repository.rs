//! Content repository: typed records on top of the KV store.
//!
//! For every registered type `T` the repository maintains three buckets:
//!
//! | Bucket | Contents |
//! |--------|----------|
//! | `T` | records keyed by decimal id |
//! | `T__sorted` | the same records keyed `timestamp:position`, newest first |
//! | `T__pending` | external submissions awaiting approval |
//!
//! plus the shared `__contentIndex` bucket mapping each slug to `T:id`.
//!
//! A write to `T` updates the record, its slug entry and its search
//! document as one unit, then schedules a debounced rebuild of
//! `T__sorted` and rotates the HTTP ETag. Writes to `T__pending` only
//! store the record.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use content_engine_core::entity::Record;
use content_engine_core::registry::EntityType;
use content_engine_core::slug::slugify;
use content_engine_core::target::{self, base_type, pending_bucket, sorted_bucket, Target};
use content_engine_core::{Item, Registry};

use crate::error::{EngineError, Result};
use crate::kv::{KvError, KvStore, Txn};
use crate::search::{SearchIndexes, TypeIndex};
use crate::settings::ConfigCache;
use crate::sort::{Admission, SortDebouncer};

pub const CONTENT_INDEX: &str = "__contentIndex";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    Asc,
    #[default]
    Desc,
}

impl Order {
    /// `asc` (any case) or descending.
    pub fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("asc") {
            Order::Asc
        } else {
            Order::Desc
        }
    }
}

/// Paging for [`Repository::query`]. `offset` counts pages, not records.
#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
    pub count: i64,
    pub offset: i64,
    pub order: Order,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            count: 10,
            offset: 0,
            order: Order::Desc,
        }
    }
}

/// Shared handle to the content store. Cheap to clone.
#[derive(Clone)]
pub struct Repository {
    inner: Arc<RepoInner>,
}

struct RepoInner {
    kv: KvStore,
    registry: Arc<Registry>,
    search: SearchIndexes,
    config: ConfigCache,
    sorter: SortDebouncer,
    /// Slugs handed out but not yet committed to `__contentIndex`.
    reserved: Mutex<HashSet<String>>,
}

impl Repository {
    pub fn new(
        kv: KvStore,
        registry: Arc<Registry>,
        search: SearchIndexes,
        config: ConfigCache,
        sort_debounce: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RepoInner {
                kv,
                registry,
                search,
                config,
                sorter: SortDebouncer::new(sort_debounce),
                reserved: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn kv(&self) -> &KvStore {
        &self.inner.kv
    }

    pub fn search_indexes(&self) -> &SearchIndexes {
        &self.inner.search
    }

    pub fn config(&self) -> &ConfigCache {
        &self.inner.config
    }

    /// Descriptor for the type owning `bucket`.
    pub fn entity_type(&self, bucket: &str) -> Result<&EntityType> {
        let type_name = base_type(bucket);
        self.inner
            .registry
            .get(type_name)
            .ok_or_else(|| EngineError::unregistered(type_name))
    }

    // ============ Stores ============

    /// Provisions `T`, `T__sorted` and `T__pending`, then sorts `T`.
    pub async fn create_entity_store(&self, type_name: &str) -> Result<()> {
        self.entity_type(type_name)?;
        if type_name != base_type(type_name) {
            return Err(EngineError::InvalidInput(format!(
                "'{}' is not a content type",
                type_name
            )));
        }

        let sorted = sorted_bucket(type_name);
        let pending = pending_bucket(type_name);
        self.inner
            .kv
            .ensure_buckets(&[type_name, sorted.as_str(), pending.as_str(), CONTENT_INDEX])
            .await?;
        self.schedule_sort(type_name);
        Ok(())
    }

    // ============ Writes ============

    /// Stores `record` in `bucket` (`T` or `T__pending`) and returns its id.
    ///
    /// A zero id allocates the next sequence value; a nil UUID and zero
    /// timestamp are filled in; `updated` is always set to now. Records in
    /// `T` get a unique slug, a `__contentIndex` entry and a search
    /// document.
    pub async fn set_entity(&self, bucket: &str, record: &mut dyn Record) -> Result<u64> {
        let type_name = base_type(bucket).to_string();
        self.entity_type(&type_name)?;
        let primary = bucket == type_name;
        if !primary && bucket != pending_bucket(&type_name) {
            return Err(EngineError::InvalidInput(format!(
                "bucket '{}' can't be written directly",
                bucket
            )));
        }

        let mut held_slug = None;
        let result = self
            .write_entity(bucket, &type_name, primary, record, &mut held_slug)
            .await;
        if let Some(slug) = held_slug {
            self.release_slug(&slug);
        }
        let id = result?;

        if primary {
            self.schedule_sort(&type_name);
        }
        self.inner.config.invalidate_cache().await?;
        Ok(id)
    }

    async fn write_entity(
        &self,
        bucket: &str,
        type_name: &str,
        primary: bool,
        record: &mut dyn Record,
        held_slug: &mut Option<String>,
    ) -> Result<u64> {
        let mut txn = self.inner.kv.begin_write().await?;
        txn.create_bucket_if_not_exists(bucket).await?;

        if record.item().id == 0 {
            let id = txn.next_sequence(bucket).await?;
            record.item_mut().id = id;
        }
        let now = chrono::Utc::now().timestamp_millis();
        stamp(record.item_mut(), now);

        let id = record.item().id;
        let key = id.to_string();
        let doc_id = Target::new(bucket, id).to_string();
        let previous = txn.get(bucket, key.as_bytes()).await?;

        if primary {
            txn.create_bucket_if_not_exists(CONTENT_INDEX).await?;
            let slug = self
                .resolve_slug(&mut txn, type_name, &doc_id, record, held_slug)
                .await?;

            if let Some(owner) = txn.get(CONTENT_INDEX, slug.as_bytes()).await? {
                if owner != doc_id.as_bytes() {
                    return Err(EngineError::Conflict(format!(
                        "slug '{}' already belongs to {}",
                        slug,
                        String::from_utf8_lossy(&owner)
                    )));
                }
            }

            if let Some(old) = previous.as_deref().and_then(slug_of) {
                if !old.is_empty() && old != slug {
                    let owner = txn.get(CONTENT_INDEX, old.as_bytes()).await?;
                    if owner.as_deref() == Some(doc_id.as_bytes()) {
                        txn.delete(CONTENT_INDEX, old.as_bytes()).await?;
                    }
                }
            }

            record.item_mut().slug = slug.clone();
            txn.put(CONTENT_INDEX, slug.as_bytes(), doc_id.as_bytes())
                .await?;
        }

        let bytes = record.to_bytes()?;
        txn.put(bucket, key.as_bytes(), &bytes).await?;

        let index = if primary {
            self.inner.search.find_index(type_name)
        } else {
            None
        };
        if let Some(index) = &index {
            index.update(&doc_id, &record.to_json()?).await?;
        }

        if let Err(e) = txn.commit().await {
            if let Some(index) = &index {
                compensate(index, &doc_id, previous.as_deref()).await;
            }
            return Err(e.into());
        }

        tracing::debug!(record = %doc_id, "record stored");
        Ok(id)
    }

    /// Picks the slug a primary write will use.
    ///
    /// A slug the index already maps to this record is kept. Otherwise the
    /// record's own slug, or one derived from its display name, is made
    /// unique. The chosen slug is held in the reservation set until the
    /// caller releases it.
    async fn resolve_slug(
        &self,
        txn: &mut Txn,
        type_name: &str,
        doc_id: &str,
        record: &dyn Record,
        held: &mut Option<String>,
    ) -> Result<String> {
        let current = record.item().slug.clone();
        if !current.is_empty() {
            let owner = txn.get(CONTENT_INDEX, current.as_bytes()).await?;
            let reserved = self.inner.reserved.lock().contains(&current);
            match owner {
                Some(owner) if owner == doc_id.as_bytes() => return Ok(current),
                None if reserved => {
                    // handed out earlier by unique_slug
                    *held = Some(current.clone());
                    return Ok(current);
                }
                _ => {}
            }
        }

        let base = if current.is_empty() {
            let derived = slugify(&record.display_name());
            if derived.is_empty() {
                type_name.to_lowercase()
            } else {
                derived
            }
        } else {
            current
        };

        let slug = self.reserve_free_slug(txn, &base).await?;
        *held = Some(slug.clone());
        Ok(slug)
    }

    /// First of `base`, `base-1`, `base-2`, ... that is neither indexed nor
    /// reserved. The winner is added to the reservation set.
    async fn reserve_free_slug(&self, txn: &mut Txn, base: &str) -> Result<String> {
        let mut candidate = base.to_string();
        let mut k = 0u64;
        loop {
            let indexed = match txn.get(CONTENT_INDEX, candidate.as_bytes()).await {
                Ok(found) => found.is_some(),
                Err(KvError::BucketNotFound(_)) => false,
                Err(e) => return Err(e.into()),
            };
            if !indexed {
                let mut reserved = self.inner.reserved.lock();
                if reserved.insert(candidate.clone()) {
                    return Ok(candidate);
                }
            }
            k += 1;
            candidate = format!("{}-{}", base, k);
        }
    }

    /// A slug derived from `candidate` that no record uses and no other
    /// caller holds. Stays reserved until a write commits it or
    /// [`release_slug`](Self::release_slug) is called.
    pub async fn unique_slug(&self, candidate: &str) -> Result<String> {
        let mut txn = self.inner.kv.begin_read().await?;
        let slug = self.reserve_free_slug(&mut txn, candidate).await?;
        txn.rollback().await?;
        Ok(slug)
    }

    pub fn release_slug(&self, slug: &str) {
        self.inner.reserved.lock().remove(slug);
    }

    /// Allocates the next id for `bucket` in its own transaction.
    pub async fn next_id_sequence(&self, bucket: &str) -> Result<u64> {
        self.entity_type(bucket)?;
        let mut txn = self.inner.kv.begin_write().await?;
        txn.create_bucket_if_not_exists(bucket).await?;
        let id = txn.next_sequence(bucket).await?;
        txn.commit().await?;
        Ok(id)
    }

    pub fn is_valid_id(&self, id: &str) -> bool {
        target::is_valid_id(id)
    }

    /// Removes the record at `T:id` (or `T__pending:id`) and returns it.
    ///
    /// Primary records also lose their slug entry and search document, and
    /// `T__sorted` is rebuilt before returning.
    pub async fn delete_entity(&self, target: &str) -> Result<Box<dyn Record>> {
        let target: Target = target.parse()?;
        let ty = self.entity_type(&target.bucket)?;
        let doc_id = target.to_string();
        let key = target.key();

        let mut txn = self.inner.kv.begin_write().await?;
        let bytes = match txn.get(&target.bucket, key.as_bytes()).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Err(EngineError::NotFound(doc_id)),
            Err(KvError::BucketNotFound(b)) => return Err(missing_bucket(&b)),
            Err(e) => return Err(e.into()),
        };
        let record = decode(ty, &doc_id, &bytes)?;
        txn.delete(&target.bucket, key.as_bytes()).await?;

        let primary = target.is_primary();
        if primary {
            let slug = &record.item().slug;
            if !slug.is_empty() && txn.bucket_exists(CONTENT_INDEX).await? {
                let owner = txn.get(CONTENT_INDEX, slug.as_bytes()).await?;
                if owner.as_deref() == Some(doc_id.as_bytes()) {
                    txn.delete(CONTENT_INDEX, slug.as_bytes()).await?;
                }
            }
        }

        let index = if primary {
            self.inner.search.find_index(target.type_name())
        } else {
            None
        };
        if let Some(index) = &index {
            index.delete(&doc_id).await?;
        }

        if let Err(e) = txn.commit().await {
            if let Some(index) = &index {
                compensate(index, &doc_id, Some(&bytes)).await;
            }
            return Err(e.into());
        }
        tracing::debug!(record = %doc_id, "record deleted");

        if primary {
            self.sort_content(target.type_name()).await?;
        }
        self.inner.config.invalidate_cache().await?;
        Ok(record)
    }

    // ============ Reads ============

    pub async fn find_one_by_target(&self, target: &str) -> Result<Box<dyn Record>> {
        let parsed: Target = target.parse()?;
        self.entity_type(&parsed.bucket)?;
        let mut txn = self.inner.kv.begin_read().await?;
        self.read_record(&mut txn, &parsed)
            .await?
            .ok_or_else(|| EngineError::NotFound(parsed.to_string()))
    }

    /// Records for each target, in order. Missing records are skipped.
    pub async fn find_by_target(&self, targets: &[String]) -> Result<Vec<Box<dyn Record>>> {
        let mut txn = self.inner.kv.begin_read().await?;
        let mut out = Vec::with_capacity(targets.len());
        for raw in targets {
            let parsed: Target = raw.parse()?;
            self.entity_type(&parsed.bucket)?;
            match self.read_record(&mut txn, &parsed).await {
                Ok(Some(record)) => out.push(record),
                Ok(None) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Every record in `bucket`, in key order.
    pub async fn find_all(&self, bucket: &str) -> Result<Vec<Box<dyn Record>>> {
        let ty = self.entity_type(bucket)?;
        let mut txn = self.inner.kv.begin_read().await?;
        let rows = match txn.entries(bucket).await {
            Ok(rows) => rows,
            Err(KvError::BucketNotFound(b)) => return Err(missing_bucket(&b)),
            Err(e) => return Err(e.into()),
        };
        rows.iter()
            .map(|(key, value)| decode(ty, &String::from_utf8_lossy(key), value))
            .collect()
    }

    /// Resolves a slug to its type name and record.
    pub async fn find_one_by_slug(&self, slug: &str) -> Result<(String, Box<dyn Record>)> {
        let mut txn = self.inner.kv.begin_read().await?;
        let owner = match txn.get(CONTENT_INDEX, slug.as_bytes()).await {
            Ok(Some(owner)) => owner,
            Ok(None) | Err(KvError::BucketNotFound(_)) => {
                return Err(EngineError::NotFound(format!("slug '{}'", slug)))
            }
            Err(e) => return Err(e.into()),
        };
        let parsed: Target = String::from_utf8_lossy(&owner).parse()?;
        self.entity_type(&parsed.bucket)?;
        let record = self
            .read_record(&mut txn, &parsed)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("slug '{}'", slug)))?;
        Ok((parsed.type_name().to_string(), record))
    }

    /// One page of `bucket` plus its total size.
    ///
    /// `count = -1` returns everything. Page `offset` starts at record
    /// `count * offset`; pages past the end are empty.
    pub async fn query(
        &self,
        bucket: &str,
        opts: QueryOptions,
    ) -> Result<(u64, Vec<Box<dyn Record>>)> {
        let ty = self.entity_type(bucket)?;
        let count = if opts.count < 0 { -1 } else { opts.count };
        let offset = opts.offset.max(0) as u64;

        let mut txn = self.inner.kv.begin_read().await?;
        let total = match txn.count(bucket).await {
            Ok(n) => n,
            Err(KvError::BucketNotFound(b)) => return Err(missing_bucket(&b)),
            Err(e) => return Err(e.into()),
        };

        let start = if count < 0 {
            0
        } else {
            (count as u64).saturating_mul(offset)
        };
        if count == 0 || start >= total {
            return Ok((total, Vec::new()));
        }

        let rows = txn
            .page(bucket, start, count, opts.order == Order::Desc)
            .await?;
        let records = rows
            .iter()
            .map(|(key, value)| decode(ty, &String::from_utf8_lossy(key), value))
            .collect::<Result<Vec<_>>>()?;
        Ok((total, records))
    }

    async fn read_record(&self, txn: &mut Txn, target: &Target) -> Result<Option<Box<dyn Record>>> {
        let ty = self.entity_type(&target.bucket)?;
        match txn.get(&target.bucket, target.key().as_bytes()).await {
            Ok(Some(bytes)) => Ok(Some(decode(ty, &target.to_string(), &bytes)?)),
            Ok(None) => Ok(None),
            Err(KvError::BucketNotFound(b)) => Err(missing_bucket(&b)),
            Err(e) => Err(e.into()),
        }
    }

    // ============ Sorted view ============

    /// Queues a debounced rebuild of `T__sorted`.
    pub fn schedule_sort(&self, type_name: &str) {
        if type_name.contains("__") {
            return;
        }
        let repo = self.clone();
        let type_name = type_name.to_string();
        tokio::spawn(async move {
            let admission = repo.inner.sorter.admit(&type_name, Instant::now());
            if let Admission::Later { delay, ticket } = admission {
                tokio::time::sleep(delay).await;
                if !repo.inner.sorter.claim(&type_name, ticket, Instant::now()) {
                    return;
                }
            }
            if let Err(e) = repo.sort_content(&type_name).await {
                tracing::warn!(type_name = %type_name, error = %e, "sort pass failed");
            }
        });
    }

    /// Rebuilds `T__sorted` from `T` in one write transaction, newest
    /// first. Keys are `timestamp:position`, both zero-padded so byte order
    /// is numeric. Equal timestamps take positions in ascending id order,
    /// so either walk direction orders records by `(timestamp, id)`.
    pub async fn sort_content(&self, type_name: &str) -> Result<()> {
        if type_name.contains("__") {
            return Ok(());
        }
        self.entity_type(type_name)?;
        let sorted = sorted_bucket(type_name);

        let mut txn = self.inner.kv.begin_write().await?;
        let rows = match txn.entries(type_name).await {
            Ok(rows) => rows,
            Err(KvError::BucketNotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut stamped = Vec::with_capacity(rows.len());
        for (_, value) in rows {
            let item: Item = serde_json::from_slice(&value)?;
            stamped.push((item.timestamp, item.id, value));
        }
        stamped.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        match txn.delete_bucket(&sorted).await {
            Ok(()) | Err(KvError::BucketNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        txn.create_bucket_if_not_exists(&sorted).await?;
        for (pos, (timestamp, _, value)) in stamped.iter().enumerate() {
            let key = format!("{:013}:{:010}", timestamp, pos);
            txn.put(&sorted, key.as_bytes(), value).await?;
        }
        txn.commit().await?;

        tracing::debug!(type_name, records = stamped.len(), "sorted view rebuilt");
        Ok(())
    }

    // ============ Search ============

    /// Full-text search within one type. `offset` skips hits, not pages.
    pub async fn search(
        &self,
        type_name: &str,
        query: &str,
        count: i64,
        offset: i64,
    ) -> Result<Vec<Box<dyn Record>>> {
        let ty = self.entity_type(type_name)?;
        if !ty.index_content() {
            return Err(EngineError::Unsupported(format!(
                "'{}' is not searchable",
                type_name
            )));
        }
        let index = self.inner.search.get_index(type_name)?;
        let count = if count < 0 { -1 } else { count };
        let ids = index.search(query, count, offset.max(0)).await?;
        self.find_by_target(&ids).await
    }

    /// Drops the index for `T`, recreates it empty and refills it in the
    /// background. Returns `None` for types that don't index content.
    pub async fn update_index(&self, type_name: &str) -> Result<Option<JoinHandle<()>>> {
        self.entity_type(type_name)?;
        let Some(index) = self.inner.search.rebuild_index(type_name).await? else {
            return Ok(None);
        };

        let repo = self.clone();
        let type_name = type_name.to_string();
        Ok(Some(tokio::spawn(async move {
            match repo.index_records(&index, &type_name).await {
                Ok(n) => tracing::info!(type_name = %type_name, documents = n, "reindex complete"),
                Err(e) => tracing::warn!(type_name = %type_name, error = %e, "reindex failed"),
            }
        })))
    }

    /// Like [`update_index`](Self::update_index) but waits for the refill.
    /// Returns the number of documents written.
    pub async fn reindex(&self, type_name: &str) -> Result<usize> {
        self.entity_type(type_name)?;
        match self.inner.search.rebuild_index(type_name).await? {
            Some(index) => self.index_records(&index, type_name).await,
            None => Ok(0),
        }
    }

    async fn index_records(&self, index: &TypeIndex, type_name: &str) -> Result<usize> {
        let records = self.find_all(type_name).await?;
        for record in &records {
            let doc_id = Target::new(type_name, record.item().id).to_string();
            index.update(&doc_id, &record.to_json()?).await?;
        }
        Ok(records.len())
    }
}

fn stamp(item: &mut Item, now: i64) {
    if item.uuid.is_nil() {
        item.uuid = Uuid::new_v4();
    }
    if item.timestamp == 0 {
        item.timestamp = now;
    }
    item.updated = now;
}

fn slug_of(bytes: &[u8]) -> Option<String> {
    serde_json::from_slice::<Item>(bytes).ok().map(|i| i.slug)
}

fn decode(ty: &EntityType, at: &str, bytes: &[u8]) -> Result<Box<dyn Record>> {
    ty.decode(bytes)
        .map_err(|e| EngineError::Programming(format!("stored record {} is unreadable: {}", at, e)))
}

/// Missing primary buckets mean the store was never provisioned; missing
/// sub-buckets just hold nothing yet.
fn missing_bucket(bucket: &str) -> EngineError {
    if bucket.contains("__") {
        EngineError::NotFound(bucket.to_string())
    } else {
        EngineError::NotInitialized(bucket.to_string())
    }
}

/// Puts the search index back the way it was before a failed commit.
async fn compensate(index: &TypeIndex, doc_id: &str, previous: Option<&[u8]>) {
    let restored: Result<()> = match previous.map(serde_json::from_slice::<Value>) {
        Some(Ok(value)) => index.update(doc_id, &value).await,
        Some(Err(e)) => Err(e.into()),
        None => index.delete(doc_id).await,
    };
    if let Err(e) = restored {
        tracing::error!(record = %doc_id, error = %e, "search index out of sync after failed commit");
    }
}

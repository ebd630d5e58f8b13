//! Content operations with their hook sequences.
//!
//! Each operation runs the record's `before_*` hooks and capability checks,
//! performs one repository mutation, then runs the `after_*` hooks:
//!
//! ```text
//! admin create   before_admin_create  before_save   set T        after_save    after_admin_create
//! admin update   before_admin_update  before_save   set T        after_save    after_admin_update
//! admin delete   before_admin_delete  before_delete delete       after_delete  after_admin_delete
//! api create     before_api_create    accept        before_save  set T|pending after_save after_api_create
//! api update     before_api_update    update        before_save  set T         after_save after_api_update
//! api delete     before_api_delete    delete        before_delete delete       after_delete after_api_delete
//! approve        before_approve       approve       before_save  set T, drop pending  after_save after_approve
//! reject         before_reject        drop pending  after_reject
//! ```
//!
//! A failing `before_*` hook or check becomes [`EngineError::Rejected`] and
//! nothing is written. A failing `after_*` hook is logged and ignored.

use content_engine_core::entity::{HookContext, Hooks, Record};
use content_engine_core::target::{base_type, pending_bucket, Target};

use crate::error::{EngineError, Result};
use crate::repository::Repository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    Public,
    Pending,
}

impl SubmitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmitStatus::Public => "public",
            SubmitStatus::Pending => "pending",
        }
    }
}

/// Outcome of an external submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub type_name: String,
    /// Set only for submissions that went straight to the public bucket.
    pub id: Option<u64>,
    pub status: SubmitStatus,
}

/// Hook-aware content operations. Cheap to clone.
#[derive(Clone)]
pub struct ContentService {
    repo: Repository,
}

impl ContentService {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    // ============ Admin ============

    /// Creates a `type_name` record from `ctx.form`.
    pub async fn admin_create(&self, type_name: &str, ctx: &HookContext) -> Result<Box<dyn Record>> {
        let ty = self.repo.entity_type(type_name)?;
        let mut record = ty.decode_form(&ctx.form)?;
        record.item_mut().id = 0;

        before(record.as_ref(), ctx, |h, c| h.before_admin_create(c))?;
        self.save(base_type(type_name), record.as_mut(), ctx).await?;

        let ctx = ctx.clone().with_target(target_of(base_type(type_name), record.as_ref()));
        after(record.as_ref(), &ctx, "after_admin_create", |h, c| h.after_admin_create(c));
        Ok(record)
    }

    /// Overlays `ctx.form` onto the record at `target`.
    pub async fn admin_update(&self, target: &str, ctx: &HookContext) -> Result<Box<dyn Record>> {
        let parsed: Target = target.parse()?;
        let existing = self.repo.find_one_by_target(target).await?;
        let ty = self.repo.entity_type(&parsed.bucket)?;
        let mut record = ty.merge_form(existing.as_ref(), &ctx.form)?;

        before(record.as_ref(), ctx, |h, c| h.before_admin_update(c))?;
        self.save(&parsed.bucket, record.as_mut(), ctx).await?;

        let ctx = ctx.clone().with_target(target);
        after(record.as_ref(), &ctx, "after_admin_update", |h, c| h.after_admin_update(c));
        Ok(record)
    }

    pub async fn admin_delete(&self, target: &str, ctx: &HookContext) -> Result<Box<dyn Record>> {
        let existing = self.repo.find_one_by_target(target).await?;
        let ctx = ctx.clone().with_target(target);
        before(existing.as_ref(), &ctx, |h, c| h.before_admin_delete(c))?;

        let removed = self.remove(target, existing.as_ref(), &ctx).await?;
        after(removed.as_ref(), &ctx, "after_admin_delete", |h, c| h.after_admin_delete(c));
        Ok(removed)
    }

    // ============ External API ============

    /// Accepts a submission for a type that allows them. Trusted
    /// submissions are published; the rest wait in `T__pending`.
    pub async fn api_create(&self, type_name: &str, ctx: &HookContext) -> Result<Submission> {
        let ty = self.repo.entity_type(type_name)?;
        let type_name = base_type(type_name).to_string();
        let mut record = ty.decode_form(&ctx.form)?;
        record.item_mut().id = 0;
        record.item_mut().slug.clear();

        let auto_approve = {
            let createable = record.createable().ok_or_else(|| {
                EngineError::Unsupported(format!("'{}' does not accept submissions", type_name))
            })?;
            before(record.as_ref(), ctx, |h, c| h.before_api_create(c))?;
            createable.accept(ctx).map_err(rejected)?;
            createable.auto_approve(ctx)
        };

        let (bucket, status) = if auto_approve {
            (type_name.clone(), SubmitStatus::Public)
        } else {
            (pending_bucket(&type_name), SubmitStatus::Pending)
        };
        let id = self.save(&bucket, record.as_mut(), ctx).await?;

        let ctx = ctx.clone().with_target(Target::new(bucket.as_str(), id).to_string());
        after(record.as_ref(), &ctx, "after_api_create", |h, c| h.after_api_create(c));

        tracing::info!(type_name = %type_name, status = status.as_str(), "submission received");
        Ok(Submission {
            type_name,
            id: (status == SubmitStatus::Public).then_some(id),
            status,
        })
    }

    /// Applies an external update to a public record.
    pub async fn api_update(&self, target: &str, ctx: &HookContext) -> Result<Box<dyn Record>> {
        let parsed: Target = target.parse()?;
        if !parsed.is_primary() {
            return Err(EngineError::InvalidInput(format!(
                "{} is not a public record",
                target
            )));
        }
        let existing = self.repo.find_one_by_target(target).await?;
        let ctx = ctx.clone().with_target(target);
        {
            let updateable = existing.updateable().ok_or_else(|| {
                EngineError::Unsupported(format!("'{}' does not accept updates", parsed.bucket))
            })?;
            before(existing.as_ref(), &ctx, |h, c| h.before_api_update(c))?;
            updateable.update(&ctx).map_err(rejected)?;
        }

        let ty = self.repo.entity_type(&parsed.bucket)?;
        let mut record = ty.merge_form(existing.as_ref(), &ctx.form)?;
        self.save(&parsed.bucket, record.as_mut(), &ctx).await?;

        after(record.as_ref(), &ctx, "after_api_update", |h, c| h.after_api_update(c));
        Ok(record)
    }

    pub async fn api_delete(&self, target: &str, ctx: &HookContext) -> Result<Box<dyn Record>> {
        let parsed: Target = target.parse()?;
        if !parsed.is_primary() {
            return Err(EngineError::InvalidInput(format!(
                "{} is not a public record",
                target
            )));
        }
        let existing = self.repo.find_one_by_target(target).await?;
        let ctx = ctx.clone().with_target(target);
        {
            let deleteable = existing.deleteable().ok_or_else(|| {
                EngineError::Unsupported(format!("'{}' does not accept deletes", parsed.bucket))
            })?;
            before(existing.as_ref(), &ctx, |h, c| h.before_api_delete(c))?;
            deleteable.delete(&ctx).map_err(rejected)?;
        }

        let removed = self.remove(target, existing.as_ref(), &ctx).await?;
        after(removed.as_ref(), &ctx, "after_api_delete", |h, c| h.after_api_delete(c));
        Ok(removed)
    }

    // ============ Moderation ============

    /// Publishes a pending record under a fresh id and removes it from
    /// `T__pending`.
    pub async fn approve(&self, pending_target: &str, ctx: &HookContext) -> Result<Box<dyn Record>> {
        let parsed = pending_target_of(pending_target)?;
        let pending = self.repo.find_one_by_target(pending_target).await?;
        let ctx_pending = ctx.clone().with_target(pending_target);

        before(pending.as_ref(), &ctx_pending, |h, c| h.before_approve(c))?;
        if let Some(approvable) = pending.approvable() {
            approvable.approve(&ctx_pending).map_err(rejected)?;
        }

        let type_name = parsed.type_name().to_string();
        let mut record = pending.clone();
        record.item_mut().id = 0;
        record.item_mut().slug.clear();
        let id = self.save(&type_name, record.as_mut(), ctx).await?;

        if let Err(e) = self.repo.delete_entity(pending_target).await {
            tracing::error!(record = %pending_target, error = %e, "approved record left in pending");
        }

        let ctx = ctx.clone().with_target(Target::new(type_name.as_str(), id).to_string());
        after(record.as_ref(), &ctx, "after_approve", |h, c| h.after_approve(c));
        Ok(record)
    }

    /// Discards a pending record.
    pub async fn reject(&self, pending_target: &str, ctx: &HookContext) -> Result<Box<dyn Record>> {
        pending_target_of(pending_target)?;
        let pending = self.repo.find_one_by_target(pending_target).await?;
        let ctx = ctx.clone().with_target(pending_target);

        before(pending.as_ref(), &ctx, |h, c| h.before_reject(c))?;
        let removed = self.repo.delete_entity(pending_target).await?;
        after(removed.as_ref(), &ctx, "after_reject", |h, c| h.after_reject(c));
        Ok(removed)
    }

    // ============ Shared steps ============

    /// `before_save`, write, `after_save`.
    async fn save(&self, bucket: &str, record: &mut dyn Record, ctx: &HookContext) -> Result<u64> {
        before(record, ctx, |h, c| h.before_save(c))?;
        let id = self.repo.set_entity(bucket, record).await?;
        let ctx = ctx.clone().with_target(Target::new(bucket, id).to_string());
        after(record, &ctx, "after_save", |h, c| h.after_save(c));
        Ok(id)
    }

    /// `before_delete`, delete, `after_delete`.
    async fn remove(
        &self,
        target: &str,
        existing: &dyn Record,
        ctx: &HookContext,
    ) -> Result<Box<dyn Record>> {
        before(existing, ctx, |h, c| h.before_delete(c))?;
        let removed = self.repo.delete_entity(target).await?;
        after(removed.as_ref(), ctx, "after_delete", |h, c| h.after_delete(c));
        Ok(removed)
    }
}

fn before<F>(record: &dyn Record, ctx: &HookContext, hook: F) -> Result<()>
where
    F: Fn(&dyn Hooks, &HookContext) -> anyhow::Result<()>,
{
    match record.hooks() {
        Some(hooks) => hook(hooks, ctx).map_err(rejected),
        None => Ok(()),
    }
}

fn after<F>(record: &dyn Record, ctx: &HookContext, stage: &'static str, hook: F)
where
    F: Fn(&dyn Hooks, &HookContext) -> anyhow::Result<()>,
{
    if let Some(hooks) = record.hooks() {
        if let Err(e) = hook(hooks, ctx) {
            tracing::warn!(stage, record = ?ctx.target, error = %e, "hook failed");
        }
    }
}

fn rejected(e: anyhow::Error) -> EngineError {
    EngineError::Rejected(format!("{:#}", e))
}

fn target_of(bucket: &str, record: &dyn Record) -> String {
    Target::new(bucket, record.item().id).to_string()
}

fn pending_target_of(raw: &str) -> Result<Target> {
    let parsed: Target = raw.parse()?;
    if parsed.bucket != pending_bucket(parsed.type_name()) {
        return Err(EngineError::InvalidInput(format!(
            "{} is not a pending record",
            raw
        )));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::{Review, Song};
    use crate::kv::KvStore;
    use crate::repository::QueryOptions;
    use crate::search::SearchIndexes;
    use crate::settings::ConfigCache;
    use content_engine_core::{downcast, FormValues, Registry};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn service() -> (TempDir, ContentService) {
        let tmp = TempDir::new().unwrap();
        let kv = KvStore::open(&tmp.path().join("system.db")).await.unwrap();
        let mut registry = Registry::new();
        crate::demo::register(&mut registry).unwrap();
        let registry = Arc::new(registry);
        let search = SearchIndexes::new(&tmp.path().join("search"), registry.clone());
        search.create_index("Review").await.unwrap();
        let config = ConfigCache::load(kv.clone()).await.unwrap();
        let repo = Repository::new(kv, registry, search, config, Duration::from_millis(10));
        for name in ["Review", "Song"] {
            repo.create_entity_store(name).await.unwrap();
        }
        (tmp, ContentService::new(repo))
    }

    fn ctx(pairs: &[(&str, &str)]) -> HookContext {
        HookContext {
            form: FormValues::from_pairs(pairs.iter().copied()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_moderated_submission_then_approve() {
        let (_tmp, svc) = service().await;
        let sub = svc
            .api_create("Review", &ctx(&[("title", "Great Place"), ("rating", "5")]))
            .await
            .unwrap();
        assert_eq!(sub.status, SubmitStatus::Pending);
        assert_eq!(sub.id, None);

        let (pending, _) = svc
            .repo()
            .query("Review__pending", QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(pending, 1);

        let approved = svc.approve("Review__pending:1", &HookContext::default()).await.unwrap();
        assert_eq!(approved.item().id, 1);
        assert_eq!(approved.item().slug, "great-place");
        let review = downcast::<Review>(approved.as_ref()).unwrap();
        assert_eq!(review.rating, 5);

        let (pending, _) = svc
            .repo()
            .query("Review__pending", QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(pending, 0);
        assert_eq!(svc.repo().search("Review", "great", 10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_trusted_submission_is_public() {
        let (_tmp, svc) = service().await;
        let sub = svc
            .api_create("Song", &ctx(&[("title", "Blue"), ("artist", "Someone")]))
            .await
            .unwrap();
        assert_eq!(sub.status, SubmitStatus::Public);
        assert_eq!(sub.id, Some(1));
        let song = svc.repo().find_one_by_target("Song:1").await.unwrap();
        assert_eq!(downcast::<Song>(song.as_ref()).unwrap().artist, "Someone");
    }

    #[tokio::test]
    async fn test_rejected_submissions_write_nothing() {
        let (_tmp, svc) = service().await;
        let err = svc
            .api_create("Review", &ctx(&[("title", "Spam"), ("website", "x.example")]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Rejected(_)));

        let err = svc.api_create("Review", &ctx(&[("body", "no title")])).await.unwrap_err();
        assert!(matches!(err, EngineError::Rejected(_)));

        let err = svc.api_create("FileUpload", &ctx(&[("name", "x")])).await.unwrap_err();
        assert!(matches!(err, EngineError::Unsupported(_)));

        let (pending, _) = svc
            .repo()
            .query("Review__pending", QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(pending, 0);
    }

    #[tokio::test]
    async fn test_api_update_and_delete() {
        let (_tmp, svc) = service().await;
        let created = svc
            .admin_create("Review", &ctx(&[("title", "Draft"), ("rating", "2")]))
            .await
            .unwrap();
        assert_eq!(created.item().id, 1);

        let updated = svc
            .api_update("Review:1", &ctx(&[("rating", "4"), ("slug", "hijack")]))
            .await
            .unwrap();
        let review = downcast::<Review>(updated.as_ref()).unwrap();
        assert_eq!(review.rating, 4);
        assert_eq!(review.title, "Draft");
        assert_eq!(review.item.slug, "draft");

        let err = svc.api_update("Review:1", &ctx(&[("rating", "11")])).await.unwrap_err();
        assert!(matches!(err, EngineError::Rejected(_)));

        svc.api_delete("Review:1", &HookContext::default()).await.unwrap();
        assert!(svc.repo().find_one_by_target("Review:1").await.unwrap_err().is_not_found());

        svc.admin_create("Song", &ctx(&[("title", "Locked")])).await.unwrap();
        let err = svc.api_delete("Song:1", &HookContext::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_reject_and_admin_paths() {
        let (_tmp, svc) = service().await;
        svc.api_create("Review", &ctx(&[("title", "Meh")])).await.unwrap();
        svc.reject("Review__pending:1", &HookContext::default()).await.unwrap();
        assert!(svc
            .repo()
            .find_one_by_target("Review__pending:1")
            .await
            .unwrap_err()
            .is_not_found());
        assert!(svc.reject("Review:1", &HookContext::default()).await.is_err());

        svc.admin_create("Review", &ctx(&[("title", "First")])).await.unwrap();
        let updated = svc
            .admin_update("Review:1", &ctx(&[("body", "now with body")]))
            .await
            .unwrap();
        assert_eq!(downcast::<Review>(updated.as_ref()).unwrap().title, "First");
        svc.admin_delete("Review:1", &HookContext::default()).await.unwrap();
        assert!(svc.repo().find_one_by_slug("first").await.unwrap_err().is_not_found());
    }
}

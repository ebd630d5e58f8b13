//! Sample content types bundled with the `cms` binary.
//!
//! `Review` is searchable and takes moderated submissions; `Song` accepts
//! trusted submissions, can be hidden while in draft and preloads its
//! cover image. Applications embedding the library register their own
//! types instead.

use serde::{Deserialize, Serialize};

use content_engine_core::entity::{
    Approvable, Createable, Deleteable, Entity, FieldKind, FieldSpec, Hideable, HookContext,
    Hooks, Record, Updateable,
};
use content_engine_core::form::parse_integer;
use content_engine_core::{Item, Registry, RegistryError};

/// Registers `Review` and `Song`.
pub fn register(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.register::<Review>("Review")?;
    registry.register::<Song>("Song")?;
    Ok(())
}

fn check_rating(ctx: &HookContext) -> anyhow::Result<()> {
    if let Some(raw) = ctx.form.get("rating") {
        let rating = parse_integer("rating", raw)?;
        if !(0..=5).contains(&rating) {
            anyhow::bail!("rating must be between 0 and 5");
        }
    }
    Ok(())
}

// ============ Review ============

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Review {
    #[serde(flatten)]
    pub item: Item,
    pub title: String,
    pub body: String,
    pub rating: i64,
    pub tags: Vec<String>,
}

impl Record for Review {
    fn item(&self) -> &Item {
        &self.item
    }

    fn item_mut(&mut self) -> &mut Item {
        &mut self.item
    }

    fn display_name(&self) -> String {
        self.title.clone()
    }

    fn hooks(&self) -> Option<&dyn Hooks> {
        Some(self)
    }

    fn createable(&self) -> Option<&dyn Createable> {
        Some(self)
    }

    fn approvable(&self) -> Option<&dyn Approvable> {
        Some(self)
    }

    fn updateable(&self) -> Option<&dyn Updateable> {
        Some(self)
    }

    fn deleteable(&self) -> Option<&dyn Deleteable> {
        Some(self)
    }

    fn csv_fields(&self) -> Option<Vec<String>> {
        Some(
            ["id", "title", "rating", "tags"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }
}

impl Entity for Review {
    fn fields() -> Vec<FieldSpec> {
        vec![
            FieldSpec::text("title").searchable(),
            FieldSpec::text("body").searchable(),
            FieldSpec::new("rating", FieldKind::Integer),
            FieldSpec::new("tags", FieldKind::TextList),
        ]
    }

    fn index_content() -> bool {
        true
    }
}

impl Hooks for Review {
    fn before_api_create(&self, ctx: &HookContext) -> anyhow::Result<()> {
        // honeypot field, left empty by real browsers
        if ctx.form.get("website").is_some_and(|v| !v.is_empty()) {
            anyhow::bail!("submission rejected");
        }
        Ok(())
    }

    fn after_approve(&self, ctx: &HookContext) -> anyhow::Result<()> {
        tracing::info!(record = ?ctx.target, "review approved");
        Ok(())
    }
}

impl Createable for Review {
    fn accept(&self, ctx: &HookContext) -> anyhow::Result<()> {
        if ctx.form.get("title").map_or(true, |t| t.trim().is_empty()) {
            anyhow::bail!("title is required");
        }
        check_rating(ctx)
    }
}

impl Approvable for Review {
    fn approve(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        if self.title.trim().is_empty() {
            anyhow::bail!("untitled reviews can't be approved");
        }
        Ok(())
    }
}

impl Updateable for Review {
    fn update(&self, ctx: &HookContext) -> anyhow::Result<()> {
        check_rating(ctx)
    }
}

impl Deleteable for Review {
    fn delete(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }
}

// ============ Song ============

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Song {
    #[serde(flatten)]
    pub item: Item,
    pub title: String,
    pub artist: String,
    pub rating: i64,
    pub opinion: String,
    /// URL path of an uploaded cover image.
    pub cover: String,
    pub draft: bool,
}

impl Record for Song {
    fn item(&self) -> &Item {
        &self.item
    }

    fn item_mut(&mut self) -> &mut Item {
        &mut self.item
    }

    fn display_name(&self) -> String {
        self.title.clone()
    }

    fn createable(&self) -> Option<&dyn Createable> {
        Some(self)
    }

    fn hideable(&self) -> Option<&dyn Hideable> {
        Some(self)
    }

    fn push_fields(&self) -> Option<Vec<String>> {
        Some(vec!["cover".to_string()])
    }

    fn omit_fields(&self) -> Option<Vec<String>> {
        Some(vec!["opinion".to_string()])
    }
}

impl Entity for Song {
    fn fields() -> Vec<FieldSpec> {
        vec![
            FieldSpec::text("title"),
            FieldSpec::text("artist"),
            FieldSpec::new("rating", FieldKind::Integer),
            FieldSpec::text("opinion"),
            FieldSpec::text("cover"),
            FieldSpec::new("draft", FieldKind::Bool),
        ]
    }
}

impl Createable for Song {
    fn accept(&self, ctx: &HookContext) -> anyhow::Result<()> {
        check_rating(ctx)
    }

    fn auto_approve(&self, _ctx: &HookContext) -> bool {
        true
    }
}

impl Hideable for Song {
    fn hide(&self, _ctx: &HookContext) -> bool {
        self.draft
    }
}

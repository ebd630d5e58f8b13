//! Entity model: the traits a content type implements to be stored,
//! indexed and served.
//!
//! A content type is a plain serde struct that flattens an [`Item`] and
//! implements [`Record`] (identity plus optional capabilities) and
//! [`Entity`] (field descriptors). The [`Registry`](crate::Registry) erases
//! concrete types to `Box<dyn Record>` so storage and transport code can
//! handle every registered type uniformly.
//!
//! # Capabilities
//!
//! | Accessor | Trait | Effect when present |
//! |----------|-------|---------------------|
//! | [`Record::hooks`] | [`Hooks`] | lifecycle callbacks |
//! | [`Record::createable`] | [`Createable`] | external submissions accepted |
//! | [`Record::approvable`] | [`Approvable`] | custom approval check |
//! | [`Record::updateable`] | [`Updateable`] | API updates accepted |
//! | [`Record::deleteable`] | [`Deleteable`] | API deletes accepted |
//! | [`Record::hideable`] | [`Hideable`] | record may be hidden from the API |
//! | [`Record::push_fields`] | — | fields whose values are preloaded |
//! | [`Record::omit_fields`] | — | fields removed from API responses |
//! | [`Record::csv_fields`] | — | fields included in CSV export |

use std::any::Any;
use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::form::FormValues;
use crate::item::Item;

// ============ Field descriptors ============

/// Logical type of a declared field, used for form decoding and search mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    TextList,
    Integer,
    Float,
    Bool,
    Json,
}

/// A declared attribute of an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub searchable: bool,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            searchable: false,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Text)
    }

    /// Marks the field for inclusion in the type's search index.
    pub fn searchable(mut self) -> Self {
        self.searchable = true;
        self
    }
}

// ============ Hook context ============

/// Request context handed to hooks and capability checks.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    /// `"T:id"` of the record once it has been written.
    pub target: Option<String>,
    pub remote_addr: Option<String>,
    /// Request headers, keyed by lowercase name.
    pub headers: BTreeMap<String, String>,
    pub form: FormValues,
}

impl HookContext {
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_str())
    }
}

// ============ Capabilities ============

/// Lifecycle callbacks. Every method defaults to a no-op.
///
/// Errors from a `before_*` hook abort the operation before anything is
/// written. Errors from an `after_*` hook are logged by the caller.
pub trait Hooks: Send + Sync {
    fn before_save(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }
    fn after_save(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }
    fn before_admin_create(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }
    fn after_admin_create(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }
    fn before_admin_update(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }
    fn after_admin_update(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }
    fn before_admin_delete(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }
    fn after_admin_delete(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }
    fn before_delete(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }
    fn after_delete(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }
    fn before_approve(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }
    fn after_approve(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }
    fn before_reject(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }
    fn after_reject(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }
    fn before_api_create(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }
    fn after_api_create(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }
    fn before_api_update(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }
    fn after_api_update(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }
    fn before_api_delete(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }
    fn after_api_delete(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Types that accept submissions from outside the admin.
pub trait Createable: Send + Sync {
    /// Rejects a submission by returning an error.
    fn accept(&self, ctx: &HookContext) -> anyhow::Result<()>;

    /// Trusted submissions skip the pending queue.
    fn auto_approve(&self, _ctx: &HookContext) -> bool {
        false
    }
}

pub trait Approvable: Send + Sync {
    fn approve(&self, ctx: &HookContext) -> anyhow::Result<()>;
}

pub trait Updateable: Send + Sync {
    fn update(&self, ctx: &HookContext) -> anyhow::Result<()>;
}

pub trait Deleteable: Send + Sync {
    fn delete(&self, ctx: &HookContext) -> anyhow::Result<()>;
}

pub trait Hideable: Send + Sync {
    /// Returns `true` when the record must not be served for this request.
    fn hide(&self, ctx: &HookContext) -> bool;
}

// ============ Record ============

/// Type-erased view of a content record.
///
/// Implemented by hand for each content type; the codec half comes from
/// the blanket [`RecordCodec`] impl.
pub trait Record: RecordCodec + Send + Sync {
    fn item(&self) -> &Item;
    fn item_mut(&mut self) -> &mut Item;

    /// Human-readable name, used to derive the slug.
    fn display_name(&self) -> String {
        self.item().default_name()
    }

    fn hooks(&self) -> Option<&dyn Hooks> {
        None
    }
    fn createable(&self) -> Option<&dyn Createable> {
        None
    }
    fn approvable(&self) -> Option<&dyn Approvable> {
        None
    }
    fn updateable(&self) -> Option<&dyn Updateable> {
        None
    }
    fn deleteable(&self) -> Option<&dyn Deleteable> {
        None
    }
    fn hideable(&self) -> Option<&dyn Hideable> {
        None
    }
    fn push_fields(&self) -> Option<Vec<String>> {
        None
    }
    fn omit_fields(&self) -> Option<Vec<String>> {
        None
    }
    fn csv_fields(&self) -> Option<Vec<String>> {
        None
    }
}

impl std::fmt::Debug for dyn Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Record").field(self.item()).finish()
    }
}

/// JSON encoding and cloning for boxed records.
pub trait RecordCodec {
    fn to_json(&self) -> serde_json::Result<serde_json::Value>;
    fn to_bytes(&self) -> serde_json::Result<Vec<u8>>;
    fn boxed_clone(&self) -> Box<dyn Record>;
    fn as_any(&self) -> &dyn Any;
}

impl<T> RecordCodec for T
where
    T: Record + Serialize + Clone + 'static,
{
    fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }

    fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    fn boxed_clone(&self) -> Box<dyn Record> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Clone for Box<dyn Record> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

/// A registrable content type.
pub trait Entity: Record + Serialize + DeserializeOwned + Default + Clone + 'static {
    /// Declared fields, in form order.
    fn fields() -> Vec<FieldSpec>;

    /// Whether records of this type are kept in a search index.
    fn index_content() -> bool {
        false
    }
}

/// Borrows a boxed record as its concrete type.
pub fn downcast<T: Entity>(record: &dyn Record) -> Option<&T> {
    record.as_any().downcast_ref::<T>()
}

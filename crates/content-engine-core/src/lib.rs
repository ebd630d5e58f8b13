//! # Content Engine Core
//!
//! Shared, storage-agnostic logic for Content Engine: the entity model and
//! capability traits, the type registry, form decoding, slug derivation,
//! search query parsing, target addressing, and analytics date math.
//!
//! This crate contains no tokio, sqlx or filesystem I/O.

pub mod analytics;
pub mod entity;
pub mod form;
pub mod item;
pub mod query;
pub mod registry;
pub mod settings;
pub mod slug;
pub mod target;
pub mod upload;

pub use entity::{
    downcast, Approvable, Createable, Deleteable, Entity, FieldKind, FieldSpec, Hideable,
    HookContext, Hooks, Record, RecordCodec, Updateable,
};
pub use form::FormValues;
pub use item::Item;
pub use registry::{EntityType, Registry, RegistryError};
pub use target::Target;
pub use upload::FileUpload;

//! Content type registry.
//!
//! Maps a type tag (`"Review"`) to the constructor, decoders and field
//! descriptors of a concrete [`Entity`]. Populated once at startup and
//! shared read-only afterwards.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::entity::{Entity, FieldKind, FieldSpec, Record};
use crate::form::{FormError, FormValues};
use crate::upload::{FileUpload, FILE_UPLOAD_TYPE};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid type name '{0}': use letters, digits and single underscores")]
    InvalidName(String),
    #[error("type '{0}' is already registered")]
    Duplicate(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error(transparent)]
    Form(#[from] FormError),
    #[error("failed to decode record: {0}")]
    Json(#[from] serde_json::Error),
}

/// Runtime descriptor for one registered content type.
#[derive(Clone)]
pub struct EntityType {
    name: String,
    fields: Vec<FieldSpec>,
    index_content: bool,
    new_fn: fn() -> Box<dyn Record>,
    from_value_fn: fn(Value) -> serde_json::Result<Box<dyn Record>>,
}

fn new_boxed<T: Entity>() -> Box<dyn Record> {
    Box::new(T::default())
}

fn from_value_boxed<T: Entity>(value: Value) -> serde_json::Result<Box<dyn Record>> {
    let record: T = serde_json::from_value(value)?;
    Ok(Box::new(record))
}

impl EntityType {
    fn of<T: Entity>(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: T::fields(),
            index_content: T::index_content(),
            new_fn: new_boxed::<T>,
            from_value_fn: from_value_boxed::<T>,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn index_content(&self) -> bool {
        self.index_content
    }

    /// Fields marked searchable, with their kinds.
    pub fn searchable_fields(&self) -> Vec<(&str, FieldKind)> {
        self.fields
            .iter()
            .filter(|f| f.searchable)
            .map(|f| (f.name.as_str(), f.kind))
            .collect()
    }

    /// A zero-valued record.
    pub fn new_record(&self) -> Box<dyn Record> {
        (self.new_fn)()
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Box<dyn Record>, DecodeError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Ok((self.from_value_fn)(value)?)
    }

    pub fn from_json(&self, value: Value) -> Result<Box<dyn Record>, DecodeError> {
        Ok((self.from_value_fn)(value)?)
    }

    /// Builds a fresh record from form data. Missing fields take their
    /// default values.
    pub fn decode_form(&self, form: &FormValues) -> Result<Box<dyn Record>, DecodeError> {
        let mut form = form.clone();
        form.normalize_indexed();
        let map = form.to_json_map(&self.fields)?;
        self.from_json(Value::Object(map))
    }

    /// Overlays form data onto an existing record. Fields missing from the
    /// form keep their current values; `id`, `uuid` and `slug` can't be
    /// changed this way.
    pub fn merge_form(
        &self,
        existing: &dyn Record,
        form: &FormValues,
    ) -> Result<Box<dyn Record>, DecodeError> {
        let mut form = form.clone();
        form.normalize_indexed();
        for key in ["id", "uuid", "slug"] {
            form.remove(key);
        }

        let mut base = match existing.to_json()? {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        for (k, v) in form.to_json_map(&self.fields)? {
            base.insert(k, v);
        }
        self.from_json(Value::Object(base))
    }
}

/// All registered content types, keyed by name.
#[derive(Clone)]
pub struct Registry {
    types: BTreeMap<String, EntityType>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// A registry holding only the built-in `FileUpload` type.
    pub fn new() -> Self {
        let mut types = BTreeMap::new();
        types.insert(
            FILE_UPLOAD_TYPE.to_string(),
            EntityType::of::<FileUpload>(FILE_UPLOAD_TYPE),
        );
        Self { types }
    }

    pub fn register<T: Entity>(&mut self, name: &str) -> Result<&mut Self, RegistryError> {
        if !is_valid_type_name(name) {
            return Err(RegistryError::InvalidName(name.to_string()));
        }
        if self.types.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        self.types.insert(name.to_string(), EntityType::of::<T>(name));
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&EntityType> {
        self.types.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(|k| k.as_str())
    }

    pub fn types(&self) -> impl Iterator<Item = &EntityType> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

fn is_valid_type_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.contains("__")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Item;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(default)]
    struct Post {
        #[serde(flatten)]
        item: Item,
        title: String,
        tags: Vec<String>,
        views: i64,
    }

    impl Record for Post {
        fn item(&self) -> &Item {
            &self.item
        }
        fn item_mut(&mut self) -> &mut Item {
            &mut self.item
        }
    }

    impl Entity for Post {
        fn fields() -> Vec<FieldSpec> {
            vec![
                FieldSpec::text("title").searchable(),
                FieldSpec::new("tags", FieldKind::TextList),
                FieldSpec::new("views", FieldKind::Integer),
            ]
        }
        fn index_content() -> bool {
            true
        }
    }

    fn registry() -> Registry {
        let mut r = Registry::new();
        r.register::<Post>("Post").unwrap();
        r
    }

    #[test]
    fn test_file_upload_is_preregistered() {
        let r = Registry::new();
        assert!(r.contains("FileUpload"));
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn test_register_rejects_bad_and_duplicate_names() {
        let mut r = registry();
        assert_eq!(
            r.register::<Post>("Post").err(),
            Some(RegistryError::Duplicate("Post".into()))
        );
        assert!(r.register::<Post>("Bad__Name").is_err());
        assert!(r.register::<Post>("has:colon").is_err());
        assert!(r.register::<Post>("").is_err());
    }

    #[test]
    fn test_decode_form_with_indexed_tags() {
        let r = registry();
        let ty = r.get("Post").unwrap();
        let form = FormValues::from_pairs([("title", "A"), ("tags.0", "x"), ("tags.1", "y")]);
        let rec = ty.decode_form(&form).unwrap();
        let json = rec.to_json().unwrap();
        assert_eq!(json["title"], "A");
        assert_eq!(json["tags"], serde_json::json!(["x", "y"]));
        assert_eq!(json["views"], 0);
    }

    #[test]
    fn test_merge_keeps_identity() {
        let r = registry();
        let ty = r.get("Post").unwrap();
        let mut existing = Post {
            title: "Old".into(),
            views: 5,
            ..Default::default()
        };
        existing.item.id = 9;
        existing.item.slug = "old".into();

        let form = FormValues::from_pairs([("title", "New"), ("id", "99"), ("slug", "hijack")]);
        let merged = ty.merge_form(&existing, &form).unwrap();
        assert_eq!(merged.item().id, 9);
        assert_eq!(merged.item().slug, "old");
        let json = merged.to_json().unwrap();
        assert_eq!(json["title"], "New");
        assert_eq!(json["views"], 5);
    }

    #[test]
    fn test_searchable_fields() {
        let r = registry();
        let ty = r.get("Post").unwrap();
        assert!(ty.index_content());
        assert_eq!(ty.searchable_fields(), vec![("title", FieldKind::Text)]);
    }
}

//! The built-in `FileUpload` content type.

use serde::{Deserialize, Serialize};

use crate::entity::{Entity, FieldKind, FieldSpec, Record};
use crate::item::Item;

pub const FILE_UPLOAD_TYPE: &str = "FileUpload";

/// Metadata record for a file stored under the uploads directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileUpload {
    #[serde(flatten)]
    pub item: Item,
    pub name: String,
    /// Public URL path, e.g. `/api/uploads/2024/03/photo.jpg`.
    pub path: String,
    pub content_length: i64,
    pub content_type: String,
}

impl Record for FileUpload {
    fn item(&self) -> &Item {
        &self.item
    }

    fn item_mut(&mut self) -> &mut Item {
        &mut self.item
    }

    fn display_name(&self) -> String {
        self.name.clone()
    }

    fn push_fields(&self) -> Option<Vec<String>> {
        Some(vec!["path".to_string()])
    }
}

impl Entity for FileUpload {
    fn fields() -> Vec<FieldSpec> {
        vec![
            FieldSpec::text("name"),
            FieldSpec::text("path"),
            FieldSpec::new("content_length", FieldKind::Integer),
            FieldSpec::text("content_type"),
        ]
    }
}

//! Identity and timestamps shared by every content record.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata embedded in every content record.
///
/// Entities flatten this struct into their own JSON encoding, so a stored
/// record looks like `{"uuid": "...", "id": 1, "slug": "hello", ...fields}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    #[serde(default)]
    pub uuid: Uuid,
    /// Sequence id within the record's bucket. `0` means "not yet assigned".
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub slug: String,
    /// Creation time, milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
    /// Last update time, milliseconds since the Unix epoch.
    #[serde(default)]
    pub updated: i64,
}

impl Item {
    pub fn is_new(&self) -> bool {
        self.id == 0
    }

    /// Fallback display name for records that don't provide one.
    pub fn default_name(&self) -> String {
        format!("Item ID: {}", self.uuid)
    }
}

//! The site settings record stored under `__config/settings`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{FieldKind, FieldSpec};
use crate::form::FormValues;
use crate::registry::DecodeError;

/// `Cache-Control: max-age` used when `cache_max_age` is unset (30 days).
pub const DEFAULT_MAX_AGE: i64 = 60 * 60 * 24 * 30;

/// Value of `cache_invalidate` that requests a new ETag.
pub const INVALIDATE: &str = "invalidate";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub name: String,
    pub domain: String,
    pub bind_addr: String,
    pub http_port: String,
    pub https_port: String,
    pub admin_email: String,
    pub client_secret: String,
    pub etag: String,
    pub cache_max_age: i64,
    pub cache_disabled: bool,
    pub cache_invalidate: Vec<String>,
    pub cors_disabled: bool,
    pub gzip_disabled: bool,
    pub backup_basic_auth_user: String,
    pub backup_basic_auth_password: String,
}

impl Settings {
    pub fn fields() -> Vec<FieldSpec> {
        let text = [
            "name",
            "domain",
            "bind_addr",
            "http_port",
            "https_port",
            "admin_email",
            "client_secret",
            "etag",
            "backup_basic_auth_user",
            "backup_basic_auth_password",
        ];
        let flags = ["cache_disabled", "cors_disabled", "gzip_disabled"];

        let mut fields: Vec<FieldSpec> = text.iter().map(|n| FieldSpec::text(*n)).collect();
        fields.extend(flags.iter().map(|n| FieldSpec::new(*n, FieldKind::Bool)));
        fields.push(FieldSpec::new("cache_max_age", FieldKind::Integer));
        fields.push(FieldSpec::new("cache_invalidate", FieldKind::TextList));
        fields
    }

    /// Decodes a settings form. Unknown keys are ignored.
    pub fn from_form(form: &FormValues) -> Result<Self, DecodeError> {
        let mut form = form.clone();
        form.normalize_indexed();
        let map = form.to_json_map(&Self::fields())?;
        Ok(serde_json::from_value(Value::Object(map))?)
    }

    pub fn wants_invalidate(&self) -> bool {
        self.cache_invalidate.first().map(|v| v.as_str()) == Some(INVALIDATE)
    }

    pub fn max_age(&self) -> i64 {
        if self.cache_max_age > 0 {
            self.cache_max_age
        } else {
            DEFAULT_MAX_AGE
        }
    }
}

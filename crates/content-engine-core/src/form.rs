//! Multi-value form data and its decoding into entity JSON.
//!
//! Form submissions arrive as `key → [values]`. Repeated inputs such as
//! checkbox groups are posted as `field.0`, `field.1`, … and are coalesced
//! into a single ordered multi-value by [`FormValues::normalize_indexed`]
//! before decoding.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::entity::{FieldKind, FieldSpec};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FormError {
    #[error("field '{field}': expected {expected}, got '{value}'")]
    InvalidValue {
        field: String,
        value: String,
        expected: &'static str,
    },
}

/// Ordered multi-valued form data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormValues {
    values: BTreeMap<String, Vec<String>>,
}

impl FormValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds form values from `(key, value)` pairs, keeping repeat order.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut form = Self::new();
        for (k, v) in pairs {
            form.add(k, v);
        }
        form
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .and_then(|v| v.first())
            .map(|s| s.as_str())
    }

    pub fn get_all(&self, key: &str) -> &[String] {
        self.values.get(key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), vec![value.into()]);
    }

    pub fn set_all(&mut self, key: impl Into<String>, values: Vec<String>) {
        self.values.insert(key.into(), values);
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.entry(key.into()).or_default().push(value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.values.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Coalesces `field.N` keys into `field`, ordered by `N`.
    ///
    /// If `field` already holds a non-empty value the indexed values are
    /// appended, otherwise they replace it. Keys whose suffix is not a
    /// number are left untouched.
    pub fn normalize_indexed(&mut self) {
        let mut grouped: BTreeMap<String, Vec<(usize, Vec<String>)>> = BTreeMap::new();
        let indexed: Vec<String> = self
            .values
            .keys()
            .filter(|k| {
                k.split_once('.')
                    .map(|(_, idx)| idx.parse::<usize>().is_ok())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        for key in indexed {
            if let (Some((field, idx)), Some(values)) =
                (key.split_once('.'), self.values.get(&key).cloned())
            {
                if let Ok(idx) = idx.parse::<usize>() {
                    grouped
                        .entry(field.to_string())
                        .or_default()
                        .push((idx, values));
                }
            }
            self.values.remove(&key);
        }

        for (field, mut parts) in grouped {
            parts.sort_by_key(|(idx, _)| *idx);
            for (_, values) in parts {
                let empty = self.get(&field).map(|v| v.is_empty()).unwrap_or(true);
                if empty {
                    self.set_all(field.clone(), values);
                } else {
                    self.values.entry(field.clone()).or_default().extend(values);
                }
            }
        }
    }

    /// Decodes the declared fields plus the item keys into a JSON object.
    ///
    /// Fields absent from the form are left out so callers can merge the
    /// result over existing data or let serde defaults apply.
    pub fn to_json_map(&self, fields: &[FieldSpec]) -> Result<Map<String, Value>, FormError> {
        let mut out = Map::new();

        if let Some(id) = self.non_empty("id") {
            let parsed = id.parse::<u64>().map_err(|_| invalid("id", id, "an unsigned integer"))?;
            out.insert("id".into(), Value::from(parsed));
        }
        if let Some(uuid) = self.non_empty("uuid") {
            out.insert("uuid".into(), Value::from(uuid));
        }
        if let Some(slug) = self.get("slug") {
            out.insert("slug".into(), Value::from(slug));
        }
        for key in ["timestamp", "updated"] {
            if let Some(raw) = self.non_empty(key) {
                out.insert(key.into(), Value::from(parse_integer(key, raw)?));
            }
        }

        for desc in fields {
            if !self.contains_key(&desc.name) {
                continue;
            }
            let name = desc.name.as_str();
            let value = match desc.kind {
                FieldKind::TextList => Value::from(self.get_all(name).to_vec()),
                FieldKind::Text => Value::from(self.get(name).unwrap_or_default()),
                FieldKind::Integer => match self.non_empty(name) {
                    Some(raw) => Value::from(parse_integer(name, raw)?),
                    None => continue,
                },
                FieldKind::Float => match self.non_empty(name) {
                    Some(raw) => {
                        let f = raw
                            .trim()
                            .parse::<f64>()
                            .map_err(|_| invalid(name, raw, "a number"))?;
                        Value::from(f)
                    }
                    None => continue,
                },
                FieldKind::Bool => Value::from(parse_bool(name, self.get(name).unwrap_or(""))?),
                FieldKind::Json => match self.non_empty(name) {
                    Some(raw) => {
                        serde_json::from_str(raw).map_err(|_| invalid(name, raw, "JSON"))?
                    }
                    None => continue,
                },
            };
            out.insert(desc.name.clone(), value);
        }

        Ok(out)
    }

    fn non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.trim().is_empty())
    }
}

fn invalid(field: &str, value: &str, expected: &'static str) -> FormError {
    FormError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        expected,
    }
}

/// Parses an integer, truncating float input such as `"2592000.0"`.
pub fn parse_integer(field: &str, raw: &str) -> Result<i64, FormError> {
    let raw_trimmed = raw.trim();
    if let Ok(i) = raw_trimmed.parse::<i64>() {
        return Ok(i);
    }
    match raw_trimmed.parse::<f64>() {
        Ok(f) if f.is_finite() => Ok(f.trunc() as i64),
        _ => Err(invalid(field, raw, "an integer")),
    }
}

fn parse_bool(field: &str, raw: &str) -> Result<bool, FormError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "1" | "yes" => Ok(true),
        "false" | "off" | "0" | "no" | "" => Ok(false),
        _ => Err(invalid(field, raw, "a boolean")),
    }
}

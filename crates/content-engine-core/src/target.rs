//! `"Type:id"` addressing and bucket naming.

use std::fmt;
use std::str::FromStr;

pub const SORTED_SUFFIX: &str = "__sorted";
pub const PENDING_SUFFIX: &str = "__pending";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("malformed target '{0}', expected Type:id")]
    Malformed(String),
    #[error("invalid id '{0}'")]
    InvalidId(String),
}

/// Address of one stored record: the bucket it lives in and its id.
///
/// The bucket may be a primary type name (`Review`) or a sub-bucket
/// (`Review__pending`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub bucket: String,
    pub id: u64,
}

impl Target {
    pub fn new(bucket: impl Into<String>, id: u64) -> Self {
        Self {
            bucket: bucket.into(),
            id,
        }
    }

    /// The registered type name, with any `__suffix` removed.
    pub fn type_name(&self) -> &str {
        base_type(&self.bucket)
    }

    pub fn is_primary(&self) -> bool {
        !self.bucket.contains("__")
    }

    pub fn key(&self) -> String {
        self.id.to_string()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bucket, self.id)
    }
}

impl FromStr for Target {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bucket, id) = s
            .rsplit_once(':')
            .ok_or_else(|| TargetError::Malformed(s.to_string()))?;
        if bucket.is_empty() {
            return Err(TargetError::Malformed(s.to_string()));
        }
        if !is_valid_id(id) {
            return Err(TargetError::InvalidId(id.to_string()));
        }
        let id = id
            .parse::<u64>()
            .map_err(|_| TargetError::InvalidId(id.to_string()))?;
        Ok(Self::new(bucket, id))
    }
}

/// An id is valid when it parses as an integer `>= 1`.
pub fn is_valid_id(id: &str) -> bool {
    matches!(id.trim().parse::<u64>(), Ok(n) if n >= 1)
}

pub fn sorted_bucket(type_name: &str) -> String {
    format!("{}{}", type_name, SORTED_SUFFIX)
}

pub fn pending_bucket(type_name: &str) -> String {
    format!("{}{}", type_name, PENDING_SUFFIX)
}

/// Strips a `__suffix` from a bucket name.
pub fn base_type(bucket: &str) -> &str {
    match bucket.find("__") {
        Some(0) | None => bucket,
        Some(i) => &bucket[..i],
    }
}

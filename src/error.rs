//! Error taxonomy shared by the engine's services.
//!
//! Every fallible library operation returns [`EngineError`]. The HTTP layer
//! turns [`EngineError::kind`] into a status code; the CLI wraps errors in
//! `anyhow` for display.

use content_engine_core::form::FormError;
use content_engine_core::query::QueryError;
use content_engine_core::registry::DecodeError;
use content_engine_core::target::TargetError;

use crate::kv::KvError;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not permitted: {0}")]
    Auth(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A registered type is missing its buckets.
    #[error("store not initialized: {0}")]
    NotInitialized(String),

    /// A `before_*` hook or capability check refused the operation.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("storage error: {0}")]
    Kv(#[from] KvError),

    #[error("search index error: {0}")]
    Search(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// A content type is declared in a way the engine can't use.
    #[error("programming error: {0}")]
    Programming(String),
}

/// Coarse error classes, used for status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidInput,
    Auth,
    Unsupported,
    Transient,
    Programming,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::InvalidInput(_) | EngineError::Rejected(_) => ErrorKind::InvalidInput,
            EngineError::Auth(_) => ErrorKind::Auth,
            EngineError::Unsupported(_) => ErrorKind::Unsupported,
            EngineError::Kv(KvError::BucketNotFound(_) | KvError::ReadOnly)
            | EngineError::NotInitialized(_) => {
                ErrorKind::Programming
            }
            EngineError::Kv(_) | EngineError::Search(_) | EngineError::Io(_) | EngineError::Json(_) => {
                ErrorKind::Transient
            }
            EngineError::Programming(_) => ErrorKind::Programming,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub(crate) fn unregistered(type_name: &str) -> Self {
        EngineError::InvalidInput(format!("content type '{}' is not registered", type_name))
    }
}

impl From<TargetError> for EngineError {
    fn from(e: TargetError) -> Self {
        EngineError::InvalidInput(e.to_string())
    }
}

impl From<QueryError> for EngineError {
    fn from(e: QueryError) -> Self {
        EngineError::InvalidInput(e.to_string())
    }
}

impl From<FormError> for EngineError {
    fn from(e: FormError) -> Self {
        EngineError::InvalidInput(e.to_string())
    }
}

impl From<DecodeError> for EngineError {
    fn from(e: DecodeError) -> Self {
        EngineError::InvalidInput(e.to_string())
    }
}

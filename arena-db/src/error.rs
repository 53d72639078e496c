//! Error taxonomy shared by the storage manager and both backends.
//!
//! The kinds mirror spec §7: Validation, NotFound, Duplicate, Backend,
//! Transaction, Performance. Validation never touches a backend; NotFound and
//! Duplicate are distinct from generic failure so callers can branch on them
//! without string matching.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("transaction failed: {0}")]
    Transaction(String),

    #[error("operation not connected to a backend")]
    NotConnected,

    #[error("performance budget exceeded: {0}")]
    Performance(String),
}

impl StorageError {
    pub fn kind(&self) -> StorageErrorKind {
        match self {
            StorageError::Validation(_) => StorageErrorKind::Validation,
            StorageError::NotFound(_) => StorageErrorKind::NotFound,
            StorageError::Duplicate(_) => StorageErrorKind::Duplicate,
            StorageError::Backend(_) => StorageErrorKind::Backend,
            StorageError::NotConnected => StorageErrorKind::Backend,
            StorageError::Transaction(_) => StorageErrorKind::Transaction,
            StorageError::Performance(_) => StorageErrorKind::Performance,
        }
    }

    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        StorageError::Backend(Box::new(err))
    }
}

/// Kind discriminant, used by callers (HTTP mapping, retry policy) that need
/// to branch on error class without matching the full enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    Validation,
    NotFound,
    Duplicate,
    Backend,
    Transaction,
    Performance,
}

pub type StorageResult<T> = Result<T, StorageError>;

impl From<diesel::result::Error> for StorageError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::NotFound => StorageError::NotFound(String::new()),
            other => StorageError::backend(other),
        }
    }
}

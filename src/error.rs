//! Errors surfaced by [`ResourceEngine`](crate::ResourceEngine) operations.

use thiserror::Error;

use crate::lock::LockError;
use crate::storage::traits::StorageError;
use crate::topic::TopicError;

#[derive(Error, Debug)]
pub enum ResourceError {
    /// Etag precondition failed; nothing was written
    #[error("Precondition failed for '{url}' (current etag: {etag})")]
    Conflict { url: String, etag: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    /// A compute transform returned an error; nothing was written
    #[error("Transform failed: {0}")]
    Transform(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Topic(#[from] TopicError),
}

impl ResourceError {
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, ResourceError::Conflict { .. })
    }
}

impl From<crate::compression::CompressionError> for ResourceError {
    fn from(e: crate::compression::CompressionError) -> Self {
        ResourceError::Storage(StorageError::Backend(e.to_string()))
    }
}

pub type Result<T, E = ResourceError> = std::result::Result<T, E>;

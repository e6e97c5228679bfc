//! Error types shared by the repositories

use crate::cache::CacheError;
use crate::hasher::HashError;
use crate::model::PackageStatus;
use crate::remote::RemoteError;

/// Result type for repository operations
pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Failure outcome of a repository operation
///
/// Collaborator errors are converted into this type at the repository
/// boundary; nothing else escapes to callers.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("You appear to be offline. Connect to a network and try again.")]
    Offline,

    #[error("{entity} not found: {key}")]
    NotFound { entity: String, key: String },

    #[error("Email is already registered: {0}")]
    EmailTaken(String),

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Cannot change package status from {from} to {to}")]
    InvalidTransition { from: PackageStatus, to: PackageStatus },

    #[error("Remote store error: {0}")]
    RemoteFailure(RemoteError),

    #[error("Password hashing failed: {0}")]
    HashingFailure(#[from] HashError),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Local cache error: {0}")]
    Cache(#[from] CacheError),
}

impl RepositoryError {
    pub fn not_found(entity: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            key: key.into(),
        }
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, Self::Offline)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<RemoteError> for RepositoryError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::NotFound { collection, id } => Self::NotFound {
                entity: collection,
                key: id,
            },
            other => Self::RemoteFailure(other),
        }
    }
}

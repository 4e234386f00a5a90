use crate::repository::BatchLink;
use crate::shortcode::ShortCode;
use thiserror::Error;

/// Result type for repository and shortener operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;

#[derive(Debug, Clone, Error)]
pub enum RepositoryError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    /// The original URL already has a live mapping. Carries the existing code,
    /// which callers should treat as the answer.
    #[error("url already shortened as {0}")]
    AlreadyExists(ShortCode),
    /// At least one URL of a batch already has a live mapping and nothing was
    /// stored.
    ///
    /// `conflicts` holds the existing codes of the offending items, `links`
    /// holds the codes that were assigned to the remaining items before the
    /// batch was abandoned.
    #[error("{} batch url(s) already shortened", conflicts.len())]
    BatchAlreadyExists {
        links: Vec<BatchLink>,
        conflicts: Vec<BatchLink>,
    },
    #[error("every candidate short code is already taken")]
    MaxRetriesExceeded,
    #[error("short code not found: {0}")]
    NotFound(String),
    #[error("short code was deleted: {0}")]
    Deleted(String),
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("storage query failed: {0}")]
    Storage(String),
    #[error("link log write failed: {0}")]
    Persistence(String),
}

impl RepositoryError {
    /// Returns `true` for both the single and the batch "already exists" outcome.
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            RepositoryError::AlreadyExists(_) | RepositoryError::BatchAlreadyExists { .. }
        )
    }
}

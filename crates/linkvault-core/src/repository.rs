use crate::error::Result;
use crate::shortcode::ShortCode;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Opaque identity of whoever created a link (a session or user id).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored mapping between a short code and the URL it stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRecord {
    pub code: ShortCode,
    pub original_url: String,
    pub owner: OwnerId,
    /// Soft-delete flag. Deleted records keep their code reserved forever.
    pub deleted: bool,
}

/// A live link as returned by "list my links".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedLink {
    pub code: ShortCode,
    pub original_url: String,
}

/// One entry of a batch creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    /// Caller-chosen identifier echoed back in the result.
    pub correlation_id: String,
    pub original_url: String,
}

impl BatchItem {
    pub fn new(correlation_id: impl Into<String>, original_url: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            original_url: original_url.into(),
        }
    }
}

/// Outcome of one batch entry: the correlation id and its short code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLink {
    pub correlation_id: String,
    pub code: ShortCode,
}

/// Storage contract shared by the in-memory and the durable backend.
///
/// Implementations receive pre-generated candidate codes and never generate
/// codes themselves. All methods are safe to call concurrently.
#[async_trait]
pub trait LinkRepository: Send + Sync + 'static {
    /// Resolves a short code to its original URL.
    ///
    /// Returns `Err(NotFound)` for codes that never existed and
    /// `Err(Deleted)` for codes whose record was soft-deleted.
    async fn get_original_url(&self, code: &ShortCode) -> Result<String>;

    /// Stores `original_url` under the first candidate code that is free.
    ///
    /// Returns `Err(AlreadyExists(existing))` when the URL already has a live
    /// mapping and `Err(MaxRetriesExceeded)` when every candidate is taken.
    async fn create_link(
        &self,
        original_url: &str,
        candidates: &[ShortCode],
        owner: &OwnerId,
    ) -> Result<ShortCode>;

    /// Stores a whole batch, all or nothing.
    ///
    /// `candidates[i]` are the candidate codes for `items[i]`. If any URL
    /// already has a live mapping nothing is stored and
    /// `Err(BatchAlreadyExists)` is returned.
    async fn create_links_batch(
        &self,
        items: &[BatchItem],
        candidates: &[Vec<ShortCode>],
        owner: &OwnerId,
    ) -> Result<Vec<BatchLink>>;

    /// Lists the live links created by `owner`.
    async fn list_links_of_owner(&self, owner: &OwnerId) -> Result<Vec<OwnedLink>>;

    /// Soft-deletes the given codes if they belong to `owner`.
    ///
    /// Codes that are unknown or owned by someone else are skipped silently.
    /// Backends may apply the deletion asynchronously.
    async fn soft_delete(&self, codes: &[ShortCode], owner: &OwnerId) -> Result<()>;

    /// Checks that a durable backend is reachable.
    ///
    /// Backends without durable storage report `Err(Unavailable)`.
    async fn health_check(&self) -> Result<()>;
}

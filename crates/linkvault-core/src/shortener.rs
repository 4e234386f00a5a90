use crate::error::Result;
use crate::repository::{BatchItem, BatchLink, OwnedLink, OwnerId};
use crate::shortcode::ShortCode;
use async_trait::async_trait;

/// Contract consumed by request-handling adapters (HTTP, RPC, CLI).
///
/// Unlike [`LinkRepository`](crate::LinkRepository) it takes raw input:
/// URLs are validated and candidate codes are generated behind it.
#[async_trait]
pub trait Shortener: Send + Sync + 'static {
    /// Resolves a short code to the original URL.
    async fn get_original_url(&self, code: &str) -> Result<String>;

    /// Shortens a URL. A repeated URL yields `Err(AlreadyExists(code))`.
    async fn create_link(&self, url: &str, owner: &OwnerId) -> Result<ShortCode>;

    /// Shortens a batch of URLs.
    async fn create_links_batch(
        &self,
        items: &[BatchItem],
        owner: &OwnerId,
    ) -> Result<Vec<BatchLink>>;

    /// Lists the live links of `owner`.
    async fn list_links_of_owner(&self, owner: &OwnerId) -> Result<Vec<OwnedLink>>;

    /// Requests deletion of the given codes on behalf of `owner`.
    async fn delete_links(&self, codes: &[String], owner: &OwnerId) -> Result<()>;

    /// Reports whether the durable backend is reachable.
    async fn ping(&self) -> Result<()>;
}

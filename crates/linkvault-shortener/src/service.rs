use async_trait::async_trait;
use linkvault_core::url::validate_url;
use linkvault_core::{
    BatchItem, BatchLink, LinkRepository, OwnedLink, OwnerId, RepositoryError, Result, ShortCode,
    Shortener,
};
use linkvault_generator::Generator;
use std::sync::Arc;
use tracing::debug;

/// Candidate codes generated per link when none is configured.
pub const DEFAULT_CANDIDATES: usize = 5;

/// A concrete implementation of the [`Shortener`] trait.
///
/// This service wraps a [`LinkRepository`] and a [`Generator`]:
/// - URLs are validated before the repository sees them
/// - every link gets a fresh list of candidate codes, and the repository
///   picks the first one that does not collide
#[derive(Debug)]
pub struct LinkService<R, G> {
    repository: Arc<R>,
    generator: Arc<G>,
    candidates: usize,
}

impl<R, G> Clone for LinkService<R, G> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
            generator: Arc::clone(&self.generator),
            candidates: self.candidates,
        }
    }
}

impl<R: LinkRepository, G: Generator> LinkService<R, G> {
    pub fn new(repository: R, generator: G) -> Self {
        Self::from_shared(Arc::new(repository), Arc::new(generator))
    }

    /// Creates a service over a repository that is also used elsewhere.
    pub fn from_shared(repository: Arc<R>, generator: Arc<G>) -> Self {
        Self {
            repository,
            generator,
            candidates: DEFAULT_CANDIDATES,
        }
    }

    /// Sets how many candidate codes are generated per link. At least one
    /// is always generated.
    pub fn with_candidates(mut self, candidates: usize) -> Self {
        self.candidates = candidates.max(1);
        self
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }
}

#[async_trait]
impl<R: LinkRepository, G: Generator> Shortener for LinkService<R, G> {
    async fn get_original_url(&self, code: &str) -> Result<String> {
        // A code that cannot exist is reported like an unknown one.
        let code = ShortCode::new(code).map_err(|_| RepositoryError::NotFound(code.to_string()))?;
        self.repository.get_original_url(&code).await
    }

    async fn create_link(&self, url: &str, owner: &OwnerId) -> Result<ShortCode> {
        validate_url(url)?;

        let candidates = self.generator.candidates(self.candidates);
        self.repository.create_link(url, &candidates, owner).await
    }

    async fn create_links_batch(
        &self,
        items: &[BatchItem],
        owner: &OwnerId,
    ) -> Result<Vec<BatchLink>> {
        for item in items {
            validate_url(&item.original_url)?;
        }

        let candidates: Vec<Vec<ShortCode>> = items
            .iter()
            .map(|_| self.generator.candidates(self.candidates))
            .collect();
        self.repository
            .create_links_batch(items, &candidates, owner)
            .await
    }

    async fn list_links_of_owner(&self, owner: &OwnerId) -> Result<Vec<OwnedLink>> {
        self.repository.list_links_of_owner(owner).await
    }

    async fn delete_links(&self, codes: &[String], owner: &OwnerId) -> Result<()> {
        let mut parsed = Vec::with_capacity(codes.len());
        for raw in codes {
            match ShortCode::new(raw.as_str()) {
                Ok(code) => parsed.push(code),
                // Nothing can be stored under it, so there is nothing to delete.
                Err(err) => debug!(code = %raw, error = %err, "skipping malformed code"),
            }
        }

        if parsed.is_empty() {
            return Ok(());
        }
        self.repository.soft_delete(&parsed, owner).await
    }

    async fn ping(&self) -> Result<()> {
        self.repository.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkvault_core::shortcode::{ALPHABET, CODE_LENGTH};
    use linkvault_generator::{RandomGenerator, SeqGenerator};
    use linkvault_storage::InMemoryRepository;

    fn test_service() -> LinkService<InMemoryRepository, SeqGenerator> {
        LinkService::new(InMemoryRepository::new(), SeqGenerator::with_prefix("lv"))
    }

    fn alice() -> OwnerId {
        OwnerId::new("alice")
    }

    #[tokio::test]
    async fn create_and_resolve() {
        let service = LinkService::new(InMemoryRepository::new(), RandomGenerator::new());

        let code = service.create_link("https://ya.ru", &alice()).await.unwrap();

        assert_eq!(code.as_str().len(), CODE_LENGTH);
        assert!(code.as_str().bytes().all(|b| ALPHABET.contains(&b)));
        assert_eq!(
            service.get_original_url(code.as_str()).await.unwrap(),
            "https://ya.ru"
        );
    }

    #[tokio::test]
    async fn distinct_urls_get_distinct_codes() {
        let service = test_service();

        let first = service.create_link("https://a.test", &alice()).await.unwrap();
        let second = service.create_link("https://b.test", &alice()).await.unwrap();

        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn repeated_url_reports_existing_code() {
        let service = test_service();

        let first = service.create_link("https://a.test", &alice()).await.unwrap();
        for _ in 0..2 {
            let err = service
                .create_link("https://a.test", &OwnerId::new("bob"))
                .await
                .unwrap_err();
            assert!(err.is_already_exists());
            assert!(matches!(err, RepositoryError::AlreadyExists(code) if code == first));
        }
    }

    #[tokio::test]
    async fn invalid_url_is_rejected_before_storage() {
        let service = test_service();

        for url in ["", "not a url", "ftp://files.test/a", "https://"] {
            let err = service.create_link(url, &alice()).await.unwrap_err();
            assert!(matches!(err, RepositoryError::InvalidUrl(_)), "{url}: {err:?}");
        }
        assert!(service.repository().is_empty());
    }

    #[tokio::test]
    async fn collisions_fall_through_to_later_candidates() {
        let repository = Arc::new(InMemoryRepository::new());
        let generator = Arc::new(SeqGenerator::with_prefix("lv"));
        let first = LinkService::from_shared(Arc::clone(&repository), Arc::clone(&generator));
        // Starts over at the same counter, so its first candidate collides.
        let second = LinkService::from_shared(repository, Arc::new(SeqGenerator::with_prefix("lv")))
            .with_candidates(2);

        let a = first.create_link("https://a.test", &alice()).await.unwrap();
        let b = second.create_link("https://b.test", &alice()).await.unwrap();

        assert_eq!(a.as_str(), "lv000000");
        assert_eq!(b.as_str(), "lv000001");
    }

    #[tokio::test]
    async fn single_candidate_collision_exhausts() {
        let repository = Arc::new(InMemoryRepository::new());
        let first = LinkService::from_shared(
            Arc::clone(&repository),
            Arc::new(SeqGenerator::with_prefix("lv")),
        )
        .with_candidates(1);
        let second =
            LinkService::from_shared(repository, Arc::new(SeqGenerator::with_prefix("lv")))
                .with_candidates(0);

        first.create_link("https://a.test", &alice()).await.unwrap();
        let err = second
            .create_link("https://b.test", &alice())
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::MaxRetriesExceeded));
    }

    #[tokio::test]
    async fn malformed_code_is_not_found() {
        let service = test_service();

        for code in ["", "short", "has-dash", "waytoolongcode"] {
            let err = service.get_original_url(code).await.unwrap_err();
            assert!(matches!(err, RepositoryError::NotFound(_)), "{code}: {err:?}");
        }
    }

    #[tokio::test]
    async fn batch_assigns_codes_per_correlation_id() {
        let service = test_service();
        let items = vec![
            BatchItem::new("x", "https://a.test"),
            BatchItem::new("y", "https://b.test"),
        ];

        let links = service.create_links_batch(&items, &alice()).await.unwrap();

        assert_eq!(links.len(), 2);
        assert_eq!(links[0].correlation_id, "x");
        assert_eq!(links[1].correlation_id, "y");
        assert_eq!(
            service
                .get_original_url(links[1].code.as_str())
                .await
                .unwrap(),
            "https://b.test"
        );
    }

    #[tokio::test]
    async fn batch_with_invalid_url_stores_nothing() {
        let service = test_service();
        let items = vec![
            BatchItem::new("x", "https://a.test"),
            BatchItem::new("y", "mailto:someone@example.com"),
        ];

        let err = service.create_links_batch(&items, &alice()).await.unwrap_err();

        assert!(matches!(err, RepositoryError::InvalidUrl(_)));
        assert!(service.repository().is_empty());
    }

    #[tokio::test]
    async fn batch_with_existing_url_fails_whole_batch() {
        let service = test_service();
        let existing = service.create_link("https://a.test", &alice()).await.unwrap();

        let items = vec![
            BatchItem::new("x", "https://a.test"),
            BatchItem::new("y", "https://b.test"),
        ];
        let err = service.create_links_batch(&items, &alice()).await.unwrap_err();

        match err {
            RepositoryError::BatchAlreadyExists { links, conflicts } => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].code, existing);
                assert_eq!(links.len(), 1);
                assert_eq!(links[0].correlation_id, "y");
            }
            other => panic!("expected BatchAlreadyExists, got {other:?}"),
        }
        assert_eq!(service.repository().len(), 1);
    }

    #[tokio::test]
    async fn delete_then_resolve_reports_deleted() {
        let service = test_service();
        let code = service.create_link("https://ya.ru", &alice()).await.unwrap();

        service
            .delete_links(&[code.to_string()], &alice())
            .await
            .unwrap();

        let err = service.get_original_url(code.as_str()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Deleted(_)));
        assert!(service.list_links_of_owner(&alice()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_by_other_owner_has_no_effect() {
        let service = test_service();
        let code = service.create_link("https://a.test", &alice()).await.unwrap();

        service
            .delete_links(&[code.to_string()], &OwnerId::new("mallory"))
            .await
            .unwrap();

        assert_eq!(
            service.get_original_url(code.as_str()).await.unwrap(),
            "https://a.test"
        );
    }

    #[tokio::test]
    async fn delete_skips_malformed_codes() {
        let service = test_service();
        let code = service.create_link("https://a.test", &alice()).await.unwrap();

        service
            .delete_links(&["not valid!".to_string(), code.to_string()], &alice())
            .await
            .unwrap();
        service
            .delete_links(&["bad".to_string()], &alice())
            .await
            .unwrap();

        assert!(matches!(
            service.get_original_url(code.as_str()).await,
            Err(RepositoryError::Deleted(_))
        ));
    }

    #[tokio::test]
    async fn list_returns_owner_links() {
        let service = test_service();
        let a = service.create_link("https://a.test", &alice()).await.unwrap();
        service
            .create_link("https://b.test", &OwnerId::new("bob"))
            .await
            .unwrap();

        let links = service.list_links_of_owner(&alice()).await.unwrap();

        assert_eq!(links.len(), 1);
        assert_eq!(links[0].code, a);
        assert_eq!(links[0].original_url, "https://a.test");
    }

    #[tokio::test]
    async fn ping_without_durable_backend_is_unavailable() {
        let service = test_service();
        assert!(matches!(
            service.ping().await,
            Err(RepositoryError::Unavailable(_))
        ));
    }
}

//! Startup-time backend selection.
//!
//! [`Repository`] is the single handle callers hold. The backend behind it is
//! chosen once from [`StorageConfig`] and never changes afterwards.

use crate::memory::InMemoryRepository;
use crate::mysql::MySqlRepository;
use crate::pool::RetryPolicy;
use crate::reconciler::{DeletionReconciler, ReconcilerConfig, ReconcilerHandle};
use async_trait::async_trait;
use linkvault_core::{
    BatchItem, BatchLink, LinkRepository, OwnedLink, OwnerId, Result, ShortCode,
};
use parking_lot::Mutex;
use sqlx::mysql::MySqlPoolOptions;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use tracing::info;
use typed_builder::TypedBuilder;

/// Which storage backs the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageKind {
    /// Process-lifetime map, lost on exit.
    Memory,
    /// In-memory map mirrored to an append-only log at the given path.
    File(PathBuf),
    /// MySQL database reached through `dsn`.
    MySql { dsn: String },
}

impl Display for StorageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageKind::Memory => write!(f, "memory"),
            StorageKind::File(path) => write!(f, "file({})", path.display()),
            StorageKind::MySql { .. } => write!(f, "mysql"),
        }
    }
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct StorageConfig {
    pub kind: StorageKind,
    #[builder(default = 10)]
    pub max_connections: u32,
    #[builder(default)]
    pub retry: RetryPolicy,
    #[builder(default)]
    pub reconciler: ReconcilerConfig,
    /// Apply the bundled schema on open. Only meaningful for MySQL.
    #[builder(default = true)]
    pub migrate: bool,
}

#[derive(Debug)]
enum Backend {
    Memory(InMemoryRepository),
    MySql(MySqlRepository),
}

/// The repository handle used by the service layer.
///
/// For MySQL, opening also starts the deletion reconciler; [`close`](Self::close)
/// stops it.
#[derive(Debug)]
pub struct Repository {
    backend: Backend,
    reconciler: Mutex<Option<ReconcilerHandle>>,
}

impl Repository {
    pub async fn open(config: StorageConfig) -> Result<Self> {
        info!(storage = %config.kind, "opening repository");

        match config.kind {
            StorageKind::Memory => Ok(InMemoryRepository::new().into()),
            StorageKind::File(path) => Ok(InMemoryRepository::open(path)?.into()),
            StorageKind::MySql { dsn } => {
                let pool = MySqlPoolOptions::new()
                    .max_connections(config.max_connections)
                    .connect(&dsn)
                    .await
                    .map_err(crate::mysql::map_sqlx_error)?;
                let repository = MySqlRepository::with_retry_policy(pool, config.retry);
                if config.migrate {
                    repository.migrate().await?;
                }

                let handle =
                    DeletionReconciler::new(repository.pool().clone(), config.reconciler).spawn();

                Ok(Self {
                    backend: Backend::MySql(repository),
                    reconciler: Mutex::new(Some(handle)),
                })
            }
        }
    }

    /// Stops background work and releases connections.
    ///
    /// Safe to call more than once.
    pub async fn close(&self) {
        let handle = self.reconciler.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }

        if let Backend::MySql(repository) = &self.backend {
            repository.pool().close().await;
        }
        info!("repository closed");
    }

    /// Returns the in-memory backend, if that is what was selected.
    pub fn as_memory(&self) -> Option<&InMemoryRepository> {
        match &self.backend {
            Backend::Memory(repository) => Some(repository),
            Backend::MySql(_) => None,
        }
    }

    /// Returns the MySQL backend, if that is what was selected.
    pub fn as_mysql(&self) -> Option<&MySqlRepository> {
        match &self.backend {
            Backend::MySql(repository) => Some(repository),
            Backend::Memory(_) => None,
        }
    }

    fn inner(&self) -> &dyn LinkRepository {
        match &self.backend {
            Backend::Memory(repository) => repository,
            Backend::MySql(repository) => repository,
        }
    }
}

impl From<InMemoryRepository> for Repository {
    fn from(repository: InMemoryRepository) -> Self {
        Self {
            backend: Backend::Memory(repository),
            reconciler: Mutex::new(None),
        }
    }
}

#[async_trait]
impl LinkRepository for Repository {
    async fn get_original_url(&self, code: &ShortCode) -> Result<String> {
        self.inner().get_original_url(code).await
    }

    async fn create_link(
        &self,
        original_url: &str,
        candidates: &[ShortCode],
        owner: &OwnerId,
    ) -> Result<ShortCode> {
        self.inner().create_link(original_url, candidates, owner).await
    }

    async fn create_links_batch(
        &self,
        items: &[BatchItem],
        candidates: &[Vec<ShortCode>],
        owner: &OwnerId,
    ) -> Result<Vec<BatchLink>> {
        self.inner().create_links_batch(items, candidates, owner).await
    }

    async fn list_links_of_owner(&self, owner: &OwnerId) -> Result<Vec<OwnedLink>> {
        self.inner().list_links_of_owner(owner).await
    }

    async fn soft_delete(&self, codes: &[ShortCode], owner: &OwnerId) -> Result<()> {
        self.inner().soft_delete(codes, owner).await
    }

    async fn health_check(&self) -> Result<()> {
        self.inner().health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkvault_core::RepositoryError;

    fn code(s: &str) -> ShortCode {
        ShortCode::new_unchecked(s)
    }

    #[test]
    fn config_defaults() {
        let config = StorageConfig::builder().kind(StorageKind::Memory).build();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.reconciler.interval, std::time::Duration::from_secs(10));
        assert!(config.migrate);
    }

    #[tokio::test]
    async fn memory_backend_round_trip() {
        let repository = Repository::open(StorageConfig::builder().kind(StorageKind::Memory).build())
            .await
            .unwrap();
        assert!(repository.as_memory().is_some());
        assert!(repository.as_mysql().is_none());

        let owner = OwnerId::new("alice");
        let created = repository
            .create_link("https://ya.ru", &[code("abcdEFGH")], &owner)
            .await
            .unwrap();
        assert_eq!(
            repository.get_original_url(&created).await.unwrap(),
            "https://ya.ru"
        );

        repository.soft_delete(&[created.clone()], &owner).await.unwrap();
        assert!(matches!(
            repository.get_original_url(&created).await,
            Err(RepositoryError::Deleted(_))
        ));

        repository.close().await;
        repository.close().await;
    }

    #[tokio::test]
    async fn file_backend_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("links.jsonl");
        let owner = OwnerId::new("bob");

        {
            let repository = Repository::open(
                StorageConfig::builder()
                    .kind(StorageKind::File(path.clone()))
                    .build(),
            )
            .await
            .unwrap();
            repository
                .create_link("https://a.test", &[code("aaaaaaaa")], &owner)
                .await
                .unwrap();
            repository.close().await;
        }

        let repository = Repository::open(
            StorageConfig::builder()
                .kind(StorageKind::File(path))
                .build(),
        )
        .await
        .unwrap();
        assert_eq!(
            repository.get_original_url(&code("aaaaaaaa")).await.unwrap(),
            "https://a.test"
        );
        assert_eq!(repository.list_links_of_owner(&owner).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn memory_health_check_reports_unavailable() {
        let repository: Repository = InMemoryRepository::new().into();
        assert!(matches!(
            repository.health_check().await,
            Err(RepositoryError::Unavailable(_))
        ));
    }

    #[test]
    fn kind_display_hides_dsn() {
        let kind = StorageKind::MySql {
            dsn: "mysql://root:secret@db/links".to_string(),
        };
        assert_eq!(kind.to_string(), "mysql");
    }
}

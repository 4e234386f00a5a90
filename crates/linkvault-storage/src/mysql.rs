use crate::batch::{plan_batch, BatchPlan, NewLink};
use crate::pool::{ResilientPool, RetryPolicy};
use async_trait::async_trait;
use jiff::Timestamp;
use linkvault_core::{
    BatchItem, BatchLink, LinkRepository, OwnedLink, OwnerId, RepositoryError, Result, ShortCode,
};
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySql, MySqlPool, QueryBuilder, Row, Transaction};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, trace};

/// Attempts for a batch whose insert lost a race against a concurrent writer.
const BATCH_ATTEMPTS: usize = 3;

const SHORT_URLS_DDL: &str = include_str!("../ddl/mysql/short_urls.sql");
const PENDING_DELETIONS_DDL: &str = include_str!("../ddl/mysql/pending_deletions.sql");

/// MySQL implementation of the repository contract.
///
/// Soft delete is implemented with `is_deleted`. A row is never removed, so
/// a short code is never handed out twice. Live-URL uniqueness is enforced by
/// a unique index over a generated column that is NULL for deleted rows.
///
/// Deletions are not applied inline: [`LinkRepository::soft_delete`] only
/// enqueues a row in `pending_deletions`, which the
/// [`DeletionReconciler`](crate::reconciler::DeletionReconciler) drains.
#[derive(Debug, Clone)]
pub struct MySqlRepository {
    pool: ResilientPool,
}

impl MySqlRepository {
    /// Creates a repository from an existing MySQL connection pool.
    pub fn new(pool: MySqlPool) -> Self {
        Self::with_retry_policy(pool, RetryPolicy::default())
    }

    /// Creates a repository with a custom closed-connection retry policy.
    pub fn with_retry_policy(pool: MySqlPool, policy: RetryPolicy) -> Self {
        Self {
            pool: ResilientPool::new(pool, policy),
        }
    }

    /// Creates a repository by opening a new MySQL connection pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(map_sqlx_error)?;
        Ok(Self::new(pool))
    }

    /// Returns a reference to the resilient pool.
    pub fn pool(&self) -> &ResilientPool {
        &self.pool
    }

    /// Creates the tables if they do not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        for ddl in [SHORT_URLS_DDL, PENDING_DELETIONS_DDL] {
            self.pool
                .run("migrate", |pool| async move {
                    sqlx::raw_sql(ddl).execute(&pool).await
                })
                .await
                .map_err(map_sqlx_error)?;
        }
        info!("mysql schema is up to date");
        Ok(())
    }

    async fn find_live_code(&self, original_url: &str) -> Result<Option<ShortCode>> {
        let row = self
            .pool
            .run("find_live_code", |pool| async move {
                sqlx::query(
                    r#"
                    SELECT short_code
                    FROM short_urls
                    WHERE live_url_hash = UNHEX(SHA2(?, 256))
                      AND original_url = ?
                    LIMIT 1
                    "#,
                )
                .bind(original_url)
                .bind(original_url)
                .fetch_optional(&pool)
                .await
            })
            .await
            .map_err(map_sqlx_error)?;

        row.map(|row| row.try_get::<String, _>("short_code"))
            .transpose()
            .map(|code| code.map(ShortCode::new_unchecked))
            .map_err(map_sqlx_error)
    }
}

pub(crate) fn now_unix_seconds() -> i64 {
    Timestamp::now().as_second()
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(sqlx::error::DatabaseError::is_unique_violation)
}

pub(crate) fn map_sqlx_error(err: sqlx::Error) -> RepositoryError {
    let message = err.to_string();

    match err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => RepositoryError::Unavailable(message),
        _ if crate::pool::classify(&err) == crate::pool::ErrorClass::ConnectionClosed => {
            RepositoryError::Unavailable(message)
        }
        _ => RepositoryError::Storage(message),
    }
}

/// Outcome of one batch transaction.
enum BatchAttempt {
    Planned(BatchPlan),
    /// The insert hit a unique index; some concurrent writer got there first.
    Raced,
}

async fn run_batch(
    tx: &mut Transaction<'static, MySql>,
    items: &[BatchItem],
    candidates: &[Vec<ShortCode>],
    owner: &str,
    now: i64,
) -> std::result::Result<BatchAttempt, sqlx::Error> {
    let urls: HashSet<&str> = items.iter().map(|item| item.original_url.as_str()).collect();
    let mut live: HashMap<String, ShortCode> = HashMap::new();
    if !urls.is_empty() {
        let mut query = QueryBuilder::<MySql>::new(
            "SELECT short_code, original_url FROM short_urls WHERE live_url_hash IN (",
        );
        for (index, url) in urls.iter().enumerate() {
            if index > 0 {
                query.push(", ");
            }
            query.push("UNHEX(SHA2(");
            query.push_bind(url.to_string());
            query.push(", 256))");
        }
        query.push(")");

        for row in query.build().fetch_all(&mut **tx).await? {
            let code: String = row.try_get("short_code")?;
            let url: String = row.try_get("original_url")?;
            live.insert(url, ShortCode::new_unchecked(code));
        }
    }

    let offered: HashSet<&str> = candidates.iter().flatten().map(ShortCode::as_str).collect();
    let mut taken: HashSet<String> = HashSet::new();
    if !offered.is_empty() {
        let mut query =
            QueryBuilder::<MySql>::new("SELECT short_code FROM short_urls WHERE short_code IN (");
        let mut separated = query.separated(", ");
        for code in &offered {
            separated.push_bind(code.to_string());
        }
        separated.push_unseparated(")");

        for row in query.build().fetch_all(&mut **tx).await? {
            taken.insert(row.try_get("short_code")?);
        }
    }

    let plan = plan_batch(
        items,
        candidates,
        |url| live.get(url).cloned(),
        |code| taken.contains(code.as_str()),
    );

    let BatchPlan::Insert { rows, .. } = &plan else {
        return Ok(BatchAttempt::Planned(plan));
    };

    if !rows.is_empty() {
        let mut query = QueryBuilder::<MySql>::new(
            "INSERT INTO short_urls (short_code, original_url, owner_id, is_deleted, created_at) ",
        );
        query.push_values(rows, |mut row, link: &NewLink| {
            row.push_bind(link.code.to_string())
                .push_bind(link.original_url.clone())
                .push_bind(owner.to_string())
                .push_bind(false)
                .push_bind(now);
        });

        match query.build().execute(&mut **tx).await {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => return Ok(BatchAttempt::Raced),
            Err(err) => return Err(err),
        }
    }

    Ok(BatchAttempt::Planned(plan))
}

#[async_trait]
impl LinkRepository for MySqlRepository {
    async fn get_original_url(&self, code: &ShortCode) -> Result<String> {
        trace!(code = %code, "resolving short code");

        let row = self
            .pool
            .run("get_original_url", |pool| async move {
                sqlx::query(
                    r#"
                    SELECT original_url, is_deleted
                    FROM short_urls
                    WHERE short_code = ?
                    LIMIT 1
                    "#,
                )
                .bind(code.as_str())
                .fetch_optional(&pool)
                .await
            })
            .await
            .map_err(map_sqlx_error)?;

        let Some(row) = row else {
            return Err(RepositoryError::NotFound(code.to_string()));
        };

        let deleted: bool = row.try_get("is_deleted").map_err(map_sqlx_error)?;
        if deleted {
            return Err(RepositoryError::Deleted(code.to_string()));
        }

        row.try_get("original_url").map_err(map_sqlx_error)
    }

    async fn create_link(
        &self,
        original_url: &str,
        candidates: &[ShortCode],
        owner: &OwnerId,
    ) -> Result<ShortCode> {
        let now = now_unix_seconds();
        let owner_id = owner.as_str();

        for code in candidates {
            let attempts = AtomicU32::new(0);
            let result = self
                .pool
                .run("create_link", |pool| {
                    attempts.fetch_add(1, Ordering::Relaxed);
                    async move {
                        sqlx::query(
                            r#"
                            INSERT INTO short_urls (short_code, original_url, owner_id, is_deleted, created_at)
                            VALUES (?, ?, ?, FALSE, ?)
                            "#,
                        )
                        .bind(code.as_str())
                        .bind(original_url)
                        .bind(owner_id)
                        .bind(now)
                        .execute(&pool)
                        .await
                    }
                })
                .await;

            match result {
                Ok(_) => {
                    debug!(code = %code, owner = %owner, "created link");
                    return Ok(code.clone());
                }
                Err(err) if is_unique_violation(&err) => {
                    if let Some(existing) = self.find_live_code(original_url).await? {
                        let attempts = attempts.load(Ordering::Relaxed);
                        if is_own_replayed_insert(&existing, code, attempts) {
                            debug!(code = %code, "insert committed before the connection dropped");
                            return Ok(existing);
                        }
                        return Err(RepositoryError::AlreadyExists(existing));
                    }
                    debug!(code = %code, "short code taken, trying next candidate");
                }
                Err(err) => return Err(map_sqlx_error(err)),
            }
        }

        Err(RepositoryError::MaxRetriesExceeded)
    }

    async fn create_links_batch(
        &self,
        items: &[BatchItem],
        candidates: &[Vec<ShortCode>],
        owner: &OwnerId,
    ) -> Result<Vec<BatchLink>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let now = now_unix_seconds();

        for attempt in 1..=BATCH_ATTEMPTS {
            let outcome = self
                .pool
                .transaction("create_links_batch", |tx| {
                    let items = items.to_vec();
                    let candidates = candidates.to_vec();
                    let owner = owner.to_string();
                    Box::pin(async move { run_batch(tx, &items, &candidates, &owner, now).await })
                })
                .await
                .map_err(map_sqlx_error)?;

            match outcome {
                BatchAttempt::Planned(BatchPlan::Insert { links, rows }) => {
                    debug!(owner = %owner, items = items.len(), stored = rows.len(), "created link batch");
                    return Ok(links);
                }
                BatchAttempt::Planned(plan) => {
                    return Err(plan
                        .into_error()
                        .unwrap_or(RepositoryError::MaxRetriesExceeded))
                }
                BatchAttempt::Raced => {
                    debug!(owner = %owner, attempt, "batch insert raced a concurrent writer");
                }
            }
        }

        Err(RepositoryError::MaxRetriesExceeded)
    }

    async fn list_links_of_owner(&self, owner: &OwnerId) -> Result<Vec<OwnedLink>> {
        let owner_id = owner.as_str();

        let rows = self
            .pool
            .run("list_links_of_owner", |pool| async move {
                sqlx::query(
                    r#"
                    SELECT short_code, original_url
                    FROM short_urls
                    WHERE owner_id = ?
                      AND is_deleted = FALSE
                    ORDER BY created_at, short_code
                    "#,
                )
                .bind(owner_id)
                .fetch_all(&pool)
                .await
            })
            .await
            .map_err(map_sqlx_error)?;

        rows.into_iter()
            .map(|row| -> std::result::Result<OwnedLink, sqlx::Error> {
                Ok(OwnedLink {
                    code: ShortCode::new_unchecked(row.try_get::<String, _>("short_code")?),
                    original_url: row.try_get("original_url")?,
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(map_sqlx_error)
    }

    async fn soft_delete(&self, codes: &[ShortCode], owner: &OwnerId) -> Result<()> {
        if codes.is_empty() {
            return Ok(());
        }

        let payload = serde_json::to_string(codes)
            .map_err(|e| RepositoryError::Storage(format!("encode pending deletion: {e}")))?;
        let payload = payload.as_str();
        let owner_id = owner.as_str();
        let now = now_unix_seconds();

        self.pool
            .run("enqueue_deletion", |pool| async move {
                sqlx::query(
                    r#"
                    INSERT INTO pending_deletions (owner_id, short_codes, enqueued_at)
                    VALUES (?, ?, ?)
                    "#,
                )
                .bind(owner_id)
                .bind(payload)
                .bind(now)
                .execute(&pool)
                .await
            })
            .await
            .map_err(map_sqlx_error)?;

        debug!(owner = %owner, codes = codes.len(), "queued deletion");
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        self.pool
            .ping()
            .await
            .map_err(|e| RepositoryError::Unavailable(e.to_string()))
    }
}

/// A unique violation on a retried insert can be the earlier attempt's own
/// row, committed just before its connection dropped.
fn is_own_replayed_insert(existing: &ShortCode, code: &ShortCode, attempts: u32) -> bool {
    attempts > 1 && existing == code
}

//! Background worker applying queued deletions.
//!
//! [`MySqlRepository::soft_delete`](crate::MySqlRepository) only records the
//! intent in `pending_deletions`. The reconciler takes the next queued
//! batch, marks its codes deleted and removes the queue row, all in one
//! transaction, so a batch is either fully applied or left queued.
//!
//! A batch that fails for a reason other than a dropped connection stays
//! queued with its `attempts` bumped. Batches are taken in `(attempts, id)`
//! order, so a batch that keeps failing sorts behind fresh ones instead of
//! blocking the queue.

use crate::mysql::{map_sqlx_error, now_unix_seconds};
use crate::pool::{classify, ErrorClass, ResilientPool};
use linkvault_core::{RepositoryError, Result};
use sqlx::{Connection, MySql, MySqlConnection, QueryBuilder, Row, Transaction};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;

/// Codes per UPDATE statement. MySQL caps placeholders per prepared
/// statement at 65535.
const UPDATE_CHUNK: usize = 1000;

#[derive(Debug, Clone, Copy, TypedBuilder)]
pub struct ReconcilerConfig {
    /// Pause after finding the queue empty or failing a batch.
    #[builder(default = Duration::from_secs(10))]
    pub interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A queued deletion batch that has just been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciledBatch {
    pub id: u64,
    pub owner_id: String,
    pub requested: usize,
    /// Rows that flipped to deleted; foreign, unknown or already deleted
    /// codes do not count.
    pub deleted: u64,
}

enum Step {
    Empty,
    Applied(ReconciledBatch),
    Failed {
        id: u64,
        attempts: u32,
        error: String,
    },
}

#[derive(Debug, Clone)]
pub struct DeletionReconciler {
    pool: ResilientPool,
    config: ReconcilerConfig,
}

impl DeletionReconciler {
    pub fn new(pool: ResilientPool, config: ReconcilerConfig) -> Self {
        Self { pool, config }
    }

    /// Applies the next queued batch, if any.
    ///
    /// Returns `Ok(None)` when the queue is empty. A batch that cannot be
    /// applied is left queued with its attempt count bumped, and reported as
    /// [`RepositoryError::Storage`].
    pub async fn run_once(&self) -> Result<Option<ReconciledBatch>> {
        let step = self
            .pool
            .transaction("reconcile_deletions", |tx| Box::pin(reconcile_next(tx)))
            .await
            .map_err(map_sqlx_error)?;

        match step {
            Step::Empty => Ok(None),
            Step::Applied(batch) => Ok(Some(batch)),
            Step::Failed {
                id,
                attempts,
                error,
            } => Err(RepositoryError::Storage(format!(
                "pending deletion {id} failed on attempt {attempts}: {error}"
            ))),
        }
    }

    /// Runs until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// A batch in flight is always finished before the loop exits; only the
    /// idle sleep is interrupted.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.config.interval, "deletion reconciler started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(Some(batch)) => {
                    debug!(
                        batch_id = batch.id,
                        owner = %batch.owner_id,
                        requested = batch.requested,
                        deleted = batch.deleted,
                        "applied pending deletion"
                    );
                    // More may be queued; drain before sleeping.
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    // Failing batches wait for the next tick.
                    warn!(error = %err, "failed to apply pending deletion, retrying next tick");
                }
            }

            tokio::select! {
                _ = sleep(self.config.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("deletion reconciler stopped");
    }

    /// Spawns [`run`](Self::run) on the tokio runtime.
    pub fn spawn(self) -> ReconcilerHandle {
        let (shutdown, receiver) = watch::channel(false);
        let task = tokio::spawn(self.run(receiver));
        ReconcilerHandle { shutdown, task }
    }
}

async fn reconcile_next(
    tx: &mut Transaction<'static, MySql>,
) -> std::result::Result<Step, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, owner_id, short_codes, attempts
        FROM pending_deletions
        ORDER BY attempts, id
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .fetch_optional(&mut **tx)
    .await?;

    let Some(row) = row else {
        return Ok(Step::Empty);
    };

    let id: u64 = row.try_get("id")?;
    let owner_id: String = row.try_get("owner_id")?;
    let raw: String = row.try_get("short_codes")?;
    let attempts: u32 = row.try_get("attempts")?;

    // Savepoint, so a batch failing halfway leaves no code flipped.
    let mut savepoint = Connection::begin(&mut **tx).await?;
    let applied = apply_deletion(&mut savepoint, &owner_id, &raw).await;
    match applied {
        Ok((requested, deleted)) => {
            savepoint.commit().await?;
            sqlx::query("DELETE FROM pending_deletions WHERE id = ?")
                .bind(id)
                .execute(&mut **tx)
                .await?;

            Ok(Step::Applied(ReconciledBatch {
                id,
                owner_id,
                requested,
                deleted,
            }))
        }
        Err(err) if classify(&err) == ErrorClass::ConnectionClosed => Err(err),
        Err(err) => {
            savepoint.rollback().await?;
            let error = err.to_string();
            sqlx::query(
                r#"
                UPDATE pending_deletions
                SET attempts = attempts + 1, last_failed_at = ?, last_error = ?
                WHERE id = ?
                "#,
            )
            .bind(now_unix_seconds())
            .bind(&error)
            .bind(id)
            .execute(&mut **tx)
            .await?;

            Ok(Step::Failed {
                id,
                attempts: attempts + 1,
                error,
            })
        }
    }
}

/// Flips the owner's live codes listed in `raw` to deleted. Returns how many
/// codes were requested and how many rows changed.
async fn apply_deletion(
    conn: &mut MySqlConnection,
    owner_id: &str,
    raw: &str,
) -> std::result::Result<(usize, u64), sqlx::Error> {
    let codes: Vec<String> =
        serde_json::from_str(raw).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    let mut deleted = 0;
    for chunk in codes.chunks(UPDATE_CHUNK) {
        let mut query = QueryBuilder::<MySql>::new(
            "UPDATE short_urls SET is_deleted = TRUE WHERE is_deleted = FALSE AND owner_id = ",
        );
        query.push_bind(owner_id.to_string());
        query.push(" AND short_code IN (");
        let mut separated = query.separated(", ");
        for code in chunk {
            separated.push_bind(code.clone());
        }
        separated.push_unseparated(")");

        deleted += query.build().execute(&mut *conn).await?.rows_affected();
    }

    Ok((codes.len(), deleted))
}

/// Handle to a spawned [`DeletionReconciler`].
#[derive(Debug)]
pub struct ReconcilerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Signals the reconciler to stop and waits for it to finish its
    /// current batch.
    pub async fn shutdown(self) {
        // The task may already be gone; the send result does not matter then.
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            error!(error = %err, "deletion reconciler task failed");
        }
    }
}

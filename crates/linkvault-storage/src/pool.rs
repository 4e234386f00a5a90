//! Connection pool wrapper that survives server-side connection drops.
//!
//! Pooled MySQL connections can be closed by the server (idle timeout,
//! restart) between acquisition and use. Operations that fail because the
//! connection went away are retried on a fresh connection a bounded number
//! of times; every other error is returned untouched.

use sqlx::mysql::MySqlDatabaseError;
use sqlx::{Connection, MySql, MySqlPool, Transaction};
use std::future::Future;
use std::io::ErrorKind;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};
use typed_builder::TypedBuilder;

/// Boxed future returned by transaction bodies.
pub type TxFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T, sqlx::Error>> + Send + 'c>>;

/// MySQL server error numbers meaning the session is gone.
const SERVER_GONE_ERRORS: &[u16] = &[
    1053, // ER_SERVER_SHUTDOWN
    2006, // CR_SERVER_GONE_ERROR
    2013, // CR_SERVER_LOST
    4031, // ER_CLIENT_INTERACTION_TIMEOUT
];

/// Coarse classification of database errors for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The connection was closed underneath us; a fresh one may succeed.
    ConnectionClosed,
    Other,
}

/// Classifies a sqlx error.
pub fn classify(err: &sqlx::Error) -> ErrorClass {
    match err {
        sqlx::Error::Io(io) => match io.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected => ErrorClass::ConnectionClosed,
            _ => ErrorClass::Other,
        },
        sqlx::Error::WorkerCrashed => ErrorClass::ConnectionClosed,
        sqlx::Error::Database(db) => match db.try_downcast_ref::<MySqlDatabaseError>() {
            Some(mysql) if SERVER_GONE_ERRORS.contains(&mysql.number()) => {
                ErrorClass::ConnectionClosed
            }
            _ => ErrorClass::Other,
        },
        _ => ErrorClass::Other,
    }
}

/// How often, and how patiently, closed-connection failures are retried.
#[derive(Debug, Clone, Copy, TypedBuilder)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    #[builder(default = 3)]
    pub max_attempts: u32,
    /// Pause between attempts.
    #[builder(default = Duration::from_millis(50))]
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Decides whether `err`, raised by attempt number `attempt`, is retried,
    /// and sleeps before returning `true`.
    async fn pause_before_retry(&self, operation: &str, err: &sqlx::Error, attempt: u32) -> bool {
        if classify(err) != ErrorClass::ConnectionClosed {
            debug!(operation, error = %err, "operation failed with non-retryable error");
            return false;
        }

        if attempt >= self.max_attempts {
            warn!(
                operation,
                attempt,
                error = %err,
                "connection closed, retries exhausted"
            );
            return false;
        }

        warn!(
            operation,
            attempt,
            max_attempts = self.max_attempts,
            error = %err,
            "connection closed, retrying on a fresh connection"
        );
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        true
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up.
pub async fn retry_on_closed<T, F, Fut>(
    operation: &str,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if !policy.pause_before_retry(operation, &err, attempt).await {
                    return Err(err);
                }
                attempt += 1;
            }
        }
    }
}

/// The part of an open transaction the replay loop needs.
pub(crate) trait Commit: Sized {
    fn commit(self) -> impl Future<Output = Result<(), sqlx::Error>> + Send;
}

impl<'a> Commit for Transaction<'a, MySql> {
    fn commit(self) -> impl Future<Output = Result<(), sqlx::Error>> + Send {
        Transaction::commit(self)
    }
}

/// Opens a transaction with `begin`, runs `body` in it and commits, replaying
/// all three steps from scratch while the failure is a closed connection.
///
/// An attempt that fails is dropped uncommitted, which rolls it back.
pub(crate) async fn replay_transaction<Tx, T, B, BFut, F>(
    operation: &str,
    policy: RetryPolicy,
    mut begin: B,
    mut body: F,
) -> Result<T, sqlx::Error>
where
    Tx: Commit,
    B: FnMut() -> BFut,
    BFut: Future<Output = Result<Tx, sqlx::Error>>,
    F: for<'c> FnMut(&'c mut Tx) -> TxFuture<'c, T>,
{
    let mut attempt = 1;
    loop {
        let result = async {
            let mut tx = begin().await?;
            let value = body(&mut tx).await?;
            tx.commit().await?;
            Ok::<T, sqlx::Error>(value)
        }
        .await;

        match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "transaction committed after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if !policy.pause_before_retry(operation, &err, attempt).await {
                    return Err(err);
                }
                attempt += 1;
            }
        }
    }
}

/// A [`MySqlPool`] whose operations transparently retry on closed connections.
#[derive(Debug, Clone)]
pub struct ResilientPool {
    pool: MySqlPool,
    policy: RetryPolicy,
}

impl ResilientPool {
    pub fn new(pool: MySqlPool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    /// Runs a single-statement operation (query, fetch, exec) with retries.
    ///
    /// `op` is called once per attempt with a handle to the pool, so every
    /// attempt checks out a fresh connection.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, sqlx::Error>
    where
        F: FnMut(MySqlPool) -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        retry_on_closed(operation, self.policy, || op(self.pool.clone())).await
    }

    /// Runs `body` inside a transaction, committing on success.
    ///
    /// A closed connection anywhere in begin, body or commit rolls back and
    /// replays the whole transaction on a fresh connection.
    pub async fn transaction<T, F>(&self, operation: &str, body: F) -> Result<T, sqlx::Error>
    where
        F: for<'c> FnMut(&'c mut Transaction<'static, MySql>) -> TxFuture<'c, T>,
    {
        replay_transaction(operation, self.policy, || self.pool.begin(), body).await
    }

    /// Pings the database on a pooled connection.
    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        self.run("ping", |pool| async move {
            let mut conn = pool.acquire().await?;
            conn.ping().await
        })
        .await
    }

    /// Closes the pool; subsequent operations fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn closed() -> sqlx::Error {
        sqlx::Error::Io(std::io::Error::from(ErrorKind::BrokenPipe))
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::builder().delay(Duration::ZERO).build()
    }

    #[test]
    fn classifies_connection_failures() {
        assert_eq!(classify(&closed()), ErrorClass::ConnectionClosed);
        assert_eq!(
            classify(&sqlx::Error::Io(ErrorKind::ConnectionReset.into())),
            ErrorClass::ConnectionClosed
        );
        assert_eq!(
            classify(&sqlx::Error::Io(ErrorKind::UnexpectedEof.into())),
            ErrorClass::ConnectionClosed
        );
        assert_eq!(classify(&sqlx::Error::WorkerCrashed), ErrorClass::ConnectionClosed);
    }

    #[test]
    fn classifies_other_failures() {
        assert_eq!(classify(&sqlx::Error::RowNotFound), ErrorClass::Other);
        assert_eq!(classify(&sqlx::Error::PoolTimedOut), ErrorClass::Other);
        assert_eq!(classify(&sqlx::Error::PoolClosed), ErrorClass::Other);
        assert_eq!(
            classify(&sqlx::Error::Io(ErrorKind::PermissionDenied.into())),
            ErrorClass::Other
        );
    }

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay, Duration::from_millis(50));
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let calls = AtomicU32::new(0);

        let result = retry_on_closed("test_op", fast_policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, sqlx::Error>(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_connection_then_success_is_invisible() {
        let calls = AtomicU32::new(0);

        let result = retry_on_closed("test_op", fast_policy(), || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    Err(closed())
                } else {
                    Ok("row")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "row");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);

        let result = retry_on_closed("test_op", fast_policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(closed()) }
        })
        .await;

        assert!(matches!(result, Err(sqlx::Error::Io(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);

        let result = retry_on_closed("test_op", fast_policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(sqlx::Error::RowNotFound) }
        })
        .await;

        assert!(matches!(result, Err(sqlx::Error::RowNotFound)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    /// Stand-in for an open transaction that counts commits.
    struct FakeTx {
        commits: Arc<AtomicU32>,
        fail_commit: bool,
    }

    impl Commit for FakeTx {
        fn commit(self) -> impl Future<Output = Result<(), sqlx::Error>> + Send {
            async move {
                if self.fail_commit {
                    return Err(closed());
                }
                self.commits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct Counters {
        begins: Arc<AtomicU32>,
        bodies: Arc<AtomicU32>,
        commits: Arc<AtomicU32>,
    }

    fn count(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn closed_begin_and_body_replay_whole_transaction() {
        let counters = Counters::default();

        let result = replay_transaction(
            "test_tx",
            fast_policy(),
            || {
                let begin = counters.begins.fetch_add(1, Ordering::SeqCst);
                let commits = Arc::clone(&counters.commits);
                async move {
                    if begin == 0 {
                        return Err(closed());
                    }
                    Ok(FakeTx {
                        commits,
                        fail_commit: false,
                    })
                }
            },
            |_tx: &mut FakeTx| {
                let bodies = Arc::clone(&counters.bodies);
                Box::pin(async move {
                    if bodies.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(closed());
                    }
                    Ok("done")
                })
            },
        )
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(count(&counters.begins), 3);
        assert_eq!(count(&counters.bodies), 2);
        assert_eq!(count(&counters.commits), 1);
    }

    #[tokio::test]
    async fn closed_commit_reruns_body_on_new_transaction() {
        let counters = Counters::default();

        let result = replay_transaction(
            "test_tx",
            fast_policy(),
            || {
                let begin = counters.begins.fetch_add(1, Ordering::SeqCst);
                let commits = Arc::clone(&counters.commits);
                async move {
                    Ok(FakeTx {
                        commits,
                        fail_commit: begin == 0,
                    })
                }
            },
            |_tx: &mut FakeTx| {
                let bodies = Arc::clone(&counters.bodies);
                Box::pin(async move { Ok(bodies.fetch_add(1, Ordering::SeqCst)) })
            },
        )
        .await;

        // The value comes from the second run of the body.
        assert_eq!(result.unwrap(), 1);
        assert_eq!(count(&counters.begins), 2);
        assert_eq!(count(&counters.commits), 1);
    }

    #[tokio::test]
    async fn failing_body_is_not_replayed_or_committed() {
        let counters = Counters::default();

        let result = replay_transaction(
            "test_tx",
            fast_policy(),
            || {
                counters.begins.fetch_add(1, Ordering::SeqCst);
                let commits = Arc::clone(&counters.commits);
                async move {
                    Ok(FakeTx {
                        commits,
                        fail_commit: false,
                    })
                }
            },
            |_tx: &mut FakeTx| {
                let bodies = Arc::clone(&counters.bodies);
                Box::pin(async move {
                    bodies.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(sqlx::Error::RowNotFound)
                })
            },
        )
        .await;

        assert!(matches!(result, Err(sqlx::Error::RowNotFound)));
        assert_eq!(count(&counters.begins), 1);
        assert_eq!(count(&counters.bodies), 1);
        assert_eq!(count(&counters.commits), 0);
    }

    #[tokio::test]
    async fn closed_transaction_gives_up_after_max_attempts() {
        let counters = Counters::default();

        let result = replay_transaction(
            "test_tx",
            fast_policy(),
            || {
                counters.begins.fetch_add(1, Ordering::SeqCst);
                async { Err::<FakeTx, _>(closed()) }
            },
            |_tx: &mut FakeTx| Box::pin(async { Ok(()) }),
        )
        .await;

        assert!(matches!(result, Err(sqlx::Error::Io(_))));
        assert_eq!(count(&counters.begins), 3);
    }
}

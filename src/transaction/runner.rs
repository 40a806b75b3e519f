// ============================================================================
// Transaction Retry Runner
// ============================================================================

use super::policy::{RetryDecision, RetryPolicy, Unbounded};
use super::state::AttemptState;
use crate::core::{SqlStateError, TxError, is_retryable};
use crate::interface::{DatabaseClient, Transaction};
use futures::future::BoxFuture;
use log::warn;
use std::fmt;
use std::time::Duration;
use tracing::{Instrument, Level, event, info_span};

/// Result of a committed unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed<T> {
    /// Value returned by the attempt that committed.
    pub value: T,
    /// Number of attempts made, including the one that committed.
    pub attempts: u32,
}

impl<T> Committed<T> {
    /// Attempts that were discarded before the commit.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

/// One state of the attempt loop together with the data it carries.
enum Step<Tx, T, E> {
    Begin,
    Run(Tx),
    Commit(Tx, T),
    Retry(E),
    Done(T),
    Failed(TxError<E>),
}

impl<Tx, T, E> Step<Tx, T, E> {
    fn state(&self) -> AttemptState {
        match self {
            Step::Begin => AttemptState::Begin,
            Step::Run(_) => AttemptState::Run,
            Step::Commit(..) => AttemptState::Commit,
            Step::Retry(_) => AttemptState::Retry,
            Step::Done(_) => AttemptState::Done,
            Step::Failed(_) => AttemptState::Failed,
        }
    }
}

/// Runs units of work in transactions, restarting them on serialization
/// failures according to a [`RetryPolicy`].
///
/// The runner holds no per-call state, so one runner may serve any number
/// of concurrent invocations.
///
/// # Examples
///
/// ```
/// use txretry::{Bounded, DbError, MemoryDb, TxRunner, Value};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let db = MemoryDb::new();
/// db.create_table("counters", &["value"]).await?;
///
/// let runner = TxRunner::with_policy(Bounded::new(5));
/// let committed = runner
///     .run(&db, |tx| {
///         Box::pin(async move {
///             tx.write("counters", 1, vec![Value::Integer(1)]).await?;
///             Ok::<_, DbError>(())
///         })
///     })
///     .await?;
///
/// assert_eq!(committed.attempts, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct TxRunner<P = Unbounded> {
    policy: P,
}

impl TxRunner<Unbounded> {
    /// A runner that retries restart errors without limit.
    pub fn new() -> Self {
        Self { policy: Unbounded }
    }
}

impl<P: RetryPolicy> TxRunner<P> {
    pub fn with_policy(policy: P) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Execute `work` in a transaction on `client` until it commits or fails
    /// with a non-retryable error.
    ///
    /// `work` is invoked once per attempt with a brand new transaction handle
    /// and may run several times. Every attempt that does not commit is
    /// rolled back before the next `begin` or before the error is returned.
    pub async fn run<C, F, T, E>(&self, client: &C, mut work: F) -> Result<Committed<T>, TxError<E>>
    where
        C: DatabaseClient,
        F: for<'t> FnMut(&'t mut C::Transaction) -> BoxFuture<'t, Result<T, E>>,
        E: From<C::Error> + SqlStateError + fmt::Display,
    {
        let span = info_span!("txn.run");
        async move {
            let mut attempts: u32 = 0;
            let mut step = Step::Begin;

            loop {
                event!(Level::TRACE, attempt = attempts, state = %step.state(), "txn step");
                step = match step {
                    Step::Begin => {
                        attempts = next_attempt(attempts);
                        match client.begin().await {
                            Ok(tx) => Step::Run(tx),
                            Err(err) => Step::Failed(TxError::Begin(E::from(err))),
                        }
                    }
                    Step::Run(mut tx) => {
                        let outcome = work(&mut tx).await;
                        match outcome {
                            Ok(value) => Step::Commit(tx, value),
                            Err(err) => {
                                if let Err(rollback_err) = tx.rollback().await {
                                    warn!(
                                        "Rollback after failed attempt {} did not complete: {}",
                                        attempts, rollback_err
                                    );
                                }
                                if is_retryable(&err) {
                                    Step::Retry(err)
                                } else {
                                    Step::Failed(TxError::Work(err))
                                }
                            }
                        }
                    }
                    Step::Commit(tx, value) => match tx.commit().await {
                        Ok(()) => Step::Done(value),
                        Err(err) => {
                            let err = E::from(err);
                            if is_retryable(&err) {
                                Step::Retry(err)
                            } else {
                                Step::Failed(TxError::Commit(err))
                            }
                        }
                    },
                    Step::Retry(err) => match self.policy.next(attempts) {
                        RetryDecision::Retry { delay } => {
                            warn!(
                                "Transaction restart (attempt {}): {} (backoff={}ms)",
                                attempts,
                                err,
                                delay.as_millis()
                            );
                            pause(delay).await;
                            Step::Begin
                        }
                        RetryDecision::GiveUp => Step::Failed(TxError::RetriesExhausted {
                            attempts,
                            source: err,
                        }),
                    },
                    Step::Done(value) => {
                        event!(Level::DEBUG, attempts, "txn committed");
                        return Ok(Committed { value, attempts });
                    }
                    Step::Failed(err) => {
                        event!(Level::DEBUG, attempts, error = %err, "txn failed");
                        return Err(err);
                    }
                };
            }
        }
        .instrument(span)
        .await
    }
}

/// Execute `work` in a transaction on `client`, retrying serialization
/// failures without limit.
///
/// This is [`TxRunner::run`] with the [`Unbounded`] policy, returning only
/// the committed value.
pub async fn execute_tx<C, F, T, E>(client: &C, work: F) -> Result<T, TxError<E>>
where
    C: DatabaseClient,
    F: for<'t> FnMut(&'t mut C::Transaction) -> BoxFuture<'t, Result<T, E>>,
    E: From<C::Error> + SqlStateError + fmt::Display,
{
    TxRunner::new()
        .run(client, work)
        .await
        .map(Committed::into_value)
}

/// Attempt counter step. Pins at `u32::MAX` under an unbounded policy.
fn next_attempt(attempts: u32) -> u32 {
    attempts.saturating_add(1)
}

async fn pause(delay: Duration) {
    if delay.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DbError, SqlState};
    use crate::transaction::policy::Bounded;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    /// Records every lifecycle call and replays scripted commit results.
    #[derive(Default)]
    struct ScriptedClient {
        log: Arc<Mutex<Vec<&'static str>>>,
        fail_begin: bool,
        fail_rollback: bool,
        commit_results: Arc<Mutex<VecDeque<Result<(), DbError>>>>,
    }

    impl ScriptedClient {
        fn with_commits(results: Vec<Result<(), DbError>>) -> Self {
            Self {
                commit_results: Arc::new(Mutex::new(results.into())),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.log.lock().unwrap().clone()
        }
    }

    struct ScriptedTx {
        log: Arc<Mutex<Vec<&'static str>>>,
        fail_rollback: bool,
        commit_results: Arc<Mutex<VecDeque<Result<(), DbError>>>>,
    }

    impl ScriptedTx {
        fn exec(&mut self) {
            self.log.lock().unwrap().push("exec");
        }
    }

    #[async_trait]
    impl DatabaseClient for ScriptedClient {
        type Transaction = ScriptedTx;
        type Error = DbError;

        async fn begin(&self) -> Result<ScriptedTx, DbError> {
            self.log.lock().unwrap().push("begin");
            if self.fail_begin {
                return Err(DbError::ConnectionError("connection refused".into()));
            }
            Ok(ScriptedTx {
                log: Arc::clone(&self.log),
                fail_rollback: self.fail_rollback,
                commit_results: Arc::clone(&self.commit_results),
            })
        }
    }

    #[async_trait]
    impl Transaction for ScriptedTx {
        type Error = DbError;

        async fn commit(self) -> Result<(), DbError> {
            self.log.lock().unwrap().push("commit");
            self.commit_results.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }

        async fn rollback(self) -> Result<(), DbError> {
            self.log.lock().unwrap().push("rollback");
            if self.fail_rollback {
                return Err(DbError::ConnectionError("connection reset".into()));
            }
            Ok(())
        }
    }

    fn restart() -> DbError {
        DbError::serialization_failure("restart transaction")
    }

    #[tokio::test]
    async fn test_success_commits_once() {
        let client = ScriptedClient::default();
        let committed = TxRunner::new()
            .run(&client, |tx| {
                Box::pin(async move {
                    tx.exec();
                    Ok::<_, DbError>(7)
                })
            })
            .await
            .unwrap();

        assert_eq!(committed, Committed { value: 7, attempts: 1 });
        assert_eq!(committed.retries(), 0);
        assert_eq!(client.calls(), vec!["begin", "exec", "commit"]);
    }

    #[tokio::test]
    async fn test_fatal_work_error_short_circuits() {
        let client = ScriptedClient::default();
        let result: Result<(), TxError<DbError>> = execute_tx(&client, |tx| {
            Box::pin(async move {
                tx.exec();
                Err(DbError::ExecutionError("insufficient funds".into()))
            })
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(&err, TxError::Work(DbError::ExecutionError(msg)) if msg == "insufficient funds"));
        assert_eq!(client.calls(), vec!["begin", "exec", "rollback"]);
    }

    #[tokio::test]
    async fn test_retryable_work_error_restarts_from_begin() {
        let client = ScriptedClient::default();
        let calls = Arc::new(AtomicU32::new(0));

        let committed = TxRunner::new()
            .run(&client, |tx| {
                let calls = Arc::clone(&calls);
                Box::pin(async move {
                    tx.exec();
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        return Err(restart());
                    }
                    Ok(())
                })
            })
            .await
            .unwrap();

        assert_eq!(committed.attempts, 3);
        assert_eq!(
            client.calls(),
            vec![
                "begin", "exec", "rollback", "begin", "exec", "rollback", "begin", "exec", "commit"
            ]
        );
    }

    #[tokio::test]
    async fn test_begin_failure_is_fatal_without_rollback() {
        let client = ScriptedClient {
            fail_begin: true,
            ..ScriptedClient::default()
        };
        let invoked = Arc::new(AtomicU32::new(0));

        let result: Result<(), TxError<DbError>> = execute_tx(&client, |_tx| {
            let invoked = Arc::clone(&invoked);
            Box::pin(async move {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_begin());
        assert!(matches!(err.inner(), DbError::ConnectionError(_)));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(client.calls(), vec!["begin"]);
    }

    #[tokio::test]
    async fn test_retryable_commit_failure_restarts() {
        let client = ScriptedClient::with_commits(vec![Err(restart()), Ok(())]);

        let committed = TxRunner::new()
            .run(&client, |tx| {
                Box::pin(async move {
                    tx.exec();
                    Ok::<_, DbError>("done")
                })
            })
            .await
            .unwrap();

        assert_eq!(committed.value, "done");
        assert_eq!(committed.attempts, 2);
        assert_eq!(
            client.calls(),
            vec!["begin", "exec", "commit", "begin", "exec", "commit"]
        );
    }

    #[tokio::test]
    async fn test_fatal_commit_failure_is_returned_verbatim() {
        let client = ScriptedClient::with_commits(vec![Err(DbError::database(
            SqlState::new("23505"),
            "duplicate key value",
        ))]);

        let result: Result<(), TxError<DbError>> =
            execute_tx(&client, |_tx| Box::pin(async move { Ok(()) })).await;

        let err = result.unwrap_err();
        assert!(err.is_commit());
        assert_eq!(err.inner().sql_state(), Some(SqlState::new("23505")));
        assert_eq!(client.calls(), vec!["begin", "commit"]);
    }

    #[tokio::test]
    async fn test_rollback_failure_does_not_mask_work_error() {
        let client = ScriptedClient {
            fail_rollback: true,
            ..ScriptedClient::default()
        };

        let result: Result<(), TxError<DbError>> = execute_tx(&client, |_tx| {
            Box::pin(async move { Err(DbError::ExecutionError("bad request".into())) })
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "Execution error: bad request");
        assert_eq!(client.calls(), vec!["begin", "rollback"]);
    }

    #[tokio::test]
    async fn test_rollback_failure_still_allows_retry() {
        let client = ScriptedClient {
            fail_rollback: true,
            ..ScriptedClient::default()
        };
        let calls = Arc::new(AtomicU32::new(0));

        let committed = TxRunner::new()
            .run(&client, |_tx| {
                let calls = Arc::clone(&calls);
                Box::pin(async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(restart());
                    }
                    Ok::<_, DbError>(())
                })
            })
            .await
            .unwrap();

        assert_eq!(committed.attempts, 2);
        assert_eq!(client.calls(), vec!["begin", "rollback", "begin", "commit"]);
    }

    #[test]
    fn test_attempt_counter_saturates() {
        assert_eq!(next_attempt(0), 1);
        assert_eq!(next_attempt(u32::MAX - 1), u32::MAX);
        assert_eq!(next_attempt(u32::MAX), u32::MAX);
    }

    #[tokio::test]
    async fn test_bounded_policy_gives_up() {
        let client = ScriptedClient::default();
        let runner = TxRunner::with_policy(Bounded::new(3));

        let result: Result<Committed<()>, TxError<DbError>> = runner
            .run(&client, |_tx| Box::pin(async move { Err(restart()) }))
            .await;

        match result.unwrap_err() {
            TxError::RetriesExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(is_retryable(&source));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(client.calls().iter().filter(|c| **c == "begin").count(), 3);
        assert_eq!(client.calls().iter().filter(|c| **c == "rollback").count(), 3);
    }

    #[tokio::test]
    async fn test_anyhow_work_errors_are_classified() {
        let client = ScriptedClient::default();
        let calls = Arc::new(AtomicU32::new(0));

        let committed = TxRunner::new()
            .run(&client, |_tx| {
                let calls = Arc::clone(&calls);
                Box::pin(async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(anyhow::Error::new(restart()).context("transfer"));
                    }
                    Ok::<_, anyhow::Error>(())
                })
            })
            .await
            .unwrap();
        assert_eq!(committed.attempts, 2);

        let result: Result<(), TxError<anyhow::Error>> = execute_tx(&client, |_tx| {
            Box::pin(async move { Err(anyhow::anyhow!("validation failed")) })
        })
        .await;
        assert_eq!(result.unwrap_err().to_string(), "validation failed");
    }
}

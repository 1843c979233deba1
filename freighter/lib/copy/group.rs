//! A reusable bounded concurrency group.
//!
//! Jobs are spawned up to a concurrency limit; individual failures are
//! collected rather than rethrown, the first error is preserved for the
//! group's final result, and cancellation aborts pending and in-flight
//! jobs. The copier and the tree replicator both fan out through this
//! primitive.

use std::{future::Future, sync::Arc};

use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{FreighterError, FreighterResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Runs submitted jobs with at most `limit` in flight.
pub struct ConcurrencyGroup {
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<FreighterResult<()>>,
    cancel: CancellationToken,
}

/// The collected outcome of a group: every error in submission-completion
/// order, plus whether the group was cancelled.
#[derive(Debug)]
pub struct GroupOutcome {
    /// Errors from failed jobs, first one first.
    pub errors: Vec<FreighterError>,

    /// The number of jobs that completed without error.
    pub completed: usize,

    /// True if the cancellation token fired while jobs were outstanding.
    pub cancelled: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ConcurrencyGroup {
    /// Creates a group running at most `limit` jobs at a time under the
    /// given cancellation token.
    pub fn new(limit: usize, cancel: CancellationToken) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit.max(1))),
            tasks: JoinSet::new(),
            cancel,
        }
    }

    /// Submits a job. The job starts once a slot frees up; a fired
    /// cancellation token resolves it to [`FreighterError::Cancelled`]
    /// without running it (or aborts it mid-flight).
    pub fn spawn<F>(&mut self, job: F)
    where
        F: Future<Output = FreighterResult<()>> + Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            let _permit = tokio::select! {
                _ = cancel.cancelled() => return Err(FreighterError::Cancelled),
                permit = semaphore.acquire_owned() => {
                    permit.map_err(|_| FreighterError::Cancelled)?
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => Err(FreighterError::Cancelled),
                result = job => result,
            }
        });
    }

    /// Waits for every submitted job and collects the outcome.
    pub async fn wait(mut self) -> GroupOutcome {
        let mut errors = Vec::new();
        let mut completed = 0usize;

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => completed += 1,
                Ok(Err(err)) => errors.push(err),
                Err(join_err) => errors.push(join_err.into()),
            }
        }

        GroupOutcome {
            errors,
            completed,
            cancelled: self.cancel.is_cancelled(),
        }
    }
}

impl GroupOutcome {
    /// Consumes the outcome, returning the first error if any job failed.
    /// Cancellation is reported as [`FreighterError::Cancelled`] rather
    /// than a unit failure.
    pub fn into_result(mut self) -> FreighterResult<usize> {
        if self.cancelled {
            return Err(FreighterError::Cancelled);
        }
        if self.errors.is_empty() {
            return Ok(self.completed);
        }
        Err(self.errors.remove(0))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_group_runs_all_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut group = ConcurrencyGroup::new(4, CancellationToken::new());

        for _ in 0..20 {
            let counter = counter.clone();
            group.spawn(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let outcome = group.wait().await;
        assert_eq!(outcome.completed, 20);
        assert!(outcome.errors.is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test_log::test(tokio::test)]
    async fn test_group_limits_concurrency() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut group = ConcurrencyGroup::new(3, CancellationToken::new());

        for _ in 0..12 {
            let current = current.clone();
            let peak = peak.clone();
            group.spawn(async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }

        group.wait().await;
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test_log::test(tokio::test)]
    async fn test_group_collects_errors_without_cancelling_peers() {
        let mut group = ConcurrencyGroup::new(2, CancellationToken::new());
        group.spawn(async { Err(FreighterError::InvalidInput("first".into())) });
        group.spawn(async { Ok(()) });
        group.spawn(async { Err(FreighterError::InvalidInput("second".into())) });

        let outcome = group.wait().await;
        assert_eq!(outcome.completed, 1);
        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome.into_result().is_err());
    }

    #[test_log::test(tokio::test)]
    async fn test_group_cancellation_aborts_pending() {
        let cancel = CancellationToken::new();
        let started = Arc::new(AtomicUsize::new(0));
        let mut group = ConcurrencyGroup::new(1, cancel.clone());

        for _ in 0..5 {
            let started = started.clone();
            group.spawn(async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                Ok(())
            });
        }

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();

        let outcome = group.wait().await;
        assert!(outcome.cancelled);
        assert!(matches!(
            outcome.into_result(),
            Err(FreighterError::Cancelled)
        ));
        assert!(started.load(Ordering::SeqCst) <= 2);
    }
}

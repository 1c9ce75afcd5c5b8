//! Queue entries and their completion handles.
//!
//! A queued operation is stored behind the [`Job`] trait so a single queue can
//! hold operations with different output and error types. Each entry owns the
//! sending half of a oneshot channel; the caller holds the receiving half
//! inside an [`Execution`].

use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::ExecuteError;

/// Result of running a job once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Attempt {
    Succeeded,
    Failed,
    Panicked,
}

/// A type-erased queue entry.
#[async_trait]
pub(crate) trait Job: Send {
    /// Sequence number within the owning limiter, for log correlation.
    fn id(&self) -> u64;

    /// Run the operation once, keeping its outcome for [`Job::settle`].
    async fn attempt(&mut self) -> Attempt;

    /// Deliver the last outcome to the caller. Consumes the job.
    fn settle(self: Box<Self>);
}

type Outcome<T, E> = Result<T, ExecuteError<E>>;

/// A caller's operation plus the channel its result goes back on.
pub(crate) struct Pending<F, T, E> {
    id: u64,
    operation: F,
    outcome: Option<Outcome<T, E>>,
    completion: oneshot::Sender<Outcome<T, E>>,
}

impl<F, T, E> Pending<F, T, E> {
    pub(crate) fn new<Fut>(id: u64, operation: F) -> (Self, Execution<T, E>)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let (tx, rx) = oneshot::channel();
        let pending = Self {
            id,
            operation,
            outcome: None,
            completion: tx,
        };
        (pending, Execution::waiting(rx))
    }
}

#[async_trait]
impl<F, Fut, T, E> Job for Pending<F, T, E>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    fn id(&self) -> u64 {
        self.id
    }

    async fn attempt(&mut self) -> Attempt {
        let result = AssertUnwindSafe(async { (self.operation)().await })
            .catch_unwind()
            .await;

        let (attempt, outcome) = match result {
            Ok(Ok(value)) => (Attempt::Succeeded, Ok(value)),
            Ok(Err(error)) => (Attempt::Failed, Err(ExecuteError::Operation(error))),
            Err(_) => (Attempt::Panicked, Err(ExecuteError::Panicked)),
        };
        self.outcome = Some(outcome);
        attempt
    }

    fn settle(self: Box<Self>) {
        let this = *self;
        let outcome = this.outcome.unwrap_or(Err(ExecuteError::Abandoned));
        if this.completion.send(outcome).is_err() {
            trace!(job = this.id, "Caller dropped its handle before completion");
        }
    }
}

/// Handle to a submitted operation.
///
/// Resolves exactly once, to the operation's value or to the reason it did not
/// produce one. Dropping the handle does not cancel the operation; it still
/// runs in its turn and the result is discarded.
#[must_use = "an Execution does nothing to the queued operation unless awaited"]
pub struct Execution<T, E> {
    state: State<T, E>,
}

enum State<T, E> {
    Waiting(oneshot::Receiver<Outcome<T, E>>),
    Rejected(Option<ExecuteError<E>>),
}

impl<T, E> Execution<T, E> {
    fn waiting(rx: oneshot::Receiver<Outcome<T, E>>) -> Self {
        Self {
            state: State::Waiting(rx),
        }
    }

    /// A handle that resolves immediately with `error`.
    pub(crate) fn rejected(error: ExecuteError<E>) -> Self {
        Self {
            state: State::Rejected(Some(error)),
        }
    }
}

// Never structurally pinned: the receiver and the owned error are moved freely.
impl<T, E> Unpin for Execution<T, E> {}

impl<T, E> Future for Execution<T, E> {
    type Output = Outcome<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            State::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
                Poll::Ready(Err(_)) => Poll::Ready(Err(ExecuteError::Abandoned)),
                Poll::Pending => Poll::Pending,
            },
            State::Rejected(error) => match error.take() {
                Some(error) => Poll::Ready(Err(error)),
                None => panic!("Execution polled after completion"),
            },
        }
    }
}

impl<T, E> std::fmt::Debug for Execution<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            State::Waiting(_) => "waiting",
            State::Rejected(_) => "rejected",
        };
        f.debug_struct("Execution").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready};

    #[tokio::test]
    async fn test_attempt_then_settle() {
        let (pending, execution) = Pending::new(1, || async { Ok::<_, String>(7) });
        let mut job: Box<dyn Job> = Box::new(pending);

        assert_eq!(job.attempt().await, Attempt::Succeeded);
        job.settle();

        assert_eq!(execution.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_settle_keeps_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let (pending, execution) = Pending::new(2, move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err::<(), _>(format!("attempt {n}")) }
        });
        let mut job: Box<dyn Job> = Box::new(pending);

        assert_eq!(job.attempt().await, Attempt::Failed);
        assert_eq!(job.attempt().await, Attempt::Failed);
        job.settle();

        let err = execution.await.unwrap_err();
        assert_eq!(err.into_operation(), Some("attempt 2".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_attempt_catches_panic() {
        let (pending, execution) = Pending::new(3, || async {
            if true {
                panic!("operation blew up");
            }
            Ok::<(), String>(())
        });
        let mut job: Box<dyn Job> = Box::new(pending);

        assert_eq!(job.attempt().await, Attempt::Panicked);
        job.settle();
        assert!(matches!(execution.await, Err(ExecuteError::Panicked)));
    }

    #[tokio::test]
    async fn test_dropped_job_abandons_execution() {
        let (pending, execution) = Pending::new(4, || async { Ok::<_, String>(()) });
        drop(pending);
        assert!(matches!(execution.await, Err(ExecuteError::Abandoned)));
    }

    #[test]
    fn test_execution_pending_until_settled() {
        let (pending, execution) = Pending::new(5, || async { Ok::<_, String>("done") });
        let mut execution = tokio_test::task::spawn(execution);
        assert_pending!(execution.poll());

        let mut job: Box<dyn Job> = Box::new(pending);
        futures::executor::block_on(job.attempt());
        job.settle();

        assert!(execution.is_woken());
        let result = assert_ready!(execution.poll());
        assert_eq!(result.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_rejected_execution() {
        let execution: Execution<(), String> = Execution::rejected(ExecuteError::NoRuntime);
        assert!(matches!(execution.await, Err(ExecuteError::NoRuntime)));
    }
}

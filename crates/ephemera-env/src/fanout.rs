//! Fan-out/fan-in of concurrent phase tasks.
//!
//! Every task gets a child token of the phase. The first failure cancels
//! that token so the remaining tasks can stop early, but every launched
//! task is still awaited before the phase returns.

use std::future::Future;

use ephemera_common::error::{EphemeraError, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A set of concurrent tasks sharing one cancellation token.
#[derive(Debug)]
pub struct FanOut<T> {
    phase: &'static str,
    cancel: CancellationToken,
    tasks: JoinSet<Result<T>>,
}

impl<T: Send + 'static> FanOut<T> {
    /// Starts a phase whose token is a child of `parent`.
    #[must_use]
    pub fn new(phase: &'static str, parent: &CancellationToken) -> Self {
        Self {
            phase,
            cancel: parent.child_token(),
            tasks: JoinSet::new(),
        }
    }

    /// Launches a task receiving the phase token.
    pub fn spawn<F, Fut>(&mut self, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let _ = self.tasks.spawn(task(self.cancel.clone()));
    }

    /// Returns the number of launched tasks not yet joined.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns `true` if no task is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Awaits every task. Returns all results in completion order, or the
    /// first genuine failure.
    ///
    /// # Errors
    ///
    /// Returns the first error reported by a task. A cancellation error is
    /// only returned when no task failed for another reason.
    pub async fn join(mut self) -> Result<Vec<T>> {
        let mut results = Vec::with_capacity(self.tasks.len());
        let mut failure: Option<EphemeraError> = None;

        while let Some(joined) = self.tasks.join_next().await {
            let outcome = joined.unwrap_or_else(|e| {
                Err(if e.is_cancelled() {
                    EphemeraError::Cancelled
                } else {
                    EphemeraError::driver("join task", self.phase, e)
                })
            });
            match outcome {
                Ok(value) => results.push(value),
                Err(e) => {
                    if failure.is_none() {
                        tracing::debug!(phase = self.phase, error = %e, "phase task failed, cancelling siblings");
                        self.cancel.cancel();
                    }
                    let replace = match &failure {
                        None => true,
                        Some(previous) => previous.is_cancellation() && !e.is_cancellation(),
                    };
                    if replace {
                        failure = Some(e);
                    }
                }
            }
        }

        failure.map_or(Ok(results), Err)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn join_collects_every_result() {
        let mut fan = FanOut::new("test", &CancellationToken::new());
        for i in 0..4_u32 {
            fan.spawn(move |_| async move { Ok(i) });
        }
        assert_eq!(fan.len(), 4);
        let mut results = fan.join().await.expect("join");
        results.sort_unstable();
        assert_eq!(results, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn first_error_cancels_siblings_and_drains_them() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut fan = FanOut::new("test", &CancellationToken::new());

        fan.spawn(|_| async {
            Err::<(), _>(EphemeraError::Readiness {
                check: "net(tcp://x:1)".into(),
            })
        });
        for _ in 0..3 {
            let finished = Arc::clone(&finished);
            fan.spawn(move |cancel| async move {
                tokio::select! {
                    () = cancel.cancelled() => {}
                    () = tokio::time::sleep(Duration::from_secs(30)) => {}
                }
                let _ = finished.fetch_add(1, Ordering::SeqCst);
                Err(EphemeraError::Cancelled)
            });
        }

        let err = fan.join().await.expect_err("failure");
        assert!(matches!(err, EphemeraError::Readiness { .. }), "{err}");
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn parent_cancellation_reaches_tasks() {
        let parent = CancellationToken::new();
        let mut fan = FanOut::new("test", &parent);
        fan.spawn(|cancel| async move {
            cancel.cancelled().await;
            Err::<(), _>(EphemeraError::Cancelled)
        });
        parent.cancel();
        assert!(fan.join().await.expect_err("cancelled").is_cancellation());
    }

    #[tokio::test]
    async fn empty_phase_succeeds() {
        let fan: FanOut<()> = FanOut::new("test", &CancellationToken::new());
        assert!(fan.is_empty());
        assert!(fan.join().await.expect("join").is_empty());
    }
}

//! Fail-fast task group for the relay, the router and an entry point.
//!
//! All tasks share one [`CancellationToken`]. The first task to fail cancels
//! the token, so its siblings shut down, and its error is what
//! [`Supervisor::wait`] returns.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt as _;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;
use tracing_error::SpanTrace;

type TaskResult = (String, Result<(), tower::BoxError>);

pub struct Supervisor {
    tasks: JoinSet<TaskResult>,
    cancel: CancellationToken,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl Supervisor {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            tasks: JoinSet::new(),
            cancel,
        }
    }

    /// Token shared by every task; cancel it to start a graceful shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn<F, E>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<tower::BoxError>,
    {
        let name = name.into();
        let span = tracing::info_span!("task", name = %name);
        self.tasks.spawn(
            async move {
                let outcome = AssertUnwindSafe(task).catch_unwind().await;
                let result: Result<(), tower::BoxError> = match outcome {
                    Ok(result) => result.map_err(Into::into),
                    Err(_) => Err(tower::BoxError::from("task panicked")),
                };
                (name, result)
            }
            .instrument(span),
        );
    }

    /// Spawn `task` once `ready` resolves, or never if shutdown comes first.
    ///
    /// Used to open the entry point only after
    /// [`Router::running`](crate::Router::running).
    pub fn spawn_after<R, F, E>(&mut self, name: impl Into<String>, ready: R, task: F)
    where
        R: Future<Output = ()> + Send + 'static,
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<tower::BoxError>,
    {
        let cancel = self.cancel.clone();
        self.spawn(name, async move {
            tokio::select! {
                _ = cancel.cancelled() => Ok(()),
                _ = ready => task.await.map_err(Into::<tower::BoxError>::into),
            }
        });
    }

    /// Wait for every task to finish.
    ///
    /// Returns the first failure, after the remaining tasks observed the
    /// cancellation and exited.
    pub async fn wait(mut self) -> Result<(), SupervisorError> {
        let mut first_error = None;

        while let Some(joined) = self.tasks.join_next().await {
            let (name, result) = match joined {
                Ok(finished) => finished,
                Err(err) => ("<aborted>".to_owned(), Err(err.into())),
            };
            match result {
                Ok(()) => tracing::info!(task = %name, "Task finished"),
                Err(error) => {
                    tracing::error!(task = %name, %error, "Task failed, shutting down");
                    self.cancel.cancel();
                    if first_error.is_none() {
                        first_error = Some(SupervisorError::new(name, error));
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// The first task failure observed by a [`Supervisor`].
#[derive(Debug)]
pub struct SupervisorError {
    context: SpanTrace,
    task: String,
    source: tower::BoxError,
}

impl SupervisorError {
    fn new(task: String, source: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            task,
            source,
        }
    }

    pub fn task(&self) -> &str {
        &self.task
    }
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Task `{}` failed: {}", self.task, self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[tokio::test]
    async fn failure_cancels_siblings() {
        let mut supervisor = Supervisor::default();
        let cancel = supervisor.cancellation_token();

        supervisor.spawn("sibling", async move {
            cancel.cancelled().await;
            Ok::<_, tower::BoxError>(())
        });
        supervisor.spawn("broken", async { Err::<(), _>("boom") });

        let err = supervisor.wait().await.unwrap_err();
        assert_eq!(err.task(), "broken");
    }

    #[tokio::test]
    async fn panic_is_reported_as_failure() {
        let mut supervisor = Supervisor::default();
        supervisor.spawn("panicky", async {
            if true {
                panic!("oops");
            }
            Ok::<_, tower::BoxError>(())
        });

        let err = supervisor.wait().await.unwrap_err();
        assert_eq!(err.task(), "panicky");
    }

    #[tokio::test]
    async fn spawn_after_waits_for_readiness() {
        let mut supervisor = Supervisor::default();
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();
        let started = Arc::new(AtomicBool::new(false));

        let flag = started.clone();
        supervisor.spawn_after(
            "entry",
            async move {
                let _ = ready_rx.await;
            },
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, tower::BoxError>(())
            },
        );

        tokio::task::yield_now().await;
        assert!(!started.load(Ordering::SeqCst));

        ready_tx.send(()).unwrap();
        supervisor.wait().await.unwrap();
        assert!(started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_before_readiness_skips_task() {
        let mut supervisor = Supervisor::default();
        let started = Arc::new(AtomicBool::new(false));

        let flag = started.clone();
        supervisor.spawn_after("entry", std::future::pending(), async move {
            flag.store(true, Ordering::SeqCst);
            Ok::<_, tower::BoxError>(())
        });
        supervisor.cancellation_token().cancel();

        supervisor.wait().await.unwrap();
        assert!(!started.load(Ordering::SeqCst));
    }
}

use std::{future::Future, pin::Pin, time::Duration};

use serde::Deserialize;
use tower::{Layer, Service, ServiceExt as _};

use crate::Envelope;
use crate::backoff::Backoff;
use crate::router::{HandlerError, Incoming};

/// Bounded retry policy for handler invocations.
///
/// A failing delivery is attempted at most `1 + max_retries` times, waiting
/// `backoff.delay(n)` before the n-th retry.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            backoff: Backoff::new(Duration::from_millis(100), 2.0, Duration::from_secs(1)),
        }
    }
}

/// Tower `Service` wrapper retrying the inner handler in place.
///
/// Retries run inline, so the consumer does not receive its next message
/// until the current one succeeded or exhausted its budget. Retrying stops
/// early when the handling context is cancelled.
#[derive(Clone)]
pub struct RetryService<T> {
    inner: T,
    config: RetryConfig,
}

impl<T> Service<Incoming> for RetryService<T>
where
    T: Service<Incoming, Response = Vec<Envelope>, Error = HandlerError> + Clone + Send + 'static,
    T::Future: Send + 'static,
{
    type Response = Vec<Envelope>;
    type Error = HandlerError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Incoming) -> Self::Future {
        let inner = self.inner.clone();
        let config = self.config;

        Box::pin(async move {
            let mut delays = config.backoff.iter();
            loop {
                let error = match inner.clone().oneshot(req.clone()).await {
                    Ok(produced) => return Ok(produced),
                    Err(error) => error,
                };

                let retries = delays.attempt();
                if retries >= config.max_retries || req.context().is_cancelled() {
                    tracing::warn!(
                        retries,
                        error = %error.reason(),
                        "Giving up on message"
                    );
                    return Err(error);
                }

                let delay = delays.next().unwrap_or(config.backoff.max_interval);
                tracing::info!(
                    retry = retries + 1,
                    max_retries = config.max_retries,
                    ?delay,
                    error = %error.reason(),
                    "Retrying message"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = req.context().cancellation().cancelled() => return Err(error),
                }
            }
        })
    }
}

/// Tower `Layer` that applies `RetryService` to a handler.
#[derive(Clone, Copy)]
pub struct RetryLayer {
    config: RetryConfig,
}

impl RetryLayer {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RetryService {
            inner: service,
            config: self.config,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;
    use tower::service_fn;

    use super::*;
    use crate::context::Context;

    fn incoming(cancel: CancellationToken) -> Incoming {
        let envelope = Envelope::new("t", Vec::new());
        let ctx = Context::from_envelope(cancel, &envelope);
        Incoming::new(envelope, ctx, "h", "1")
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_follows_backoff_then_gives_up() {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let recorded = attempts.clone();
        let handler = service_fn(move |_: Incoming| {
            recorded.lock().unwrap().push(start.elapsed());
            async { Err::<Vec<Envelope>, _>(HandlerError::handler("boom")) }
        });
        let config = RetryConfig {
            max_retries: 3,
            backoff: Backoff::new(Duration::from_millis(100), 2.0, Duration::from_millis(250)),
        };

        let result = RetryLayer::new(config)
            .layer(handler)
            .oneshot(incoming(CancellationToken::new()))
            .await;

        assert!(result.is_err());
        assert_eq!(
            *attempts.lock().unwrap(),
            vec![
                Duration::ZERO,
                Duration::from_millis(100),
                Duration::from_millis(300),
                Duration::from_millis(550),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_failures_returns_output() {
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let handler = service_fn(move |_: Incoming| {
            let mut calls = counter.lock().unwrap();
            *calls += 1;
            let attempt = *calls;
            async move {
                if attempt < 3 {
                    Err(HandlerError::handler("not yet"))
                } else {
                    Ok(vec![Envelope::new("out", Vec::new())])
                }
            }
        });

        let produced = RetryLayer::new(RetryConfig::default())
            .layer(handler)
            .oneshot(incoming(CancellationToken::new()))
            .await
            .unwrap();

        assert_eq!(produced.len(), 1);
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_retrying() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let token = cancel.clone();
        let handler = service_fn(move |_: Incoming| {
            *counter.lock().unwrap() += 1;
            token.cancel();
            async { Err::<Vec<Envelope>, _>(HandlerError::handler("boom")) }
        });

        let result = RetryLayer::new(RetryConfig::default())
            .layer(handler)
            .oneshot(incoming(cancel))
            .await;

        assert!(result.is_err());
        assert_eq!(*calls.lock().unwrap(), 1);
    }
}

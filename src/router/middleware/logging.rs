use std::{future::Future, pin::Pin, time::Instant};

use tower::{Layer, Service};
use tracing::Instrument as _;

use crate::Envelope;
use crate::router::{HandlerError, Incoming};

/// Tower `Service` wrapper recording every handler invocation.
#[derive(Clone)]
pub struct LoggingService<T> {
    inner: T,
}

impl<T> Service<Incoming> for LoggingService<T>
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
        let mut inner = self.inner.clone();
        let span = tracing::info_span!(
            "handle",
            handler = req.handler_name(),
            message_id = %req.envelope().id(),
            correlation_id = req.context().correlation_id(),
            topic = req.envelope().topic(),
        );

        Box::pin(
            async move {
                tracing::debug!("Handling message");
                let started = Instant::now();
                let result = inner.call(req).await;
                match &result {
                    Ok(produced) => tracing::debug!(
                        produced = produced.len(),
                        elapsed = ?started.elapsed(),
                        "Message handled"
                    ),
                    Err(error) => tracing::error!(
                        error = %error.reason(),
                        elapsed = ?started.elapsed(),
                        "Handler returned an error"
                    ),
                }
                result
            }
            .instrument(span),
        )
    }
}

/// Tower `Layer` that applies `LoggingService` to a handler.
#[derive(Clone, Copy, Default)]
pub struct LoggingLayer;

impl<S> Layer<S> for LoggingLayer {
    type Service = LoggingService<S>;

    fn layer(&self, service: S) -> Self::Service {
        LoggingService { inner: service }
    }
}

use std::{future::Future, pin::Pin};

use tower::{Layer, Service};

use crate::Envelope;
use crate::context::generate_correlation_id;
use crate::envelope::CORRELATION_ID;

/// Tower `Service` wrapper that guarantees a correlation id on every envelope.
///
/// Envelopes published outside of any handling context (a script, a
/// scheduled job) would otherwise start a chain downstream consumers cannot
/// trace. Envelopes that already carry a correlation id pass through untouched.
#[derive(Clone)]
pub struct CorrelationService<T> {
    inner: T,
}

impl<T> Service<Envelope> for CorrelationService<T>
where
    T: Service<Envelope> + Clone + Send + 'static,
    T::Error: Into<tower::BoxError>,
    T::Future: Send + 'static,
{
    type Response = T::Response;
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Envelope) -> Self::Future {
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let envelope = if req.metadata().correlation_id().is_some() {
                req
            } else {
                req.with_metadata(CORRELATION_ID, generate_correlation_id())
            };

            inner.call(envelope).await.map_err(Into::into)
        })
    }
}

/// Tower `Layer` that applies `CorrelationService` to a service stack.
#[derive(Clone, Copy, Default)]
pub struct CorrelationLayer;

impl<S> Layer<S> for CorrelationLayer {
    type Service = CorrelationService<S>;

    fn layer(&self, service: S) -> Self::Service {
        CorrelationService { inner: service }
    }
}

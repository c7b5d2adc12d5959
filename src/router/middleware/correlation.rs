use std::{future::Future, pin::Pin};

use tower::{Layer, Service};

use crate::Envelope;
use crate::envelope::CORRELATION_ID;
use crate::router::{HandlerError, Incoming};

/// Tower `Service` wrapper propagating the correlation id of a delivery.
///
/// The handling context already continues the inbound chain, or starts a new
/// one when the envelope had no correlation id. This middleware writes that id
/// back onto the inbound envelope when it was missing and onto every envelope
/// the handler produces, replacing whatever the handler set.
#[derive(Clone)]
pub struct CorrelationService<T> {
    inner: T,
}

impl<T> Service<Incoming> for CorrelationService<T>
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
        let ctx = req.context().clone();

        let req = if req.envelope().metadata().correlation_id() == Some(ctx.correlation_id()) {
            req
        } else {
            let id = ctx.correlation_id().to_owned();
            req.map_envelope(|envelope| envelope.with_metadata(CORRELATION_ID, id))
        };

        Box::pin(async move {
            let produced = inner.call(req).await?;
            Ok(produced
                .into_iter()
                .map(|envelope| ctx.stamp(envelope))
                .collect())
        })
    }
}

/// Tower `Layer` that applies `CorrelationService` to a handler.
#[derive(Clone, Copy, Default)]
pub struct CorrelationLayer;

impl<S> Layer<S> for CorrelationLayer {
    type Service = CorrelationService<S>;

    fn layer(&self, service: S) -> Self::Service {
        CorrelationService { inner: service }
    }
}

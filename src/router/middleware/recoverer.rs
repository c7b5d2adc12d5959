use std::{any::Any, future::Future, panic::AssertUnwindSafe, pin::Pin};

use futures::FutureExt as _;
use tower::{Layer, Service};

use crate::Envelope;
use crate::router::{HandlerError, Incoming};

/// Tower `Service` wrapper turning a panicking handler into a [`HandlerError`].
///
/// The panic is caught at this layer, so it rejects the delivery instead of
/// tearing down the consumer task. Register it first to cover every other
/// middleware as well.
#[derive(Clone)]
pub struct RecovererService<T> {
    inner: T,
}

impl<T> Service<Incoming> for RecovererService<T>
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

        Box::pin(async move {
            match AssertUnwindSafe(async move { inner.call(req).await })
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(panic = %message, "Handler panicked");
                    Err(HandlerError::panicked(message))
                }
            }
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Tower `Layer` that applies `RecovererService` to a handler.
#[derive(Clone, Copy, Default)]
pub struct RecovererLayer;

impl<S> Layer<S> for RecovererLayer {
    type Service = RecovererService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RecovererService { inner: service }
    }
}

use std::{future::Future, pin::Pin};

use tower::{Layer, Service, ServiceExt as _};

use crate::Envelope;
use crate::router::{HandlerError, Incoming, PublishService};

/// Metadata key holding why a message was dead-lettered.
pub const DEAD_LETTER_REASON: &str = "dead_letter_reason";
/// Metadata key holding the handler that gave up on the message.
pub const DEAD_LETTER_HANDLER: &str = "dead_letter_handler";
/// Metadata key holding the topic the message was consumed from.
pub const DEAD_LETTER_TOPIC: &str = "dead_letter_topic";

/// Tower `Service` wrapper moving failed deliveries to a dead-letter topic.
///
/// When the wrapped chain fails, the inbound envelope (same id, payload and
/// metadata) is published to the dead-letter topic with the failure recorded
/// in its metadata, and the delivery is reported as handled so the broker
/// stops redelivering it. If the dead-letter publish itself fails, the
/// original error path applies and the delivery is rejected.
///
/// Failures observed after the handling context was cancelled are not
/// dead-lettered: the delivery is rejected and redelivered after restart.
///
/// Register it before [`RetryLayer`](super::RetryLayer) so only messages that
/// exhausted their retries are withdrawn.
#[derive(Clone)]
pub struct PoisonService<T> {
    inner: T,
    topic: String,
    publisher: PublishService,
}

impl<T> Service<Incoming> for PoisonService<T>
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
        let publisher = self.publisher.clone();
        let topic = self.topic.clone();
        let original = req.envelope().clone();
        let handler = req.handler_name().to_owned();
        let cancel = req.context().cancellation().clone();

        Box::pin(async move {
            let error = match inner.call(req).await {
                Ok(produced) => return Ok(produced),
                Err(error) => error,
            };

            if cancel.is_cancelled() {
                tracing::debug!(error = %error.reason(), "Shutting down, rejecting instead");
                return Err(error);
            }

            let source_topic = original.topic().to_owned();
            let dead = original
                .with_metadata(DEAD_LETTER_REASON, error.reason())
                .with_metadata(DEAD_LETTER_HANDLER, handler)
                .with_metadata(DEAD_LETTER_TOPIC, source_topic)
                .with_topic(topic.as_str());

            match publisher.oneshot(dead).await {
                Ok(()) => {
                    tracing::warn!(
                        dead_letter_topic = %topic,
                        error = %error.reason(),
                        "Message moved to dead-letter topic"
                    );
                    Ok(Vec::new())
                }
                Err(publish_error) => {
                    tracing::error!(%publish_error, "Failed to dead-letter message");
                    Err(error)
                }
            }
        })
    }
}

/// Tower `Layer` that applies `PoisonService` to a handler.
#[derive(Clone)]
pub struct PoisonLayer {
    topic: String,
    publisher: PublishService,
}

impl PoisonLayer {
    /// Dead-letter to `topic` through `publisher`, usually
    /// [`Router::publisher`](crate::Router::publisher).
    pub fn new(topic: impl Into<String>, publisher: PublishService) -> Self {
        Self {
            topic: topic.into(),
            publisher,
        }
    }
}

impl<S> Layer<S> for PoisonLayer {
    type Service = PoisonService<S>;

    fn layer(&self, service: S) -> Self::Service {
        PoisonService {
            inner: service,
            topic: self.topic.clone(),
            publisher: self.publisher.clone(),
        }
    }
}

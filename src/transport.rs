//! Transport abstractions and broker backends.
//!
//! This module defines a Tower-compatible publishing layer used by the relay,
//! the router and the event bus to hand [`Envelope`]s to a broker, and the
//! subscriber contract the router consumes from.
//!
//! Publishing is built around Tower's `Service` abstraction, enabling
//! middleware composition (correlation stamping, timeouts, buffering) while
//! keeping broker implementations backend-agnostic.
//!
//! ## Key components
//!
//! - [`Transport`]: Public-facing wrapper implementing `tower::Service`
//! - [`PublisherService`]: Adapter from a [`Publisher`] to a Tower service
//! - [`Publisher`]: Trait implemented by concrete broker backends
//! - [`Subscriber`]: Trait yielding a stream of [`Message`]s for a topic
//! - [`TransportError`]: Unified error type with tracing context

mod inmemory;

pub mod layers;

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing_error::SpanTrace;

use crate::Envelope;
use crate::event::EnvelopeSink;

pub use inmemory::InMemoryBroker;

/// Generic Tower-compatible transport wrapper.
///
/// `Transport` is the main entry point for publishing envelopes. It wraps an
/// underlying Tower `Service` and:
///
/// - Normalizes errors into [`TransportError`]
/// - Supports Tower middleware via layers
/// - Provides convenience [`send`](Transport::send) and
///   [`publish`](Transport::publish) APIs
///
/// Typically constructed from a concrete [`Publisher`] implementation.
#[derive(Clone)]
pub struct Transport<S> {
    service: S,
}

impl<D> Transport<PublisherService<D>> {
    /// Create a new transport from a concrete publisher backend.
    pub fn new(driver: D) -> Self {
        Self {
            service: PublisherService::new(driver),
        }
    }
}

impl<S> Transport<S> {
    /// Apply a Tower layer to the transport.
    pub fn layer<L>(self, layer: L) -> Transport<L::Service>
    where
        L: tower::Layer<S>,
    {
        Transport {
            service: layer.layer(self.service),
        }
    }
}

/// Tower `Service` implementation for `Transport`.
///
/// Delegates readiness and request handling to the inner service while mapping
/// all errors into [`TransportError`].
impl<R, S> Service<R> for Transport<S>
where
    S: Service<R> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
    R: Send + 'static,
{
    type Response = ();
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service
            .poll_ready(cx)
            .map_err(|e| TransportError::publish(e.into()))
    }

    fn call(&mut self, req: R) -> Self::Future {
        let mut service = self.service.clone();

        Box::pin(async move {
            service
                .call(req)
                .await
                .map_err(|e| TransportError::publish(e.into()))?;
            Ok(())
        })
    }
}

impl<S> Transport<S>
where
    S: Service<Envelope> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
{
    /// Send an [`Envelope`] to the topic it is addressed to.
    pub async fn send(&mut self, envelope: Envelope) -> Result<(), TransportError> {
        let mut service = self.service.clone();
        service
            .call(envelope)
            .await
            .map_err(|e| TransportError::publish(e.into()))?;
        Ok(())
    }

    /// Publish an [`Envelope`] under `topic`.
    pub async fn publish(&mut self, topic: &str, envelope: Envelope) -> Result<(), TransportError> {
        let envelope = if envelope.topic() == topic {
            envelope
        } else {
            envelope.with_topic(topic)
        };
        self.send(envelope).await
    }
}

/// Direct-mode sink: an [`EventBus`](crate::EventBus) over a transport
/// publishes straight to the broker.
#[async_trait::async_trait]
impl<S> EnvelopeSink for Transport<S>
where
    S: Service<Envelope> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
{
    async fn dispatch(&mut self, topic: &str, envelope: Envelope) -> Result<(), tower::BoxError> {
        self.publish(topic, envelope).await.map_err(Into::into)
    }
}

/// Error returned by transport operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// Errors originating from the publisher backend.
    Publish(tower::BoxError),
    /// Errors originating from the subscriber backend.
    Subscribe(tower::BoxError),
}

impl TransportError {
    /// Create a publish-related transport error.
    pub fn publish(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Publish(err),
        }
    }

    /// Create a subscribe-related transport error.
    pub fn subscribe(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Subscribe(err),
        }
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::Publish(err) => writeln!(f, "Publish error: {err}"),
            TransportErrorKind::Subscribe(err) => writeln!(f, "Subscribe error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Publish(err) => Some(err.as_ref()),
            TransportErrorKind::Subscribe(err) => Some(err.as_ref()),
        }
    }
}

/// Tower service adapter for a [`Publisher`] backend.
#[derive(Clone)]
pub struct PublisherService<D> {
    publisher: D,
}

impl<D> PublisherService<D> {
    pub fn new(publisher: D) -> Self {
        Self { publisher }
    }
}

/// `tower::Service` implementation delegating to a [`Publisher`].
impl<D> Service<Envelope> for PublisherService<D>
where
    D: Publisher + Clone + Send + 'static,
{
    type Response = ();
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Envelope) -> Self::Future {
        let mut publisher = self.publisher.clone();
        Box::pin(async move {
            let topic = req.topic().to_owned();
            publisher.publish(&topic, req).await.map_err(Into::into)?;
            Ok(())
        })
    }
}

/// Trait implemented by concrete broker backends able to publish.
#[async_trait::async_trait]
pub trait Publisher {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Publish an envelope under `topic`.
    async fn publish(&mut self, topic: &str, envelope: Envelope) -> Result<(), Self::Error>;
}

/// Stream of deliveries for one subscription.
///
/// The stream is infinite until the subscription's cancellation token fires.
pub type MessageStream = BoxStream<'static, Result<Message, TransportError>>;

/// Trait implemented by concrete broker backends able to deliver messages.
///
/// Subscriptions sharing a `consumer_group` compete for messages: each message
/// of the topic is delivered to exactly one of them. Distinct groups each
/// receive every message.
#[async_trait::async_trait]
pub trait Subscriber {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    async fn subscribe(
        &self,
        cancel: CancellationToken,
        topic: &str,
        consumer_group: &str,
    ) -> Result<MessageStream, Self::Error>;
}

/// Settlement capability attached to a delivered [`Message`].
pub trait Acknowledge: Send {
    /// Remove the message from the backlog.
    fn ack(self: Box<Self>);
    /// Hand the message back to the broker for redelivery.
    fn nack(self: Box<Self>);
}

/// A delivered envelope plus broker bookkeeping.
///
/// [`ack`](Message::ack) and [`nack`](Message::nack) consume the message, so it
/// is settled exactly once. A message dropped unsettled is nacked.
pub struct Message {
    envelope: Envelope,
    delivery_id: String,
    consumer_group: String,
    acker: Option<Box<dyn Acknowledge>>,
}

impl Message {
    pub fn new(
        envelope: Envelope,
        delivery_id: impl Into<String>,
        consumer_group: impl Into<String>,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            envelope,
            delivery_id: delivery_id.into(),
            consumer_group: consumer_group.into(),
            acker: Some(acker),
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn delivery_id(&self) -> &str {
        &self.delivery_id
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    pub fn ack(mut self) {
        if let Some(acker) = self.acker.take() {
            acker.ack();
        }
    }

    pub fn nack(mut self) {
        if let Some(acker) = self.acker.take() {
            acker.nack();
        }
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if let Some(acker) = self.acker.take() {
            tracing::warn!(
                delivery_id = %self.delivery_id,
                "Message dropped without settlement, rejecting"
            );
            acker.nack();
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("envelope", &self.envelope)
            .field("delivery_id", &self.delivery_id)
            .field("consumer_group", &self.consumer_group)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<&'static str>>>);

    struct RecordingAcker(Recorder);

    impl Acknowledge for RecordingAcker {
        fn ack(self: Box<Self>) {
            self.0.0.lock().unwrap().push("ack");
        }

        fn nack(self: Box<Self>) {
            self.0.0.lock().unwrap().push("nack");
        }
    }

    fn message(recorder: &Recorder) -> Message {
        Message::new(
            Envelope::new("topic", Vec::new()),
            "1",
            "group",
            Box::new(RecordingAcker(recorder.clone())),
        )
    }

    #[test]
    fn ack_settles_once() {
        let recorder = Recorder::default();
        message(&recorder).ack();
        assert_eq!(*recorder.0.lock().unwrap(), ["ack"]);
    }

    #[test]
    fn dropped_message_is_rejected() {
        let recorder = Recorder::default();
        drop(message(&recorder));
        assert_eq!(*recorder.0.lock().unwrap(), ["nack"]);
    }

    #[tokio::test]
    async fn publish_readdresses_envelope() {
        let broker = InMemoryBroker::new();
        let mut transport = Transport::new(broker.clone());

        transport
            .publish("other", Envelope::new("topic", b"x".to_vec()))
            .await
            .unwrap();

        assert!(broker.published("topic").is_empty());
        assert_eq!(broker.published("other").len(), 1);
    }
}

//! Message router: consumes broker subscriptions and dispatches to handlers.
//!
//! Each registered handler owns one subscription, under the consumer group
//! `consumer_group_prefix + name`. For every delivery the router:
//!
//! 1. builds an [`Incoming`] carrying the envelope and a fresh [`Context`]
//! 2. runs it through the middleware chain and the handler
//! 3. publishes the envelopes the handler produced to its publish topic
//! 4. acknowledges the delivery, or rejects it when any step failed
//!
//! Middleware are Tower [`Layer`]s over the boxed [`HandlerService`]; the
//! first registered middleware is the outermost one. See [`middleware`] for
//! the stock layers.

pub mod middleware;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tower::util::BoxCloneService;
use tower::{Layer, Service, ServiceExt as _};
use tracing::Instrument as _;
use tracing_error::SpanTrace;

use crate::Envelope;
use crate::backoff::Backoff;
use crate::context::Context;
use crate::event::EventRegistry;
use crate::transport::{Message, MessageStream, Subscriber, Transport, TransportError};

/// Boxed handler: takes a delivery, returns the envelopes it produced.
pub type HandlerService = BoxCloneService<Incoming, Vec<Envelope>, HandlerError>;

/// Boxed publisher used for follow-up and dead-letter envelopes.
pub type PublishService = BoxCloneService<Envelope, (), TransportError>;

type Middleware = Box<dyn Fn(HandlerService) -> HandlerService + Send>;

/// Router configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Prepended to each handler name to form its consumer group.
    pub consumer_group_prefix: String,
    /// How long in-flight handling may take to drain after cancellation.
    #[serde(rename = "close_timeout_ms", with = "crate::config::millis")]
    pub close_timeout: Duration,
    /// Pause after a subscription yields an error, growing while errors repeat.
    pub subscription_backoff: Backoff,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            consumer_group_prefix: String::new(),
            close_timeout: Duration::from_secs(30),
            subscription_backoff: Backoff::new(
                Duration::from_millis(100),
                2.0,
                Duration::from_secs(5),
            ),
        }
    }
}

/// A delivery as seen by middleware and handlers.
#[derive(Debug, Clone)]
pub struct Incoming {
    envelope: Envelope,
    ctx: Context,
    handler: Arc<str>,
    delivery_id: Arc<str>,
}

impl Incoming {
    pub fn new(
        envelope: Envelope,
        ctx: Context,
        handler: impl Into<Arc<str>>,
        delivery_id: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            envelope,
            ctx,
            handler: handler.into(),
            delivery_id: delivery_id.into(),
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn payload(&self) -> &[u8] {
        self.envelope.payload()
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Name of the handler the delivery is dispatched to.
    pub fn handler_name(&self) -> &str {
        &self.handler
    }

    pub fn delivery_id(&self) -> &str {
        &self.delivery_id
    }

    pub fn map_envelope(mut self, f: impl FnOnce(Envelope) -> Envelope) -> Self {
        self.envelope = f(self.envelope);
        self
    }
}

struct HandlerRegistration {
    name: Arc<str>,
    subscribe_topic: String,
    publish_topic: Option<String>,
    service: HandlerService,
}

/// Message router.
///
/// Generic over the subscriber backend `B`. Follow-up envelopes go through
/// the transport given at construction.
pub struct Router<B> {
    subscriber: B,
    publisher: PublishService,
    config: RouterConfig,
    handlers: Vec<HandlerRegistration>,
    middleware: Vec<Middleware>,
    registry: EventRegistry,
    running: watch::Sender<bool>,
}

impl<B> Router<B>
where
    B: Subscriber + Send + Sync,
{
    pub fn new<S>(subscriber: B, transport: Transport<S>) -> Self
    where
        Transport<S>:
            Service<Envelope, Response = (), Error = TransportError> + Clone + Send + 'static,
        <Transport<S> as Service<Envelope>>::Future: Send + 'static,
    {
        Self {
            subscriber,
            publisher: BoxCloneService::new(transport),
            config: RouterConfig::default(),
            handlers: Vec::new(),
            middleware: Vec::new(),
            registry: EventRegistry::global().clone(),
            running: watch::channel(false).0,
        }
    }

    pub fn with_config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    /// Install the stock middleware stack, outermost first: recoverer, retry
    /// (10 retries, 100 ms doubling up to 1 s), correlation, logging.
    pub fn with_default_middleware(mut self) -> Self {
        self.add_middleware(middleware::RecovererLayer);
        self.add_middleware(middleware::RetryLayer::new(middleware::RetryConfig::default()));
        self.add_middleware(middleware::CorrelationLayer);
        self.add_middleware(middleware::LoggingLayer);
        self
    }

    /// Check event types of attached processors against `registry` instead
    /// of [`EventRegistry::global`].
    pub fn with_registry(mut self, registry: EventRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Event names registered by event processors attached to this router.
    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    /// Publisher shared with middleware that needs to emit envelopes.
    pub fn publisher(&self) -> PublishService {
        self.publisher.clone()
    }

    pub fn handler_names(&self) -> impl Iterator<Item = &str> {
        self.handlers.iter().map(|h| &*h.name)
    }

    /// Register a handler.
    ///
    /// Envelopes returned by the handler are published to `publish_topic`.
    /// Fails when a handler with the same name is already registered.
    pub fn add_handler<S>(
        &mut self,
        name: &str,
        subscribe_topic: &str,
        publish_topic: Option<&str>,
        handler: S,
    ) -> Result<&mut Self, ConfigError>
    where
        S: Service<Incoming, Response = Vec<Envelope>, Error = HandlerError>
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        if self.handlers.iter().any(|h| &*h.name == name) {
            return Err(ConfigError::duplicate_handler(name));
        }

        tracing::debug!(handler = name, topic = subscribe_topic, "Registering handler");
        self.handlers.push(HandlerRegistration {
            name: Arc::from(name),
            subscribe_topic: subscribe_topic.to_owned(),
            publish_topic: publish_topic.map(str::to_owned),
            service: BoxCloneService::new(handler),
        });
        Ok(self)
    }

    /// Register a handler that produces no envelopes.
    pub fn add_consumer_handler<S>(
        &mut self,
        name: &str,
        subscribe_topic: &str,
        handler: S,
    ) -> Result<&mut Self, ConfigError>
    where
        S: Service<Incoming, Response = Vec<Envelope>, Error = HandlerError>
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        self.add_handler(name, subscribe_topic, None, handler)
    }

    /// Append a middleware to the chain applied to every handler.
    pub fn add_middleware<L>(&mut self, layer: L) -> &mut Self
    where
        L: Layer<HandlerService> + Send + 'static,
        L::Service: Service<Incoming, Response = Vec<Envelope>, Error = HandlerError>
            + Clone
            + Send
            + 'static,
        <L::Service as Service<Incoming>>::Future: Send + 'static,
    {
        self.middleware
            .push(Box::new(move |service| BoxCloneService::new(layer.layer(service))));
        self
    }

    /// Resolves once every subscription of [`run`](Self::run) is established.
    ///
    /// Also resolves if the router stops before getting there.
    pub fn running(&self) -> impl std::future::Future<Output = ()> + Send + use<B> {
        let mut running = self.running.subscribe();
        async move {
            let _ = running.wait_for(|running| *running).await;
        }
    }

    /// Consume every subscription until `cancel` fires.
    ///
    /// Subscriptions are established before any message is handled; failing
    /// to establish one aborts the run, and so does a subscription ending
    /// before `cancel` fires. After cancellation, in-flight handling gets
    /// `close_timeout` to finish.
    #[tracing::instrument(skip_all)]
    pub async fn run(self, cancel: CancellationToken) -> Result<(), RouterRunError> {
        let Router {
            subscriber,
            publisher,
            config,
            handlers,
            middleware,
            running,
            ..
        } = self;

        let mut consumers = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let consumer_group = format!("{}{}", config.consumer_group_prefix, handler.name);
            let stream = subscriber
                .subscribe(cancel.child_token(), &handler.subscribe_topic, &consumer_group)
                .await
                .map_err(|e| RouterRunError::subscribe(&handler.name, e.into()))?;

            let mut service = handler.service;
            for layer in middleware.iter().rev() {
                service = layer(service);
            }

            tracing::info!(
                handler = %handler.name,
                topic = %handler.subscribe_topic,
                consumer_group = %consumer_group,
                "Subscribed"
            );
            consumers.push(Consumer {
                name: handler.name,
                publish_topic: handler.publish_topic,
                service,
                publisher: publisher.clone(),
                stream,
                cancel: cancel.clone(),
                backoff: config.subscription_backoff,
            });
        }

        let mut tasks = JoinSet::new();
        for consumer in consumers {
            tasks.spawn(consumer.run());
        }
        running.send_replace(true);
        tracing::info!(handlers = tasks.len(), "Router is running");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                joined = tasks.join_next() => match joined {
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(err))) => return Err(err),
                    Some(Err(err)) => return Err(RouterRunError::consumer(err)),
                    None => {
                        cancel.cancelled().await;
                        break;
                    }
                },
            }
        }

        tracing::info!("Router is shutting down");
        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::warn!(error = %err, "Consumer stopped during shutdown");
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "Consumer task failed during shutdown");
                    }
                }
            }
        };
        if tokio::time::timeout(config.close_timeout, drain).await.is_err() {
            tracing::warn!(
                timeout = ?config.close_timeout,
                "In-flight handling did not drain in time"
            );
            tasks.abort_all();
        }
        Ok(())
    }
}

struct Consumer {
    name: Arc<str>,
    publish_topic: Option<String>,
    service: HandlerService,
    publisher: PublishService,
    stream: MessageStream,
    cancel: CancellationToken,
    backoff: Backoff,
}

impl Consumer {
    /// Consume until cancelled. The stream ending first is an error.
    async fn run(mut self) -> Result<(), RouterRunError> {
        let mut errors = self.backoff.iter();
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                next = self.stream.next() => next,
            };
            match next {
                Some(Ok(message)) => {
                    errors.reset();
                    let span = tracing::info_span!(
                        "dispatch",
                        handler = %self.name,
                        message_id = %message.envelope().id(),
                        delivery_id = message.delivery_id(),
                    );
                    self.dispatch(message).instrument(span).await;
                }
                Some(Err(error)) => {
                    let delay = errors.next().unwrap_or(self.backoff.max_interval);
                    tracing::error!(
                        handler = %self.name,
                        %error,
                        retry_in = ?delay,
                        "Subscription delivered an error"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None if self.cancel.is_cancelled() => return Ok(()),
                None => return Err(RouterRunError::subscription_ended(&self.name)),
            }
        }
    }

    async fn dispatch(&mut self, message: Message) {
        let ctx = Context::from_envelope(self.cancel.child_token(), message.envelope());
        let incoming = Incoming::new(
            message.envelope().clone(),
            ctx,
            Arc::clone(&self.name),
            message.delivery_id(),
        );

        let produced = match self.service.clone().oneshot(incoming).await {
            Ok(produced) => produced,
            Err(error) => {
                tracing::debug!(%error, "Rejecting message");
                message.nack();
                return;
            }
        };

        match self.publish_follow_ups(produced).await {
            Ok(()) => message.ack(),
            Err(error) => {
                tracing::error!(%error, "Failed to publish produced messages, rejecting");
                message.nack();
            }
        }
    }

    async fn publish_follow_ups(&mut self, produced: Vec<Envelope>) -> Result<(), HandlerError> {
        if produced.is_empty() {
            return Ok(());
        }
        let Some(topic) = self.publish_topic.as_deref() else {
            tracing::warn!(
                count = produced.len(),
                "Handler has no publish topic, dropping produced messages"
            );
            return Ok(());
        };
        for envelope in produced {
            self.publisher
                .clone()
                .oneshot(envelope.with_topic(topic))
                .await
                .map_err(HandlerError::publish)?;
        }
        Ok(())
    }
}

/// Error returned by a handler or middleware. Any error rejects the delivery.
#[derive(Debug)]
pub struct HandlerError {
    context: SpanTrace,
    kind: HandlerErrorKind,
}

/// Classification of handler errors.
#[derive(Debug)]
pub enum HandlerErrorKind {
    /// The payload does not match the declared event type.
    Deserialization(tower::BoxError),
    /// The handler or one of its collaborators failed.
    Handler(tower::BoxError),
    /// The handler panicked.
    Panicked(String),
    /// Produced or dead-lettered envelopes could not be published.
    Publish(TransportError),
}

impl HandlerError {
    pub fn handler(err: impl Into<tower::BoxError>) -> Self {
        Self::new(HandlerErrorKind::Handler(err.into()))
    }

    pub fn deserialization(err: impl Into<tower::BoxError>) -> Self {
        Self::new(HandlerErrorKind::Deserialization(err.into()))
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Panicked(message.into()))
    }

    pub fn publish(err: TransportError) -> Self {
        Self::new(HandlerErrorKind::Publish(err))
    }

    fn new(kind: HandlerErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &HandlerErrorKind {
        &self.kind
    }

    /// One-line description without the span trace.
    pub fn reason(&self) -> String {
        match &self.kind {
            HandlerErrorKind::Deserialization(err) => format!("Deserialization error: {err}"),
            HandlerErrorKind::Handler(err) => format!("Handler error: {err}"),
            HandlerErrorKind::Panicked(msg) => format!("Handler panicked: {msg}"),
            HandlerErrorKind::Publish(err) => {
                format!("Publish error: {}", err.to_string().lines().next().unwrap_or_default())
            }
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.reason())?;
        self.context.fmt(f)
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            HandlerErrorKind::Deserialization(err) => Some(err.as_ref()),
            HandlerErrorKind::Handler(err) => Some(err.as_ref()),
            HandlerErrorKind::Panicked(_) => None,
            HandlerErrorKind::Publish(err) => Some(err),
        }
    }
}

/// Startup configuration error. The process must not begin serving.
#[derive(Debug)]
pub struct ConfigError {
    context: SpanTrace,
    kind: ConfigErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// Two handlers share a name.
    DuplicateHandler(String),
    /// Two distinct types declare the same event name.
    EventNameCollision {
        name: String,
        registered: &'static str,
        conflicting: &'static str,
    },
}

impl ConfigError {
    pub(crate) fn duplicate_handler(name: &str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConfigErrorKind::DuplicateHandler(name.to_owned()),
        }
    }

    pub(crate) fn event_name_collision(
        name: &str,
        registered: &'static str,
        conflicting: &'static str,
    ) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConfigErrorKind::EventNameCollision {
                name: name.to_owned(),
                registered,
                conflicting,
            },
        }
    }

    pub fn kind(&self) -> &ConfigErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConfigErrorKind::DuplicateHandler(name) => {
                writeln!(f, "Handler `{name}` is already registered")
            }
            ConfigErrorKind::EventNameCollision {
                name,
                registered,
                conflicting,
            } => writeln!(
                f,
                "Event name `{name}` is used by both `{registered}` and `{conflicting}`"
            ),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConfigError {}

/// Error returned when the router loop fails.
#[derive(Debug)]
pub struct RouterRunError {
    context: SpanTrace,
    kind: RouterRunErrorKind,
}

#[derive(Debug)]
pub enum RouterRunErrorKind {
    /// A subscription could not be established.
    Subscribe {
        handler: String,
        source: tower::BoxError,
    },
    /// A subscription stream ended while the router was still running.
    SubscriptionEnded { handler: String },
    /// A consumer task panicked or was aborted.
    Consumer(tokio::task::JoinError),
}

impl RouterRunError {
    fn subscribe(handler: &str, source: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: RouterRunErrorKind::Subscribe {
                handler: handler.to_owned(),
                source,
            },
        }
    }

    fn subscription_ended(handler: &str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: RouterRunErrorKind::SubscriptionEnded {
                handler: handler.to_owned(),
            },
        }
    }

    fn consumer(err: tokio::task::JoinError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: RouterRunErrorKind::Consumer(err),
        }
    }

    pub fn kind(&self) -> &RouterRunErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for RouterRunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            RouterRunErrorKind::Subscribe { handler, source } => {
                writeln!(f, "Subscription of handler `{handler}` failed: {source}")
            }
            RouterRunErrorKind::SubscriptionEnded { handler } => {
                writeln!(f, "Subscription of handler `{handler}` ended before shutdown")
            }
            RouterRunErrorKind::Consumer(err) => writeln!(f, "Consumer task failed: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for RouterRunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            RouterRunErrorKind::Subscribe { source, .. } => Some(source.as_ref()),
            RouterRunErrorKind::SubscriptionEnded { .. } => None,
            RouterRunErrorKind::Consumer(err) => Some(err),
        }
    }
}

/// Names already taken, used to reject duplicates across batch registrations.
pub(crate) fn check_unique_names<'a>(
    existing: impl Iterator<Item = &'a str>,
    new: impl Iterator<Item = &'a str>,
) -> Result<(), ConfigError> {
    let mut seen: HashSet<&str> = existing.collect();
    for name in new {
        if !seen.insert(name) {
            return Err(ConfigError::duplicate_handler(name));
        }
    }
    Ok(())
}

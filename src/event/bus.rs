use chrono::{SecondsFormat, Utc};
use tracing_error::SpanTrace;

use crate::Envelope;
use crate::context::Context;
use crate::envelope::{EVENT_TYPE, IDEMPOTENCY_KEY, PUBLISHED_AT};
use crate::event::{EnvelopeSink, Event, EventRegistry};
use crate::router::ConfigError;

/// Typed publishing façade.
///
/// The sink decides the delivery mode:
///
/// - over [`Outbox::writer`](crate::Outbox::writer) the event is appended in
///   the caller's transaction and reaches the broker through the relay once
///   the transaction commits
/// - over a [`Transport`](crate::Transport) the event is published right away
///
/// Every published type is registered in [`EventRegistry::global`], so a
/// second type reusing a published name is refused. Use
/// [`with_registry`](Self::with_registry) to check against another table.
///
/// ```rust,no_run
/// # use outpost::{Context, Event, EventBus, Outbox};
/// # use outpost::outbox::inmemory::InMemoryOutbox;
/// # #[derive(serde::Serialize, serde::Deserialize)]
/// # struct TicketBookingConfirmed { ticket_id: String }
/// # impl Event for TicketBookingConfirmed { const NAME: &'static str = "TicketBookingConfirmed"; }
/// # async fn run(store: InMemoryOutbox, ctx: Context) -> Result<(), Box<dyn std::error::Error>> {
/// let outbox = Outbox::new(store.clone());
/// let mut tx = store.begin();
/// EventBus::new(outbox.writer(&mut tx))
///     .publish(&ctx, &TicketBookingConfirmed { ticket_id: "t-1".into() })
///     .await?;
/// tx.commit().await;
/// # Ok(())
/// # }
/// ```
pub struct EventBus<S> {
    sink: S,
    registry: EventRegistry,
}

impl<S> EventBus<S>
where
    S: EnvelopeSink,
{
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            registry: EventRegistry::global().clone(),
        }
    }

    /// Check published types against `registry` instead of the global one.
    pub fn with_registry(mut self, registry: EventRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn into_inner(self) -> S {
        self.sink
    }

    /// Publish `event` on the topic named after its type.
    ///
    /// The envelope gets a fresh id and carries the context's correlation id,
    /// the event type, the publication time and the event's idempotency key.
    #[tracing::instrument(skip_all, fields(event = E::NAME, correlation_id = ctx.correlation_id()))]
    pub async fn publish<E: Event>(
        &mut self,
        ctx: &Context,
        event: &E,
    ) -> Result<(), EventBusError> {
        self.registry.register::<E>().map_err(EventBusError::config)?;

        let envelope = to_envelope(ctx, event).map_err(EventBusError::serde)?;
        let id = envelope.id();
        self.sink
            .dispatch(E::NAME, envelope)
            .await
            .map_err(EventBusError::sink)?;

        tracing::debug!(envelope_id = %id, "Event published");
        Ok(())
    }
}

/// Wrap `event` in a new envelope addressed to its topic.
pub fn to_envelope<E: Event>(ctx: &Context, event: &E) -> Result<Envelope, serde_json::Error> {
    let payload = serde_json::to_vec(event)?;
    let mut envelope = ctx
        .stamp(Envelope::new(E::NAME, payload))
        .with_metadata(EVENT_TYPE, E::NAME)
        .with_metadata(
            PUBLISHED_AT,
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        );
    if let Some(key) = event.idempotency_key() {
        envelope = envelope.with_metadata(IDEMPOTENCY_KEY, key);
    }
    Ok(envelope)
}

/// Error returned by [`EventBus::publish`].
#[derive(Debug)]
pub struct EventBusError {
    context: SpanTrace,
    kind: EventBusErrorKind,
}

#[derive(Debug)]
pub enum EventBusErrorKind {
    /// The event could not be serialized.
    Serde(serde_json::Error),
    /// The event name is taken by another type.
    Config(ConfigError),
    /// The sink refused the envelope.
    Sink(tower::BoxError),
}

impl EventBusError {
    fn serde(err: serde_json::Error) -> Self {
        Self::new(EventBusErrorKind::Serde(err))
    }

    fn config(err: ConfigError) -> Self {
        Self::new(EventBusErrorKind::Config(err))
    }

    fn sink(err: tower::BoxError) -> Self {
        Self::new(EventBusErrorKind::Sink(err))
    }

    fn new(kind: EventBusErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &EventBusErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for EventBusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            EventBusErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
            EventBusErrorKind::Config(err) => writeln!(f, "Configuration error: {err}"),
            EventBusErrorKind::Sink(err) => writeln!(f, "Sink error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for EventBusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            EventBusErrorKind::Serde(err) => Some(err),
            EventBusErrorKind::Config(err) => Some(err),
            EventBusErrorKind::Sink(err) => Some(err.as_ref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::outbox::inmemory::InMemoryOutbox;
    use crate::outbox::{FetchPending, Outbox};
    use crate::transport::{InMemoryBroker, Transport};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TicketRefunded {
        ticket_id: String,
        key: String,
    }

    impl Event for TicketRefunded {
        const NAME: &'static str = "TicketRefunded";

        fn idempotency_key(&self) -> Option<&str> {
            Some(&self.key)
        }
    }

    fn event() -> TicketRefunded {
        TicketRefunded {
            ticket_id: "t-1".into(),
            key: "refund-1".into(),
        }
    }

    #[tokio::test]
    async fn direct_mode_publishes_to_type_topic() {
        let broker = InMemoryBroker::new();
        let ctx = Context::with_correlation_id(CancellationToken::new(), "req-1");

        let mut bus = EventBus::new(Transport::new(broker.clone()));
        bus.publish(&ctx, &event()).await.unwrap();

        let published = broker.published(TicketRefunded::NAME);
        assert_eq!(published.len(), 1);
        let metadata = published[0].metadata();
        assert_eq!(metadata.correlation_id(), Some("req-1"));
        assert_eq!(metadata.event_type(), Some("TicketRefunded"));
        assert_eq!(metadata.idempotency_key(), Some("refund-1"));
        assert!(metadata.get(PUBLISHED_AT).is_some());

        let decoded: TicketRefunded = serde_json::from_slice(published[0].payload()).unwrap();
        assert_eq!(decoded, event());
    }

    #[tokio::test]
    async fn transactional_mode_waits_for_commit() {
        let store = InMemoryOutbox::new();
        let outbox = Outbox::new(store.clone());
        let ctx = Context::new(CancellationToken::new());

        let mut tx = store.begin();
        EventBus::new(outbox.writer(&mut tx))
            .publish(&ctx, &event())
            .await
            .unwrap();
        assert!(store.fetch_pending(10).await.unwrap().is_empty());

        tx.commit().await;
        let pending = store.fetch_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].envelope().topic(), "TicketRefunded");
    }

    #[tokio::test]
    async fn registry_rejects_colliding_type() {
        #[derive(Serialize, Deserialize)]
        struct Impostor;

        impl Event for Impostor {
            const NAME: &'static str = "TicketRefunded";
        }

        let registry = EventRegistry::new();
        registry.register::<TicketRefunded>().unwrap();

        let broker = InMemoryBroker::new();
        let ctx = Context::new(CancellationToken::new());
        let mut bus = EventBus::new(Transport::new(broker.clone())).with_registry(registry);

        let err = bus.publish(&ctx, &Impostor).await.unwrap_err();
        assert!(matches!(err.kind(), EventBusErrorKind::Config(_)));
        assert!(broker.published("TicketRefunded").is_empty());
    }

    #[tokio::test]
    async fn default_bus_refuses_a_second_type_for_a_published_name() {
        #[derive(Serialize, Deserialize)]
        struct Counterfeit;

        impl Event for Counterfeit {
            const NAME: &'static str = "TicketRefunded";
        }

        let broker = InMemoryBroker::new();
        let ctx = Context::new(CancellationToken::new());
        let mut bus = EventBus::new(Transport::new(broker.clone()));

        bus.publish(&ctx, &event()).await.unwrap();
        assert_eq!(
            EventRegistry::global().type_name(TicketRefunded::NAME),
            Some(std::any::type_name::<TicketRefunded>())
        );

        let err = bus.publish(&ctx, &Counterfeit).await.unwrap_err();
        assert!(matches!(err.kind(), EventBusErrorKind::Config(_)));
        assert_eq!(broker.published("TicketRefunded").len(), 1);
    }
}

use std::any::TypeId;
use std::sync::Arc;

use tower::service_fn;
use tower::util::BoxCloneService;

use crate::Envelope;
use crate::context::Context;
use crate::event::Event;
use crate::router::{self, ConfigError, HandlerError, HandlerService, Incoming, Router};
use crate::transport::Subscriber;

/// Typed handler for one event type.
///
/// Handlers must be idempotent: the same event may be delivered more than
/// once. Follow-up events are published through an
/// [`EventBus`](crate::EventBus) the handler owns.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + 'static {
    type Event: Event;

    /// Unique handler name, also the consumer group suffix.
    fn name(&self) -> &str;

    async fn handle(&self, ctx: &Context, event: Self::Event) -> Result<(), tower::BoxError>;
}

/// A type-erased [`EventHandler`], ready to be added to an [`EventProcessor`].
pub struct EventHandlerRegistration {
    name: String,
    event_name: &'static str,
    type_id: TypeId,
    type_name: &'static str,
    service: HandlerService,
}

impl EventHandlerRegistration {
    pub fn new<H: EventHandler>(handler: H) -> Self {
        let name = handler.name().to_owned();
        let handler = Arc::new(handler);
        let service = service_fn(move |incoming: Incoming| {
            let handler = Arc::clone(&handler);
            async move { decode_and_handle(&*handler, incoming).await }
        });

        Self {
            name,
            event_name: <H::Event as Event>::NAME,
            type_id: TypeId::of::<H::Event>(),
            type_name: std::any::type_name::<H::Event>(),
            service: BoxCloneService::new(service),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Topic the handler subscribes to.
    pub fn event_name(&self) -> &'static str {
        self.event_name
    }
}

async fn decode_and_handle<H: EventHandler>(
    handler: &H,
    incoming: Incoming,
) -> Result<Vec<Envelope>, HandlerError> {
    let expected = <H::Event as Event>::NAME;
    if let Some(event_type) = incoming.envelope().metadata().event_type() {
        if event_type != expected {
            tracing::debug!(event_type, expected, "Skipping event of another type");
            return Ok(Vec::new());
        }
    }

    let event: H::Event =
        serde_json::from_slice(incoming.payload()).map_err(HandlerError::deserialization)?;
    handler
        .handle(incoming.context(), event)
        .await
        .map_err(HandlerError::handler)?;
    Ok(Vec::new())
}

/// Binds typed event handlers to a [`Router`].
///
/// Each handler subscribes to the topic named after its event type, in its
/// own consumer group, so several handlers of one event each see every
/// occurrence.
pub struct EventProcessor<'r, B> {
    router: &'r mut Router<B>,
}

impl<'r, B> EventProcessor<'r, B>
where
    B: Subscriber + Send + Sync,
{
    pub fn new(router: &'r mut Router<B>) -> Self {
        Self { router }
    }

    pub fn add_handler<H: EventHandler>(&mut self, handler: H) -> Result<&mut Self, ConfigError> {
        self.add_handlers([EventHandlerRegistration::new(handler)])?;
        Ok(self)
    }

    /// Register a batch of handlers.
    ///
    /// Nothing is registered when two handlers share a name (within the batch
    /// or with a handler already on the router), or when an event name is
    /// claimed by two distinct types.
    #[tracing::instrument(skip_all)]
    pub fn add_handlers(
        &mut self,
        handlers: impl IntoIterator<Item = EventHandlerRegistration>,
    ) -> Result<(), ConfigError> {
        let handlers: Vec<_> = handlers.into_iter().collect();

        router::check_unique_names(
            self.router.handler_names(),
            handlers.iter().map(|h| h.name.as_str()),
        )?;
        for handler in &handlers {
            self.router
                .registry()
                .register_type(handler.event_name, handler.type_id, handler.type_name)?;
        }

        for handler in handlers {
            tracing::info!(
                handler = %handler.name,
                event = handler.event_name,
                "Adding event handler"
            );
            self.router
                .add_handler(&handler.name, handler.event_name, None, handler.service)?;
        }
        Ok(())
    }
}

//! Typed events on top of envelopes.
//!
//! An [`Event`] is a serde-serializable type with a stable logical name. The
//! name doubles as the event's topic and as the `type` metadata of the
//! envelopes carrying it, so two distinct Rust types must never share one;
//! the [`EventRegistry`] enforces this. Buses and routers share
//! [`EventRegistry::global`] unless given their own.
//!
//! - [`EventBus`] publishes typed events, either transactionally through an
//!   [`OutboxWriter`](crate::outbox::OutboxWriter) or directly through a
//!   [`Transport`](crate::Transport)
//! - [`EventProcessor`] registers typed [`EventHandler`]s on a
//!   [`Router`](crate::Router)

mod bus;
mod processor;

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::Envelope;
use crate::router::ConfigError;

pub use bus::{EventBus, EventBusError, EventBusErrorKind, to_envelope};
pub use processor::{EventHandler, EventHandlerRegistration, EventProcessor};

/// A domain event.
///
/// ```rust
/// use outpost::Event;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct TicketPrinted {
///     ticket_id: String,
///     file_name: String,
/// }
///
/// impl Event for TicketPrinted {
///     const NAME: &'static str = "TicketPrinted";
/// }
/// ```
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Logical type name, also used as topic.
    const NAME: &'static str;

    /// Deduplication token copied to the `idempotency_key` metadata.
    fn idempotency_key(&self) -> Option<&str> {
        None
    }
}

/// Destination for envelopes produced by an [`EventBus`].
#[async_trait::async_trait]
pub trait EnvelopeSink: Send {
    async fn dispatch(&mut self, topic: &str, envelope: Envelope) -> Result<(), tower::BoxError>;
}

#[async_trait::async_trait]
impl<S> EnvelopeSink for &mut S
where
    S: EnvelopeSink + ?Sized,
{
    async fn dispatch(&mut self, topic: &str, envelope: Envelope) -> Result<(), tower::BoxError> {
        (**self).dispatch(topic, envelope).await
    }
}

/// Event name to Rust type mapping.
///
/// Cloning shares the underlying table.
#[derive(Clone, Default)]
pub struct EventRegistry {
    names: Arc<Mutex<HashMap<&'static str, Registered>>>,
}

static GLOBAL: LazyLock<EventRegistry> = LazyLock::new(EventRegistry::default);

#[derive(Clone, Copy)]
struct Registered {
    type_id: TypeId,
    type_name: &'static str,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry used by every [`EventBus`] and
    /// [`Router`](crate::Router) not configured with another one.
    pub fn global() -> &'static EventRegistry {
        &GLOBAL
    }

    /// Register `E` under its name.
    ///
    /// Registering the same type twice is a no-op; registering another type
    /// under a taken name fails.
    pub fn register<E: Event>(&self) -> Result<(), ConfigError> {
        self.register_type(E::NAME, TypeId::of::<E>(), std::any::type_name::<E>())
    }

    pub(crate) fn register_type(
        &self,
        name: &'static str,
        type_id: TypeId,
        type_name: &'static str,
    ) -> Result<(), ConfigError> {
        let mut names = self.names.lock().unwrap_or_else(PoisonError::into_inner);
        match names.get(name) {
            Some(existing) if existing.type_id != type_id => Err(ConfigError::event_name_collision(
                name,
                existing.type_name,
                type_name,
            )),
            Some(_) => Ok(()),
            None => {
                names.insert(name, Registered { type_id, type_name });
                Ok(())
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Rust type registered under `name`.
    pub fn type_name(&self, name: &str) -> Option<&'static str> {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|registered| registered.type_name)
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = self.names.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_set().entries(names.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::router::ConfigErrorKind;

    #[derive(Serialize, Deserialize)]
    struct Booked;

    impl Event for Booked {
        const NAME: &'static str = "Booked";
    }

    mod other {
        use super::*;

        #[derive(Serialize, Deserialize)]
        pub struct Booked;

        impl Event for Booked {
            const NAME: &'static str = "Booked";
        }
    }

    #[test]
    fn same_type_registers_twice() {
        let registry = EventRegistry::new();
        registry.register::<Booked>().unwrap();
        registry.register::<Booked>().unwrap();
        assert!(registry.contains("Booked"));
    }

    #[test]
    fn distinct_types_cannot_share_a_name() {
        let registry = EventRegistry::new();
        registry.register::<Booked>().unwrap();

        let err = registry.register::<other::Booked>().unwrap_err();
        assert!(matches!(
            err.kind(),
            ConfigErrorKind::EventNameCollision { name, .. } if name == "Booked"
        ));
    }
}

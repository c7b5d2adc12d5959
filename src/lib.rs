#![doc = include_str!("../README.md")]

pub mod backoff;
pub mod config;
pub mod context;
pub mod envelope;
pub mod event;
pub mod outbox;
pub mod relay;
pub mod router;
pub mod service;
pub mod transport;

#[doc(inline)]
pub use envelope::Envelope;

#[doc(inline)]
pub use context::Context;

#[doc(inline)]
pub use config::Config;

#[doc(inline)]
pub use outbox::{Outbox, OutboxError, OutboxRecord};

#[doc(inline)]
pub use transport::{Transport, TransportError, TransportErrorKind};

#[doc(inline)]
pub use relay::{DefaultRelayHook, Relay, RelayConfig, RelayError, RelayErrorKind, RelayHook};

#[doc(inline)]
pub use router::{ConfigError, HandlerError, Incoming, Router, RouterConfig, RouterRunError};

#[doc(inline)]
pub use event::{Event, EventBus, EventHandler, EventProcessor};

#[doc(inline)]
pub use service::Supervisor;

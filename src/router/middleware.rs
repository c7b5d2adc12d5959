//! Stock router middleware.
//!
//! Every middleware is a Tower [`Layer`](tower::Layer) over the router's
//! [`HandlerService`](crate::router::HandlerService). Register them with
//! [`Router::add_middleware`](crate::Router::add_middleware); the first one
//! registered wraps all the others.

mod correlation;
mod logging;
mod poison;
mod recoverer;
mod retry;

pub use correlation::{CorrelationLayer, CorrelationService};
pub use logging::{LoggingLayer, LoggingService};
pub use poison::{
    DEAD_LETTER_HANDLER, DEAD_LETTER_REASON, DEAD_LETTER_TOPIC, PoisonLayer, PoisonService,
};
pub use recoverer::{RecovererLayer, RecovererService};
pub use retry::{RetryConfig, RetryLayer, RetryService};

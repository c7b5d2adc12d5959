//! Explicit handling context.
//!
//! A [`Context`] is created at the edge of the system (a request handler, the
//! router receiving a message) and passed by reference to every component
//! that acts on behalf of that unit of work. It replaces ambient, process-wide
//! state: the correlation identifier, the cancellation signal and the tracing
//! span all travel with the value.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::envelope::{CORRELATION_ID, Envelope};

/// Prefix of correlation ids minted when an inbound unit of work carried none.
pub const GENERATED_PREFIX: &str = "gen_";

#[derive(Debug, Clone)]
pub struct Context {
    correlation_id: String,
    cancel: CancellationToken,
    span: tracing::Span,
}

impl Context {
    /// Build a root context with a freshly generated correlation id.
    pub fn new(cancel: CancellationToken) -> Self {
        Self::with_correlation_id(cancel, generate_correlation_id())
    }

    /// Build a root context continuing an existing causal chain.
    pub fn with_correlation_id(
        cancel: CancellationToken,
        correlation_id: impl Into<String>,
    ) -> Self {
        let correlation_id = correlation_id.into();
        let span = tracing::info_span!("context", correlation_id = %correlation_id);
        Self {
            correlation_id,
            cancel,
            span,
        }
    }

    /// Continue the chain an inbound envelope belongs to.
    ///
    /// Envelopes without a correlation id start a new chain.
    pub fn from_envelope(cancel: CancellationToken, envelope: &Envelope) -> Self {
        match envelope.metadata().correlation_id() {
            Some(id) => Self::with_correlation_id(cancel, id),
            None => Self::new(cancel),
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Child context whose cancellation is scoped to the parent.
    pub fn child(&self) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            cancel: self.cancel.child_token(),
            span: self.span.clone(),
        }
    }

    /// Copy this context's correlation id onto an envelope the unit of work produced.
    pub fn stamp(&self, envelope: Envelope) -> Envelope {
        envelope.with_metadata(CORRELATION_ID, self.correlation_id.clone())
    }
}

pub fn generate_correlation_id() -> String {
    format!("{GENERATED_PREFIX}{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_without_correlation_id_starts_a_chain() {
        let envelope = Envelope::new("topic", Vec::new());
        let ctx = Context::from_envelope(CancellationToken::new(), &envelope);
        assert!(ctx.correlation_id().starts_with(GENERATED_PREFIX));
    }

    #[test]
    fn stamp_overrides_foreign_correlation_id() {
        let ctx = Context::with_correlation_id(CancellationToken::new(), "req-1");
        let produced = Envelope::new("topic", Vec::new()).with_metadata(CORRELATION_ID, "other");
        assert_eq!(ctx.stamp(produced).metadata().correlation_id(), Some("req-1"));
    }

    #[test]
    fn child_cancellation_follows_parent() {
        let parent = Context::new(CancellationToken::new());
        let child = parent.child();
        parent.cancellation().cancel();
        assert!(child.is_cancelled());
    }
}

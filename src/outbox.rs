//! Outbox abstractions and backend drivers.
//!
//! This module implements the *transactional outbox*: events are written into
//! an outbox table inside the same transaction as the business write that
//! caused them, and a [`Relay`](crate::Relay) later forwards the committed
//! records to the broker.
//!
//! The outbox is responsible for **durability and ordering**, while delivery
//! concerns are delegated to the relay and transport layers.
//!
//! ## Responsibilities
//!
//! - Persist records atomically with application state
//! - Hand pending records to the relay in position order
//! - Remember which records (and up to which position) were forwarded
//! - Grant the relay lease to at most one relay at a time
//!
//! ## Components
//!
//! - [`Outbox`]: Writer façade used by business code
//! - [`AppendRecords`]: Trait for appending records inside a transaction
//! - [`FetchPending`]: Trait for reading unforwarded records
//! - [`MarkForwarded`]: Trait for recording successful forwarding
//! - [`RelayLease`]: Trait for the single-relay lease
//!
//! Concrete implementations are provided by [`inmemory`] and [`sqlx`]
//! (feature-gated).

pub mod inmemory;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use chrono::{DateTime, Utc};
use tracing::instrument;
use tracing_error::SpanTrace;

use crate::Envelope;
use crate::event::EnvelopeSink;

/// Position of a record in the outbox.
///
/// Positions increase across commits but may have gaps.
pub type Position = i64;

/// Error returned by outbox operations.
///
/// Wraps the underlying backend error and captures a tracing span backtrace
/// for improved diagnostics.
#[derive(Debug)]
pub struct OutboxError {
    context: SpanTrace,
    source: tower::BoxError,
}

impl OutboxError {
    /// Create a backend-related outbox error.
    pub(crate) fn backend(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            source: err,
        }
    }
}

impl std::fmt::Display for OutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Outbox store error: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for OutboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Record stored in the outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub(crate) position: Position,
    pub(crate) envelope: Envelope,
    pub(crate) forwarded: bool,
    pub(crate) forwarded_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    pub fn position(&self) -> Position {
        self.position
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn is_forwarded(&self) -> bool {
        self.forwarded
    }

    pub fn forwarded_at(&self) -> Option<DateTime<Utc>> {
        self.forwarded_at
    }
}

/// Relay bookkeeping: the last position a named relay forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberOffset {
    pub subscriber_name: String,
    pub last_position: Position,
}

/// Writer façade over an outbox backend.
///
/// `Outbox` provides the business-facing half of the pattern: appending
/// envelopes within the caller's transaction. Reading and marking records is
/// the relay's job and goes through the backend traits directly.
#[derive(Clone)]
pub struct Outbox<D>(D);

impl<D> Outbox<D> {
    /// Create a new outbox backed by the given backend implementation.
    pub fn new(driver: D) -> Self {
        Self(driver)
    }

    pub fn driver(&self) -> &D {
        &self.0
    }
}

impl<D> Outbox<D>
where
    D: AppendRecords,
    D::Error: Into<tower::BoxError>,
{
    /// Append an envelope under `topic` to the outbox.
    ///
    /// The envelope is inserted but **not** sent. It becomes visible to the
    /// relay only when `tx` commits; if the caller rolls back, the record is
    /// discarded together with the business write. On error the caller must
    /// roll back.
    #[instrument(skip(self, envelope, tx), fields(envelope_id = %envelope.id()))]
    pub async fn append(
        &self,
        tx: &mut D::Transaction<'_>,
        topic: &str,
        envelope: Envelope,
    ) -> Result<(), OutboxError> {
        let envelope = if envelope.topic() == topic {
            envelope
        } else {
            envelope.with_topic(topic)
        };
        self.append_all(tx, [envelope]).await
    }

    /// Append several envelopes, each under its own topic.
    #[instrument(skip_all)]
    pub async fn append_all(
        &self,
        tx: &mut D::Transaction<'_>,
        envelopes: impl IntoIterator<Item = Envelope>,
    ) -> Result<(), OutboxError> {
        let envelopes: Vec<Envelope> = envelopes.into_iter().collect();
        self.0
            .append_records(envelopes, tx)
            .await
            .map_err(|e| OutboxError::backend(e.into()))
    }

    /// Bind the outbox to an open transaction.
    ///
    /// The returned writer is an [`EnvelopeSink`], so an
    /// [`EventBus`](crate::EventBus) built over it publishes transactionally.
    pub fn writer<'t, 'c>(&'t self, tx: &'t mut D::Transaction<'c>) -> OutboxWriter<'t, 'c, D> {
        OutboxWriter { outbox: self, tx }
    }
}

/// An [`Outbox`] bound to a transaction.
pub struct OutboxWriter<'t, 'c, D: AppendRecords> {
    outbox: &'t Outbox<D>,
    tx: &'t mut D::Transaction<'c>,
}

#[async_trait::async_trait]
impl<'t, 'c, D> EnvelopeSink for OutboxWriter<'t, 'c, D>
where
    D: AppendRecords + Send + Sync,
    D::Error: Into<tower::BoxError>,
{
    async fn dispatch(&mut self, topic: &str, envelope: Envelope) -> Result<(), tower::BoxError> {
        self.outbox
            .append(&mut *self.tx, topic, envelope)
            .await
            .map_err(Into::into)
    }
}

/// Trait for appending records to the outbox.
///
/// Implementations must assign positions from a monotonic generator and make
/// the records visible only once the transaction commits.
#[async_trait::async_trait]
pub trait AppendRecords {
    /// Backend-specific error type.
    type Error;
    /// Transaction type used for atomic insertion.
    type Transaction<'a>: Send;

    /// Append a batch of envelopes as new records.
    async fn append_records(
        &self,
        envelopes: Vec<Envelope>,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), Self::Error>;
}

/// Trait for reading records that still need forwarding.
///
/// Implementations must only return committed records, ordered by position.
#[async_trait::async_trait]
pub trait FetchPending {
    /// Backend-specific error type.
    type Error;

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, Self::Error>;
}

/// Trait for recording that a record reached the broker.
#[async_trait::async_trait]
pub trait MarkForwarded {
    /// Backend-specific error type.
    type Error;

    /// Flag the record as forwarded and advance the subscriber's offset.
    async fn mark_forwarded(
        &self,
        subscriber: &str,
        record: &OutboxRecord,
    ) -> Result<(), Self::Error>;

    /// Last position forwarded by `subscriber`, if any.
    async fn last_forwarded(&self, subscriber: &str)
    -> Result<Option<SubscriberOffset>, Self::Error>;
}

/// Trait for the exclusive relay lease.
///
/// At most one holder may own the lease of a given outbox at a time.
/// Re-acquiring a lease already held by the same holder succeeds, so holders
/// must be unique per relay instance; [`Relay`](crate::Relay) derives one
/// from its name and a random suffix.
#[async_trait::async_trait]
pub trait RelayLease {
    /// Backend-specific error type.
    type Error;

    async fn try_acquire_lease(&self, holder: &str) -> Result<bool, Self::Error>;

    async fn release_lease(&self, holder: &str) -> Result<(), Self::Error>;
}

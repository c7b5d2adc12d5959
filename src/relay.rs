//! Relay loop forwarding outbox records through a transport.
//!
//! This module implements the *outbox relay* that:
//!
//! - Acquires the outbox's relay lease, so at most one relay forwards a table
//! - Fetches committed, unforwarded records in position order
//! - Publishes them one at a time through a [`Transport`]
//! - Marks each record forwarded before publishing the next one
//! - Exposes lifecycle hooks for observability and customization
//!
//! Delivery is at-least-once: a crash between a publish and its mark leaves
//! the record pending, and it is published again after restart.
//!
//! The relay runs until its [`CancellationToken`] is triggered. Store and
//! broker failures are retried with capped exponential backoff.

use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower::Service;

use crate::Envelope;
use crate::backoff::Backoff;
use crate::outbox::{
    FetchPending, MarkForwarded, OutboxRecord, Position, RelayLease, SubscriberOffset,
};
use crate::transport::Transport;

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Offset subscriber name, also the prefix of the relay's lease token.
    pub name: String,
    /// Maximum number of records fetched per cycle. Never zero.
    #[serde(deserialize_with = "crate::config::non_zero")]
    pub batch_size: usize,
    /// Idle wait when the outbox is drained or the lease is taken.
    #[serde(rename = "poll_interval_ms", with = "crate::config::millis")]
    pub poll_interval: Duration,
    /// Wait between failed cycles.
    pub backoff: Backoff,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            name: "outbox-relay".to_owned(),
            batch_size: 100,
            poll_interval: Duration::from_millis(100),
            backoff: Backoff::default(),
        }
    }
}

/// Outcome of one forwarding cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardReport {
    /// Records returned by the store.
    pub fetched: usize,
    /// Records published and marked forwarded.
    pub forwarded: usize,
    /// Position of the record whose publish failed; later records of the
    /// batch were left untouched.
    pub failed_at: Option<Position>,
}

/// Outbox relay.
///
/// Generic parameters:
/// - `D`: Outbox store backend
/// - `T`: Transport service type
/// - `HK`: Hook implementation for lifecycle events
pub struct Relay<D, T, HK = DefaultRelayHook> {
    store: D,
    transport: Transport<T>,
    config: RelayConfig,
    /// Lease token, unique to this instance.
    holder: String,
    hook: HK,
    running: watch::Sender<bool>,
}

fn lease_holder(name: &str) -> String {
    format!("{name}-{}", uuid::Uuid::new_v4())
}

impl<D, T> Relay<D, T, DefaultRelayHook> {
    /// Create a new relay with the default configuration and hook.
    pub fn new(store: D, transport: Transport<T>) -> Self {
        let config = RelayConfig::default();
        Self {
            store,
            transport,
            holder: lease_holder(&config.name),
            config,
            hook: DefaultRelayHook,
            running: watch::channel(false).0,
        }
    }
}

impl<D, T, HK> Relay<D, T, HK>
where
    D: FetchPending + MarkForwarded + RelayLease + Send + Sync,
    <D as FetchPending>::Error: Into<tower::BoxError>,
    <D as MarkForwarded>::Error: Into<tower::BoxError>,
    <D as RelayLease>::Error: Into<tower::BoxError>,
    T: Service<Envelope> + Clone + Send + 'static,
    T::Future: Send + 'static,
    T::Error: Into<tower::BoxError>,
    HK: RelayHook,
{
    /// Replace the relay hook while keeping everything else unchanged.
    pub fn with_hook<HK2: RelayHook>(self, hook: HK2) -> Relay<D, T, HK2> {
        Relay {
            store: self.store,
            transport: self.transport,
            config: self.config,
            holder: self.holder,
            hook,
            running: self.running,
        }
    }

    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.holder = lease_holder(&config.name);
        self.config = RelayConfig {
            batch_size: config.batch_size.max(1),
            ..config
        };
        self
    }

    /// Set the offset subscriber name.
    ///
    /// Relays sharing a name share their offset, never their lease: each
    /// instance still competes for the lease with its own token.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self.holder = lease_holder(&self.config.name);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.config.poll_interval = poll_interval;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Last position this relay marked forwarded.
    pub async fn offset(&self) -> Result<Option<SubscriberOffset>, RelayError> {
        self.store
            .last_forwarded(&self.config.name)
            .await
            .map_err(|e| RelayError::store(e.into()))
    }

    /// Resolves once the relay holds its lease and entered the poll loop.
    ///
    /// Also resolves if the relay stops before getting there.
    pub fn running(&self) -> impl std::future::Future<Output = ()> + Send + use<D, T, HK> {
        let mut running = self.running.subscribe();
        async move {
            let _ = running.wait_for(|running| *running).await;
        }
    }

    /// Run one Polling → Publishing → MarkingForwarded cycle.
    ///
    /// Records are published strictly in the order returned by the store, and
    /// each is marked forwarded before the next one is published. A publish
    /// failure ends the cycle and is reported through
    /// [`ForwardReport::failed_at`]; the record stays pending.
    ///
    /// This does not take the lease; [`run`](Self::run) does.
    #[tracing::instrument(skip(self), fields(relay = %self.config.name))]
    pub async fn forward_batch(&mut self) -> Result<ForwardReport, RelayError> {
        let records = self
            .store
            .fetch_pending(self.config.batch_size)
            .await
            .map_err(|e| RelayError::store(e.into()))?;

        let mut report = ForwardReport {
            fetched: records.len(),
            ..ForwardReport::default()
        };

        for record in records {
            self.hook.on_next_record(&record);

            if let Err(error) = self.transport.send(record.envelope().clone()).await {
                self.hook.on_publish_error(&record, &error);
                report.failed_at = Some(record.position());
                break;
            }

            self.store
                .mark_forwarded(&self.config.name, &record)
                .await
                .map_err(|e| RelayError::mark(record.position(), e.into()))?;

            self.hook.on_record_forwarded(&record);
            report.forwarded += 1;
        }

        Ok(report)
    }

    /// Run the relay loop until `cancel` fires.
    ///
    /// The relay first waits for the lease, polling at `poll_interval`; a
    /// relay that never gets the lease never forwards. Once leased it drains
    /// the outbox, idles for `poll_interval` when there is nothing left, and
    /// backs off after failed cycles. The lease is released on shutdown.
    #[tracing::instrument(skip_all, fields(relay = %self.config.name))]
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), RelayError> {
        self.hook.on_startup(&self.config.name);

        if !self.acquire_lease(&cancel).await {
            self.hook.on_shutdown(&self.config.name);
            return Ok(());
        }

        let resume_from = match self.offset().await {
            Ok(offset) => offset.map(|o| o.last_position),
            Err(error) => {
                self.hook.on_store_error(&error);
                None
            }
        };
        self.hook.on_lease_acquired(&self.config.name, resume_from);
        self.running.send_replace(true);

        let mut delays = self.config.backoff.iter();
        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                outcome = self.forward_batch() => outcome,
            };

            let pause = match outcome {
                Ok(report) if report.failed_at.is_some() => self.backoff(&mut delays),
                Ok(report) if report.fetched == 0 || report.fetched < self.config.batch_size => {
                    delays.reset();
                    self.config.poll_interval
                }
                Ok(_) => {
                    delays.reset();
                    continue;
                }
                Err(error) => {
                    self.hook.on_store_error(&error);
                    self.backoff(&mut delays)
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        self.hook.on_shutdown(&self.config.name);
        self.store
            .release_lease(&self.holder)
            .await
            .map_err(|e| RelayError::lease(e.into()))
    }

    /// Returns `false` when cancelled before the lease was granted.
    async fn acquire_lease(&self, cancel: &CancellationToken) -> bool {
        loop {
            let acquired = tokio::select! {
                _ = cancel.cancelled() => return false,
                acquired = self.store.try_acquire_lease(&self.holder) => acquired,
            };
            match acquired {
                Ok(true) => return true,
                Ok(false) => self.hook.on_lease_unavailable(&self.config.name),
                Err(e) => self.hook.on_store_error(&RelayError::lease(e.into())),
            }

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    fn backoff(&self, delays: &mut crate::backoff::BackoffIter) -> Duration {
        let delay = delays.next().unwrap_or(self.config.backoff.max_interval);
        self.hook.on_backoff(delay);
        delay
    }
}

/// Error returned by relay operations.
#[derive(Debug)]
pub struct RelayError {
    context: tracing_error::SpanTrace,
    kind: RelayErrorKind,
}

impl RelayError {
    fn store(error: tower::BoxError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: RelayErrorKind::Store(error),
        }
    }

    fn mark(position: Position, error: tower::BoxError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: RelayErrorKind::Mark { position, error },
        }
    }

    fn lease(error: tower::BoxError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: RelayErrorKind::Lease(error),
        }
    }

    pub fn kind(&self) -> &RelayErrorKind {
        &self.kind
    }
}

/// Classification of relay errors.
#[derive(Debug)]
pub enum RelayErrorKind {
    /// Reading pending records or offsets failed.
    Store(tower::BoxError),
    /// A published record could not be marked forwarded; it will be
    /// published again.
    Mark {
        position: Position,
        error: tower::BoxError,
    },
    /// Acquiring or releasing the relay lease failed.
    Lease(tower::BoxError),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            RelayErrorKind::Store(err) => writeln!(f, "Outbox store error: {}", err),
            RelayErrorKind::Mark { position, error } => writeln!(
                f,
                "Failed to mark record at position {} forwarded: {}",
                position, error
            ),
            RelayErrorKind::Lease(err) => writeln!(f, "Relay lease error: {}", err),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            RelayErrorKind::Store(err) => Some(err.as_ref()),
            RelayErrorKind::Mark { error, .. } => Some(error.as_ref()),
            RelayErrorKind::Lease(err) => Some(err.as_ref()),
        }
    }
}

/// Hook trait for observing relay lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// Typical use cases include logging, metrics, and tracing integration.
pub trait RelayHook: Send + Sync {
    fn on_startup(&self, relay: &str);
    fn on_shutdown(&self, relay: &str);
    fn on_lease_acquired(&self, relay: &str, resume_from: Option<Position>);
    fn on_lease_unavailable(&self, relay: &str);
    fn on_next_record(&self, record: &OutboxRecord);
    fn on_record_forwarded(&self, record: &OutboxRecord);
    fn on_publish_error(&self, record: &OutboxRecord, error: &dyn std::error::Error);
    fn on_store_error(&self, error: &RelayError);
    fn on_backoff(&self, delay: Duration);
}

/// Default relay hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultRelayHook;

impl RelayHook for DefaultRelayHook {
    fn on_startup(&self, relay: &str) {
        tracing::info!(relay, "Relay is starting up");
    }

    fn on_shutdown(&self, relay: &str) {
        tracing::info!(relay, "Relay is shutting down");
    }

    fn on_lease_acquired(&self, relay: &str, resume_from: Option<Position>) {
        tracing::info!(relay, ?resume_from, "Relay lease acquired");
    }

    fn on_lease_unavailable(&self, relay: &str) {
        tracing::debug!(relay, "Relay lease held by another instance");
    }

    fn on_next_record(&self, record: &OutboxRecord) {
        tracing::debug!(position = record.position(), "Forwarding record");
    }

    fn on_record_forwarded(&self, record: &OutboxRecord) {
        tracing::debug!(
            position = record.position(),
            envelope_id = %record.envelope().id(),
            topic = record.envelope().topic(),
            "Record forwarded"
        );
    }

    fn on_publish_error(&self, record: &OutboxRecord, error: &dyn std::error::Error) {
        tracing::warn!(position = record.position(), %error, "Error publishing record");
    }

    fn on_store_error(&self, error: &RelayError) {
        tracing::error!(%error, "Relay cycle failed");
    }

    fn on_backoff(&self, delay: Duration) {
        tracing::debug!(?delay, "Relay backing off");
    }
}

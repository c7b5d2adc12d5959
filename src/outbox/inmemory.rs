use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::outbox::{
    AppendRecords, Envelope, FetchPending, MarkForwarded, OutboxRecord, Position, RelayLease,
    SubscriberOffset,
};

type CommitEffect = Box<dyn FnOnce() + Send>;

/// An in-memory outbox for testing or single-process usage.
///
/// Writes go through an [`InMemoryTransaction`]: appended envelopes are staged
/// in the transaction and only become records when it commits. Positions are
/// assigned at commit time, so the relay never observes a lower position
/// appearing after a higher one.
#[derive(Clone, Default)]
pub struct InMemoryOutbox {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    records: BTreeMap<Position, OutboxRecord>,
    last_position: Position,
    offsets: HashMap<String, Position>,
    lease_holder: Option<String>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a transaction.
    pub fn begin(&self) -> InMemoryTransaction {
        InMemoryTransaction {
            outbox: self.clone(),
            staged: Vec::new(),
            effects: Vec::new(),
        }
    }

    /// Snapshot of every committed record, forwarded or not, in position order.
    pub async fn records(&self) -> Vec<OutboxRecord> {
        self.state.lock().await.records.values().cloned().collect()
    }

    /// Number of committed records not yet forwarded.
    pub async fn pending_count(&self) -> usize {
        self.state
            .lock()
            .await
            .records
            .values()
            .filter(|r| !r.forwarded)
            .count()
    }
}

/// Transaction over an [`InMemoryOutbox`].
///
/// Besides outbox records, a transaction can carry business writes as commit
/// effects; they run under the same lock as the record insertion, so either
/// both happen or neither does. Dropping the transaction without calling
/// [`commit`](Self::commit) rolls it back.
pub struct InMemoryTransaction {
    outbox: InMemoryOutbox,
    staged: Vec<Envelope>,
    effects: Vec<CommitEffect>,
}

impl InMemoryTransaction {
    /// Register a business write to apply when the transaction commits.
    pub fn on_commit(&mut self, effect: impl FnOnce() + Send + 'static) {
        self.effects.push(Box::new(effect));
    }

    /// Number of envelopes appended so far.
    pub fn staged(&self) -> usize {
        self.staged.len()
    }

    #[tracing::instrument(skip_all, fields(records = self.staged.len()))]
    pub async fn commit(self) {
        let mut state = self.outbox.state.lock().await;
        for effect in self.effects {
            effect();
        }
        for envelope in self.staged {
            state.last_position += 1;
            let position = state.last_position;
            state.records.insert(
                position,
                OutboxRecord {
                    position,
                    envelope,
                    forwarded: false,
                    forwarded_at: None,
                },
            );
        }
    }

    /// Discard staged records and effects.
    pub fn rollback(self) {
        tracing::debug!(records = self.staged.len(), "Rolling back in-memory transaction");
    }
}

#[async_trait]
impl AppendRecords for InMemoryOutbox {
    type Error = InMemoryOutboxError;
    type Transaction<'a> = InMemoryTransaction;

    async fn append_records(
        &self,
        envelopes: Vec<Envelope>,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), InMemoryOutboxError> {
        if !Arc::ptr_eq(&self.state, &tx.outbox.state) {
            return Err(InMemoryOutboxError::foreign_transaction());
        }
        tx.staged.extend(envelopes);
        Ok(())
    }
}

#[async_trait]
impl FetchPending for InMemoryOutbox {
    type Error = InMemoryOutboxError;

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, InMemoryOutboxError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .filter(|r| !r.forwarded)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MarkForwarded for InMemoryOutbox {
    type Error = InMemoryOutboxError;

    async fn mark_forwarded(
        &self,
        subscriber: &str,
        record: &OutboxRecord,
    ) -> Result<(), InMemoryOutboxError> {
        let mut state = self.state.lock().await;
        let stored = state
            .records
            .get_mut(&record.position)
            .filter(|r| r.envelope.id() == record.envelope.id())
            .ok_or(InMemoryOutboxError::not_found())?;

        stored.forwarded = true;
        stored.forwarded_at = Some(Utc::now());

        let offset = state.offsets.entry(subscriber.to_owned()).or_default();
        *offset = (*offset).max(record.position);
        Ok(())
    }

    async fn last_forwarded(
        &self,
        subscriber: &str,
    ) -> Result<Option<SubscriberOffset>, InMemoryOutboxError> {
        let state = self.state.lock().await;
        Ok(state
            .offsets
            .get(subscriber)
            .map(|position| SubscriberOffset {
                subscriber_name: subscriber.to_owned(),
                last_position: *position,
            }))
    }
}

#[async_trait]
impl RelayLease for InMemoryOutbox {
    type Error = InMemoryOutboxError;

    async fn try_acquire_lease(&self, holder: &str) -> Result<bool, InMemoryOutboxError> {
        let mut state = self.state.lock().await;
        match state.lease_holder.as_deref() {
            Some(current) => Ok(current == holder),
            None => {
                state.lease_holder = Some(holder.to_owned());
                Ok(true)
            }
        }
    }

    async fn release_lease(&self, holder: &str) -> Result<(), InMemoryOutboxError> {
        let mut state = self.state.lock().await;
        if state.lease_holder.as_deref() == Some(holder) {
            state.lease_holder = None;
        }
        Ok(())
    }
}

/// Error type for `InMemoryOutbox` operations.
#[derive(Debug)]
pub struct InMemoryOutboxError {
    kind: InMemoryOutboxErrorKind,
}

impl InMemoryOutboxError {
    fn not_found() -> Self {
        Self {
            kind: InMemoryOutboxErrorKind::NotFound,
        }
    }

    fn foreign_transaction() -> Self {
        Self {
            kind: InMemoryOutboxErrorKind::ForeignTransaction,
        }
    }
}

impl std::fmt::Display for InMemoryOutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InMemoryOutboxErrorKind::NotFound => write!(f, "Record not found in in-memory outbox"),
            InMemoryOutboxErrorKind::ForeignTransaction => {
                write!(f, "Transaction belongs to another in-memory outbox")
            }
        }
    }
}

impl std::error::Error for InMemoryOutboxError {}

#[derive(Debug)]
enum InMemoryOutboxErrorKind {
    NotFound,
    ForeignTransaction,
}

use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::Envelope;
use crate::transport::{Acknowledge, Message, MessageStream, Publisher, Subscriber};

/// In-memory broker for testing or local pipelines.
///
/// The broker keeps an append-only log per topic and implements both
/// [`Publisher`] and [`Subscriber`]:
///
/// - every consumer group has its own read position in the topic log, so
///   distinct groups each see every message
/// - subscriptions sharing a group compete for messages
/// - a nacked message is queued for redelivery to the same group, ahead of
///   messages not yet delivered
///
/// Once every consumer group of a topic has been handed a message, the log
/// drops it; messages still in flight are kept by their delivery. A group
/// created later starts from the oldest retained message, which is the start
/// of the log for topics nobody has subscribed to yet.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, TopicLog>,
    deliveries: u64,
}

#[derive(Default)]
struct TopicLog {
    log: VecDeque<Envelope>,
    /// Position of `log[0]` since the topic was created.
    base: usize,
    groups: HashMap<String, GroupState>,
}

impl TopicLog {
    /// Drop the entries every group has moved past.
    fn compact(&mut self) {
        let Some(min) = self.groups.values().map(|g| g.cursor).min() else {
            return;
        };
        if min > self.base {
            self.log.drain(..min - self.base);
            self.base = min;
        }
    }

    fn end(&self) -> usize {
        self.base + self.log.len()
    }
}

#[derive(Default)]
struct GroupState {
    /// Next log position to hand out, counted like [`TopicLog::base`].
    cursor: usize,
    redeliver: VecDeque<Envelope>,
    in_flight: usize,
    acked: usize,
    nacked: usize,
}

/// Per-group counters, as observed by tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupStats {
    pub in_flight: usize,
    pub acked: usize,
    pub nacked: usize,
    /// Messages published but not yet handed to the group.
    pub backlog: usize,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Envelopes of `topic` still retained, in publication order.
    ///
    /// This is every published envelope as long as nobody consumes the topic.
    pub fn published(&self, topic: &str) -> Vec<Envelope> {
        self.lock()
            .topics
            .get(topic)
            .map(|t| t.log.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of envelopes ever published to `topic`.
    pub fn published_count(&self, topic: &str) -> usize {
        self.lock().topics.get(topic).map_or(0, TopicLog::end)
    }

    /// Number of envelopes `topic` still holds.
    pub fn retained(&self, topic: &str) -> usize {
        self.lock().topics.get(topic).map_or(0, |t| t.log.len())
    }

    pub fn group_stats(&self, topic: &str, consumer_group: &str) -> GroupStats {
        let state = self.lock();
        let Some(topic) = state.topics.get(topic) else {
            return GroupStats::default();
        };
        let Some(group) = topic.groups.get(consumer_group) else {
            return GroupStats {
                backlog: topic.log.len(),
                ..GroupStats::default()
            };
        };
        GroupStats {
            in_flight: group.in_flight,
            acked: group.acked,
            nacked: group.nacked,
            backlog: topic.end() - group.cursor + group.redeliver.len(),
        }
    }

    fn next_delivery(&self, topic: &str, consumer_group: &str) -> Option<Message> {
        let mut state = self.lock();
        state.deliveries += 1;
        let delivery_id = state.deliveries;

        let topic_log = state.topics.entry(topic.to_owned()).or_default();
        let group = group_entry(&mut topic_log.groups, topic_log.base, consumer_group);

        let envelope = match group.redeliver.pop_front() {
            Some(envelope) => envelope,
            None => {
                let envelope = topic_log.log.get(group.cursor - topic_log.base)?.clone();
                group.cursor += 1;
                envelope
            }
        };
        group.in_flight += 1;
        topic_log.compact();

        let acker = InMemoryAcker {
            broker: self.clone(),
            topic: topic.to_owned(),
            consumer_group: consumer_group.to_owned(),
            envelope: envelope.clone(),
        };
        Some(Message::new(
            envelope,
            delivery_id.to_string(),
            consumer_group,
            Box::new(acker),
        ))
    }

    fn settle(&self, topic: &str, consumer_group: &str, redeliver: Option<Envelope>) {
        {
            let mut state = self.lock();
            let topic_log = state.topics.entry(topic.to_owned()).or_default();
            let group = group_entry(&mut topic_log.groups, topic_log.base, consumer_group);
            group.in_flight = group.in_flight.saturating_sub(1);
            match redeliver {
                Some(envelope) => {
                    group.nacked += 1;
                    group.redeliver.push_back(envelope);
                }
                None => group.acked += 1,
            }
        }
        self.notify.notify_waiters();
    }
}

#[async_trait::async_trait]
impl Publisher for InMemoryBroker {
    type Error = Infallible;

    #[tracing::instrument(skip_all, fields(topic = topic, envelope_id = %envelope.id()))]
    async fn publish(&mut self, topic: &str, envelope: Envelope) -> Result<(), Self::Error> {
        let envelope = if envelope.topic() == topic {
            envelope
        } else {
            envelope.with_topic(topic)
        };
        self.lock()
            .topics
            .entry(topic.to_owned())
            .or_default()
            .log
            .push_back(envelope);
        self.notify.notify_waiters();
        tracing::debug!("Message published to in-memory broker");
        Ok(())
    }
}

#[async_trait::async_trait]
impl Subscriber for InMemoryBroker {
    type Error = Infallible;

    #[tracing::instrument(skip(self, cancel))]
    async fn subscribe(
        &self,
        cancel: CancellationToken,
        topic: &str,
        consumer_group: &str,
    ) -> Result<MessageStream, Self::Error> {
        {
            let mut state = self.lock();
            let topic_log = state.topics.entry(topic.to_owned()).or_default();
            group_entry(&mut topic_log.groups, topic_log.base, consumer_group);
        }

        let broker = self.clone();
        let topic = topic.to_owned();
        let consumer_group = consumer_group.to_owned();

        let stream = async_stream::stream! {
            loop {
                let notified = broker.notify.notified();
                if cancel.is_cancelled() {
                    break;
                }
                if let Some(message) = broker.next_delivery(&topic, &consumer_group) {
                    yield Ok(message);
                    continue;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = notified => {}
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// State of `consumer_group`, created at the oldest retained message.
fn group_entry<'a>(
    groups: &'a mut HashMap<String, GroupState>,
    base: usize,
    consumer_group: &str,
) -> &'a mut GroupState {
    groups
        .entry(consumer_group.to_owned())
        .or_insert_with(|| GroupState {
            cursor: base,
            ..GroupState::default()
        })
}

struct InMemoryAcker {
    broker: InMemoryBroker,
    topic: String,
    consumer_group: String,
    envelope: Envelope,
}

impl Acknowledge for InMemoryAcker {
    fn ack(self: Box<Self>) {
        self.broker.settle(&self.topic, &self.consumer_group, None);
    }

    fn nack(self: Box<Self>) {
        let this = *self;
        this.broker
            .settle(&this.topic, &this.consumer_group, Some(this.envelope));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_stream::StreamExt;

    use super::*;

    async fn next(stream: &mut MessageStream) -> Message {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("delivery timed out")
            .expect("stream ended")
            .expect("delivery failed")
    }

    #[tokio::test]
    async fn distinct_groups_each_receive_every_message() {
        let mut broker = InMemoryBroker::new();
        let cancel = CancellationToken::new();
        let mut first = broker.subscribe(cancel.clone(), "t", "g1").await.unwrap();
        let mut second = broker.subscribe(cancel.clone(), "t", "g2").await.unwrap();

        let envelope = Envelope::new("t", b"1".to_vec());
        broker.publish("t", envelope.clone()).await.unwrap();

        let a = next(&mut first).await;
        let b = next(&mut second).await;
        assert_eq!(a.envelope().id(), envelope.id());
        assert_eq!(b.envelope().id(), envelope.id());
        a.ack();
        b.ack();

        assert_eq!(broker.group_stats("t", "g1").acked, 1);
        assert_eq!(broker.group_stats("t", "g2").acked, 1);
    }

    #[tokio::test]
    async fn same_group_competes_for_messages() {
        let mut broker = InMemoryBroker::new();
        let cancel = CancellationToken::new();
        let mut first = broker.subscribe(cancel.clone(), "t", "g").await.unwrap();
        let mut second = broker.subscribe(cancel.clone(), "t", "g").await.unwrap();

        broker.publish("t", Envelope::new("t", b"1".to_vec())).await.unwrap();
        broker.publish("t", Envelope::new("t", b"2".to_vec())).await.unwrap();

        let a = next(&mut first).await;
        let b = next(&mut second).await;
        assert_ne!(a.envelope().id(), b.envelope().id());
        a.ack();
        b.ack();
        assert_eq!(broker.group_stats("t", "g").acked, 2);
    }

    #[tokio::test]
    async fn nacked_message_is_redelivered_first() {
        let mut broker = InMemoryBroker::new();
        let cancel = CancellationToken::new();
        let mut stream = broker.subscribe(cancel.clone(), "t", "g").await.unwrap();

        let first = Envelope::new("t", b"1".to_vec());
        broker.publish("t", first.clone()).await.unwrap();
        broker.publish("t", Envelope::new("t", b"2".to_vec())).await.unwrap();

        next(&mut stream).await.nack();
        let again = next(&mut stream).await;
        assert_eq!(again.envelope().id(), first.id());
        again.ack();

        let stats = broker.group_stats("t", "g");
        assert_eq!(stats.nacked, 1);
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.backlog, 1);
    }

    #[tokio::test]
    async fn cancellation_ends_the_stream() {
        let broker = InMemoryBroker::new();
        let cancel = CancellationToken::new();
        let mut stream = broker.subscribe(cancel.clone(), "t", "g").await.unwrap();

        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn log_keeps_only_what_a_group_has_not_received() {
        let mut broker = InMemoryBroker::new();
        let cancel = CancellationToken::new();
        let mut fast = broker.subscribe(cancel.clone(), "t", "fast").await.unwrap();
        let mut slow = broker.subscribe(cancel.clone(), "t", "slow").await.unwrap();

        for payload in [b"1", b"2", b"3"] {
            broker.publish("t", Envelope::new("t", payload.to_vec())).await.unwrap();
        }
        for _ in 0..3 {
            next(&mut fast).await.ack();
        }
        assert_eq!(broker.retained("t"), 3);

        let first = next(&mut slow).await;
        first.nack();
        assert_eq!(broker.retained("t"), 2);

        // The nacked envelope no longer lives in the log but is still redelivered.
        let again = next(&mut slow).await;
        assert_eq!(again.envelope().payload(), b"1");
        again.ack();
        assert_eq!(broker.group_stats("t", "slow").backlog, 2);
        assert_eq!(broker.published_count("t"), 3);

        let _late = broker.subscribe(cancel.clone(), "t", "late").await.unwrap();
        assert_eq!(broker.group_stats("t", "late").backlog, 2);
    }
}

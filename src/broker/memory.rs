//! In-process broker with partitions and consumer groups.
//!
//! Each topic is a fixed set of append-only partition logs. Each consumer
//! group keeps, per partition, a committed offset, the next offset to hand
//! out and at most one in-flight delivery. Partitions are spread round-robin
//! over the group's live members and reassigned when members come and go; a
//! partition whose delivery is still in flight stays blocked until that
//! delivery resolves, so two members never work the same partition at once.
//! Nacks rewind the partition and redeliver immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Notify;
use tracing::{debug, info, instrument};

use super::{AckHandle, Acknowledger, BrokerClient, ConsistentHashPartitioner, Delivery, Subscription};
use crate::error::TransportError;
use crate::message::{metadata_keys, Envelope};
use crate::types::BrokerConfig;

/// (topic, consumer group)
type GroupKey = (String, String);

#[derive(Debug, Default)]
struct Cursor {
    committed: u64,
    next: u64,
    in_flight: Option<u64>,
    attempts: HashMap<u64, u32>,
}

#[derive(Debug)]
struct Group {
    /// Live members in join order
    members: Vec<u64>,
    owners: Vec<Option<u64>>,
    cursors: Vec<Cursor>,
}

impl Group {
    fn new(partitions: usize) -> Self {
        Self {
            members: Vec::new(),
            owners: vec![None; partitions],
            cursors: (0..partitions).map(|_| Cursor::default()).collect(),
        }
    }

    fn rebalance(&mut self) {
        let members = &self.members;
        for (partition, owner) in self.owners.iter_mut().enumerate() {
            *owner = if members.is_empty() {
                None
            } else {
                Some(members[partition % members.len()])
            };
        }
    }
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, Vec<Vec<Envelope>>>,
    groups: HashMap<GroupKey, Group>,
    publish_failures: HashMap<String, u32>,
    next_member_id: u64,
}

impl State {
    fn topic_mut(&mut self, topic: &str, partitions: usize) -> &mut Vec<Vec<Envelope>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions])
    }
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
    partitioner: ConsistentHashPartitioner,
    closed: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn partitions(&self) -> usize {
        self.partitioner.partitions() as usize
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn resolve(&self, key: &GroupKey, partition: usize, offset: u64, committed: bool) {
        {
            let mut state = self.lock();
            if let Some(cursor) = state
                .groups
                .get_mut(key)
                .and_then(|group| group.cursors.get_mut(partition))
            {
                if cursor.in_flight == Some(offset) {
                    cursor.in_flight = None;
                    if committed {
                        cursor.next = offset + 1;
                        cursor.committed = cursor.committed.max(offset + 1);
                        cursor.attempts.remove(&offset);
                    } else {
                        cursor.next = offset;
                    }
                }
            }
        }
        self.notify.notify_waiters();
    }
}

/// Hand out the next deliverable envelope owned by `member`, if any.
///
/// Partitions are scanned starting at `hint` so one busy partition cannot
/// starve the others.
fn claim(shared: &Arc<Shared>, key: &GroupKey, member: u64, hint: &mut usize) -> Option<Delivery> {
    let partitions = shared.partitions();
    let mut state = shared.lock();
    let State { topics, groups, .. } = &mut *state;
    let log = topics.get(&key.0)?;
    let group = groups.get_mut(key)?;

    for step in 0..partitions {
        let partition = (*hint + step) % partitions;
        if group.owners[partition] != Some(member) {
            continue;
        }

        let cursor = &mut group.cursors[partition];
        if cursor.in_flight.is_some() {
            continue;
        }
        let Some(stored) = log[partition].get(cursor.next as usize) else {
            continue;
        };

        let offset = cursor.next;
        cursor.in_flight = Some(offset);
        let attempts = cursor.attempts.entry(offset).or_insert(0);
        *attempts += 1;

        let mut envelope = stored.clone();
        envelope.set_metadata(metadata_keys::DELIVERY_ATTEMPT, attempts.to_string());
        *hint = partition + 1;

        let ack = MemoryAck {
            shared: Arc::clone(shared),
            key: key.clone(),
            partition,
            offset,
            resolved: false,
        };
        return Some(Delivery::new(envelope, AckHandle::new(ack)));
    }

    None
}

struct MemoryAck {
    shared: Arc<Shared>,
    key: GroupKey,
    partition: usize,
    offset: u64,
    resolved: bool,
}

#[async_trait]
impl Acknowledger for MemoryAck {
    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        let mut this = self;
        this.resolved = true;
        this.shared.resolve(&this.key, this.partition, this.offset, true);
        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<(), TransportError> {
        let mut this = self;
        this.resolved = true;
        this.shared.resolve(&this.key, this.partition, this.offset, false);
        Ok(())
    }
}

impl Drop for MemoryAck {
    fn drop(&mut self) {
        if !self.resolved {
            debug!(
                topic = %self.key.0,
                group = %self.key.1,
                offset = self.offset,
                "Unresolved delivery dropped, returning it for redelivery"
            );
            self.shared.resolve(&self.key, self.partition, self.offset, false);
        }
    }
}

/// Group membership held by a subscription stream.
struct Membership {
    shared: Arc<Shared>,
    key: GroupKey,
    member: u64,
}

impl Drop for Membership {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            if let Some(group) = state.groups.get_mut(&self.key) {
                group.members.retain(|member| *member != self.member);
                group.rebalance();
            }
        }
        debug!(topic = %self.key.0, group = %self.key.1, member = self.member, "Member left group");
        self.shared.notify.notify_waiters();
    }
}

/// In-process broker client. Cloning shares the same topics and groups.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    /// Create a broker whose topics have `partitions` partitions.
    pub fn new(partitions: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                partitioner: ConsistentHashPartitioner::new(partitions),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(config.partitions)
    }

    /// Make the next `count` publishes to `topic` fail.
    pub fn fail_next_publishes(&self, topic: &str, count: u32) {
        self.shared
            .lock()
            .publish_failures
            .insert(topic.to_string(), count);
    }

    /// Every envelope published to `topic`, partition by partition.
    pub fn messages(&self, topic: &str) -> Vec<Envelope> {
        self.shared
            .lock()
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Envelopes of one partition in offset order.
    pub fn partition_messages(&self, topic: &str, partition: u32) -> Vec<Envelope> {
        self.shared
            .lock()
            .topics
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .cloned()
            .unwrap_or_default()
    }

    /// Committed offset of every partition for `group` on `topic`.
    pub fn committed_offsets(&self, topic: &str, group: &str) -> Vec<u64> {
        self.shared
            .lock()
            .groups
            .get(&(topic.to_string(), group.to_string()))
            .map(|group| group.cursors.iter().map(|cursor| cursor.committed).collect())
            .unwrap_or_default()
    }

    /// Wait until `topic` holds at least `count` envelopes.
    pub async fn wait_for_messages(&self, topic: &str, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| {
            state
                .topics
                .get(topic)
                .map(|partitions| partitions.iter().map(Vec::len).sum::<usize>())
                .unwrap_or(0)
                >= count
        })
        .await
    }

    /// Wait until `group` has committed at least `count` envelopes of `topic`.
    pub async fn wait_for_commits(
        &self,
        topic: &str,
        group: &str,
        count: u64,
        timeout: Duration,
    ) -> bool {
        let key = (topic.to_string(), group.to_string());
        self.wait_until(timeout, |state| {
            state
                .groups
                .get(&key)
                .map(|group| group.cursors.iter().map(|cursor| cursor.committed).sum::<u64>())
                .unwrap_or(0)
                >= count
        })
        .await
    }

    async fn wait_until(&self, timeout: Duration, condition: impl Fn(&State) -> bool) -> bool {
        let shared = &self.shared;
        tokio::time::timeout(timeout, async {
            loop {
                let notified = shared.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if condition(&shared.lock()) {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(crate::DEFAULT_PARTITIONS)
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    #[instrument(skip(self, envelope), fields(id = %envelope.id()))]
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::Closed);
        }

        let partition = self.shared.partitioner.partition_for(envelope.partition_key()) as usize;
        let partitions = self.shared.partitions();
        {
            let mut state = self.shared.lock();
            if let Some(remaining) = state.publish_failures.get_mut(topic) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TransportError::Publish {
                        topic: topic.to_string(),
                        reason: "injected failure".to_string(),
                    });
                }
            }
            state.topic_mut(topic, partitions)[partition].push(envelope);
        }

        self.shared.notify.notify_waiters();
        debug!(topic = %topic, partition, "Envelope published");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        consumer_group: &str,
    ) -> Result<Subscription, TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::Subscribe {
                topic: topic.to_string(),
                group: consumer_group.to_string(),
                reason: "broker is closed".to_string(),
            });
        }

        let key: GroupKey = (topic.to_string(), consumer_group.to_string());
        let partitions = self.shared.partitions();
        let member = {
            let mut state = self.shared.lock();
            state.topic_mut(topic, partitions);
            let member = state.next_member_id;
            state.next_member_id += 1;
            let group = state
                .groups
                .entry(key.clone())
                .or_insert_with(|| Group::new(partitions));
            group.members.push(member);
            group.rebalance();
            member
        };
        self.shared.notify.notify_waiters();

        info!(topic = %topic, group = %consumer_group, member, "Subscribed to topic");

        let membership = Membership {
            shared: Arc::clone(&self.shared),
            key,
            member,
        };

        let stream = futures::stream::unfold((membership, 0usize), |(membership, mut hint)| async move {
            let shared = Arc::clone(&membership.shared);
            loop {
                let notified = shared.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if shared.is_closed() {
                    return None;
                }
                if let Some(delivery) = claim(&shared, &membership.key, membership.member, &mut hint) {
                    return Some((delivery, (membership, hint)));
                }

                notified.await;
            }
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
        info!("In-memory broker closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_millis(200);

    async fn next(subscription: &mut Subscription) -> Option<Delivery> {
        timeout(WAIT, subscription.next()).await.ok().flatten()
    }

    #[tokio::test]
    async fn test_ack_commits_offset() {
        let broker = InMemoryBroker::new(1);
        broker.publish("events", Envelope::new("a")).await.unwrap();

        let mut subscription = broker.subscribe("events", "g").await.unwrap();
        let delivery = next(&mut subscription).await.unwrap();
        assert_eq!(delivery.envelope.payload, b"a".to_vec());
        assert_eq!(delivery.envelope.delivery_attempt(), 1);

        delivery.ack.ack().await.unwrap();
        assert_eq!(broker.committed_offsets("events", "g"), vec![1]);
        assert!(next(&mut subscription).await.is_none());
    }

    #[tokio::test]
    async fn test_nack_redelivers_with_attempt_count() {
        let broker = InMemoryBroker::new(1);
        let published = Envelope::new("a");
        let id = published.id().to_string();
        broker.publish("events", published).await.unwrap();

        let mut subscription = broker.subscribe("events", "g").await.unwrap();
        for attempt in 1..=3 {
            let delivery = next(&mut subscription).await.unwrap();
            assert_eq!(delivery.envelope.id(), id);
            assert_eq!(delivery.envelope.delivery_attempt(), attempt);
            delivery.ack.nack().await.unwrap();
        }
        assert_eq!(broker.committed_offsets("events", "g"), vec![0]);
    }

    #[tokio::test]
    async fn test_dropped_handle_redelivers() {
        let broker = InMemoryBroker::new(1);
        broker.publish("events", Envelope::new("a")).await.unwrap();

        let mut subscription = broker.subscribe("events", "g").await.unwrap();
        drop(next(&mut subscription).await.unwrap());

        let again = next(&mut subscription).await.unwrap();
        assert_eq!(again.envelope.delivery_attempt(), 2);
    }

    #[tokio::test]
    async fn test_partition_order_preserved() {
        let broker = InMemoryBroker::new(4);
        for i in 0..10 {
            let envelope = Envelope::new(i.to_string()).with_metadata(metadata_keys::PARTITION_KEY, "same");
            broker.publish("events", envelope).await.unwrap();
        }

        let mut subscription = broker.subscribe("events", "g").await.unwrap();
        for i in 0..10 {
            let delivery = next(&mut subscription).await.unwrap();
            assert_eq!(delivery.envelope.payload, i.to_string().into_bytes());
            delivery.ack.ack().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_groups_consume_independently() {
        let broker = InMemoryBroker::new(2);
        let mut first = broker.subscribe("events", "a").await.unwrap();
        let mut second = broker.subscribe("events", "b").await.unwrap();
        broker.publish("events", Envelope::new("x")).await.unwrap();

        let one = next(&mut first).await.unwrap();
        let two = next(&mut second).await.unwrap();
        assert_eq!(one.envelope.id(), two.envelope.id());
    }

    #[tokio::test]
    async fn test_group_members_split_partitions() {
        let broker = InMemoryBroker::new(4);
        let first = broker.subscribe("events", "g").await.unwrap();
        let second = broker.subscribe("events", "g").await.unwrap();

        let mut published = HashSet::new();
        for _ in 0..40 {
            let envelope = Envelope::new("x");
            published.insert(envelope.id().to_string());
            broker.publish("events", envelope).await.unwrap();
        }

        let drain = |mut subscription: Subscription| async move {
            let mut seen = Vec::new();
            while let Some(delivery) = next(&mut subscription).await {
                seen.push(delivery.envelope.id().to_string());
                delivery.ack.ack().await.unwrap();
            }
            seen
        };
        let (seen_first, seen_second) = tokio::join!(drain(first), drain(second));

        let first_set: HashSet<_> = seen_first.iter().cloned().collect();
        let second_set: HashSet<_> = seen_second.iter().cloned().collect();
        assert_eq!(first_set.len(), seen_first.len(), "duplicates in first member");
        assert_eq!(second_set.len(), seen_second.len(), "duplicates in second member");
        assert!(first_set.is_disjoint(&second_set));
        assert_eq!(&first_set | &second_set, published);

        // Every partition was consumed by exactly one member.
        for partition in 0..4 {
            let ids: HashSet<String> = broker
                .partition_messages("events", partition)
                .iter()
                .map(|envelope| envelope.id().to_string())
                .collect();
            assert!(ids.is_subset(&first_set) || ids.is_subset(&second_set));
        }
    }

    #[tokio::test]
    async fn test_in_flight_partition_not_handed_over() {
        let broker = InMemoryBroker::new(1);
        let mut first = broker.subscribe("events", "g").await.unwrap();
        let mut second = broker.subscribe("events", "g").await.unwrap();
        broker.publish("events", Envelope::new("1")).await.unwrap();
        broker.publish("events", Envelope::new("2")).await.unwrap();

        let held = next(&mut first).await.unwrap();
        assert!(next(&mut second).await.is_none(), "second member owns no partition");

        // The first member leaves; its partition moves but stays blocked
        // until the in-flight delivery resolves.
        drop(first);
        assert!(next(&mut second).await.is_none());

        held.ack.ack().await.unwrap();
        let delivery = next(&mut second).await.unwrap();
        assert_eq!(delivery.envelope.payload, b"2".to_vec());
    }

    #[tokio::test]
    async fn test_subscription_wakes_on_publish() {
        let broker = InMemoryBroker::new(1);
        let mut subscription = broker.subscribe("events", "g").await.unwrap();

        let mut pending = tokio_test::task::spawn(subscription.next());
        tokio_test::assert_pending!(pending.poll());

        broker.publish("events", Envelope::new("x")).await.unwrap();
        assert!(pending.is_woken());
        match pending.poll() {
            std::task::Poll::Ready(Some(delivery)) => assert_eq!(delivery.envelope.payload, b"x".to_vec()),
            other => panic!("expected a delivery, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let broker = InMemoryBroker::new(1);
        let mut subscription = broker.subscribe("events", "g").await.unwrap();
        broker.close().await.unwrap();

        assert!(subscription.next().await.is_none());
        assert!(matches!(
            broker.publish("events", Envelope::new("x")).await,
            Err(TransportError::Closed)
        ));
        assert!(broker.subscribe("events", "g").await.is_err());
    }

    #[tokio::test]
    async fn test_injected_publish_failures() {
        let broker = InMemoryBroker::new(1);
        broker.fail_next_publishes("events", 2);

        assert!(broker.publish("events", Envelope::new("1")).await.is_err());
        assert!(broker.publish("events", Envelope::new("2")).await.is_err());
        assert!(broker.publish("events", Envelope::new("3")).await.is_ok());
        assert_eq!(broker.messages("events").len(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_messages() {
        let broker = InMemoryBroker::new(1);
        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("events", Envelope::new("x")).await.unwrap();
        });

        assert!(broker.wait_for_messages("events", 1, Duration::from_secs(2)).await);
        assert!(!broker.wait_for_messages("events", 2, Duration::from_millis(50)).await);
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! An in-process stand-in for RabbitMQ implementing the transport traits with
//! the broker behaviors the delivery layer depends on:
//!
//! - queue declaration is idempotent, and conflicting redeclarations fail
//! - publishes through the default exchange are confirmed, and dropped if no
//!   queue matches the routing key
//! - consumers are manual-ack and limited by their prefetch
//! - rejected deliveries follow the queue's dead-letter routing key
//! - unacked deliveries go back to the head of their queue when the channel
//!   that received them goes away
//!
//! Faults can be injected: refused connections, nacked or withheld publisher
//! confirms, and dropped connections.

use crate::{
    envelope::MessageEnvelope,
    errors::AmqpError,
    queue::QueueDefinition,
    transport::{
        Acknowledger, BrokerChannel, Confirmation, Connector, DeliveryStream, DisconnectHook,
        Inbound, PendingConfirm,
    },
};
use async_trait::async_trait;
use futures_util::{future, stream, StreamExt};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::Notify;
use tracing::debug;

/// Handle to an in-process broker. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, MemoryQueue>,
    unacked: BTreeMap<u64, Unacked>,
    channels: HashMap<u64, ChannelEntry>,
    cancelled: HashSet<String>,
    deliveries: HashMap<String, u32>,
    next_delivery_tag: u64,
    next_channel: u64,
    connect_attempts: u32,
    publish_attempts: u32,
    refused_connections: u32,
    nack_next: u32,
    nacked_queues: HashSet<String>,
    withheld_queues: HashSet<String>,
}

struct MemoryQueue {
    def: QueueDefinition,
    messages: VecDeque<MessageEnvelope>,
}

struct Unacked {
    channel: u64,
    consumer_tag: String,
    queue: String,
    envelope: MessageEnvelope,
}

struct ChannelEntry {
    open: Arc<AtomicBool>,
    hook: DisconnectHook,
}

enum Next {
    Deliver(Inbound),
    Wait,
    Cancelled,
    Lost,
}

enum Settle {
    Ack,
    Nack { requeue: bool },
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    /// Refuses the next `count` connection attempts.
    pub fn refuse_connections(&self, count: u32) {
        self.shared.state.lock().refused_connections = count;
    }

    /// Negatively confirms the next `count` publishes, whatever their queue.
    pub fn nack_next_publishes(&self, count: u32) {
        self.shared.state.lock().nack_next = count;
    }

    /// Negatively confirms every publish routed to `queue`.
    pub fn nack_publishes_to(&self, queue: &str) {
        self.shared.state.lock().nacked_queues.insert(queue.to_owned());
    }

    /// Never confirms publishes routed to `queue`; they are not stored either.
    pub fn withhold_confirms_for(&self, queue: &str) {
        self.shared.state.lock().withheld_queues.insert(queue.to_owned());
    }

    /// Closes every open connection as if the network failed.
    ///
    /// Disconnect hooks fire and unacked deliveries are requeued.
    pub fn drop_connections(&self) {
        let channels: Vec<u64> = self.shared.state.lock().channels.keys().copied().collect();

        for channel in channels {
            self.close_channel(channel, true);
        }
    }

    /// Messages ready in `queue`, head first.
    pub fn messages(&self, queue: &str) -> Vec<MessageEnvelope> {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Definition `queue` was declared with, if it exists.
    pub fn queue_definition(&self, queue: &str) -> Option<QueueDefinition> {
        self.shared.state.lock().queues.get(queue).map(|q| q.def.clone())
    }

    /// Total deliveries handed to consumers of `queue`.
    pub fn deliveries(&self, queue: &str) -> u32 {
        self.shared
            .state
            .lock()
            .deliveries
            .get(queue)
            .copied()
            .unwrap_or_default()
    }

    /// Deliveries handed out and not yet settled, across every channel.
    pub fn unacked(&self) -> usize {
        self.shared.state.lock().unacked.len()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.shared.state.lock().connect_attempts
    }

    /// Publishes received, confirmed or not.
    pub fn publish_attempts(&self) -> u32 {
        self.shared.state.lock().publish_attempts
    }

    pub fn open_channels(&self) -> usize {
        self.shared.state.lock().channels.len()
    }

    fn close_channel(&self, channel: u64, unexpected: bool) {
        let hook = {
            let mut state = self.shared.state.lock();
            let Some(entry) = state.channels.remove(&channel) else {
                return;
            };
            entry.open.store(false, Ordering::SeqCst);

            let tags: Vec<u64> = state
                .unacked
                .iter()
                .filter(|(_, u)| u.channel == channel)
                .map(|(tag, _)| *tag)
                .collect();

            // Highest tag first so the original order is restored at the head.
            for tag in tags.into_iter().rev() {
                if let Some(unacked) = state.unacked.remove(&tag) {
                    if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                        queue.messages.push_front(unacked.envelope);
                    }
                }
            }

            entry.hook
        };

        debug!(channel, unexpected, "memory channel closed");
        if unexpected {
            hook("connection reset by memory broker");
        }
        self.shared.notify.notify_waiters();
    }

    fn next_delivery(&self, channel: u64, queue: &str, consumer_tag: &str, prefetch: u16) -> Next {
        let mut state = self.shared.state.lock();

        if !state.channels.contains_key(&channel) {
            return Next::Lost;
        }

        if state.cancelled.contains(consumer_tag) {
            return Next::Cancelled;
        }

        let in_flight = state
            .unacked
            .values()
            .filter(|u| u.consumer_tag == consumer_tag)
            .count();
        if prefetch > 0 && in_flight >= usize::from(prefetch) {
            return Next::Wait;
        }

        let Some(envelope) = state
            .queues
            .get_mut(queue)
            .and_then(|q| q.messages.pop_front())
        else {
            return Next::Wait;
        };

        state.next_delivery_tag += 1;
        let delivery_tag = state.next_delivery_tag;
        *state.deliveries.entry(queue.to_owned()).or_default() += 1;
        state.unacked.insert(
            delivery_tag,
            Unacked {
                channel,
                consumer_tag: consumer_tag.to_owned(),
                queue: queue.to_owned(),
                envelope: envelope.clone(),
            },
        );

        Next::Deliver(Inbound::new(
            envelope,
            Box::new(MemoryAcker {
                broker: self.clone(),
                channel,
                delivery_tag,
            }),
        ))
    }

    fn settle(&self, channel: u64, delivery_tag: u64, settle: Settle) -> Result<(), AmqpError> {
        let failure = match settle {
            Settle::Ack => AmqpError::AckMessageError,
            Settle::Nack { .. } => AmqpError::NackMessageError,
        };

        {
            let mut state = self.shared.state.lock();

            if !state.channels.contains_key(&channel) {
                return Err(failure);
            }

            let Some(unacked) = state.unacked.remove(&delivery_tag) else {
                return Err(failure);
            };

            match settle {
                Settle::Ack => {}
                Settle::Nack { requeue: true } => {
                    if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                        queue.messages.push_front(unacked.envelope);
                    }
                }
                Settle::Nack { requeue: false } => {
                    let routing_key = state
                        .queues
                        .get(&unacked.queue)
                        .and_then(|q| q.def.dead_letter_routing_key.clone());

                    if let Some(routing_key) = routing_key {
                        if let Some(dlq) = state.queues.get_mut(&routing_key) {
                            dlq.messages
                                .push_back(unacked.envelope.dead_lettered(&routing_key));
                        }
                    }
                }
            }
        }

        self.shared.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(
        &self,
        _url: &str,
        on_disconnect: DisconnectHook,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut state = self.shared.state.lock();
        state.connect_attempts += 1;

        if state.refused_connections > 0 {
            state.refused_connections -= 1;
            return Err(AmqpError::ConnectionError);
        }

        state.next_channel += 1;
        let id = state.next_channel;
        let open = Arc::new(AtomicBool::new(true));
        state.channels.insert(
            id,
            ChannelEntry {
                open: open.clone(),
                hook: on_disconnect,
            },
        );

        Ok(Arc::new(MemoryChannel {
            broker: self.clone(),
            id,
            open,
        }))
    }
}

/// Channel on a [`MemoryBroker`].
pub struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::DeclareQueueError(def.name.clone()));
        }

        let mut state = self.broker.shared.state.lock();
        match state.queues.get(&def.name) {
            Some(existing) if existing.def == *def => Ok(()),
            Some(_) => Err(AmqpError::DeclareQueueError(def.name.clone())),
            None => {
                state.queues.insert(
                    def.name.clone(),
                    MemoryQueue {
                        def: def.clone(),
                        messages: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn publish(
        &self,
        queue: &str,
        envelope: &MessageEnvelope,
    ) -> Result<PendingConfirm, AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::PublishingError(queue.to_owned()));
        }

        {
            let mut state = self.broker.shared.state.lock();
            state.publish_attempts += 1;

            if state.withheld_queues.contains(queue) {
                return Ok(never_confirmed());
            }

            if state.nack_next > 0 {
                state.nack_next -= 1;
                return Ok(confirmed(Confirmation::Nack));
            }

            if state.nacked_queues.contains(queue) {
                return Ok(confirmed(Confirmation::Nack));
            }

            if let Some(target) = state.queues.get_mut(queue) {
                target.messages.push_back(MessageEnvelope {
                    queue: queue.to_owned(),
                    ..envelope.clone()
                });
            }
        }

        self.broker.shared.notify.notify_waiters();
        Ok(confirmed(Confirmation::Ack))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, AmqpError> {
        {
            let mut state = self.broker.shared.state.lock();
            if !self.is_open() || !state.queues.contains_key(queue) {
                return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
            }
            state.cancelled.remove(consumer_tag);
        }

        let seed = (
            self.broker.clone(),
            self.id,
            queue.to_owned(),
            consumer_tag.to_owned(),
        );

        Ok(stream::unfold(Some(seed), move |seed| async move {
            let (broker, channel, queue, tag) = seed?;
            let shared = broker.shared.clone();

            loop {
                let notified = shared.notify.notified();

                match broker.next_delivery(channel, &queue, &tag, prefetch) {
                    Next::Deliver(inbound) => {
                        return Some((Ok(inbound), Some((broker, channel, queue, tag))))
                    }
                    Next::Lost => return Some((Err(AmqpError::ConnectionLost), None)),
                    Next::Cancelled => return None,
                    Next::Wait => notified.await,
                }
            }
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.broker
            .shared
            .state
            .lock()
            .cancelled
            .insert(consumer_tag.to_owned());
        self.broker.shared.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.close_channel(self.id, false);
        Ok(())
    }
}

fn confirmed(confirmation: Confirmation) -> PendingConfirm {
    Box::pin(future::ready(Ok(confirmation)))
}

fn never_confirmed() -> PendingConfirm {
    Box::pin(future::pending())
}

struct MemoryAcker {
    broker: MemoryBroker,
    channel: u64,
    delivery_tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.broker.settle(self.channel, self.delivery_tag, Settle::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.broker
            .settle(self.channel, self.delivery_tag, Settle::Nack { requeue })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn open(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
        broker
            .connect("amqp://memory", Arc::new(|_: &str| {}))
            .await
            .unwrap()
    }

    async fn declare_pair(channel: &Arc<dyn BrokerChannel>, name: &str) {
        let def = QueueDefinition::new(name).durable().with_dlq();
        channel.declare_queue(&def.dlq().unwrap()).await.unwrap();
        channel.declare_queue(&def).await.unwrap();
    }

    async fn publish(channel: &Arc<dyn BrokerChannel>, queue: &str, body: &str) -> Confirmation {
        let pending = channel
            .publish(queue, &MessageEnvelope::new(queue, body))
            .await
            .unwrap();
        pending.await.unwrap()
    }

    async fn next(stream: &mut DeliveryStream) -> Inbound {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("delivery")
            .expect("stream open")
            .expect("delivery ok")
    }

    #[tokio::test]
    async fn redeclaring_is_idempotent_but_conflicts_fail() {
        let broker = MemoryBroker::new();
        let channel = open(&broker).await;

        declare_pair(&channel, "q1").await;
        declare_pair(&channel, "q1").await;

        let conflicting = QueueDefinition::new("q1");
        assert_eq!(
            channel.declare_queue(&conflicting).await,
            Err(AmqpError::DeclareQueueError("q1".into()))
        );
    }

    #[tokio::test]
    async fn rejected_delivery_follows_dead_letter_routing() {
        let broker = MemoryBroker::new();
        let channel = open(&broker).await;
        declare_pair(&channel, "q1").await;

        assert_eq!(publish(&channel, "q1", "hello").await, Confirmation::Ack);

        let mut stream = channel.consume("q1", "c1", 1).await.unwrap();
        let inbound = next(&mut stream).await;
        inbound.nack(false).await.unwrap();

        let dead = broker.messages("q1.dlq");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, b"hello".to_vec());
        assert!(broker.messages("q1").is_empty());
    }

    #[tokio::test]
    async fn prefetch_limits_unacked_deliveries() {
        let broker = MemoryBroker::new();
        let channel = open(&broker).await;
        declare_pair(&channel, "q1").await;

        for body in ["a", "b", "c"] {
            publish(&channel, "q1", body).await;
        }

        let mut stream = channel.consume("q1", "c1", 2).await.unwrap();
        let first = next(&mut stream).await;
        let _second = next(&mut stream).await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(blocked.is_err());

        first.ack().await.unwrap();
        let third = next(&mut stream).await;
        assert_eq!(third.envelope.body, b"c".to_vec());
    }

    #[tokio::test]
    async fn dropped_connection_requeues_unacked_in_order() {
        let broker = MemoryBroker::new();
        let channel = open(&broker).await;
        declare_pair(&channel, "q1").await;

        for body in ["a", "b", "c"] {
            publish(&channel, "q1", body).await;
        }

        let mut stream = channel.consume("q1", "c1", 2).await.unwrap();
        let first = next(&mut stream).await;
        let second = next(&mut stream).await;

        broker.drop_connections();

        assert!(!channel.is_open());
        assert_eq!(first.ack().await, Err(AmqpError::AckMessageError));
        assert_eq!(second.nack(true).await, Err(AmqpError::NackMessageError));
        assert!(matches!(
            stream.next().await,
            Some(Err(AmqpError::ConnectionLost))
        ));

        let bodies: Vec<Vec<u8>> = broker.messages("q1").into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(broker.unacked(), 0);
    }

    #[tokio::test]
    async fn injected_nacks_do_not_store_the_message() {
        let broker = MemoryBroker::new();
        let channel = open(&broker).await;
        declare_pair(&channel, "q1").await;

        broker.nack_next_publishes(1);
        assert_eq!(publish(&channel, "q1", "a").await, Confirmation::Nack);
        assert_eq!(publish(&channel, "q1", "b").await, Confirmation::Ack);

        assert_eq!(broker.messages("q1").len(), 1);
        assert_eq!(broker.publish_attempts(), 2);
    }

    #[tokio::test]
    async fn cancelled_consumer_stream_ends() {
        let broker = MemoryBroker::new();
        let channel = open(&broker).await;
        declare_pair(&channel, "q1").await;

        let mut stream = channel.consume("q1", "c1", 1).await.unwrap();
        channel.cancel("c1").await.unwrap();

        assert!(stream.next().await.is_none());
    }
}

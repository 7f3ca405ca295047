// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport
//!
//! The traits the delivery layer is written against. `channel` implements them
//! over `lapin`; `memory` implements them in-process.

use crate::{envelope::MessageEnvelope, errors::AmqpError, queue::QueueDefinition};
use async_trait::async_trait;
use futures_util::{future::BoxFuture, stream::BoxStream};
use std::sync::Arc;

/// Broker answer to a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
}

/// Resolves once the broker confirmed (or rejected) a published message.
pub type PendingConfirm = BoxFuture<'static, Result<Confirmation, AmqpError>>;

/// Stream of deliveries for one consumer. It ends, or yields an error, when the
/// channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Inbound, AmqpError>>;

/// Invoked with a reason when the connection or its channel fails.
pub type DisconnectHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Opens connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects to `url` and opens a confirm-mode channel on the new connection.
    ///
    /// `on_disconnect` must be called whenever the connection or channel closes
    /// without being asked to.
    async fn connect(
        &self,
        url: &str,
        on_disconnect: DisconnectHook,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError>;
}

/// A confirm-mode channel together with the connection that owns it.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Declares a queue. Re-declaring with identical properties is a no-op.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    /// Sends `envelope` to `queue` through the default exchange.
    ///
    /// Returning `Ok` only means the frame left; the returned future reports
    /// the broker's confirmation.
    async fn publish(
        &self,
        queue: &str,
        envelope: &MessageEnvelope,
    ) -> Result<PendingConfirm, AmqpError>;

    /// Starts a manual-ack consumer limited to `prefetch` unacked deliveries.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, AmqpError>;

    /// Stops the broker from sending further deliveries to `consumer_tag`.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message delivered to a consumer, not yet settled.
pub struct Inbound {
    pub envelope: MessageEnvelope,
    pub(crate) acker: Box<dyn Acknowledger>,
}

impl Inbound {
    /// Wraps a delivery with the handle that settles it.
    pub fn new(envelope: MessageEnvelope, acker: Box<dyn Acknowledger>) -> Self {
        Inbound { envelope, acker }
    }

    /// Acknowledges the delivery. Fails with `AckMessageError` once the
    /// channel that received it is gone.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    /// Rejects the delivery.
    ///
    /// # Parameters
    /// * `requeue` - `true` returns the message to its queue unchanged;
    ///   `false` hands it to the queue's dead-letter routing
    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(requeue).await
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module implements the broker transport over `lapin`. `AmqpConnector`
//! opens a connection and a confirm-mode channel on it and wires the
//! connection's error callbacks to the disconnect hook; `AmqpChannel` performs
//! declarations, confirmed publishes and manual-ack consumption.

use crate::{
    envelope::{MessageEnvelope, AMQP_HEADERS_X_RETRIES},
    errors::AmqpError,
    queue::QueueDefinition,
    transport::{
        Acknowledger, BrokerChannel, Confirmation, Connector, DeliveryStream, DisconnectHook,
        Inbound, PendingConfirm,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";

const DELIVERY_MODE_TRANSIENT: u8 = 1;
const DELIVERY_MODE_PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// Opens RabbitMQ connections with `lapin`.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    connection_name: String,
}

impl AmqpConnector {
    /// Creates a connector that announces itself with `connection_name`.
    pub fn new(connection_name: &str) -> AmqpConnector {
        AmqpConnector {
            connection_name: connection_name.to_owned(),
        }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(
        &self,
        url: &str,
        on_disconnect: DisconnectHook,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(url, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }?;
        debug!("amqp connected");

        let hook = on_disconnect.clone();
        conn.on_error(move |err| hook(&err.to_string()));

        debug!("creating amqp channel...");
        let channel = match conn.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }?;

        let hook = on_disconnect;
        channel.on_error(move |err| hook(&err.to_string()));

        if let Err(err) = channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
        {
            error!(error = err.to_string(), "error to enable publisher confirms");
            return Err(AmqpError::ChannelError);
        }
        debug!("channel created");

        Ok(Arc::new(AmqpChannel { conn, channel }))
    }
}

/// A confirm-mode `lapin` channel and the connection that owns it.
pub struct AmqpChannel {
    conn: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.conn.status().connected() && self.channel.status().connected()
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                queue_arguments(def),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = %def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn publish(
        &self,
        queue: &str,
        envelope: &MessageEnvelope,
    ) -> Result<PendingConfirm, AmqpError> {
        let confirm = match self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &envelope.body,
                properties_for(envelope),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error publishing message");
                Err(AmqpError::PublishingError(queue.to_owned()))
            }
            Ok(confirm) => Ok(confirm),
        }?;

        let queue = queue.to_owned();
        Ok(Box::pin(async move {
            match confirm.await {
                Ok(confirmation) if confirmation.is_nack() => Ok(Confirmation::Nack),
                Ok(_) => Ok(Confirmation::Ack),
                Err(err) => {
                    warn!(error = err.to_string(), queue = %queue, "error waiting for confirmation");
                    Err(AmqpError::PublishingError(queue))
                }
            }
        }))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, AmqpError> {
        if let Err(err) = self
            .channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
        {
            error!(error = err.to_string(), "error to configure qos");
            return Err(AmqpError::QoSDeclarationError(queue.to_owned()));
        }

        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(inbound_from(delivery)),
                Err(err) => {
                    warn!(error = err.to_string(), "consumer stream failed");
                    Err(AmqpError::ConnectionLost)
                }
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), consumer_tag, "error to cancel the consumer");
                AmqpError::ConsumerDeclarationError(consumer_tag.to_owned())
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.channel.status().connected() {
            if let Err(err) = self.channel.close(REPLY_SUCCESS, "closing").await {
                warn!(error = err.to_string(), "error to close the channel");
            }
        }

        if self.conn.status().connected() {
            if let Err(err) = self.conn.close(REPLY_SUCCESS, "closing").await {
                error!(error = err.to_string(), "error to close the connection");
                return Err(AmqpError::InternalError);
            }
        }

        Ok(())
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}

fn inbound_from(delivery: Delivery) -> Inbound {
    let envelope = envelope_from(
        delivery.routing_key.as_str(),
        delivery.data,
        &delivery.properties,
    );

    Inbound::new(envelope, Box::new(AmqpAcker(delivery.acker)))
}

/// Queue arguments routing rejections through the default exchange.
fn queue_arguments(def: &QueueDefinition) -> FieldTable {
    let mut args = BTreeMap::new();

    if let Some(routing_key) = &def.dead_letter_routing_key {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from("")),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(routing_key.clone())),
        );
    }

    FieldTable::from(args)
}

/// Maps an envelope onto AMQP properties.
///
/// The redelivery counter always travels in `x-retries`, even when zero.
pub(crate) fn properties_for(envelope: &MessageEnvelope) -> BasicProperties {
    let mut headers = BTreeMap::<ShortString, AMQPValue>::default();

    for (key, value) in &envelope.headers {
        headers.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }

    headers.insert(
        ShortString::from(AMQP_HEADERS_X_RETRIES),
        AMQPValue::LongLongInt(LongLongInt::from(envelope.redelivery_count)),
    );

    let mut props = BasicProperties::default()
        .with_delivery_mode(if envelope.persistent {
            DELIVERY_MODE_PERSISTENT
        } else {
            DELIVERY_MODE_TRANSIENT
        })
        .with_message_id(ShortString::from(envelope.message_id.clone()))
        .with_headers(FieldTable::from(headers));

    if let Some(content_type) = &envelope.content_type {
        props = props.with_content_type(ShortString::from(content_type.clone()));
    }

    props
}

/// Rebuilds an envelope from a delivery's routing key, body and properties.
pub(crate) fn envelope_from(queue: &str, body: Vec<u8>, props: &AMQPProperties) -> MessageEnvelope {
    let mut headers = BTreeMap::new();
    let mut redelivery_count = 0;

    if let Some(table) = props.headers() {
        for (key, value) in table.inner() {
            if key.as_str() == AMQP_HEADERS_X_RETRIES {
                redelivery_count = redelivery_count_from(value).unwrap_or_default();
                continue;
            }

            if let Some(text) = header_text(value) {
                headers.insert(key.to_string(), text);
            }
        }
    }

    MessageEnvelope {
        queue: queue.to_owned(),
        body,
        persistent: props.delivery_mode() == &Some(DELIVERY_MODE_PERSISTENT),
        redelivery_count,
        message_id: match props.message_id() {
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        },
        content_type: props.content_type().as_ref().map(|v| v.to_string()),
        headers,
    }
}

/// Reads the redelivery counter from any integer representation, or from a
/// numeric string written by other clients.
fn redelivery_count_from(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::ShortShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::ShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::LongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongUInt(v) => Some(*v),
        AMQPValue::LongLongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongString(_) | AMQPValue::ShortString(_) => {
            header_text(value).and_then(|text| text.trim().parse().ok())
        }
        _ => None,
    }
}

fn header_text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes())
            .map(str::to_owned)
            .map_err(|e| error!("Error decoding header value {:?}", e))
            .ok(),
        AMQPValue::ShortString(v) => Some(v.as_str().to_owned()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueDefinition;

    #[test]
    fn envelope_survives_property_mapping() {
        let sent = MessageEnvelope::new("q1", r#"{"to":"a@b.c"}"#)
            .with_content_type("application/json")
            .with_header("traceparent", "00-abc-def-01")
            .requeued()
            .requeued();

        let props = properties_for(&sent);
        let received = envelope_from("q1", sent.body.clone(), &props);

        assert_eq!(received, sent);
        assert_eq!(props.delivery_mode(), &Some(DELIVERY_MODE_PERSISTENT));
    }

    #[test]
    fn counter_header_is_always_written() {
        let props = properties_for(&MessageEnvelope::new("q1", "hello"));
        let headers = props.headers().clone().unwrap();

        assert_eq!(
            headers.inner().get(AMQP_HEADERS_X_RETRIES),
            Some(&AMQPValue::LongLongInt(0))
        );
    }

    #[test]
    fn counter_defaults_to_zero_without_headers() {
        let received = envelope_from("q1", b"hello".to_vec(), &BasicProperties::default());

        assert_eq!(received.redelivery_count, 0);
        assert!(!received.persistent);
        assert!(!received.message_id.is_empty());
    }

    #[test]
    fn counter_is_read_from_other_integer_types() {
        assert_eq!(redelivery_count_from(&AMQPValue::LongInt(2)), Some(2));
        assert_eq!(redelivery_count_from(&AMQPValue::ShortShortUInt(3)), Some(3));
        assert_eq!(
            redelivery_count_from(&AMQPValue::LongString(LongString::from("4"))),
            Some(4)
        );
        assert_eq!(redelivery_count_from(&AMQPValue::LongLongInt(-1)), None);
        assert_eq!(redelivery_count_from(&AMQPValue::Boolean(true)), None);
    }

    #[test]
    fn work_queue_arguments_route_to_dlq() {
        let args = queue_arguments(&QueueDefinition::new("q1").durable().with_dlq());

        assert_eq!(
            args.inner().get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&AMQPValue::LongString(LongString::from("q1.dlq")))
        );
        assert_eq!(
            args.inner().get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&AMQPValue::LongString(LongString::from("")))
        );
        assert!(queue_arguments(&QueueDefinition::new("q1.dlq")).inner().is_empty());
    }
}

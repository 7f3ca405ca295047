// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishes messages with broker confirmation. Transient failures (nacks,
//! failed sends, confirmations that never arrive) are retried with exponential
//! backoff; once the retry budget is spent the message is parked in the
//! queue's dead-letter queue instead of being dropped.
//!
//! The caller's OpenTelemetry context travels in the message headers.

use crate::{
    config::RabbitMqConfig,
    connection::{ConnectionManager, Session},
    envelope::{MessageEnvelope, JSON_CONTENT_TYPE},
    errors::AmqpError,
    otel,
    queue::dead_letter_name,
    retry::RetryPolicy,
    topology::QueueTopology,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, warn};

/// How a publish ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The broker confirmed the message on the work queue.
    Delivered { attempts: u32 },
    /// The work queue never confirmed it; the message sits in the dead-letter
    /// queue instead.
    Degraded {
        dead_letter_queue: String,
        attempts: u32,
    },
}

impl DeliveryOutcome {
    /// Whether the message reached its work queue.
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

/// Confirmed publisher sharing the process-wide connection.
pub struct Publisher {
    connections: Arc<ConnectionManager>,
    topology: Arc<QueueTopology>,
    policy: RetryPolicy,
    confirm_timeout: Duration,
}

impl Publisher {
    /// Creates a new publisher.
    ///
    /// # Parameters
    /// * `connections` - The connection shared with the rest of the process
    /// * `topology` - Declares the target queues before their first publish
    /// * `policy` - Retry budget for a single message
    /// * `confirm_timeout` - How long one attempt waits for the broker
    ///
    /// # Returns
    /// An Arc-wrapped Publisher instance for thread-safe sharing
    pub fn new(
        connections: Arc<ConnectionManager>,
        topology: Arc<QueueTopology>,
        policy: RetryPolicy,
        confirm_timeout: Duration,
    ) -> Arc<Publisher> {
        Arc::new(Publisher {
            connections,
            topology,
            policy,
            confirm_timeout,
        })
    }

    /// Creates a publisher using the retry budget and confirm timeout of `cfg`.
    pub fn from_config(
        connections: Arc<ConnectionManager>,
        topology: Arc<QueueTopology>,
        cfg: &RabbitMqConfig,
    ) -> Arc<Publisher> {
        Self::new(connections, topology, cfg.publish_retry, cfg.confirm_timeout)
    }

    /// Publishes `body` to `queue`.
    ///
    /// Returns `Delivered` once the broker confirmed the message, or
    /// `Degraded` when every attempt failed and the message was confirmed on
    /// `<queue>.dlq` instead. Errors are reserved for the cases where the
    /// message could not be stored anywhere.
    pub async fn publish(
        &self,
        queue: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<DeliveryOutcome, AmqpError> {
        self.publish_envelope(MessageEnvelope::new(queue, body))
            .await
    }

    /// Serializes `payload` as JSON and publishes it to `queue`.
    pub async fn publish_json<T>(&self, queue: &str, payload: &T) -> Result<DeliveryOutcome, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let body = match serde_json::to_vec(payload) {
            Err(err) => {
                error!(error = err.to_string(), "error serializing message");
                Err(AmqpError::SerializationError(err.to_string()))
            }
            Ok(body) => Ok(body),
        }?;

        self.publish_envelope(MessageEnvelope::new(queue, body).with_content_type(JSON_CONTENT_TYPE))
            .await
    }

    /// Publishes a prepared envelope to the queue it names.
    pub async fn publish_envelope(
        &self,
        mut envelope: MessageEnvelope,
    ) -> Result<DeliveryOutcome, AmqpError> {
        let target = envelope.queue.clone();
        let queue = target.as_str();

        let mut session = self.connections.acquire().await?;
        self.topology.ensure(&session, queue).await?;

        otel::inject(&Context::current(), &mut envelope.headers);

        for attempt in 0..self.policy.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.policy.backoff(attempt - 1)).await;

                if !session.is_open() {
                    match self.reacquire(queue).await {
                        Ok(fresh) => session = fresh,
                        Err(err) => {
                            warn!(
                                error = err.to_string(),
                                queue,
                                attempt = attempt + 1,
                                "failure to reconnect for publish"
                            );
                            continue;
                        }
                    }
                }
            }

            match session
                .publish_confirmed(queue, &envelope, self.confirm_timeout)
                .await
            {
                Ok(()) => {
                    debug!(queue, attempt = attempt + 1, "message confirmed");
                    return Ok(DeliveryOutcome::Delivered {
                        attempts: attempt + 1,
                    });
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        queue,
                        attempt = attempt + 1,
                        max_attempts = self.policy.max_attempts,
                        "publish attempt failed"
                    );
                }
            }
        }

        self.dead_letter(session, &envelope).await
    }

    /// Parks `envelope` in the dead-letter queue of its work queue.
    async fn dead_letter(
        &self,
        session: Session,
        envelope: &MessageEnvelope,
    ) -> Result<DeliveryOutcome, AmqpError> {
        let dead_letter_queue = dead_letter_name(&envelope.queue);
        error!(
            queue = %envelope.queue,
            message_id = %envelope.message_id,
            "retry budget exhausted, sending to dlq"
        );

        let session = if session.is_open() {
            session
        } else {
            match self.connections.acquire().await {
                Err(err) => {
                    error!(error = err.to_string(), "no connection left for the dlq, message lost");
                    return Err(AmqpError::DeadLetterFailure(dead_letter_queue));
                }
                Ok(session) => session,
            }
        };

        let dead = envelope.dead_lettered(&dead_letter_queue);
        match session
            .publish_confirmed(&dead_letter_queue, &dead, self.confirm_timeout)
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    dead_letter_queue = %dead_letter_queue,
                    "error publishing to dlq, message lost"
                );
                Err(AmqpError::DeadLetterFailure(dead_letter_queue))
            }
            Ok(()) => Ok(DeliveryOutcome::Degraded {
                dead_letter_queue,
                attempts: self.policy.max_attempts,
            }),
        }
    }

    async fn reacquire(&self, queue: &str) -> Result<Session, AmqpError> {
        let session = self.connections.acquire().await?;
        self.topology.ensure(&session, queue).await?;
        Ok(session)
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Delivery Layer
//!
//! `AmqpError` covers every failure the connection, topology, publishing and
//! consuming paths can report. Handler failures are kept apart in
//! `HandlerError` because they never leave the consume loop.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Some variants are fatal to the caller (`ConnectionError`,
/// `DeadLetterFailure`), some are only observed inside the publish retry loop
/// (`PublishingError`, `PublishNotConfirmed`, `ConfirmTimeout`), and
/// `ConnectionLost` tells a subscriber it may resubscribe once the broker is
/// reachable again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server after every attempt
    #[error("failure to connect")]
    ConnectionError,

    /// The connection backing a running subscription went away
    #[error("connection lost")]
    ConnectionLost,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer on the given queue
    #[error("failure to declare consumer on `{0}`")]
    ConsumerDeclarationError(String),

    /// The local send of a message to the given queue failed
    #[error("failure to publish to `{0}`")]
    PublishingError(String),

    /// The broker negatively acknowledged a message sent to the given queue
    #[error("publish to `{0}` was not confirmed")]
    PublishNotConfirmed(String),

    /// No broker confirmation arrived in time for the given queue
    #[error("timed out waiting for confirmation from `{0}`")]
    ConfirmTimeout(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Publishing to the dead-letter queue failed, the message may be lost
    #[error("failure to publish to dead-letter queue `{0}`")]
    DeadLetterFailure(String),

    /// The payload could not be serialized
    #[error("failure to serialize payload: {0}")]
    SerializationError(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}

impl AmqpError {
    /// Whether the caller can recover by acquiring the connection again and
    /// retrying the operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionLost
                | AmqpError::PublishingError(_)
                | AmqpError::PublishNotConfirmed(_)
                | AmqpError::ConfirmTimeout(_)
        )
    }
}

/// Failure reported by a consumer handler.
///
/// The consume loop turns it into a requeue or a dead-letter decision; it is
/// never propagated out of a subscription.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        HandlerError(reason.into())
    }

    pub fn reason(&self) -> &str {
        &self.0
    }
}

impl From<&str> for HandlerError {
    fn from(reason: &str) -> Self {
        HandlerError(reason.to_owned())
    }
}

impl From<String> for HandlerError {
    fn from(reason: String) -> Self {
        HandlerError(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_recoverable() {
        assert!(AmqpError::ConnectionLost.is_recoverable());
        assert!(AmqpError::ConfirmTimeout("q1".into()).is_recoverable());
        assert!(!AmqpError::ConnectionError.is_recoverable());
        assert!(!AmqpError::DeadLetterFailure("q1.dlq".into()).is_recoverable());
    }

    #[test]
    fn handler_error_keeps_reason() {
        let err = HandlerError::from("smtp unavailable");
        assert_eq!(err.reason(), "smtp unavailable");
        assert_eq!(err.to_string(), "smtp unavailable");
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Every work queue the layer touches is paired with exactly one dead-letter
//! queue named `<queue>.dlq`. Broker-level rejections of the work queue are
//! routed there through the default exchange.

/// Suffix appended to a work queue name to form its dead-letter queue.
pub const DEAD_LETTER_SUFFIX: &str = ".dlq";

/// Returns the dead-letter queue paired with `queue`.
pub fn dead_letter_name(queue: &str) -> String {
    format!("{queue}{DEAD_LETTER_SUFFIX}")
}

/// Definition of a queue and its dead-letter routing.
///
/// Follows the builder pattern. `dead_letter_routing_key` is the queue that
/// rejected messages are routed to; it is `None` for the dead-letter queues
/// themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) dead_letter_routing_key: Option<String>,
}

impl QueueDefinition {
    /// Creates a new, non-durable queue definition without dead-letter routing.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            dead_letter_routing_key: None,
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Routes broker-level rejections to the paired `<name>.dlq` queue.
    pub fn with_dlq(mut self) -> Self {
        self.dead_letter_routing_key = Some(dead_letter_name(&self.name));
        self
    }

    /// Returns the definition of the paired dead-letter queue, if any.
    ///
    /// The dead-letter queue shares the durability of its work queue.
    pub fn dlq(&self) -> Option<QueueDefinition> {
        self.dead_letter_routing_key.as_deref().map(|name| QueueDefinition {
            name: name.to_owned(),
            durable: self.durable,
            dead_letter_routing_key: None,
        })
    }

    /// Queue name, also its routing key on the default exchange.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the queue survives a broker restart.
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Queue receiving messages this queue rejects, sent as
    /// `x-dead-letter-routing-key` through the default exchange.
    pub fn dead_letter_routing_key(&self) -> Option<&str> {
        self.dead_letter_routing_key.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlq_follows_naming_convention() {
        assert_eq!(dead_letter_name("email-queue"), "email-queue.dlq");

        let def = QueueDefinition::new("q1").durable().with_dlq();
        assert_eq!(def.dead_letter_routing_key(), Some("q1.dlq"));

        let dlq = def.dlq().unwrap();
        assert_eq!(dlq.name(), "q1.dlq");
        assert!(dlq.is_durable());
        assert_eq!(dlq.dead_letter_routing_key(), None);
    }

    #[test]
    fn plain_queue_has_no_dlq() {
        let def = QueueDefinition::new("q1");
        assert!(!def.is_durable());
        assert!(def.dlq().is_none());
    }
}

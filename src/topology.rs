// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Topology
//!
//! Declares a work queue and its paired dead-letter queue before anything is
//! published to or consumed from it. Declarations are idempotent on the
//! broker; successful ones are also remembered per connection epoch so the
//! publish path does not repeat them.

use crate::{
    connection::Session,
    errors::AmqpError,
    queue::QueueDefinition,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

/// Declares `<queue>` and `<queue>.dlq` on demand.
pub struct QueueTopology {
    declared: Mutex<HashMap<String, u64>>,
}

impl Default for QueueTopology {
    fn default() -> Self {
        QueueTopology::new()
    }
}

impl QueueTopology {
    /// Creates a topology declaring durable queues.
    pub fn new() -> QueueTopology {
        QueueTopology {
            declared: Mutex::new(HashMap::default()),
        }
    }

    /// Definition used for `queue`: durable, dead-lettering to `<queue>.dlq`.
    pub fn definition(&self, queue: &str) -> QueueDefinition {
        QueueDefinition::new(queue).durable().with_dlq()
    }

    /// Ensures `queue` and its dead-letter queue exist.
    ///
    /// The dead-letter queue is declared first so the work queue never routes
    /// rejections into a queue that does not exist yet.
    pub async fn ensure(&self, session: &Session, queue: &str) -> Result<QueueDefinition, AmqpError> {
        let def = self.definition(queue);

        if self.declared.lock().get(queue) == Some(&session.epoch()) {
            return Ok(def);
        }

        if let Some(dlq) = def.dlq() {
            session.declare_queue(&dlq).await?;
        }
        session.declare_queue(&def).await?;

        debug!(queue, epoch = session.epoch(), "queue topology declared");
        self.declared.lock().insert(queue.to_owned(), session.epoch());

        Ok(def)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{connection::ConnectionManager, memory::MemoryBroker, retry::RetryPolicy};
    use std::{sync::Arc, time::Duration};

    fn manager(broker: &MemoryBroker) -> Arc<ConnectionManager> {
        ConnectionManager::new(
            "amqp://memory",
            RetryPolicy::new(1, Duration::from_millis(10), Duration::from_millis(10)),
            Arc::new(broker.clone()),
        )
    }

    #[tokio::test]
    async fn declares_durable_pair_with_dead_letter_routing() {
        let broker = MemoryBroker::new();
        let session = manager(&broker).acquire().await.unwrap();

        QueueTopology::new().ensure(&session, "q1").await.unwrap();

        let work = broker.queue_definition("q1").unwrap();
        assert!(work.is_durable());
        assert_eq!(work.dead_letter_routing_key(), Some("q1.dlq"));

        let dlq = broker.queue_definition("q1.dlq").unwrap();
        assert!(dlq.is_durable());
        assert_eq!(dlq.dead_letter_routing_key(), None);
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let broker = MemoryBroker::new();
        let session = manager(&broker).acquire().await.unwrap();
        let topology = QueueTopology::new();

        topology.ensure(&session, "q1").await.unwrap();
        topology.ensure(&session, "q1").await.unwrap();
        // A second topology instance re-declares against the broker.
        QueueTopology::new().ensure(&session, "q1").await.unwrap();

        assert!(broker.queue_definition("q1").is_some());
    }

    #[tokio::test]
    async fn reconnect_invalidates_the_cache() {
        let broker = MemoryBroker::new();
        let connections = manager(&broker);
        let topology = QueueTopology::new();

        let first = connections.acquire().await.unwrap();
        topology.ensure(&first, "q1").await.unwrap();

        broker.drop_connections();
        let second = connections.acquire().await.unwrap();

        assert_eq!(topology.declared.lock().get("q1"), Some(&first.epoch()));
        topology.ensure(&second, "q1").await.unwrap();
        assert_eq!(topology.declared.lock().get("q1"), Some(&second.epoch()));
    }

    #[tokio::test]
    async fn declaring_on_a_closed_session_fails() {
        let broker = MemoryBroker::new();
        let session = manager(&broker).acquire().await.unwrap();
        broker.drop_connections();

        let result = QueueTopology::new().ensure(&session, "q1").await;
        assert_eq!(result, Err(AmqpError::DeclareQueueError("q1.dlq".into())));
    }
}

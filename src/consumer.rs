// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Subscribes a handler to a work queue. Each subscription runs on its own
//! task, pulling deliveries from the broker and dispatching them concurrently,
//! at most `prefetch` at a time.
//!
//! Handler failures never stop a subscription. It ends when it is shut down,
//! when the connection backing it goes away (`ConnectionLost`, resubscribe
//! once the broker is back), or when a message can be neither retried nor
//! dead-lettered (`DeadLetterFailure`).

use crate::{
    config::{ConsumerConfig, RabbitMqConfig},
    connection::{ConnectionManager, ConnectionState, Session},
    dispatcher::{Dispatcher, Disposition},
    errors::AmqpError,
    handler::ConsumerHandler,
    topology::QueueTopology,
    transport::DeliveryStream,
};
use futures_util::StreamExt;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    task::{JoinError, JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Starts subscriptions on the process-wide connection.
pub struct Consumer {
    connections: Arc<ConnectionManager>,
    topology: Arc<QueueTopology>,
    config: ConsumerConfig,
    confirm_timeout: Duration,
}

impl Consumer {
    /// Creates a new consumer.
    ///
    /// # Parameters
    /// * `connections` - The connection shared with the rest of the process
    /// * `topology` - Declares the consumed queues before subscribing
    /// * `config` - Retry budget, prefetch and timeouts of every subscription
    /// * `confirm_timeout` - How long a requeue or dead-letter republish waits
    ///   for the broker
    ///
    /// # Returns
    /// An Arc-wrapped Consumer instance for thread-safe sharing
    pub fn new(
        connections: Arc<ConnectionManager>,
        topology: Arc<QueueTopology>,
        config: ConsumerConfig,
        confirm_timeout: Duration,
    ) -> Arc<Consumer> {
        Arc::new(Consumer {
            connections,
            topology,
            config,
            confirm_timeout,
        })
    }

    /// Creates a consumer from the `consumer` section and confirm timeout of
    /// `cfg`.
    pub fn from_config(
        connections: Arc<ConnectionManager>,
        topology: Arc<QueueTopology>,
        cfg: &RabbitMqConfig,
    ) -> Arc<Consumer> {
        Self::new(connections, topology, cfg.consumer.clone(), cfg.confirm_timeout)
    }

    /// Starts consuming `queue` with `handler`.
    ///
    /// Fails if the connection cannot be acquired or the queue cannot be
    /// declared or consumed; afterwards failures surface through
    /// [`Subscription::closed`].
    pub async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Subscription, AmqpError> {
        let session = self.connections.acquire().await?;
        self.topology.ensure(&session, queue).await?;

        let consumer_tag = format!("{queue}-{}", Uuid::new_v4());
        let deliveries = session
            .consume(queue, &consumer_tag, self.config.prefetch)
            .await?;

        let token = CancellationToken::new();
        let consume_loop = ConsumeLoop {
            session: session.clone(),
            state: self.connections.watch(),
            dispatcher: Arc::new(Dispatcher::new(
                queue,
                handler,
                &self.config,
                self.confirm_timeout,
            )),
            token: token.clone(),
            max_in_flight: usize::from(self.config.prefetch.max(1)),
            shutdown_timeout: self.config.shutdown_timeout,
        };

        debug!(queue, consumer_tag = %consumer_tag, "subscription started");
        let task = tokio::spawn(consume_loop.run(deliveries));

        Ok(Subscription {
            queue: queue.to_owned(),
            consumer_tag,
            session,
            token,
            task,
        })
    }
}

/// A running subscription.
///
/// Dropping it leaves the consume task running; call
/// [`Subscription::shutdown`] to stop it.
pub struct Subscription {
    queue: String,
    consumer_tag: String,
    session: Session,
    token: CancellationToken,
    task: JoinHandle<Result<(), AmqpError>>,
}

impl Subscription {
    /// Work queue being consumed.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Broker consumer tag, `<queue>-<uuid>`.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Whether the consume task has ended, for whatever reason.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits until the subscription ends on its own.
    ///
    /// `Err(ConnectionLost)` means the caller may subscribe again.
    pub async fn closed(self) -> Result<(), AmqpError> {
        join(self.task).await
    }

    /// Stops taking deliveries and waits for the in-flight ones to settle,
    /// for at most the configured shutdown timeout.
    ///
    /// Deliveries still running at the timeout are abandoned unacked; the
    /// broker hands them out again once the channel closes.
    ///
    /// # Returns
    /// * `Result<(), AmqpError>` - `DeadLetterFailure` if a delivery settled
    ///   during the drain could not be dead-lettered
    pub async fn shutdown(self) -> Result<(), AmqpError> {
        self.token.cancel();

        if self.session.is_open() {
            if let Err(err) = self.session.cancel(&self.consumer_tag).await {
                warn!(error = err.to_string(), "failure to cancel the consumer");
            }
        }

        let result = join(self.task).await;
        debug!(queue = %self.queue, "subscription stopped");
        result
    }
}

async fn join(task: JoinHandle<Result<(), AmqpError>>) -> Result<(), AmqpError> {
    match task.await {
        Err(err) => {
            error!(error = err.to_string(), "consume task failed");
            Err(AmqpError::InternalError)
        }
        Ok(result) => result,
    }
}

struct ConsumeLoop {
    session: Session,
    state: watch::Receiver<ConnectionState>,
    dispatcher: Arc<Dispatcher>,
    token: CancellationToken,
    max_in_flight: usize,
    shutdown_timeout: Duration,
}

type Settled = Result<Result<Disposition, AmqpError>, JoinError>;

impl ConsumeLoop {
    async fn run(mut self, mut deliveries: DeliveryStream) -> Result<(), AmqpError> {
        let mut in_flight: JoinSet<Result<Disposition, AmqpError>> = JoinSet::new();

        let outcome = if self.is_live() {
            self.pump(&mut deliveries, &mut in_flight).await
        } else {
            Err(AmqpError::ConnectionLost)
        };

        let drained = self.drain(&mut in_flight).await;

        match outcome {
            Ok(()) => drained,
            Err(err) => {
                warn!(error = err.to_string(), "subscription ended");
                Err(err)
            }
        }
    }

    async fn pump(
        &mut self,
        deliveries: &mut DeliveryStream,
        in_flight: &mut JoinSet<Result<Disposition, AmqpError>>,
    ) -> Result<(), AmqpError> {
        loop {
            tokio::select! {
                biased;

                _ = self.token.cancelled() => return Ok(()),

                Some(settled) = in_flight.join_next() => report(settled)?,

                changed = self.state.changed() => {
                    if changed.is_err() || !self.is_live() {
                        return Err(AmqpError::ConnectionLost);
                    }
                }

                next = deliveries.next(), if in_flight.len() < self.max_in_flight => match next {
                    Some(Ok(inbound)) => {
                        let dispatcher = self.dispatcher.clone();
                        let session = self.session.clone();
                        in_flight.spawn(async move { dispatcher.dispatch(&session, inbound).await });
                    }
                    Some(Err(err)) => {
                        error!(error = err.to_string(), "errors consume msg");
                        return Err(AmqpError::ConnectionLost);
                    }
                    None if self.token.is_cancelled() => return Ok(()),
                    None => return Err(AmqpError::ConnectionLost),
                },
            }
        }
    }

    /// Waits for in-flight deliveries, aborting the ones still running after
    /// the shutdown timeout. Their messages stay unacked and are redelivered.
    async fn drain(
        &self,
        in_flight: &mut JoinSet<Result<Disposition, AmqpError>>,
    ) -> Result<(), AmqpError> {
        let mut outcome = Ok(());

        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while let Some(settled) = in_flight.join_next().await {
                if let Err(err) = report(settled) {
                    outcome = Err(err);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = in_flight.len(),
                "shutdown timeout reached, abandoning in-flight deliveries"
            );
            in_flight.abort_all();
        }

        outcome
    }

    fn is_live(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected {
            epoch: self.session.epoch(),
        }
    }
}

/// Logs a settled delivery. Only a dead-letter failure is returned.
fn report(settled: Settled) -> Result<(), AmqpError> {
    match settled {
        Ok(Ok(disposition)) => {
            debug!(?disposition, "delivery settled");
            Ok(())
        }
        Ok(Err(err @ AmqpError::DeadLetterFailure(_))) => Err(err),
        Ok(Err(err)) => {
            warn!(error = err.to_string(), "delivery left to the broker");
            Ok(())
        }
        Err(err) => {
            error!(error = err.to_string(), "dispatch task failed");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        envelope::MessageEnvelope, errors::HandlerError, handler::handler_fn,
        memory::MemoryBroker, retry::RetryPolicy,
    };
    use parking_lot::Mutex;

    struct Fixture {
        broker: MemoryBroker,
        connections: Arc<ConnectionManager>,
        consumer: Arc<Consumer>,
    }

    fn fixture(config: ConsumerConfig) -> Fixture {
        let broker = MemoryBroker::new();
        let connections = ConnectionManager::new(
            "amqp://memory",
            RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(100)),
            Arc::new(broker.clone()),
        );
        let consumer = Consumer::new(
            connections.clone(),
            Arc::new(QueueTopology::new()),
            config,
            Duration::from_secs(1),
        );

        Fixture {
            broker,
            connections,
            consumer,
        }
    }

    async fn seed(fx: &Fixture, bodies: &[&str]) {
        let session = fx.connections.acquire().await.unwrap();
        QueueTopology::new().ensure(&session, "q1").await.unwrap();
        for body in bodies {
            session
                .publish_confirmed("q1", &MessageEnvelope::new("q1", *body), Duration::from_secs(1))
                .await
                .unwrap();
        }
    }

    async fn eventually(check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn handled_messages_are_acked() {
        let fx = fixture(ConsumerConfig::default());
        seed(&fx, &["a", "b", "c"]).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = handler_fn({
            let seen = seen.clone();
            move |msg: MessageEnvelope| {
                let seen = seen.clone();
                async move {
                    seen.lock().push(msg.body);
                    Ok(())
                }
            }
        });

        let sub = fx.consumer.subscribe("q1", handler).await.unwrap();
        eventually(|| seen.lock().len() == 3).await;
        sub.shutdown().await.unwrap();

        assert!(fx.broker.messages("q1").is_empty());
        assert_eq!(fx.broker.unacked(), 0);
    }

    #[tokio::test]
    async fn in_flight_handlers_are_capped_by_prefetch() {
        let fx = fixture(ConsumerConfig {
            prefetch: 2,
            ..ConsumerConfig::default()
        });
        seed(&fx, &["a", "b", "c", "d", "e"]).await;

        let running = Arc::new(Mutex::new((0usize, 0usize)));
        let handler = handler_fn({
            let running = running.clone();
            move |_: MessageEnvelope| {
                let running = running.clone();
                async move {
                    {
                        let mut guard = running.lock();
                        guard.0 += 1;
                        guard.1 = guard.1.max(guard.0);
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.lock().0 -= 1;
                    Ok(())
                }
            }
        });

        let sub = fx.consumer.subscribe("q1", handler).await.unwrap();
        eventually(|| fx.broker.messages("q1").is_empty() && fx.broker.unacked() == 0).await;
        sub.shutdown().await.unwrap();

        assert_eq!(running.lock().1, 2);
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_handlers() {
        let fx = fixture(ConsumerConfig::default());
        seed(&fx, &["slow"]).await;

        let started = Arc::new(tokio::sync::Notify::new());
        let handler = handler_fn({
            let started = started.clone();
            move |_: MessageEnvelope| {
                let started = started.clone();
                async move {
                    started.notify_one();
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                }
            }
        });

        let sub = fx.consumer.subscribe("q1", handler).await.unwrap();
        started.notified().await;
        sub.shutdown().await.unwrap();

        assert!(fx.broker.messages("q1").is_empty());
        assert_eq!(fx.broker.unacked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_handlers_past_the_timeout() {
        let fx = fixture(ConsumerConfig {
            shutdown_timeout: Duration::from_millis(100),
            ..ConsumerConfig::default()
        });
        seed(&fx, &["stuck"]).await;

        let started = Arc::new(tokio::sync::Notify::new());
        let handler = handler_fn({
            let started = started.clone();
            move |_: MessageEnvelope| {
                let started = started.clone();
                async move {
                    started.notify_one();
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }
        });

        let sub = fx.consumer.subscribe("q1", handler).await.unwrap();
        started.notified().await;

        let begun = tokio::time::Instant::now();
        sub.shutdown().await.unwrap();
        let elapsed = begun.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(1));

        // Abandoned, not settled: still held until the channel goes away.
        assert_eq!(fx.broker.unacked(), 1);
        fx.connections.close().await.unwrap();

        let returned = fx.broker.messages("q1");
        assert_eq!(returned.len(), 1);
        assert_eq!(returned[0].body, b"stuck".to_vec());
        assert_eq!(returned[0].redelivery_count, 0);
        assert_eq!(fx.broker.unacked(), 0);
    }

    #[tokio::test]
    async fn dropped_connection_ends_the_subscription() {
        let fx = fixture(ConsumerConfig::default());
        seed(&fx, &[]).await;

        let handler = handler_fn(|_| async { Ok(()) });
        let sub = fx.consumer.subscribe("q1", handler).await.unwrap();

        fx.broker.drop_connections();

        assert_eq!(sub.closed().await, Err(AmqpError::ConnectionLost));
    }

    #[tokio::test]
    async fn failing_dead_letter_ends_the_subscription() {
        let fx = fixture(ConsumerConfig {
            max_retries: 0,
            ..ConsumerConfig::default()
        });
        seed(&fx, &["poison"]).await;
        fx.broker.nack_publishes_to("q1.dlq");

        let handler = handler_fn(|_| async { Err(HandlerError::from("boom")) });
        let sub = fx.consumer.subscribe("q1", handler).await.unwrap();

        assert_eq!(
            sub.closed().await,
            Err(AmqpError::DeadLetterFailure("q1.dlq".into()))
        );
        assert_eq!(fx.broker.messages("q1").len(), 1);
    }

    #[tokio::test]
    async fn subscribe_fails_without_a_broker() {
        let fx = fixture(ConsumerConfig::default());
        fx.broker.refuse_connections(10);

        let handler = handler_fn(|_| async { Ok(()) });
        let result = fx.consumer.subscribe("q1", handler).await;

        assert!(matches!(result, Err(AmqpError::ConnectionError)));
    }
}

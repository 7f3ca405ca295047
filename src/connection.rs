// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Lifecycle
//!
//! `ConnectionManager` owns the single broker connection of a process and the
//! channel opened on it. Publishers and consumers borrow it through
//! [`ConnectionManager::acquire`], which connects lazily with bounded
//! exponential backoff and hands out the live [`Session`] while it stays
//! healthy.
//!
//! Unexpected closes only flip the state to `Disconnected`; nothing reconnects
//! until the next `acquire`, so a long broker outage does not turn into a
//! reconnect storm.

use crate::{
    channel::AmqpConnector,
    config::RabbitMqConfig,
    envelope::MessageEnvelope,
    errors::AmqpError,
    queue::QueueDefinition,
    retry::RetryPolicy,
    transport::{BrokerChannel, Confirmation, Connector, DeliveryStream, DisconnectHook},
};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{watch, Mutex},
    time::Instant,
};
use tracing::{debug, error, warn};

/// Lifecycle of the managed connection.
///
/// `Connected` carries the epoch of the link so observers can tell a
/// reconnected link from the one they were using.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected { epoch: u64 },
    Closing,
}

impl ConnectionState {
    /// Whether a live session is available without reconnecting.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }
}

/// Borrowed handle to the live connection and its channel.
///
/// Cloning is cheap; every clone shares the same write lock, so publishes from
/// concurrent callers reach the channel one at a time.
#[derive(Clone)]
pub struct Session {
    epoch: u64,
    channel: Arc<dyn BrokerChannel>,
    write: Arc<Mutex<()>>,
}

impl Session {
    /// Connection epoch this session belongs to. Epochs only grow.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    /// Declares `def` on the session's channel.
    ///
    /// # Returns
    /// * `Result<(), AmqpError>` - `DeclareQueueError` when the queue exists
    ///   with different properties or the channel is gone.
    pub async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.channel.declare_queue(def).await
    }

    /// Publishes `envelope` to `queue` and waits for the broker confirmation.
    ///
    /// A single deadline covers waiting for the write lock, the send and the
    /// confirmation. Only the send holds the write lock; the confirmation wait
    /// runs unlocked so other callers can pipeline their sends.
    ///
    /// # Parameters
    /// * `queue` - Routing key on the default exchange
    /// * `envelope` - Message to publish
    /// * `confirm_timeout` - Budget for the whole attempt
    ///
    /// # Returns
    /// * `Result<(), AmqpError>` - `Ok` once the broker acked the publish,
    ///   `ConfirmTimeout` when the budget ran out, `PublishNotConfirmed` on a
    ///   broker nack.
    pub async fn publish_confirmed(
        &self,
        queue: &str,
        envelope: &MessageEnvelope,
        confirm_timeout: Duration,
    ) -> Result<(), AmqpError> {
        let deadline = Instant::now() + confirm_timeout;

        let send = async {
            let _guard = self.write.lock().await;
            self.channel.publish(queue, envelope).await
        };

        let pending = match tokio::time::timeout_at(deadline, send).await {
            Err(_) => {
                warn!(queue, "send did not complete before the confirm deadline");
                return Err(AmqpError::ConfirmTimeout(queue.to_owned()));
            }
            Ok(result) => result?,
        };

        match tokio::time::timeout_at(deadline, pending).await {
            Err(_) => Err(AmqpError::ConfirmTimeout(queue.to_owned())),
            Ok(Err(err)) => Err(err),
            Ok(Ok(Confirmation::Nack)) => Err(AmqpError::PublishNotConfirmed(queue.to_owned())),
            Ok(Ok(Confirmation::Ack)) => Ok(()),
        }
    }

    /// Starts a manual-ack consumer on `queue` limited to `prefetch` unacked
    /// deliveries.
    ///
    /// # Parameters
    /// * `queue` - Queue to consume from; it must already be declared
    /// * `consumer_tag` - Tag used later to [`Session::cancel`] the consumer
    /// * `prefetch` - Broker-side qos
    ///
    /// # Returns
    /// * `Result<DeliveryStream, AmqpError>` - Stream of deliveries, ending
    ///   when the consumer is cancelled and failing with `ConnectionLost` when
    ///   the channel goes away.
    pub async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, AmqpError> {
        self.channel.consume(queue, consumer_tag, prefetch).await
    }

    /// Cancels the broker consumer registered as `consumer_tag`.
    pub async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel.cancel(consumer_tag).await
    }
}

/// Owns the lifecycle of one broker connection.
///
/// Construct it once at startup, share it behind an `Arc` with publishers and
/// consumers, and call [`ConnectionManager::close`] at shutdown.
pub struct ConnectionManager {
    url: String,
    policy: RetryPolicy,
    connector: Arc<dyn Connector>,
    current: Mutex<Option<Session>>,
    state: Arc<watch::Sender<ConnectionState>>,
    live_epoch: Arc<AtomicU64>,
    next_epoch: AtomicU64,
}

impl ConnectionManager {
    /// Creates a disconnected manager. Nothing connects until the first
    /// [`ConnectionManager::acquire`].
    ///
    /// # Parameters
    /// * `url` - AMQP URL handed to `connector`
    /// * `policy` - Attempts and backoff for each `acquire`
    /// * `connector` - Transport used to open connections
    ///
    /// # Returns
    /// * `Arc<ConnectionManager>` - Shared handle for publishers and consumers
    pub fn new(url: &str, policy: RetryPolicy, connector: Arc<dyn Connector>) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Arc::new(ConnectionManager {
            url: url.to_owned(),
            policy,
            connector,
            current: Mutex::new(None),
            state: Arc::new(state),
            live_epoch: Arc::new(AtomicU64::new(0)),
            next_epoch: AtomicU64::new(1),
        })
    }

    /// Creates a manager that connects to RabbitMQ with `lapin`.
    pub fn amqp(cfg: &RabbitMqConfig) -> Arc<Self> {
        Self::new(
            &cfg.url,
            cfg.connection_retry,
            Arc::new(AmqpConnector::new(&cfg.connection_name)),
        )
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribes to state transitions.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Returns the live session, connecting first if there is none.
    ///
    /// Concurrent callers wait on the same connection attempt. After
    /// `max_attempts` failures the call gives up with `ConnectionError`.
    pub async fn acquire(&self) -> Result<Session, AmqpError> {
        let mut current = self.current.lock().await;

        if let Some(session) = current.as_ref() {
            if session.is_open() && self.is_live(session.epoch) {
                return Ok(session.clone());
            }
            debug!(epoch = session.epoch, "dropping stale amqp session");
        }
        *current = None;

        self.state.send_replace(ConnectionState::Connecting);

        for attempt in 0..self.policy.max_attempts {
            let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);
            // Published before connecting so an immediate failure is not missed.
            self.live_epoch.store(epoch, Ordering::SeqCst);

            match self.connector.connect(&self.url, self.disconnect_hook(epoch)).await {
                Ok(channel) if self.is_live(epoch) => {
                    let session = Session {
                        epoch,
                        channel,
                        write: Arc::new(Mutex::new(())),
                    };
                    self.state.send_replace(ConnectionState::Connected { epoch });
                    debug!(epoch, attempt = attempt + 1, "amqp session established");

                    *current = Some(session.clone());
                    return Ok(session);
                }
                Ok(channel) => {
                    warn!(epoch, "connection closed while it was being established");
                    let _ = channel.close().await;
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        attempt = attempt + 1,
                        max_attempts = self.policy.max_attempts,
                        "failure to connect"
                    );
                }
            }

            if attempt + 1 < self.policy.max_attempts {
                let backoff = self.policy.backoff(attempt);
                debug!(backoff_ms = backoff.as_millis() as u64, "retrying connection");
                tokio::time::sleep(backoff).await;
            }
        }

        self.live_epoch.store(0, Ordering::SeqCst);
        self.state.send_replace(ConnectionState::Disconnected);
        error!(
            max_attempts = self.policy.max_attempts,
            "giving up connecting to the broker"
        );

        Err(AmqpError::ConnectionError)
    }

    /// Closes the channel and the connection.
    ///
    /// Stop subscriptions first: closing the channel loses any ack that is
    /// still pending.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let mut current = self.current.lock().await;

        let Some(session) = current.take() else {
            self.state.send_replace(ConnectionState::Disconnected);
            return Ok(());
        };

        self.state.send_replace(ConnectionState::Closing);
        self.live_epoch.store(0, Ordering::SeqCst);

        let result = session.channel.close().await;
        self.state.send_replace(ConnectionState::Disconnected);
        debug!(epoch = session.epoch, "amqp session closed");

        result
    }

    fn is_live(&self, epoch: u64) -> bool {
        self.live_epoch.load(Ordering::SeqCst) == epoch
    }

    /// Hook handed to the transport for the connection stamped `epoch`.
    ///
    /// Events from an older connection are ignored.
    fn disconnect_hook(&self, epoch: u64) -> DisconnectHook {
        let state = self.state.clone();
        let live_epoch = self.live_epoch.clone();

        Arc::new(move |reason: &str| {
            if live_epoch
                .compare_exchange(epoch, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                warn!(epoch, reason, "amqp connection lost");
                state.send_replace(ConnectionState::Disconnected);
            }
        })
    }
}

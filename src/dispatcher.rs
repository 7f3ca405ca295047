// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Dispatcher
//!
//! Runs the handler for one delivery and settles the delivery with the broker
//! according to the outcome and the message's redelivery counter:
//!
//! - success: ack
//! - failure with retries left: republish a copy with the counter bumped,
//!   then ack the original
//! - failure with the budget spent: publish the body to `<queue>.dlq`, then
//!   ack the original
//! - failure whose republish is refused: reject the original without requeue,
//!   leaving it to the work queue's dead-letter routing
//!
//! A handler that panics or runs past its timeout has failed.

use crate::{
    config::ConsumerConfig,
    connection::Session,
    envelope::MessageEnvelope,
    errors::{AmqpError, HandlerError},
    handler::ConsumerHandler,
    otel,
    queue::dead_letter_name,
    transport::Inbound,
};
use futures_util::FutureExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tracing::{debug, error, warn};

/// Final state of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    /// A copy carrying `redelivery_count` went back to the work queue.
    Requeued { redelivery_count: u32 },
    DeadLettered,
}

/// Settles deliveries of one queue.
pub(crate) struct Dispatcher {
    queue: String,
    handler: Arc<dyn ConsumerHandler>,
    max_retries: u32,
    handler_timeout: Duration,
    confirm_timeout: Duration,
    tracer: BoxedTracer,
}

impl Dispatcher {
    pub(crate) fn new(
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
        cfg: &ConsumerConfig,
        confirm_timeout: Duration,
    ) -> Self {
        Dispatcher {
            queue: queue.to_owned(),
            handler,
            max_retries: cfg.max_retries,
            handler_timeout: cfg.handler_timeout,
            confirm_timeout,
            tracer: global::tracer("amqp consumer"),
        }
    }

    /// Handles `inbound` and settles it on `session`.
    ///
    /// Only `DeadLetterFailure` should stop the caller; every other error
    /// leaves the delivery to be redelivered by the broker.
    pub(crate) async fn dispatch(
        &self,
        session: &Session,
        inbound: Inbound,
    ) -> Result<Disposition, AmqpError> {
        let msg = &inbound.envelope;
        let (ctx, mut span) = otel::new_span(&msg.headers, &self.tracer, &self.queue);

        debug!(
            queue = %self.queue,
            message_id = %msg.message_id,
            redelivery_count = msg.redelivery_count,
            "received"
        );

        let Err(err) = self.run_handler(&ctx, msg).await else {
            return match inbound.ack().await {
                Err(err) => {
                    error!(error = err.to_string(), "error whiling ack msg");
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                    Err(err)
                }
                Ok(()) => {
                    span.set_status(Status::Ok);
                    Ok(Disposition::Acked)
                }
            };
        };

        span.record_error(&err);
        span.set_status(Status::Error {
            description: Cow::from(err.reason().to_owned()),
        });

        if msg.redelivery_count < self.max_retries {
            self.requeue(session, &inbound).await
        } else {
            self.dead_letter(session, &inbound).await
        }
    }

    async fn run_handler(&self, ctx: &Context, msg: &MessageEnvelope) -> Result<(), HandlerError> {
        let exec = AssertUnwindSafe(async { self.handler.exec(ctx, msg).await }).catch_unwind();

        match tokio::time::timeout(self.handler_timeout, exec).await {
            Err(_) => Err(HandlerError::new(format!(
                "handler timed out after {}ms",
                self.handler_timeout.as_millis()
            ))),
            Ok(Err(_)) => Err(HandlerError::new("handler panicked")),
            Ok(Ok(result)) => result,
        }
    }

    async fn requeue(&self, session: &Session, inbound: &Inbound) -> Result<Disposition, AmqpError> {
        let next = inbound.envelope.requeued();
        warn!(
            queue = %self.queue,
            redelivery_count = next.redelivery_count,
            max_retries = self.max_retries,
            "error whiling handling msg, requeuing for latter"
        );

        if let Err(err) = session
            .publish_confirmed(&self.queue, &next, self.confirm_timeout)
            .await
        {
            // Rejecting without requeue lets the queue's dead-letter routing
            // take the message, so a broken work queue cannot loop forever.
            error!(
                error = err.to_string(),
                queue = %self.queue,
                "error whiling requeuing, rejecting msg to the dlq"
            );
            return match inbound.nack(false).await {
                Err(nack_err) => {
                    error!(error = nack_err.to_string(), "error whiling nack msg");
                    Err(nack_err)
                }
                Ok(()) => Ok(Disposition::DeadLettered),
            };
        }

        // The copy is already confirmed; a failed ack here means a duplicate.
        inbound.ack().await.map_err(|err| {
            error!(error = err.to_string(), "error whiling ack requeued msg");
            err
        })?;

        Ok(Disposition::Requeued {
            redelivery_count: next.redelivery_count,
        })
    }

    async fn dead_letter(&self, session: &Session, inbound: &Inbound) -> Result<Disposition, AmqpError> {
        let dead_letter_queue = dead_letter_name(&self.queue);
        error!(
            queue = %self.queue,
            message_id = %inbound.envelope.message_id,
            "too many attempts, sending to dlq"
        );

        let dead = inbound.envelope.dead_lettered(&dead_letter_queue);
        if let Err(err) = session
            .publish_confirmed(&dead_letter_queue, &dead, self.confirm_timeout)
            .await
        {
            error!(
                error = err.to_string(),
                dead_letter_queue = %dead_letter_queue,
                "error whiling sending to dlq, message may be lost"
            );
            if let Err(nack_err) = inbound.nack(true).await {
                error!(error = nack_err.to_string(), "error whiling nack msg");
            }
            return Err(AmqpError::DeadLetterFailure(dead_letter_queue));
        }

        inbound.ack().await.map_err(|err| {
            error!(error = err.to_string(), "error whiling ack msg to default queue");
            err
        })?;

        Ok(Disposition::DeadLettered)
    }
}

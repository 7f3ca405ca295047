// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! The caller-supplied side of a subscription. A handler returns `Ok` to have
//! the message acknowledged; an `Err` makes the consume loop requeue or
//! dead-letter it.

use crate::{envelope::MessageEnvelope, errors::HandlerError};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use opentelemetry::Context;
use std::{future::Future, sync::Arc};

/// Processes one delivered message.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// `ctx` carries the trace context propagated by the publisher.
    async fn exec(&self, ctx: &Context, msg: &MessageEnvelope) -> Result<(), HandlerError>;
}

/// Adapts an async closure into a [`ConsumerHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F>
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn exec(&self, _ctx: &Context, msg: &MessageEnvelope) -> Result<(), HandlerError> {
        (self.f)(msg.clone()).await
    }
}

/// Wraps `f` as a shareable handler.
///
/// ```ignore
/// let handler = handler_fn(|msg| async move {
///     let mail: Mail = serde_json::from_slice(&msg.body).map_err(|e| HandlerError::new(e.to_string()))?;
///     send(mail).await
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ConsumerHandler>
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closure_handler_sees_the_message() {
        let handler = handler_fn(|msg: MessageEnvelope| async move {
            if msg.body == b"ok" {
                Ok(())
            } else {
                Err(HandlerError::from("unexpected body"))
            }
        });

        let ctx = Context::new();
        assert!(handler.exec(&ctx, &MessageEnvelope::new("q1", "ok")).await.is_ok());
        assert_eq!(
            handler.exec(&ctx, &MessageEnvelope::new("q1", "ko")).await,
            Err(HandlerError::from("unexpected body"))
        );
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! The unit the delivery layer moves around: an opaque body plus the
//! attributes the layer itself relies on (persistence, redelivery counter,
//! message id and trace headers).

use std::collections::BTreeMap;
use uuid::Uuid;

/// Header carrying the redelivery counter on the wire.
pub const AMQP_HEADERS_X_RETRIES: &str = "x-retries";

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A message as published to, or delivered from, a queue.
///
/// The body is caller-serialized; the layer never inspects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub queue: String,
    pub body: Vec<u8>,
    pub persistent: bool,
    pub redelivery_count: u32,
    pub message_id: String,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl MessageEnvelope {
    /// Creates a persistent, first-delivery envelope for `queue`.
    pub fn new(queue: &str, body: impl Into<Vec<u8>>) -> MessageEnvelope {
        MessageEnvelope {
            queue: queue.to_owned(),
            body: body.into(),
            persistent: true,
            redelivery_count: 0,
            message_id: Uuid::new_v4().to_string(),
            content_type: None,
            headers: BTreeMap::default(),
        }
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }

    /// Builds the envelope republished after a handler failure.
    ///
    /// The original is left untouched; the copy carries `redelivery_count + 1`.
    pub fn requeued(&self) -> MessageEnvelope {
        MessageEnvelope {
            redelivery_count: self.redelivery_count.saturating_add(1),
            ..self.clone()
        }
    }

    /// Builds the envelope forwarded to `dead_letter_queue`, body unchanged.
    pub fn dead_lettered(&self, dead_letter_queue: &str) -> MessageEnvelope {
        MessageEnvelope {
            queue: dead_letter_queue.to_owned(),
            ..self.clone()
        }
    }
}

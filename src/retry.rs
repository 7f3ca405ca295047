// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Policy
//!
//! Bounded exponential backoff shared by connection establishment and
//! publishing.

use crate::errors::AmqpError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Attempt budget and backoff curve for a retried operation.
///
/// The delay slept after failed attempt `n` (0-indexed) is
/// `min(base_delay * 2^n, max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms", with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy, raising `max_attempts` to at least one attempt.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> RetryPolicy {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Returns the same policy with a different attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Backoff to sleep after the failed attempt `attempt` (0-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Rejects policies that could never attempt anything.
    pub fn validate(&self, name: &str) -> Result<(), AmqpError> {
        if self.max_attempts == 0 {
            return Err(AmqpError::ConfigError(format!(
                "{name}: max_attempts must be at least 1"
            )));
        }

        if self.base_delay > self.max_delay {
            return Err(AmqpError::ConfigError(format!(
                "{name}: base delay exceeds max delay"
            )));
        }

        Ok(())
    }
}

/// Serde adapter for durations written as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy::new(5, Duration::from_millis(base_ms), Duration::from_millis(max_ms))
    }

    #[test]
    fn backoff_doubles_from_base() {
        let p = policy(100, 10_000);
        assert_eq!(p.backoff(0), Duration::from_millis(100));
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(2), Duration::from_millis(400));
        assert_eq!(p.backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let p = policy(100, 500);
        assert_eq!(p.backoff(3), Duration::from_millis(500));
        assert_eq!(p.backoff(40), Duration::from_millis(500));
        assert_eq!(p.backoff(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn at_least_one_attempt() {
        let p = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO);
        assert_eq!(p.max_attempts, 1);
        assert_eq!(RetryPolicy::default().with_max_attempts(0).max_attempts, 1);
    }

    #[test]
    fn validate_rejects_zero_attempts() {
        let p = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert!(matches!(p.validate("publish"), Err(AmqpError::ConfigError(_))));
        assert!(RetryPolicy::default().validate("publish").is_ok());
    }

    #[test]
    fn delays_are_read_as_milliseconds() {
        let p: RetryPolicy = serde_json::from_str(
            r#"{ "max_attempts": 4, "base_delay_ms": 250, "max_delay_ms": 2000 }"#,
        )
        .unwrap();

        assert_eq!(p.max_attempts, 4);
        assert_eq!(p.base_delay, Duration::from_millis(250));
        assert_eq!(p.max_delay, Duration::from_secs(2));
    }
}

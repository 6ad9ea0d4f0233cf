//! Durable work-queue adapter. Built on `async-nats`/JetStream, following
//! a trait-plus-fake-double idiom for the bus collaborator (mirrored by
//! every other I/O seam in this crate: store, registry client, tools).

pub mod fake;
pub mod nats;

use crate::errors::{BusError, HandlerError};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A message handle delivered to a consumer. `num_delivered` lets the
/// subscriber compute backoff and detect exhausted retries.
#[async_trait]
pub trait BusMessage: Send + Sync {
    fn subject(&self) -> &str;
    fn payload(&self) -> &[u8];
    fn num_delivered(&self) -> u32;

    async fn ack(&self) -> Result<(), BusError>;
    async fn nak(&self, delay: Duration) -> Result<(), BusError>;
    /// Heartbeat extending `AckWait` past a long-running step.
    async fn in_progress(&self) -> Result<(), BusError>;
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Idempotent within the bus's dedup window.
    async fn publish(&self, subject: &str, message_id: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Streams messages on `subjects` to `on_message` under a durable
    /// consumer named `durable` until `cancel` fires.
    async fn consume(
        &self,
        subjects: Vec<String>,
        durable: &str,
        cancel: CancellationToken,
        on_message: Arc<dyn Fn(Box<dyn BusMessage>) -> HandlerFuture + Send + Sync>,
    ) -> Result<(), BusError>;
}

pub type HandlerFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), HandlerError>> + Send>>;

/// `delay = base * 2^(numDelivered-1) * (1 +/- jitter)`, clamped at zero.
pub fn backoff_delay(base: Duration, num_delivered: u32, jitter: f64) -> Duration {
    let exponent = num_delivered.saturating_sub(1).min(20);
    let multiplier = 2f64.powi(exponent as i32);
    let jittered = 1.0 + rand::rng().random_range(-jitter..=jitter);
    let secs = (base.as_secs_f64() * multiplier * jittered).max(0.0);
    Duration::from_secs_f64(secs)
}

/// What the subscriber does after a handler error: retry with backoff,
/// or (after `max_attempts` deliveries) hand off to the failure handler
/// and ack to remove the message.
pub enum RetryOutcome {
    Nak(Duration),
    ExhaustedRetries,
}

pub fn retry_outcome(num_delivered: u32, max_attempts: u32, base: Duration, jitter: f64) -> RetryOutcome {
    if num_delivered >= max_attempts {
        RetryOutcome::ExhaustedRetries
    } else {
        RetryOutcome::Nak(backoff_delay(base, num_delivered, jitter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_with_delivery_count() {
        let base = Duration::from_secs(10);
        let d1 = backoff_delay(base, 1, 0.0);
        let d2 = backoff_delay(base, 2, 0.0);
        let d3 = backoff_delay(base, 3, 0.0);
        assert_eq!(d1, Duration::from_secs(10));
        assert_eq!(d2, Duration::from_secs(20));
        assert_eq!(d3, Duration::from_secs(40));
    }

    #[test]
    fn backoff_never_goes_negative_with_max_jitter() {
        let d = backoff_delay(Duration::from_secs(1), 1, 1.0);
        assert!(d.as_secs_f64() >= 0.0);
    }

    #[test]
    fn retry_outcome_exhausts_at_max_attempts() {
        let outcome = retry_outcome(5, 5, Duration::from_secs(1), 0.0);
        assert!(matches!(outcome, RetryOutcome::ExhaustedRetries));
        let outcome = retry_outcome(4, 5, Duration::from_secs(1), 0.0);
        assert!(matches!(outcome, RetryOutcome::Nak(_)));
    }
}

//! In-memory `MessageBus` double for unit and seed-scenario tests.
//! A trait-plus-no-op-double split, generalized here to a fake that
//! actually honors the dedup-window and delivery-count contract so the
//! seed scenarios exercise real subscriber logic.

use crate::bus::{BusMessage, HandlerFuture, MessageBus};
use crate::errors::BusError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct Envelope {
    subject: String,
    payload: Vec<u8>,
    delivered: AtomicU32,
}

#[derive(Default)]
struct Inner {
    /// FIFO queue of not-yet-acked messages.
    queue: Vec<Arc<Envelope>>,
    /// message_id -> seen, for the dedup window (no expiry: tests run
    /// well within any realistic window).
    seen_message_ids: HashMap<String, ()>,
}

pub struct FakeBus {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl Default for FakeBus {
    fn default() -> Self {
        FakeBus {
            inner: Arc::new(Mutex::new(Inner::default())),
            notify: Arc::new(Notify::new()),
        }
    }
}

impl FakeBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: count of messages currently published on `subject`
    /// regardless of delivery/ack state. Used to assert dedup (property 5).
    pub fn published_count(&self, subject: &str) -> usize {
        self.inner.lock().unwrap().queue.iter().filter(|e| e.subject == subject).count()
    }
}

struct FakeMessage {
    envelope: Arc<Envelope>,
    inner: Arc<Mutex<Inner>>,
}

#[async_trait]
impl BusMessage for FakeMessage {
    fn subject(&self) -> &str {
        &self.envelope.subject
    }

    fn payload(&self) -> &[u8] {
        &self.envelope.payload
    }

    fn num_delivered(&self) -> u32 {
        self.envelope.delivered.load(Ordering::SeqCst)
    }

    async fn ack(&self) -> Result<(), BusError> {
        self.inner.lock().unwrap().queue.retain(|e| !Arc::ptr_eq(e, &self.envelope));
        Ok(())
    }

    async fn nak(&self, _delay: Duration) -> Result<(), BusError> {
        // Test bus redelivers immediately; real backoff timing is covered
        // by `bus::backoff_delay` unit tests instead.
        self.envelope.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn in_progress(&self) -> Result<(), BusError> {
        Ok(())
    }
}

#[async_trait]
impl MessageBus for FakeBus {
    async fn publish(&self, subject: &str, message_id: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.seen_message_ids.contains_key(message_id) {
            return Ok(()); // duplicate within the dedup window: silently dropped.
        }
        inner.seen_message_ids.insert(message_id.to_string(), ());
        inner.queue.push(Arc::new(Envelope {
            subject: subject.to_string(),
            payload,
            delivered: AtomicU32::new(1),
        }));
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn consume(
        &self,
        subjects: Vec<String>,
        _durable: &str,
        cancel: CancellationToken,
        on_message: Arc<dyn Fn(Box<dyn BusMessage>) -> HandlerFuture + Send + Sync>,
    ) -> Result<(), BusError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let next = {
                let inner = self.inner.lock().unwrap();
                inner.queue.iter().find(|e| subjects.iter().any(|s| s == &e.subject)).cloned()
            };

            let Some(envelope) = next else {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = self.notify.notified() => continue,
                    _ = tokio::time::sleep(Duration::from_millis(20)) => continue,
                }
            };

            let handle: Box<dyn BusMessage> = Box::new(FakeMessage {
                envelope,
                inner: self.inner.clone(),
            });

            on_message(handle).await.ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn publish_then_consume_delivers_once() {
        let bus = FakeBus::new();
        bus.publish("catalog.create", "msg-1", b"payload".to_vec()).await.unwrap();

        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered2 = delivered.clone();
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();

        let handler: Arc<dyn Fn(Box<dyn BusMessage>) -> HandlerFuture + Send + Sync> = Arc::new(move |msg| {
            let delivered = delivered2.clone();
            let cancel = cancel2.clone();
            Box::pin(async move {
                delivered.fetch_add(1, Ordering::SeqCst);
                msg.ack().await.ok();
                cancel.cancel();
                Ok(())
            })
        });

        bus.consume(vec!["catalog.create".to_string()], "durable", cancel.clone(), handler)
            .await
            .unwrap();

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(bus.published_count("catalog.create"), 0);
    }

    #[tokio::test]
    async fn duplicate_message_id_within_window_is_dropped() {
        let bus = FakeBus::new();
        bus.publish("catalog.create", "same-id", b"a".to_vec()).await.unwrap();
        bus.publish("catalog.create", "same-id", b"b".to_vec()).await.unwrap();
        assert_eq!(bus.published_count("catalog.create"), 1);
    }
}

//! JetStream-backed `MessageBus`. One durable
//! work-queue stream carrying the three subjects of
//! (`catalog.create`, `sbom.generate`, `sbom.scan`).

use crate::bus::{BusMessage, HandlerFuture, MessageBus};
use crate::errors::BusError;
use async_nats::jetstream::{self, consumer::pull::Config as PullConfig, stream::Config as StreamConfig};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct NatsBus {
    jetstream: jetstream::Context,
    stream_name: String,
    dedup_window: Duration,
    ack_wait: Duration,
}

impl NatsBus {
    pub async fn connect(
        nats_url: &str,
        stream_name: &str,
        subjects: Vec<String>,
        dedup_window: Duration,
        ack_wait: Duration,
    ) -> Result<Self, BusError> {
        let client = async_nats::connect(nats_url).await.map_err(|e| BusError::Nats(e.to_string()))?;
        let jetstream = jetstream::new(client);
        jetstream
            .get_or_create_stream(StreamConfig {
                name: stream_name.to_string(),
                subjects,
                duplicate_window: dedup_window,
                retention: jetstream::stream::RetentionPolicy::WorkQueue,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Nats(e.to_string()))?;

        Ok(NatsBus {
            jetstream,
            stream_name: stream_name.to_string(),
            dedup_window,
            ack_wait,
        })
    }
}

struct NatsMessage {
    message: jetstream::Message,
    num_delivered: u32,
}

#[async_trait]
impl BusMessage for NatsMessage {
    fn subject(&self) -> &str {
        self.message.subject.as_str()
    }

    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn num_delivered(&self) -> u32 {
        self.num_delivered
    }

    async fn ack(&self) -> Result<(), BusError> {
        self.message.ack().await.map_err(|e| BusError::Nats(e.to_string()))
    }

    async fn nak(&self, delay: Duration) -> Result<(), BusError> {
        self.message
            .ack_with(jetstream::AckKind::Nak(Some(delay)))
            .await
            .map_err(|e| BusError::Nats(e.to_string()))
    }

    async fn in_progress(&self) -> Result<(), BusError> {
        self.message
            .ack_with(jetstream::AckKind::Progress)
            .await
            .map_err(|e| BusError::Nats(e.to_string()))
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(&self, subject: &str, message_id: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let ack = self
            .jetstream
            .publish_with_headers(subject.to_string(), {
                let mut headers = async_nats::HeaderMap::new();
                headers.insert("Nats-Msg-Id", message_id);
                headers
            }, payload.into())
            .await
            .map_err(|e| BusError::Nats(e.to_string()))?;
        // Wait for the server's publish ack so a duplicate within the
        // dedup window is reliably observed as dropped, not merely
        // fire-and-forgotten given the dedup window above.
        ack.await.map_err(|e| BusError::Nats(e.to_string()))?;
        Ok(())
    }

    async fn consume(
        &self,
        subjects: Vec<String>,
        durable: &str,
        cancel: CancellationToken,
        on_message: Arc<dyn Fn(Box<dyn BusMessage>) -> HandlerFuture + Send + Sync>,
    ) -> Result<(), BusError> {
        let stream = self
            .jetstream
            .get_stream(&self.stream_name)
            .await
            .map_err(|e| BusError::Nats(e.to_string()))?;

        let consumer = stream
            .get_or_create_consumer(
                durable,
                PullConfig {
                    durable_name: Some(durable.to_string()),
                    filter_subjects: subjects,
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait: self.ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::Nats(e.to_string()))?;

        let mut messages = consumer.messages().await.map_err(|e| BusError::Nats(e.to_string()))?;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = futures::StreamExt::next(&mut messages) => next,
            };

            let Some(message) = next else { return Ok(()) };
            let message = message.map_err(|e| BusError::Nats(e.to_string()))?;
            let num_delivered = message.info().map(|i| i.delivered as u32).unwrap_or(1);
            let handle: Box<dyn BusMessage> = Box::new(NatsMessage { message, num_delivered });

            let handler_cancel = cancel.clone();
            let fut = on_message(handle);
            tokio::select! {
                _ = handler_cancel.cancelled() => return Ok(()),
                _ = fut => {}
            }
        }
    }
}

/// `dedup_window` governs the stream-level dedup window.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(2 * 60 * 60);

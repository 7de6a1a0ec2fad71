//! Kafka producer side of the Blinkwatch pipeline.
//!
//! [`EventSink`] is the fire-and-forget publish capability; [`KafkaSink`]
//! implements it on top of an rdkafka `FutureProducer`. [`EventPublisher`]
//! owns the partitioning policy:
//!
//! - session lifecycle events are keyed by `user_id`, so one user's sessions
//!   stay in chronological order;
//! - frame and blink events are keyed by `session_id`, so each session's
//!   samples stay ordered regardless of other sessions' volume.
//!
//! Nothing is ordered across topics.

use crate::config::{KafkaConfig, TopicConfig};
use crate::events::{BlinkEvent, FrameEvent, SessionEvent};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, trace, warn};

/// Errors that can occur during message production
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Producer timeout after {0:?}")]
    Timeout(Duration),
}

/// Message to be sent to Kafka
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    /// Topic to send the message to
    pub topic: String,
    /// Partition key
    pub key: Option<String>,
    /// Serialized message payload
    pub payload: Vec<u8>,
    /// Optional headers
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    /// Create a new outgoing message with a JSON payload
    pub fn new_json<T: serde::Serialize>(
        topic: impl Into<String>,
        message: &T,
    ) -> Result<Self, ProducerError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| ProducerError::SerializationError(e.to_string()))?;
        Ok(Self {
            topic: topic.into(),
            key: None,
            payload,
            headers: Vec::new(),
        })
    }

    /// Set the message key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a header to the message
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Add a correlation ID header
    pub fn with_correlation_id(self, id: impl Into<String>) -> Self {
        self.with_header("correlation-id", id)
    }

    /// Add a message type header
    pub fn with_message_type(self, msg_type: impl Into<String>) -> Self {
        self.with_header("message-type", msg_type)
    }

    fn kafka_headers(&self) -> OwnedHeaders {
        self.headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_str()),
                })
            })
    }
}

/// Fire-and-forget publish capability.
///
/// `publish` hands the message to the client's buffer and returns; delivery is
/// at-least-once as furnished by the broker. Implementations must be safe to
/// call concurrently from many sessions.
pub trait EventSink: Send + Sync {
    fn publish(&self, message: OutgoingMessage) -> Result<(), ProducerError>;
}

/// rdkafka-backed event sink
pub struct KafkaSink {
    producer: FutureProducer,
}

impl KafkaSink {
    /// Create a new producer with the given configuration
    pub fn new(config: KafkaConfig) -> Result<Self, ProducerError> {
        info!("Creating Kafka producer for {}", config.bootstrap_servers);

        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| ProducerError::CreationError(e.to_string()))?;

        Ok(Self { producer })
    }

    /// Flush all pending messages
    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::Timeout(timeout))
    }
}

impl EventSink for KafkaSink {
    fn publish(&self, message: OutgoingMessage) -> Result<(), ProducerError> {
        let mut record = FutureRecord::to(&message.topic)
            .payload(&message.payload)
            .headers(message.kafka_headers());

        if let Some(ref k) = message.key {
            record = record.key(k);
        }

        let delivery = self
            .producer
            .send_result(record)
            .map_err(|(e, _)| ProducerError::SendError {
                topic: message.topic.clone(),
                message: e.to_string(),
            })?;

        trace!(topic = %message.topic, key = ?message.key, "Message enqueued");

        // Delivery reports are only logged; callers never wait on them.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let topic = message.topic;
            handle.spawn(async move {
                match delivery.await {
                    Ok(Ok((partition, offset))) => {
                        trace!(topic = %topic, partition, offset, "Message delivered");
                    }
                    Ok(Err((e, _))) => {
                        warn!(topic = %topic, error = %e, "Message delivery failed");
                    }
                    Err(_) => {
                        warn!(topic = %topic, "Delivery report lost, producer shut down");
                    }
                }
            });
        }

        Ok(())
    }
}

impl Drop for KafkaSink {
    fn drop(&mut self) {
        info!("Shutting down Kafka producer");
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!("Failed to flush producer on shutdown: {}", e);
        }
    }
}

/// Serialises pipeline events and routes them with the right partition keys.
///
/// Cheap to clone; all clones share one sink.
#[derive(Clone)]
pub struct EventPublisher {
    sink: Arc<dyn EventSink>,
    topics: TopicConfig,
}

impl EventPublisher {
    pub fn new(sink: Arc<dyn EventSink>, topics: TopicConfig) -> Self {
        Self { sink, topics }
    }

    /// Raw publish: `topic`, `partition_key`, JSON `payload`
    pub fn publish<T: serde::Serialize>(
        &self,
        topic: &str,
        partition_key: impl Into<String>,
        payload: &T,
    ) -> Result<(), ProducerError> {
        let message = OutgoingMessage::new_json(topic, payload)?.with_key(partition_key);
        self.sink.publish(message)
    }

    /// Publish a lifecycle event, keyed by user
    pub fn publish_session(&self, event: &SessionEvent) -> Result<(), ProducerError> {
        let message = OutgoingMessage::new_json(&self.topics.sessions, event)?
            .with_key(&event.user_id)
            .with_message_type("session_event")
            .with_correlation_id(event.session_id.to_string());
        self.sink.publish(message)
    }

    /// Publish a frame sample, keyed by session
    pub fn publish_frame(&self, event: &FrameEvent) -> Result<(), ProducerError> {
        let message = OutgoingMessage::new_json(&self.topics.frames, event)?
            .with_key(event.session_id.partition_key())
            .with_message_type("frame_data");
        self.sink.publish(message)
    }

    /// Publish a completed blink, keyed by session
    pub fn publish_blink(&self, event: &BlinkEvent) -> Result<(), ProducerError> {
        let message = OutgoingMessage::new_json(&self.topics.blinks, event)?
            .with_key(event.session_id.partition_key())
            .with_message_type("blink_event");
        self.sink.publish(message)
    }
}

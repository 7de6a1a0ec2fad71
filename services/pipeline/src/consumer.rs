//! Kafka consumer wrapper used by the storage consumers.
//!
//! A [`TopicConsumer`] reads one topic as part of a consumer group and hands
//! out owned [`IncomingMessage`]s. Offsets are committed explicitly, one
//! message at a time, once the caller is done with it.

use crate::config::KafkaConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message as KafkaMessage};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur during message consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Failed to commit offset: {0}")]
    CommitError(String),

    #[error("Consumer poll error: {0}")]
    PollError(String),
}

/// Metadata about a received message
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    /// Topic the message was received from
    pub topic: String,
    /// Partition the message was received from
    pub partition: i32,
    /// Offset of the message in the partition
    pub offset: i64,
    /// Message key (if present)
    pub key: Option<Vec<u8>>,
    /// Broker timestamp in milliseconds
    pub timestamp: Option<i64>,
    /// Message headers
    pub headers: HashMap<String, String>,
}

/// A received message with payload and metadata
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Raw message payload
    pub payload: Vec<u8>,
    /// Message metadata
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    /// Get a header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata.headers.get(key).map(|s| s.as_str())
    }

    /// Get the correlation ID header
    pub fn correlation_id(&self) -> Option<&str> {
        self.header("correlation-id")
    }
}

/// Consumer for a single topic with explicit, per-message offset commits
pub struct TopicConsumer {
    consumer: StreamConsumer,
    group_id: String,
    topic: Option<String>,
}

impl TopicConsumer {
    /// Create a new consumer with the given configuration
    pub fn new(config: KafkaConfig) -> Result<Self, ConsumerError> {
        info!(
            servers = %config.bootstrap_servers,
            group = %config.consumer.group_id,
            "Creating Kafka consumer"
        );

        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        Ok(Self {
            consumer,
            group_id: config.consumer.group_id,
            topic: None,
        })
    }

    /// Subscribe to `topic`, replacing any previous subscription
    pub fn subscribe(&mut self, topic: &str) -> Result<(), ConsumerError> {
        info!(topic, group = %self.group_id, "Subscribing");
        self.consumer
            .subscribe(&[topic])
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))?;
        self.topic = Some(topic.to_string());
        Ok(())
    }

    /// Wait for the next message
    pub async fn recv(&self) -> Result<IncomingMessage, ConsumerError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| ConsumerError::PollError(e.to_string()))?;

        let incoming = convert_message(&message);
        debug!(
            topic = %incoming.metadata.topic,
            partition = incoming.metadata.partition,
            offset = incoming.metadata.offset,
            "Received message"
        );
        Ok(incoming)
    }

    /// Commit the position just past `metadata` without waiting for the broker
    pub fn commit(&self, metadata: &MessageMetadata) -> Result<(), ConsumerError> {
        let mut partitions = TopicPartitionList::new();
        partitions
            .add_partition_offset(
                &metadata.topic,
                metadata.partition,
                Offset::Offset(metadata.offset + 1),
            )
            .map_err(|e| ConsumerError::CommitError(e.to_string()))?;

        self.consumer
            .commit(&partitions, CommitMode::Async)
            .map_err(|e| ConsumerError::CommitError(e.to_string()))
    }

    /// Leave the group and drop the subscription
    pub fn close(&mut self) -> Result<(), ConsumerError> {
        if let Some(topic) = self.topic.take() {
            info!(topic = %topic, "Unsubscribing");
            self.consumer.unsubscribe();
        } else {
            warn!("Closing a consumer that was never subscribed");
        }
        Ok(())
    }
}

/// Convert a borrowed Kafka message to our IncomingMessage type
fn convert_message<M: KafkaMessage>(msg: &M) -> IncomingMessage {
    let payload = msg.payload().unwrap_or(&[]).to_vec();
    let key = msg.key().map(|k| k.to_vec());

    let mut headers = HashMap::new();
    if let Some(h) = msg.headers() {
        for header in h.iter() {
            if let Some(value) = header.value {
                if let Ok(v) = String::from_utf8(value.to_vec()) {
                    headers.insert(header.key.to_string(), v);
                }
            }
        }
    }

    IncomingMessage {
        payload,
        metadata: MessageMetadata {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            timestamp: msg.timestamp().to_millis(),
            headers,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(headers: HashMap<String, String>) -> IncomingMessage {
        IncomingMessage {
            payload: b"{}".to_vec(),
            metadata: MessageMetadata {
                topic: "session_events".to_string(),
                partition: 0,
                offset: 100,
                key: Some(b"user-1".to_vec()),
                timestamp: Some(1234567890),
                headers,
            },
        }
    }

    #[test]
    fn test_incoming_message_headers() {
        let mut headers = HashMap::new();
        headers.insert("correlation-id".to_string(), "42".to_string());
        headers.insert("message-type".to_string(), "session_event".to_string());

        let message = message(headers);

        assert_eq!(message.correlation_id(), Some("42"));
        assert_eq!(message.header("message-type"), Some("session_event"));
        assert_eq!(message.header("missing"), None);
    }

    #[test]
    fn test_correlation_id_is_optional() {
        assert_eq!(message(HashMap::new()).correlation_id(), None);
    }
}

use super::to_datetime;
use crate::driver::EventHandler;
use crate::fields::{self, ValidationError};
use crate::store::{EventStore, FrameRecord, StoreError};
use async_trait::async_trait;
use blinkwatch_pipeline::IncomingMessage;
use tracing::trace;

/// Persists every EAR sample as one row.
///
/// There is no deduplication; a redelivered message becomes a second row.
pub struct FrameConsumer {
    topic: String,
}

impl FrameConsumer {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl EventHandler for FrameConsumer {
    type Event = FrameRecord;

    fn name(&self) -> &'static str {
        "frame"
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn validate(&self, message: &IncomingMessage) -> Result<FrameRecord, ValidationError> {
        let object = fields::parse_object(&message.payload)?;

        Ok(FrameRecord {
            session_id: fields::session_id(&object)?,
            timestamp: to_datetime(fields::timestamp(&object, "timestamp")?, "timestamp")?,
            ear_value: fields::finite_number(&object, "ear_value")?,
        })
    }

    async fn persist(
        &mut self,
        frame: FrameRecord,
        store: &mut dyn EventStore,
    ) -> Result<(), StoreError> {
        store.insert_frame(&frame).await?;
        trace!(session_id = %frame.session_id, ear = frame.ear_value, "Frame stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::message;
    use blinkwatch_pipeline::SessionId;
    use serde_json::json;

    fn validate(payload: serde_json::Value) -> Result<FrameRecord, ValidationError> {
        FrameConsumer::new("frame_data").validate(&message("frame_data", 0, payload))
    }

    #[test]
    fn test_accepts_producer_payload() {
        let frame =
            validate(json!({"session_id": 42, "timestamp": 1700000000.5, "ear_value": 0.27}))
                .unwrap();
        assert_eq!(frame.session_id, SessionId::new(42));
        assert_eq!(frame.timestamp.timestamp_millis(), 1_700_000_000_500);
        assert_eq!(frame.ear_value, 0.27);
    }

    #[test]
    fn test_accepts_iso_timestamp_and_string_id() {
        let frame = validate(json!({
            "session_id": "42",
            "timestamp": "2024-03-01T12:00:00Z",
            "ear_value": -1.0,
        }))
        .unwrap();
        assert_eq!(frame.session_id, SessionId::new(42));
        assert_eq!(frame.timestamp.to_rfc3339(), "2024-03-01T12:00:00+00:00");
    }

    #[test]
    fn test_rejects_missing_or_malformed_fields() {
        assert_eq!(
            validate(json!({"timestamp": 1.0, "ear_value": 0.3})).unwrap_err(),
            ValidationError::MissingField("session_id")
        );
        assert_eq!(
            validate(json!({"session_id": 1, "ear_value": 0.3})).unwrap_err(),
            ValidationError::MissingField("timestamp")
        );
        assert!(validate(json!({"session_id": 1, "timestamp": 1.0, "ear_value": "open"})).is_err());
        assert!(validate(json!({"session_id": 1, "timestamp": 1.0, "ear_value": null})).is_err());
    }
}

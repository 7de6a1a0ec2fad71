//! In-memory doubles shared by the unit tests.

use crate::producer::{EventSink, OutgoingMessage, ProducerError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Records every published message in publish order.
#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<OutgoingMessage>>,
    failing: AtomicBool,
}

impl RecordingSink {
    /// A sink that rejects every publish
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.set_failing(true);
        sink
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<OutgoingMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn on_topic(&self, topic: &str) -> Vec<serde_json::Value> {
        self.messages()
            .into_iter()
            .filter(|m| m.topic == topic)
            .map(|m| serde_json::from_slice(&m.payload).unwrap())
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, message: OutgoingMessage) -> Result<(), ProducerError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProducerError::SendError {
                topic: message.topic,
                message: "broker unavailable".to_string(),
            });
        }
        self.messages.lock().unwrap().push(message);
        Ok(())
    }
}

//! Blinkwatch Pipeline - blink detection and Kafka event publishing
//!
//! This library turns a per-frame eye-aspect-ratio (EAR) signal into blink
//! events and publishes the resulting session, frame and blink events to
//! Kafka:
//!
//! - `session_events`: session lifecycle, keyed by user
//! - `frame_data`: one EAR sample per frame, keyed by session
//! - `blink_event`: completed blinks, keyed by session
//!
//! # Example
//!
//! ```rust,no_run
//! use blinkwatch_pipeline::{EventPublisher, KafkaSink, PipelineConfig, SessionController};
//! use std::sync::Arc;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::load()?;
//!     let sink = Arc::new(KafkaSink::new(config.kafka.clone())?);
//!     let publisher = EventPublisher::new(sink, config.kafka.topics.clone());
//!
//!     let mut session = SessionController::new(publisher, config.blink);
//!     session.start("user-1")?;
//!     session.on_frame(1_700_000_000.0, Some(0.31))?;
//!     Ok(())
//! }
//! ```

pub mod blink;
pub mod config;
pub mod consumer;
pub mod ear;
pub mod events;
pub mod producer;
pub mod session;

#[cfg(test)]
mod testing;

// Re-export main types
pub use blink::{BlinkConfig, BlinkStateMachine, BlinkUpdate, CompletedBlink};
pub use config::{
    ConfigError, ConsumerConfig, KafkaConfig, LoggingConfig, PipelineConfig, ProducerConfig,
    ReliabilityConfig, SaslConfig, SaslMechanism, SecurityProtocol, SslConfig, TopicConfig,
};
pub use consumer::{ConsumerError, IncomingMessage, MessageMetadata, TopicConsumer};
pub use ear::{face_ear, EyeLandmarks, FaceLandmarks, LandmarkProvider, Point};
pub use events::{
    AckStatus, Acknowledgement, BlinkEvent, FrameEvent, InboundSignal, SessionEvent, SessionId,
    SessionStatus, NO_FACE_EAR,
};
pub use producer::{EventPublisher, EventSink, KafkaSink, OutgoingMessage, ProducerError};
pub use session::{SessionController, SessionError};

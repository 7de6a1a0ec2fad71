//! Blinkwatch Storage Consumers
//!
//! Long-running consumers that move Blinkwatch events from Kafka into
//! PostgreSQL. Each process runs one variant against one topic:
//!
//! - **frame**: one row per EAR sample (`frame_data`)
//! - **blink**: one row per blink, with the interval recomputed per session
//!   (`blink_event`)
//! - **session**: session rows upserted on `active` and closed on a terminal
//!   status (`session_events`)
//!
//! ## Architecture
//!
//! ```text
//! Kafka topic            ConsumerLoop                     PostgreSQL
//! ┌──────────────┐      ┌───────────────────────┐        ┌──────────────────┐
//! │ frame_data   │      │ next message          │        │ operation.       │
//! │ blink_event  │─────▶│ validate ──▶ persist  │───────▶│   frame_data     │
//! │ session_     │      │ commit offset         │        │   blink_events   │
//! │   events     │      └───────────────────────┘        │   sessions       │
//! └──────────────┘                                       └──────────────────┘
//! ```
//!
//! Throughput scales by running more processes in the same consumer group,
//! never by processing in parallel within one.

pub mod config;
pub mod consumers;
pub mod driver;
pub mod fields;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::{Config, ConsumerKind};
pub use consumers::{BlinkConsumer, FrameConsumer, SessionConsumer};
pub use driver::{ConsumerLoop, ConsumerLoopError, EventHandler, LoopStats, MessageSource};
pub use fields::{EventTime, ValidationError};
pub use store::{EventStore, PgEventStore, StoreError};

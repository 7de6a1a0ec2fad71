//! The three consumer variants, one per topic.

mod blink;
mod frame;
mod session;

pub use blink::{BlinkConsumer, BlinkObservation};
pub use frame::FrameConsumer;
pub use session::{SessionConsumer, SessionUpdate};

use crate::fields::{EventTime, ValidationError};
use chrono::{DateTime, Utc};

fn to_datetime(time: EventTime, field: &'static str) -> Result<DateTime<Utc>, ValidationError> {
    time.to_datetime().ok_or_else(|| ValidationError::InvalidField {
        field,
        reason: "timestamp out of range".to_string(),
    })
}

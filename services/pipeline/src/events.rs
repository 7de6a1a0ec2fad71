//! Wire payloads exchanged over the broker and with the signal transport.
//!
//! All broker payloads are JSON objects. Field names are part of the contract
//! shared with the storage consumers:
//!
//! - `session_events`: [`SessionEvent`]
//! - `frame_data`: [`FrameEvent`]
//! - `blink_event`: [`BlinkEvent`]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// EAR value published for frames in which no face was detected.
pub const NO_FACE_EAR: f64 = -1.0;

/// Identifier of one monitoring session.
///
/// Serialised as a plain JSON integer. Generated values are 63 bits drawn from
/// a random v4 UUID, so collisions are improbable but not impossible; the
/// session consumer refuses to merge two sessions that collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(i64);

impl SessionId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Generate a fresh, strictly positive session id
    pub fn generate() -> Self {
        loop {
            let bits = Uuid::new_v4().as_u128() as u64 & (i64::MAX as u64);
            if bits != 0 {
                return Self(bits as i64);
            }
        }
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Partition key used for per-session ordering
    pub fn partition_key(&self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for SessionId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Complete,
    Interrupted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Complete => "complete",
            SessionStatus::Interrupted => "interrupted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Active)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "complete" => Ok(SessionStatus::Complete),
            "interrupted" => Ok(SessionStatus::Interrupted),
            other => Err(format!("unknown session status '{}'", other)),
        }
    }
}

/// Session lifecycle event, keyed by `user_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: SessionId,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
}

/// One EAR sample, keyed by `session_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameEvent {
    pub session_id: SessionId,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
    /// EAR, or [`NO_FACE_EAR`] when no face or no usable reading was detected
    pub ear_value: f64,
}

impl FrameEvent {
    pub fn new(session_id: SessionId, timestamp: f64, ear: Option<f64>) -> Self {
        let ear_value = match ear {
            Some(value) if value.is_finite() && value > 0.0 => value,
            _ => NO_FACE_EAR,
        };
        Self {
            session_id,
            timestamp,
            ear_value,
        }
    }

    pub fn has_face(&self) -> bool {
        self.ear_value != NO_FACE_EAR
    }
}

/// A completed blink, keyed by `session_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlinkEvent {
    pub session_id: SessionId,
    pub start_timestamp: f64,
    pub end_timestamp: f64,
    /// `end_timestamp - start_timestamp`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// Seconds since the previous blink of the same session ended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<f64>,
}

/// One per-frame message from the signal transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundSignal {
    pub timestamp: f64,
    #[serde(default)]
    pub ear_value: Option<f64>,
    /// Client-side hint that a closure started on this frame
    #[serde(default)]
    pub event_onset: Option<bool>,
    /// Client-side hint that a blink completed on this frame
    #[serde(default)]
    pub event_end: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Received,
}

/// Acknowledgement returned to the transport for every inbound signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub status: AckStatus,
    pub timestamp: f64,
}

impl Acknowledgement {
    pub fn received(timestamp: f64) -> Self {
        Self {
            status: AckStatus::Received,
            timestamp,
        }
    }
}

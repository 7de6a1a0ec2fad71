use super::to_datetime;
use crate::driver::EventHandler;
use crate::fields::{self, ValidationError};
use crate::store::{BlinkRecord, EventStore, StoreError};
use async_trait::async_trait;
use blinkwatch_pipeline::{IncomingMessage, SessionId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Allowed disagreement between our interval and the producer's, in seconds
const INTERVAL_TOLERANCE: f64 = 1e-6;

const DEFAULT_IDLE_HORIZON: Duration = Duration::from_secs(3600);

/// A validated blink, before the interval is known
#[derive(Debug, Clone, PartialEq)]
pub struct BlinkObservation {
    pub session_id: SessionId,
    /// Epoch seconds
    pub start: f64,
    /// Epoch seconds
    pub end: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Interval the producer computed, if it sent one
    pub reported_interval: Option<f64>,
}

impl BlinkObservation {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Persists blinks and recomputes each one's interval from the previous
/// blink of the same session.
///
/// The last end time per session is process-local bookkeeping. After a
/// restart the first blink of each session is stored without an interval.
/// Sessions whose last blink ended more than the idle horizon before the
/// newest blink seen are forgotten, measured in event time.
pub struct BlinkConsumer {
    topic: String,
    last_end: HashMap<SessionId, f64>,
    idle_horizon: f64,
    newest_end: f64,
    last_sweep: f64,
}

impl BlinkConsumer {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            last_end: HashMap::new(),
            idle_horizon: DEFAULT_IDLE_HORIZON.as_secs_f64(),
            newest_end: f64::NEG_INFINITY,
            last_sweep: f64::NEG_INFINITY,
        }
    }

    pub fn with_idle_horizon(mut self, horizon: Duration) -> Self {
        self.idle_horizon = horizon.as_secs_f64();
        self
    }

    /// Sessions whose last blink end is still remembered
    pub fn tracked_sessions(&self) -> usize {
        self.last_end.len()
    }

    fn remember(&mut self, session_id: SessionId, end: f64) {
        let last = self.last_end.entry(session_id).or_insert(end);
        *last = last.max(end);

        self.newest_end = self.newest_end.max(end);
        // Sweep at most once per horizon of event time
        if self.newest_end - self.last_sweep >= self.idle_horizon {
            self.evict_idle();
        }
    }

    fn evict_idle(&mut self) {
        let cutoff = self.newest_end - self.idle_horizon;
        let before = self.last_end.len();
        self.last_end.retain(|_, end| *end >= cutoff);
        self.last_sweep = self.newest_end;

        let evicted = before - self.last_end.len();
        if evicted > 0 {
            debug!(evicted, tracked = self.last_end.len(), "Forgot idle sessions");
        }
    }

    /// Seconds between the previous blink's end and `blink`'s start.
    ///
    /// Overlapping or redelivered blinks would give a negative interval; those
    /// are stored without one.
    fn interval_for(&self, blink: &BlinkObservation) -> Option<f64> {
        let previous_end = *self.last_end.get(&blink.session_id)?;
        let interval = blink.start - previous_end;
        if interval < 0.0 {
            warn!(
                session_id = %blink.session_id,
                start = blink.start,
                previous_end,
                "Blink starts before the previous one ended, storing without interval"
            );
            return None;
        }
        Some(interval)
    }
}

#[async_trait]
impl EventHandler for BlinkConsumer {
    type Event = BlinkObservation;

    fn name(&self) -> &'static str {
        "blink"
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn validate(&self, message: &IncomingMessage) -> Result<BlinkObservation, ValidationError> {
        let object = fields::parse_object(&message.payload)?;

        let session_id = fields::session_id(&object)?;
        let start = fields::timestamp(&object, "start_timestamp")?;
        let end = fields::timestamp(&object, "end_timestamp")?;

        let (start_secs, end_secs) = (start.as_epoch_seconds(), end.as_epoch_seconds());
        if end_secs < start_secs {
            return Err(ValidationError::NegativeDuration {
                start: start_secs,
                end: end_secs,
            });
        }

        Ok(BlinkObservation {
            session_id,
            start: start_secs,
            end: end_secs,
            start_time: to_datetime(start, "start_timestamp")?,
            end_time: to_datetime(end, "end_timestamp")?,
            // Only used for the cross-check, so a bad value is ignored
            reported_interval: fields::optional_number(&object, "interval").ok().flatten(),
        })
    }

    async fn persist(
        &mut self,
        blink: BlinkObservation,
        store: &mut dyn EventStore,
    ) -> Result<(), StoreError> {
        let interval = self.interval_for(&blink);

        if let (Some(ours), Some(theirs)) = (interval, blink.reported_interval) {
            if (ours - theirs).abs() > INTERVAL_TOLERANCE {
                warn!(
                    session_id = %blink.session_id,
                    computed = ours,
                    reported = theirs,
                    "Producer interval disagrees with consumer interval"
                );
            }
        }

        store
            .insert_blink(&BlinkRecord {
                session_id: blink.session_id,
                start_time: blink.start_time,
                end_time: blink.end_time,
                duration: blink.duration(),
                interval,
            })
            .await?;

        self.remember(blink.session_id, blink.end);

        debug!(
            session_id = %blink.session_id,
            duration = blink.duration(),
            interval = ?interval,
            "Blink stored"
        );
        Ok(())
    }
}

//! Lifecycle of one monitoring session.
//!
//! A [`SessionController`] binds a user to a fresh [`SessionId`], feeds every
//! frame's EAR through its own [`BlinkStateMachine`] and publishes the
//! resulting frame and blink events. The session ends exactly once, either
//! `complete` (the signal stream closed normally) or `interrupted` (anything
//! failed). After that, no further events are accepted.

use crate::blink::{BlinkConfig, BlinkStateMachine, BlinkUpdate};
use crate::events::{
    Acknowledgement, BlinkEvent, FrameEvent, InboundSignal, SessionEvent, SessionId, SessionStatus,
};
use crate::producer::{EventPublisher, ProducerError};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use std::fmt::Display;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session {0} is already running")]
    AlreadyStarted(SessionId),

    #[error("Session has not been started")]
    NotStarted,

    #[error("Session {session_id} already ended with status {status}")]
    Ended {
        session_id: SessionId,
        status: SessionStatus,
    },

    #[error("{0} is not a terminal status")]
    NotTerminal(SessionStatus),

    #[error("Failed to publish session event: {0}")]
    Publish(#[from] ProducerError),

    #[error("Signal transport failed: {0}")]
    Transport(String),
}

#[derive(Debug, Clone)]
struct SessionInfo {
    id: SessionId,
    user_id: String,
    start_time: DateTime<Utc>,
}

#[derive(Debug)]
enum Lifecycle {
    Idle,
    Active(SessionInfo),
    Ended(SessionInfo, SessionStatus),
}

pub struct SessionController {
    publisher: EventPublisher,
    detector: BlinkStateMachine,
    lifecycle: Lifecycle,
    last_blink_end: Option<f64>,
}

impl SessionController {
    pub fn new(publisher: EventPublisher, blink: BlinkConfig) -> Self {
        Self {
            publisher,
            detector: BlinkStateMachine::new(blink),
            lifecycle: Lifecycle::Idle,
            last_blink_end: None,
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        match &self.lifecycle {
            Lifecycle::Idle => None,
            Lifecycle::Active(info) | Lifecycle::Ended(info, _) => Some(info.id),
        }
    }

    /// `None` before `start`
    pub fn status(&self) -> Option<SessionStatus> {
        match &self.lifecycle {
            Lifecycle::Idle => None,
            Lifecycle::Active(_) => Some(SessionStatus::Active),
            Lifecycle::Ended(_, status) => Some(*status),
        }
    }

    pub fn blink_count(&self) -> u64 {
        self.detector.blink_count()
    }

    /// Open a session for `user_id` and announce it as `active`.
    ///
    /// If the announcement cannot be published the controller stays idle.
    #[instrument(skip(self, user_id))]
    pub fn start(&mut self, user_id: impl Into<String>) -> Result<SessionId, SessionError> {
        match &self.lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Active(info) => return Err(SessionError::AlreadyStarted(info.id)),
            Lifecycle::Ended(info, status) => {
                return Err(SessionError::Ended {
                    session_id: info.id,
                    status: *status,
                })
            }
        }

        let info = SessionInfo {
            id: SessionId::generate(),
            user_id: user_id.into(),
            start_time: Utc::now(),
        };

        self.publisher.publish_session(&SessionEvent {
            session_id: info.id,
            user_id: info.user_id.clone(),
            start_time: info.start_time,
            end_time: None,
            status: SessionStatus::Active,
        })?;

        info!(session_id = %info.id, user_id = %info.user_id, "Session started");
        let id = info.id;
        self.lifecycle = Lifecycle::Active(info);
        Ok(id)
    }

    /// Process one frame: publish the sample and, if it completes a blink,
    /// the blink with its interval since the previous one.
    pub fn on_frame(
        &mut self,
        timestamp: f64,
        ear: Option<f64>,
    ) -> Result<BlinkUpdate, SessionError> {
        let session_id = self.active_info()?.id;

        let update = self.detector.process(timestamp, ear);
        self.publisher
            .publish_frame(&FrameEvent::new(session_id, timestamp, ear))?;

        if let Some(blink) = update.completed {
            let interval = self.last_blink_end.map(|previous_end| blink.start - previous_end);
            self.last_blink_end = Some(blink.end);

            self.publisher.publish_blink(&BlinkEvent {
                session_id,
                start_timestamp: blink.start,
                end_timestamp: blink.end,
                duration: Some(blink.duration()),
                interval,
            })?;

            debug!(
                session_id = %session_id,
                duration = blink.duration(),
                interval = ?interval,
                count = update.blink_count,
                "Blink published"
            );
        }

        Ok(update)
    }

    /// Handle one inbound transport message and build its acknowledgement.
    ///
    /// Client-side onset/end hints are compared with the server-side detector
    /// but never override it.
    pub fn handle_signal(
        &mut self,
        signal: &InboundSignal,
    ) -> Result<Acknowledgement, SessionError> {
        let update = self.on_frame(signal.timestamp, signal.ear_value)?;

        if let Some(hint) = signal.event_end {
            if hint != update.blink_completed() {
                debug!(
                    timestamp = signal.timestamp,
                    client = hint,
                    server = update.blink_completed(),
                    "Client blink-end hint disagrees with detector"
                );
            }
        }
        if let Some(hint) = signal.event_onset {
            if hint != update.closure_started {
                debug!(
                    timestamp = signal.timestamp,
                    client = hint,
                    server = update.closure_started,
                    "Client onset hint disagrees with detector"
                );
            }
        }

        Ok(Acknowledgement::received(signal.timestamp))
    }

    /// End the session with a terminal status.
    ///
    /// The controller stops accepting frames even if the terminal event
    /// cannot be published; the publish error is still returned.
    #[instrument(skip(self))]
    pub fn end(&mut self, status: SessionStatus) -> Result<(), SessionError> {
        if !status.is_terminal() {
            return Err(SessionError::NotTerminal(status));
        }

        let info = self.active_info()?.clone();
        self.lifecycle = Lifecycle::Ended(info.clone(), status);

        self.publisher.publish_session(&SessionEvent {
            session_id: info.id,
            user_id: info.user_id,
            start_time: info.start_time,
            end_time: Some(Utc::now()),
            status,
        })?;

        info!(
            session_id = %info.id,
            status = %status,
            blinks = self.detector.blink_count(),
            "Session ended"
        );
        Ok(())
    }

    /// Run the session against a stream of inbound signals.
    ///
    /// Every signal is acknowledged on `acks`. The session completes when the
    /// stream ends or the acknowledgement receiver goes away, and is
    /// interrupted on the first transport or publish error, which is then
    /// returned.
    pub async fn drive<S, E>(
        &mut self,
        signals: S,
        acks: mpsc::Sender<Acknowledgement>,
    ) -> Result<SessionStatus, SessionError>
    where
        S: Stream<Item = Result<InboundSignal, E>>,
        E: Display,
    {
        let session_id = self.active_info()?.id;
        futures::pin_mut!(signals);

        loop {
            let signal = match signals.next().await {
                Some(Ok(signal)) => signal,
                Some(Err(e)) => {
                    error!(session_id = %session_id, error = %e, "Signal transport failed");
                    self.interrupt();
                    return Err(SessionError::Transport(e.to_string()));
                }
                None => {
                    info!(session_id = %session_id, "Signal stream closed");
                    self.end(SessionStatus::Complete)?;
                    return Ok(SessionStatus::Complete);
                }
            };

            let ack = match self.handle_signal(&signal) {
                Ok(ack) => ack,
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "Failed to handle frame");
                    self.interrupt();
                    return Err(e);
                }
            };

            if acks.send(ack).await.is_err() {
                info!(session_id = %session_id, "Client went away");
                self.end(SessionStatus::Complete)?;
                return Ok(SessionStatus::Complete);
            }
        }
    }

    /// Best-effort `interrupted` transition; failures are only logged.
    pub fn interrupt(&mut self) {
        if !matches!(self.lifecycle, Lifecycle::Active(_)) {
            return;
        }
        if let Err(e) = self.end(SessionStatus::Interrupted) {
            error!(
                session_id = ?self.session_id(),
                error = %e,
                "Failed to publish interrupted status"
            );
        }
    }

    fn active_info(&self) -> Result<&SessionInfo, SessionError> {
        match &self.lifecycle {
            Lifecycle::Active(info) => Ok(info),
            Lifecycle::Idle => Err(SessionError::NotStarted),
            Lifecycle::Ended(info, status) => Err(SessionError::Ended {
                session_id: info.id,
                status: *status,
            }),
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Lifecycle::Active(info) = &self.lifecycle {
            warn!(session_id = %info.id, "Session dropped while active");
            self.interrupt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopicConfig;
    use crate::testing::RecordingSink;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn controller() -> (SessionController, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let publisher = EventPublisher::new(sink.clone(), TopicConfig::default());
        (SessionController::new(publisher, BlinkConfig::default()), sink)
    }

    fn signal(timestamp: f64, ear: f64) -> InboundSignal {
        InboundSignal {
            timestamp,
            ear_value: Some(ear),
            event_onset: None,
            event_end: None,
        }
    }

    /// Three closed frames starting at `start`, reopening at `start + 3`
    fn blink_at(session: &mut SessionController, start: f64) {
        for i in 0..3 {
            session.on_frame(start + i as f64, Some(0.2)).unwrap();
        }
        session.on_frame(start + 3.0, Some(0.35)).unwrap();
    }

    #[test]
    fn test_start_publishes_active_event_keyed_by_user() {
        let (mut session, sink) = controller();
        let id = session.start("user-1").unwrap();

        let messages = sink.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "session_events");
        assert_eq!(messages[0].key.as_deref(), Some("user-1"));

        let event: SessionEvent = serde_json::from_slice(&messages[0].payload).unwrap();
        assert_eq!(event.session_id, id);
        assert_eq!(event.status, SessionStatus::Active);
        assert_eq!(event.end_time, None);
        assert_eq!(session.status(), Some(SessionStatus::Active));
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let (mut session, _sink) = controller();
        let id = session.start("user-1").unwrap();
        assert!(matches!(
            session.start("user-1"),
            Err(SessionError::AlreadyStarted(existing)) if existing == id
        ));
    }

    #[test]
    fn test_failed_start_leaves_session_idle() {
        let sink = Arc::new(RecordingSink::failing());
        let publisher = EventPublisher::new(sink.clone(), TopicConfig::default());
        let mut session = SessionController::new(publisher, BlinkConfig::default());

        assert!(matches!(session.start("user-1"), Err(SessionError::Publish(_))));
        assert_eq!(session.status(), None);
        assert!(matches!(session.on_frame(1.0, Some(0.3)), Err(SessionError::NotStarted)));
    }

    #[test]
    fn test_frames_before_start_are_rejected() {
        let (mut session, sink) = controller();
        assert!(matches!(session.on_frame(1.0, Some(0.3)), Err(SessionError::NotStarted)));
        assert!(sink.messages().is_empty());
    }

    #[test]
    fn test_every_frame_is_published_including_no_face() {
        let (mut session, sink) = controller();
        let id = session.start("user-1").unwrap();
        session.on_frame(1.0, Some(0.33)).unwrap();
        session.on_frame(2.0, None).unwrap();

        let frames = sink.on_topic("frame_data");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["session_id"], id.as_i64());
        assert_eq!(frames[0]["ear_value"], 0.33);
        assert_eq!(frames[1]["ear_value"], -1.0);
    }

    #[test]
    fn test_blinks_carry_duration_and_interval() {
        let (mut session, sink) = controller();
        session.start("user-1").unwrap();

        blink_at(&mut session, 10.25);
        blink_at(&mut session, 20.5);

        let blinks = sink.on_topic("blink_event");
        assert_eq!(blinks.len(), 2);

        assert_eq!(blinks[0]["start_timestamp"], 10.25);
        assert_eq!(blinks[0]["end_timestamp"], 13.25);
        assert_eq!(blinks[0]["duration"], 3.0);
        assert!(blinks[0].get("interval").is_none());

        // start_2 - end_1 = 20.5 - 13.25
        assert_eq!(blinks[1]["interval"], 20.5 - 13.25);
        assert_eq!(session.blink_count(), 2);
    }

    #[test]
    fn test_end_publishes_terminal_event_and_closes_session() {
        let (mut session, sink) = controller();
        let id = session.start("user-1").unwrap();
        session.end(SessionStatus::Complete).unwrap();

        let events = sink.on_topic("session_events");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1]["status"], "complete");
        assert_eq!(events[1]["session_id"], id.as_i64());
        assert!(events[1]["end_time"].is_string());
        assert_eq!(events[0]["start_time"], events[1]["start_time"]);

        assert!(matches!(
            session.on_frame(5.0, Some(0.3)),
            Err(SessionError::Ended { status: SessionStatus::Complete, .. })
        ));
        assert!(session.end(SessionStatus::Interrupted).is_err());
        assert_eq!(sink.on_topic("session_events").len(), 2);
    }

    #[test]
    fn test_end_requires_terminal_status() {
        let (mut session, _sink) = controller();
        session.start("user-1").unwrap();
        assert!(matches!(
            session.end(SessionStatus::Active),
            Err(SessionError::NotTerminal(SessionStatus::Active))
        ));
        assert_eq!(session.status(), Some(SessionStatus::Active));
    }

    #[test]
    fn test_dropping_active_session_publishes_interrupted() {
        let (mut session, sink) = controller();
        session.start("user-1").unwrap();
        drop(session);

        let events = sink.on_topic("session_events");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1]["status"], "interrupted");
    }

    #[test]
    fn test_handle_signal_acknowledges() {
        let (mut session, _sink) = controller();
        session.start("user-1").unwrap();

        let mut hinted = signal(4.0, 0.2);
        hinted.event_onset = Some(true);
        let ack = session.handle_signal(&hinted).unwrap();
        assert_eq!(ack, Acknowledgement::received(4.0));
    }

    #[tokio::test]
    async fn test_drive_completes_when_stream_ends() {
        let (mut session, sink) = controller();
        session.start("user-1").unwrap();

        let signals = futures::stream::iter(
            [0.35, 0.2, 0.2, 0.2, 0.35]
                .iter()
                .enumerate()
                .map(|(i, ear)| Ok::<_, String>(signal(i as f64, *ear)))
                .collect::<Vec<_>>(),
        );
        let (tx, mut rx) = mpsc::channel(16);

        let status = session.drive(signals, tx).await.unwrap();
        assert_eq!(status, SessionStatus::Complete);

        let mut acks = Vec::new();
        while let Some(ack) = rx.recv().await {
            acks.push(ack);
        }
        assert_eq!(acks.len(), 5);
        assert_eq!(acks[4].timestamp, 4.0);

        assert_eq!(sink.on_topic("frame_data").len(), 5);
        assert_eq!(sink.on_topic("blink_event").len(), 1);
        let events = sink.on_topic("session_events");
        assert_eq!(events.last().unwrap()["status"], "complete");
    }

    #[tokio::test]
    async fn test_drive_interrupts_on_transport_error() {
        let (mut session, sink) = controller();
        session.start("user-1").unwrap();

        let signals = futures::stream::iter(vec![Ok(signal(1.0, 0.3)), Err("connection reset")]);
        let (tx, _rx) = mpsc::channel(16);

        let result = session.drive(signals, tx).await;
        assert!(matches!(result, Err(SessionError::Transport(_))));
        assert_eq!(session.status(), Some(SessionStatus::Interrupted));

        let events = sink.on_topic("session_events");
        assert_eq!(events.last().unwrap()["status"], "interrupted");
    }

    #[tokio::test]
    async fn test_drive_interrupts_on_publish_failure() {
        let (mut session, sink) = controller();
        session.start("user-1").unwrap();
        sink.set_failing(true);

        let signals = futures::stream::iter(vec![Ok::<_, String>(signal(1.0, 0.3))]);
        let (tx, _rx) = mpsc::channel(16);

        let result = session.drive(signals, tx).await;
        assert!(matches!(result, Err(SessionError::Publish(_))));
        // The terminal event could not be published either, but the session
        // no longer accepts frames.
        assert_eq!(session.status(), Some(SessionStatus::Interrupted));
        assert!(session.on_frame(2.0, Some(0.3)).is_err());
    }

    #[tokio::test]
    async fn test_drive_completes_when_client_goes_away() {
        let (mut session, sink) = controller();
        session.start("user-1").unwrap();

        let signals = futures::stream::iter(vec![Ok::<_, String>(signal(1.0, 0.3)); 3]);
        let (tx, rx) = mpsc::channel(16);
        drop(rx);

        let status = session.drive(signals, tx).await.unwrap();
        assert_eq!(status, SessionStatus::Complete);
        assert_eq!(sink.on_topic("frame_data").len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_sessions_keep_per_session_order() {
        let sink = Arc::new(RecordingSink::default());
        let publisher = EventPublisher::new(sink.clone(), TopicConfig::default());

        let handles: Vec<_> = (0..8)
            .map(|user| {
                let publisher = publisher.clone();
                tokio::spawn(async move {
                    let mut session = SessionController::new(publisher, BlinkConfig::default());
                    session.start(format!("user-{}", user)).unwrap();
                    for frame in 0..50 {
                        let ear = if frame % 5 < 3 { 0.2 } else { 0.35 };
                        session.on_frame(frame as f64, Some(ear)).unwrap();
                        tokio::task::yield_now().await;
                    }
                    session.end(SessionStatus::Complete).unwrap();
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        let mut per_session: HashMap<String, Vec<f64>> = HashMap::new();
        for message in sink.messages().iter().filter(|m| m.topic == "frame_data") {
            let payload: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();
            per_session
                .entry(message.key.clone().unwrap())
                .or_default()
                .push(payload["timestamp"].as_f64().unwrap());
        }

        assert_eq!(per_session.len(), 8);
        for timestamps in per_session.values() {
            assert_eq!(timestamps.len(), 50);
            assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
        }
        assert_eq!(sink.on_topic("session_events").len(), 16);
    }
}

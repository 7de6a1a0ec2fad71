//! In-memory doubles shared by the unit tests.

use crate::driver::MessageSource;
use crate::store::{BlinkRecord, EventStore, FrameRecord, SessionClose, SessionRecord, StoreError};
use async_trait::async_trait;
use blinkwatch_pipeline::{
    ConsumerError, IncomingMessage, MessageMetadata, SessionId, SessionStatus,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

pub fn message(topic: &str, offset: i64, payload: serde_json::Value) -> IncomingMessage {
    IncomingMessage {
        payload: serde_json::to_vec(&payload).unwrap(),
        metadata: MessageMetadata {
            topic: topic.to_string(),
            partition: 0,
            offset,
            key: None,
            timestamp: None,
            headers: HashMap::new(),
        },
    }
}

/// Order in which resources were released
#[derive(Clone, Default)]
pub struct CloseLog(Arc<Mutex<Vec<&'static str>>>);

impl CloseLog {
    fn push(&self, entry: &'static str) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().clone()
    }
}

/// Replays a fixed script, then idles until the loop is stopped
pub struct ScriptedSource {
    script: VecDeque<Result<IncomingMessage, ConsumerError>>,
    committed: Arc<Mutex<Vec<i64>>>,
    log: CloseLog,
    drained: Option<CancellationToken>,
    fail_close: bool,
}

impl ScriptedSource {
    pub fn new(script: Vec<Result<IncomingMessage, ConsumerError>>, log: CloseLog) -> Self {
        Self {
            script: script.into(),
            committed: Arc::default(),
            log,
            drained: None,
            fail_close: false,
        }
    }

    /// Cancel `token` once the script is exhausted
    pub fn cancel_when_drained(mut self, token: CancellationToken) -> Self {
        self.drained = Some(token);
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    /// Committed offsets, in commit order
    pub fn committed(&self) -> Arc<Mutex<Vec<i64>>> {
        self.committed.clone()
    }
}

#[async_trait]
impl MessageSource for ScriptedSource {
    async fn next_message(&mut self) -> Result<IncomingMessage, ConsumerError> {
        match self.script.pop_front() {
            Some(next) => next,
            None => {
                if let Some(token) = &self.drained {
                    token.cancel();
                }
                std::future::pending().await
            }
        }
    }

    fn commit(&mut self, metadata: &MessageMetadata) -> Result<(), ConsumerError> {
        self.committed.lock().unwrap().push(metadata.offset);
        Ok(())
    }

    fn close(&mut self) -> Result<(), ConsumerError> {
        if self.fail_close {
            return Err(ConsumerError::CommitError("broker went away".into()));
        }
        self.log.push("source");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionRow {
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
}

/// Store with the same upsert and close rules as the SQL statements
pub struct MemoryStore {
    frames: Arc<Mutex<Vec<FrameRecord>>>,
    blinks: Arc<Mutex<Vec<BlinkRecord>>>,
    sessions: Arc<Mutex<HashMap<SessionId, SessionRow>>>,
    log: CloseLog,
}

impl MemoryStore {
    pub fn new(log: CloseLog) -> Self {
        Self {
            frames: Arc::default(),
            blinks: Arc::default(),
            sessions: Arc::default(),
            log,
        }
    }

    pub fn frames(&self) -> Arc<Mutex<Vec<FrameRecord>>> {
        self.frames.clone()
    }

    pub fn blinks(&self) -> Arc<Mutex<Vec<BlinkRecord>>> {
        self.blinks.clone()
    }

    pub fn sessions(&self) -> Arc<Mutex<HashMap<SessionId, SessionRow>>> {
        self.sessions.clone()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_frame(&mut self, frame: &FrameRecord) -> Result<(), StoreError> {
        self.frames.lock().unwrap().push(frame.clone());
        Ok(())
    }

    async fn insert_blink(&mut self, blink: &BlinkRecord) -> Result<(), StoreError> {
        self.blinks.lock().unwrap().push(blink.clone());
        Ok(())
    }

    async fn upsert_session(
        &mut self,
        session: &SessionRecord,
    ) -> Result<SessionStatus, StoreError> {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get(&session.session_id) {
            Some(row)
                if row.user_id == session.user_id && row.start_time == session.start_time =>
            {
                Ok(row.status)
            }
            Some(_) => Err(StoreError::SessionCollision(session.session_id)),
            None => {
                sessions.insert(
                    session.session_id,
                    SessionRow {
                        user_id: session.user_id.clone(),
                        start_time: session.start_time,
                        end_time: None,
                        status: SessionStatus::Active,
                    },
                );
                Ok(SessionStatus::Active)
            }
        }
    }

    async fn close_session(&mut self, close: &SessionClose) -> Result<u64, StoreError> {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(&close.session_id) {
            Some(row) if row.status == SessionStatus::Active || row.status == close.status => {
                row.end_time = Some(close.end_time);
                row.status = close.status;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        self.log.push("store");
        Ok(())
    }
}

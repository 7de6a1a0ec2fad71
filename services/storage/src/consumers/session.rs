use super::to_datetime;
use crate::driver::EventHandler;
use crate::fields::{self, ValidationError};
use crate::store::{EventStore, SessionClose, SessionRecord, StoreError};
use async_trait::async_trait;
use blinkwatch_pipeline::{IncomingMessage, MessageMetadata, SessionId, SessionStatus};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// A validated session lifecycle event
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Open(SessionRecord),
    Close {
        close: SessionClose,
        user_id: Option<String>,
    },
}

/// Keeps the session table in step with the lifecycle events.
///
/// `active` upserts the row and terminal statuses update it. A terminal event
/// without `end_time` is closed at the broker timestamp, or now if the broker
/// gave none. The map of active sessions is a correlation cache only; the
/// table is authoritative.
pub struct SessionConsumer {
    topic: String,
    active: HashMap<SessionId, String>,
}

impl SessionConsumer {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            active: HashMap::new(),
        }
    }

    /// Sessions this process has seen open and not yet closed
    pub fn active_sessions(&self) -> usize {
        self.active.len()
    }

    fn report_active(&self) {
        metrics::gauge!("consumer.sessions.active").set(self.active.len() as f64);
    }

    async fn open(
        &mut self,
        session: SessionRecord,
        store: &mut dyn EventStore,
    ) -> Result<(), StoreError> {
        if let Some(cached) = self.active.get(&session.session_id) {
            if *cached != session.user_id {
                warn!(
                    session_id = %session.session_id,
                    cached_user = %cached,
                    user_id = %session.user_id,
                    "Active session reported for a different user"
                );
            }
        }

        match store.upsert_session(&session).await? {
            SessionStatus::Active => {
                info!(
                    session_id = %session.session_id,
                    user_id = %session.user_id,
                    "Session active"
                );
                self.active.insert(session.session_id, session.user_id);
            }
            status => {
                debug!(
                    session_id = %session.session_id,
                    status = %status,
                    "Ignoring active event for a closed session"
                );
                self.active.remove(&session.session_id);
            }
        }
        self.report_active();
        Ok(())
    }

    async fn close(
        &mut self,
        close: SessionClose,
        user_id: Option<String>,
        store: &mut dyn EventStore,
    ) -> Result<(), StoreError> {
        if let (Some(cached), Some(user_id)) = (self.active.get(&close.session_id), &user_id) {
            if cached != user_id {
                warn!(
                    session_id = %close.session_id,
                    cached_user = %cached,
                    user_id = %user_id,
                    "Terminal status reported for a different user"
                );
            }
        }

        let updated = store.close_session(&close).await?;
        if updated == 0 {
            warn!(
                session_id = %close.session_id,
                status = %close.status,
                "No open session matched terminal status"
            );
        } else {
            info!(session_id = %close.session_id, status = %close.status, "Session closed");
        }

        self.active.remove(&close.session_id);
        self.report_active();
        Ok(())
    }
}

/// Broker timestamp of `metadata`, or the current time without one
fn received_at(metadata: &MessageMetadata) -> DateTime<Utc> {
    metadata
        .timestamp
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
        .unwrap_or_else(Utc::now)
}

#[async_trait]
impl EventHandler for SessionConsumer {
    type Event = SessionUpdate;

    fn name(&self) -> &'static str {
        "session"
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn validate(&self, message: &IncomingMessage) -> Result<SessionUpdate, ValidationError> {
        let object = fields::parse_object(&message.payload)?;
        let session_id = fields::session_id(&object)?;

        if let Some(correlation) = message.correlation_id() {
            if correlation != session_id.to_string() {
                warn!(
                    session_id = %session_id,
                    correlation_id = correlation,
                    "Correlation header does not match payload session"
                );
            }
        }

        match fields::status(&object)? {
            SessionStatus::Active => Ok(SessionUpdate::Open(SessionRecord {
                session_id,
                user_id: fields::string(&object, "user_id")?,
                start_time: to_datetime(fields::timestamp(&object, "start_time")?, "start_time")?,
            })),
            status => {
                let end_time = match fields::optional_timestamp(&object, "end_time")? {
                    Some(end_time) => to_datetime(end_time, "end_time")?,
                    None => received_at(&message.metadata),
                };
                Ok(SessionUpdate::Close {
                    close: SessionClose {
                        session_id,
                        end_time,
                        status,
                    },
                    user_id: fields::string(&object, "user_id").ok(),
                })
            }
        }
    }

    async fn persist(
        &mut self,
        update: SessionUpdate,
        store: &mut dyn EventStore,
    ) -> Result<(), StoreError> {
        match update {
            SessionUpdate::Open(session) => self.open(session, store).await,
            SessionUpdate::Close { close, user_id } => self.close(close, user_id, store).await,
        }
    }
}

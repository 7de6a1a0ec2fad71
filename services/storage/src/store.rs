//! Persistence of frames, blinks and session rows.
//!
//! [`EventStore`] is what the consumers write through; [`PgEventStore`] is the
//! PostgreSQL implementation. Each consumer owns exactly one store, and the
//! store owns exactly one connection for its whole lifetime.

use crate::config::DatabaseConfig;
use async_trait::async_trait;
use blinkwatch_pipeline::{SessionId, SessionStatus};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgConnection;
use sqlx::Connection;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Session {0} already exists for a different user or start time")]
    SessionCollision(SessionId),
}

impl StoreError {
    /// Whether the consumer can keep going after this error.
    ///
    /// There is no reconnect, so a lost connection ends the consumer.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Connection(e.to_string()),
            other => StoreError::Query(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub ear_value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlinkRecord {
    pub session_id: SessionId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Seconds
    pub duration: f64,
    /// Seconds since the previous blink of the same session ended
    pub interval: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionClose {
    pub session_id: SessionId,
    pub end_time: DateTime<Utc>,
    pub status: SessionStatus,
}

/// Write operations the consumers need
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventStore: Send {
    async fn insert_frame(&mut self, frame: &FrameRecord) -> Result<(), StoreError>;

    async fn insert_blink(&mut self, blink: &BlinkRecord) -> Result<(), StoreError>;

    /// Insert an `active` session, or accept a redelivery of the same one.
    ///
    /// Returns the row's status afterwards, which stays terminal when the
    /// session was already closed. Fails with [`StoreError::SessionCollision`]
    /// if the id already belongs to a different user or start time.
    async fn upsert_session(
        &mut self,
        session: &SessionRecord,
    ) -> Result<SessionStatus, StoreError>;

    /// Apply a terminal status. Returns the number of rows updated, which is
    /// zero for unknown sessions and for sessions already closed with a
    /// different status.
    async fn close_session(&mut self, close: &SessionClose) -> Result<u64, StoreError>;

    /// Release the connection
    async fn close(&mut self) -> Result<(), StoreError>;
}

const INSERT_FRAME: &str = r#"
    INSERT INTO operation.frame_data (session_id, timestamp, ear_value)
    VALUES ($1, $2, $3)
"#;

const INSERT_BLINK: &str = r#"
    INSERT INTO operation.blink_events (session_id, start_time, end_time, duration, interval)
    VALUES ($1, $2, $3, $4, $5)
"#;

// The no-op update makes a redelivery return the existing row, while a
// colliding id (different user or start) returns nothing.
const UPSERT_SESSION: &str = r#"
    INSERT INTO operation.sessions (session_id, user_id, start_time, end_time, status)
    VALUES ($1, $2, $3, NULL, 'active')
    ON CONFLICT (session_id) DO UPDATE
        SET user_id = EXCLUDED.user_id
        WHERE sessions.user_id = EXCLUDED.user_id
          AND sessions.start_time IS NOT DISTINCT FROM EXCLUDED.start_time
    RETURNING status
"#;

const CLOSE_SESSION: &str = r#"
    UPDATE operation.sessions
    SET end_time = $1, status = $2
    WHERE session_id = $3
      AND (status = 'active' OR status = $2)
"#;

/// PostgreSQL-backed event store over a single owned connection
pub struct PgEventStore {
    conn: Option<PgConnection>,
}

impl PgEventStore {
    /// Open the connection. There is exactly one attempt.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let connect = PgConnection::connect(&config.url);
        let conn = tokio::time::timeout(config.connect_timeout(), connect)
            .await
            .map_err(|_| {
                StoreError::Connection(format!("timed out after {}s", config.connect_timeout_secs))
            })?
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!("Connected to PostgreSQL database");

        Ok(Self { conn: Some(conn) })
    }

    fn conn(&mut self) -> Result<&mut PgConnection, StoreError> {
        self.conn
            .as_mut()
            .ok_or_else(|| StoreError::Connection("connection already closed".to_string()))
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    #[instrument(skip(self, frame), fields(session_id = %frame.session_id))]
    async fn insert_frame(&mut self, frame: &FrameRecord) -> Result<(), StoreError> {
        sqlx::query(INSERT_FRAME)
            .bind(frame.session_id.as_i64())
            .bind(frame.timestamp)
            .bind(frame.ear_value)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, blink), fields(session_id = %blink.session_id))]
    async fn insert_blink(&mut self, blink: &BlinkRecord) -> Result<(), StoreError> {
        sqlx::query(INSERT_BLINK)
            .bind(blink.session_id.as_i64())
            .bind(blink.start_time)
            .bind(blink.end_time)
            .bind(blink.duration)
            .bind(blink.interval)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, session), fields(session_id = %session.session_id))]
    async fn upsert_session(
        &mut self,
        session: &SessionRecord,
    ) -> Result<SessionStatus, StoreError> {
        let status: Option<String> = sqlx::query_scalar(UPSERT_SESSION)
            .bind(session.session_id.as_i64())
            .bind(&session.user_id)
            .bind(session.start_time)
            .fetch_optional(self.conn()?)
            .await?;

        let status = status.ok_or(StoreError::SessionCollision(session.session_id))?;
        status
            .parse()
            .map_err(|reason: String| StoreError::Query(format!("stored status: {}", reason)))
    }

    #[instrument(skip(self, close), fields(session_id = %close.session_id, status = %close.status))]
    async fn close_session(&mut self, close: &SessionClose) -> Result<u64, StoreError> {
        let result = sqlx::query(CLOSE_SESSION)
            .bind(close.end_time)
            .bind(close.status.as_str())
            .bind(close.session_id.as_i64())
            .execute(self.conn()?)
            .await?;

        debug!(rows = result.rows_affected(), "Session status updated");
        Ok(result.rows_affected())
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        match self.conn.take() {
            Some(conn) => {
                conn.close()
                    .await
                    .map_err(|e| StoreError::Connection(e.to_string()))?;
                info!("Database connection closed");
                Ok(())
            }
            None => {
                warn!("Database connection was already closed");
                Ok(())
            }
        }
    }
}

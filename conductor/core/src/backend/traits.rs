//! Backend Traits
//!
//! The two collaborators the Conductor talks to over the network.
//!
//! # Design Philosophy
//!
//! - [`ChatBackend`] opens the streaming request for one turn and hands back
//!   the raw response body as a stream of byte chunks. It knows nothing about
//!   records or events; decoding happens in the Conductor.
//! - [`SessionDirectory`] is the session CRUD side: list, create, rename,
//!   delete, and fetch history.
//!
//! Keeping them apart lets tests script a byte stream without faking the whole
//! HTTP surface.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::messages::ThreadId;

/// Raw response body, chunked however the transport delivers it
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, BackendError>>;

/// Errors from talking to the voting-graph server
#[derive(Debug, Error)]
pub enum BackendError {
    /// The HTTP client failed (connect, TLS, body read, ...)
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server answered with a non-success status
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, if it could be read
        body: String,
    },

    /// A JSON response did not have the expected shape
    #[error("unexpected response: {0}")]
    Decode(String),

    /// Transport failure not originating from the HTTP client
    #[error("transport error: {0}")]
    Transport(String),
}

/// One streaming chat request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRequest {
    /// User message
    pub message: String,
    /// Model identifier
    pub model: String,
    /// Existing thread to continue; `None` asks the server for a new one
    pub thread_id: Option<ThreadId>,
}

impl StreamRequest {
    /// Request that starts a new server thread
    pub fn new(message: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            model: model.into(),
            thread_id: None,
        }
    }

    /// Continue an existing thread instead
    #[must_use]
    pub fn with_thread(mut self, thread_id: Option<ThreadId>) -> Self {
        self.thread_id = thread_id;
        self
    }
}

/// A session as listed by the server
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Server thread id
    pub thread_id: ThreadId,
    /// Current title
    #[serde(default)]
    pub title: String,
    /// Last metadata change
    #[serde(default, deserialize_with = "deserialize_server_time")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Messages stored for the thread (user and assistant)
    #[serde(default)]
    pub message_count: u32,
    /// Time of the newest message
    #[serde(default, deserialize_with = "deserialize_server_time")]
    pub last_message_at: Option<DateTime<Utc>>,
}

/// A session the server just created
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedSession {
    /// New thread id
    pub thread_id: ThreadId,
    /// Initial title
    #[serde(default)]
    pub title: String,
}

/// Author of a stored message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryRole {
    /// The human
    User,
    /// The voting graph's final answer
    Assistant,
    /// Anything else the server may store
    #[serde(other)]
    Other,
}

/// One stored message of a thread
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    /// Author
    pub role: HistoryRole,
    /// Text
    #[serde(default)]
    pub content: String,
    /// When it was stored
    #[serde(default, deserialize_with = "deserialize_server_time")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Streaming chat transport
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Open the streaming request for one turn
    ///
    /// Resolves once response headers arrived with a success status. Dropping
    /// the returned stream releases the connection.
    async fn open_stream(&self, request: &StreamRequest) -> Result<ByteStream, BackendError>;
}

/// Session CRUD collaborator
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    /// List every session the server knows
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, BackendError>;

    /// Create an empty session
    async fn create_session(&self) -> Result<CreatedSession, BackendError>;

    /// Rename a session
    async fn rename_session(&self, thread_id: &ThreadId, title: &str)
        -> Result<(), BackendError>;

    /// Delete a session and its history
    async fn delete_session(&self, thread_id: &ThreadId) -> Result<(), BackendError>;

    /// Stored messages of a session, oldest first
    async fn session_messages(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Vec<HistoryMessage>, BackendError>;
}

/// Parse a server timestamp
///
/// Accepts RFC 3339 and the naive `YYYY-MM-DDTHH:MM:SS[.ffffff]` form the
/// server writes; naive times are taken as UTC.
#[must_use]
pub fn parse_server_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

fn deserialize_server_time<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(|value| {
        let parsed = parse_server_time(value);
        if parsed.is_none() {
            tracing::debug!(value, "Ignoring unparseable server timestamp");
        }
        parsed
    }))
}

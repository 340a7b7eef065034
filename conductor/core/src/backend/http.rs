//! HTTP Backend
//!
//! reqwest client for the voting-graph server.
//!
//! # Endpoints
//!
//! Everything lives under `{base_url}/api/voting-graph`:
//! - `POST /voting-graph-chat-stream` - stream a turn in a new thread
//! - `POST /voting-graph-sessions/{id}/chat-stream` - stream a turn in an existing thread
//! - `GET|POST /voting-graph-sessions` - list / create sessions
//! - `GET /voting-graph-sessions/{id}/messages` - stored history
//! - `PUT /voting-graph-sessions/{id}/title` - rename
//! - `DELETE /voting-graph-sessions/{id}` - delete
//!
//! No overall request timeout is set on the client: a voting turn can take
//! minutes, and idle detection is done per chunk by the Conductor.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;

use super::traits::{
    BackendError, ByteStream, ChatBackend, CreatedSession, HistoryMessage, SessionDirectory,
    SessionSummary, StreamRequest,
};
use crate::config::VoteChatConfig;
use crate::messages::ThreadId;

/// Path prefix of the voting-graph router
const API_PREFIX: &str = "/api/voting-graph";

/// Voting-graph server client
#[derive(Clone, Debug)]
pub struct HttpBackend {
    /// Base URL without trailing slash
    base_url: String,
    /// HTTP client
    http_client: reqwest::Client,
}

impl HttpBackend {
    /// Create a backend for `base_url`
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Request`] if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    /// Create from the resolved configuration
    ///
    /// # Errors
    ///
    /// Same as [`HttpBackend::new`].
    pub fn from_config(config: &VoteChatConfig) -> Result<Self, BackendError> {
        Self::new(config.base_url.clone(), config.connect_timeout)
    }

    /// Base URL this backend talks to
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{API_PREFIX}{path}", self.base_url)
    }

    /// Streaming endpoint for a request
    fn stream_url(&self, thread_id: Option<&ThreadId>) -> String {
        match thread_id {
            Some(thread) => self.url(&format!("/voting-graph-sessions/{thread}/chat-stream")),
            None => self.url("/voting-graph-chat-stream"),
        }
    }

    fn session_url(&self, thread_id: &ThreadId) -> String {
        self.url(&format!("/voting-graph-sessions/{thread_id}"))
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, BackendError> {
        let response = check_status(request.send().await?).await?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| BackendError::Decode(e.to_string()))
    }
}

/// Turn a non-success response into [`BackendError::Status`]
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ChatBackend for HttpBackend {
    fn name(&self) -> &'static str {
        "voting-graph"
    }

    async fn open_stream(&self, request: &StreamRequest) -> Result<ByteStream, BackendError> {
        let url = self.stream_url(request.thread_id.as_ref());
        let body = serde_json::json!({
            "message": request.message,
            "model": request.model,
        });

        tracing::debug!(
            url = %url,
            model = %request.model,
            continuing = request.thread_id.is_some(),
            "Opening voting stream"
        );

        let response = self
            .http_client
            .post(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await?;
        let response = check_status(response).await?;

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(BackendError::from));
        Ok(stream.boxed())
    }
}

#[async_trait]
impl SessionDirectory for HttpBackend {
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, BackendError> {
        self.fetch_json(self.http_client.get(self.url("/voting-graph-sessions")))
            .await
    }

    async fn create_session(&self) -> Result<CreatedSession, BackendError> {
        self.fetch_json(self.http_client.post(self.url("/voting-graph-sessions")))
            .await
    }

    async fn rename_session(
        &self,
        thread_id: &ThreadId,
        title: &str,
    ) -> Result<(), BackendError> {
        let url = format!("{}/title", self.session_url(thread_id));
        let response = self
            .http_client
            .put(url)
            .json(&serde_json::json!({ "title": title }))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn delete_session(&self, thread_id: &ThreadId) -> Result<(), BackendError> {
        let response = self
            .http_client
            .delete(self.session_url(thread_id))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn session_messages(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Vec<HistoryMessage>, BackendError> {
        let url = format!("{}/messages", self.session_url(thread_id));
        self.fetch_json(self.http_client.get(url)).await
    }
}

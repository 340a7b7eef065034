//! Conductor - The Orchestration Core
//!
//! The Conductor owns the lifecycle of every turn:
//! - opening the streaming request (new thread or continued thread)
//! - pumping bytes through decoder, interpreter and reducer
//! - committing the completed turn to the session store, exactly once
//! - cancellation, idle timeouts, and the per-session busy guard
//! - session CRUD pass-throughs to the server
//!
//! # Design Philosophy
//!
//! The Conductor is UI-agnostic. Whoever starts a turn (CLI, UI surface, test
//! harness) observes it through [`ConductorMessage`]s and the [`TurnOutcome`]
//! returned by [`TurnHandle::outcome`].
//!
//! ```text
//!  start() ──► spawn read loop
//!                 │
//!   body chunk ──►│ FrameDecoder ─► EventInterpreter ─► reduce() ─► effects
//!                 │                                               │
//!                 │            commit / adopt thread / refresh ◄──┘
//!                 ▼
//!          TurnOutcome + terminal ConductorMessage
//! ```
//!
//! The read loop is the only owner of the in-flight turn; the
//! [`SessionStore`] only ever sees it when it is committed. The store lock is
//! held for short synchronous sections and never across an `.await`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendError, ChatBackend, SessionDirectory, StreamRequest};
use crate::config::VoteChatConfig;
use crate::events::{EventInterpreter, VotingEvent};
use crate::frame::FrameDecoder;
use crate::messages::{ConductorMessage, SessionId, ThreadId, TurnId};
use crate::session::{turns_from_history, Session, SessionStore, StoreError};
use crate::turn::{reduce, ConversationTurn, FailReason, Reduction, TurnEffect};

/// Conductor configuration
#[derive(Clone, Debug)]
pub struct ConductorConfig {
    /// Model used when `start` is not given one
    pub default_model: String,
    /// Idle timeout for opening the stream, each chunk read and each update
    /// handed to the caller
    pub read_timeout: Option<Duration>,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self::from_config(&VoteChatConfig::default())
    }
}

impl ConductorConfig {
    /// Take the relevant values from the resolved configuration
    #[must_use]
    pub fn from_config(config: &VoteChatConfig) -> Self {
        Self {
            default_model: config.default_model.clone(),
            read_timeout: config.read_timeout,
        }
    }
}

/// Why a turn could not be started, or a session operation failed
#[derive(Debug, Error)]
pub enum ConductorError {
    /// The message was empty or whitespace
    #[error("message is empty")]
    EmptyMessage,

    /// The session already has a turn streaming
    #[error("session {session_id} is busy with {in_flight}")]
    Busy {
        /// Busy session
        session_id: SessionId,
        /// Turn currently streaming
        in_flight: TurnId,
    },

    /// No session with this id
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    /// The operation needs a server thread the session does not have yet
    #[error("session {0} has no server thread yet")]
    NoThread(SessionId),

    /// The server call failed
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Any other store rejection
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ConductorError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Busy {
                session_id,
                in_flight,
            } => Self::Busy {
                session_id,
                in_flight,
            },
            StoreError::UnknownSession(id) => Self::UnknownSession(id),
            other => Self::Store(other),
        }
    }
}

/// Why a started turn failed
#[derive(Debug, Error)]
pub enum TurnError {
    /// Opening or reading the stream failed
    #[error("transport error: {0}")]
    Transport(#[from] BackendError),

    /// The server sent an `error` record
    #[error("{0}")]
    Server(String),

    /// `end` arrived before `complete`
    #[error("stream ended before the turn completed")]
    PrematureEnd,

    /// Nothing arrived within the idle timeout
    #[error("no data received for {0:?}")]
    Timeout(Duration),

    /// The body closed before `complete` or `end`
    #[error("connection closed before the turn completed")]
    Disconnected,

    /// The store refused the commit
    #[error("could not record turn: {0}")]
    Store(#[from] StoreError),

    /// The read loop task died
    #[error("turn task ended abnormally: {0}")]
    Aborted(String),
}

/// How a turn ended
#[derive(Debug)]
pub enum TurnOutcome {
    /// Completed and appended to the session history
    Committed {
        /// Owning session
        session_id: SessionId,
        /// The session's server thread after the turn
        thread_id: Option<ThreadId>,
        /// Position in the session history
        turn_index: usize,
    },
    /// Failed and discarded
    Failed(TurnError),
    /// Cancelled by the caller and discarded
    Cancelled,
}

impl TurnOutcome {
    /// Whether the turn made it into history
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

/// Handle to a running turn
#[derive(Debug)]
pub struct TurnHandle {
    /// The turn
    pub turn_id: TurnId,
    /// Session it belongs to
    pub session_id: SessionId,
    cancel: CancellationToken,
    task: JoinHandle<TurnOutcome>,
}

impl TurnHandle {
    /// Request cancellation; observed at the next chunk read
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this turn (e.g. for a Ctrl-C handler)
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the turn to finish
    pub async fn outcome(self) -> TurnOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => TurnOutcome::Failed(TurnError::Aborted(e.to_string())),
        }
    }
}

/// The Conductor - headless orchestration core
pub struct Conductor<B> {
    /// Configuration
    config: ConductorConfig,
    /// Voting-graph server
    backend: Arc<B>,
    /// Sessions and committed history
    store: Arc<Mutex<SessionStore>>,
    /// Channel to send updates to the caller
    tx: mpsc::Sender<ConductorMessage>,
}

impl<B: ChatBackend + SessionDirectory + 'static> Conductor<B> {
    /// Create a new Conductor with the given backend
    pub fn new(backend: B, config: ConductorConfig, tx: mpsc::Sender<ConductorMessage>) -> Self {
        Self {
            config,
            backend: Arc::new(backend),
            store: Arc::new(Mutex::new(SessionStore::new())),
            tx,
        }
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    /// The backend
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    // ========================================================================
    // Turns
    // ========================================================================

    /// Submit a message and start streaming its turn
    ///
    /// With `session_id` the turn continues that session (and its server
    /// thread, once known); without it a fresh local session is opened, and
    /// dropped again if the turn ends without committing.
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`ConductorError::EmptyMessage`] for a blank message,
    /// [`ConductorError::Busy`] when the session already streams a turn,
    /// [`ConductorError::UnknownSession`] for an unknown session.
    pub fn start(
        &self,
        message: impl Into<String>,
        model: Option<&str>,
        session_id: Option<SessionId>,
    ) -> Result<TurnHandle, ConductorError> {
        let message = message.into();
        if message.trim().is_empty() {
            return Err(ConductorError::EmptyMessage);
        }
        let model = model.unwrap_or(&self.config.default_model).to_string();
        let turn = ConversationTurn::new(message.clone(), model.clone());

        let fresh_session = session_id.is_none();
        let (session_id, thread_id) = {
            let mut store = self.store.lock();
            let session_id = match session_id {
                Some(id) => id,
                None => store.open_new(),
            };
            store.begin_turn(&session_id, &turn.id)?;
            let thread_id = store
                .session(&session_id)
                .and_then(|s| s.thread_id.clone());
            (session_id, thread_id)
        };

        tracing::info!(
            turn_id = %turn.id,
            session_id = %session_id,
            thread_id = ?thread_id,
            model = %model,
            "Starting turn"
        );

        let cancel = CancellationToken::new();
        let task = TurnTask {
            backend: Arc::clone(&self.backend),
            store: Arc::clone(&self.store),
            tx: self.tx.clone(),
            cancel: cancel.clone(),
            read_timeout: self.config.read_timeout,
            session_id: session_id.clone(),
            fresh_session,
            request: StreamRequest::new(message, model).with_thread(thread_id),
        };
        let turn_id = turn.id.clone();
        let task = tokio::spawn(task.run(turn));

        Ok(TurnHandle {
            turn_id,
            session_id,
            cancel,
            task,
        })
    }

    /// Cancel a running turn
    ///
    /// Stops reading at the next chunk, drops the connection and guarantees
    /// the turn is not committed (unless it already was).
    pub fn cancel(&self, handle: &TurnHandle) {
        tracing::debug!(turn_id = %handle.turn_id, "Cancelling turn");
        handle.cancel();
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Copy of every known session
    #[must_use]
    pub fn sessions(&self) -> Vec<Session> {
        self.store.lock().snapshot()
    }

    /// Copy of one session
    #[must_use]
    pub fn session(&self, session_id: &SessionId) -> Option<Session> {
        self.store.lock().session(session_id).cloned()
    }

    /// Local session for a server thread (created if unknown)
    pub fn open_thread(&self, thread_id: &ThreadId) -> SessionId {
        self.store.lock().open_thread(thread_id)
    }

    /// Re-fetch session titles and counters from the server
    ///
    /// # Errors
    ///
    /// Returns the backend error if the listing fails.
    pub async fn refresh_metadata(&self) -> Result<usize, ConductorError> {
        Ok(refresh_sessions(&*self.backend, &self.store, &self.tx).await?)
    }

    /// Refresh from the server and return every known session
    ///
    /// # Errors
    ///
    /// Returns the backend error if the listing fails.
    pub async fn list_sessions(&self) -> Result<Vec<Session>, ConductorError> {
        self.refresh_metadata().await?;
        Ok(self.sessions())
    }

    /// Create an empty session on the server
    ///
    /// # Errors
    ///
    /// Returns the backend error if creation fails.
    pub async fn create_session(&self) -> Result<SessionId, ConductorError> {
        let created = self.backend.create_session().await?;
        tracing::info!(thread_id = %created.thread_id, "Session created");

        let mut store = self.store.lock();
        let session_id = store.open_thread(&created.thread_id);
        store.set_title(&session_id, created.title)?;
        store.replace_history(&session_id, Vec::new())?;
        Ok(session_id)
    }

    /// Rename a session on the server and locally
    ///
    /// # Errors
    ///
    /// [`ConductorError::NoThread`] if the server does not know the session
    /// yet, or the backend error.
    pub async fn rename_session(
        &self,
        session_id: &SessionId,
        title: &str,
    ) -> Result<(), ConductorError> {
        let thread_id = self.thread_of(session_id)?;
        self.backend.rename_session(&thread_id, title).await?;
        self.store.lock().set_title(session_id, title)?;
        Ok(())
    }

    /// Delete a session on the server and forget it locally
    ///
    /// A session the server never saw is only dropped locally.
    ///
    /// # Errors
    ///
    /// [`ConductorError::Busy`] while a turn streams in it, or the backend
    /// error.
    pub async fn delete_session(&self, session_id: &SessionId) -> Result<(), ConductorError> {
        let thread_id = {
            let store = self.store.lock();
            let session = store
                .session(session_id)
                .ok_or_else(|| ConductorError::UnknownSession(session_id.clone()))?;
            if let Some(in_flight) = session.in_flight() {
                return Err(ConductorError::Busy {
                    session_id: session_id.clone(),
                    in_flight: in_flight.clone(),
                });
            }
            session.thread_id.clone()
        };

        if let Some(ref thread_id) = thread_id {
            self.backend.delete_session(thread_id).await?;
        }
        self.store.lock().remove(session_id);
        tracing::info!(session_id = %session_id, thread_id = ?thread_id, "Session deleted");
        Ok(())
    }

    /// Load a thread's stored history into its local session
    ///
    /// Each stored user message becomes a committed turn whose final answer
    /// is the assistant message that follows it.
    ///
    /// # Errors
    ///
    /// The backend error, or [`ConductorError::Busy`] while a turn streams in
    /// the session.
    pub async fn load_session(&self, thread_id: &ThreadId) -> Result<SessionId, ConductorError> {
        let session_id = self.open_thread(thread_id);
        let messages = self.backend.session_messages(thread_id).await?;
        let turns = turns_from_history(&messages);
        tracing::debug!(
            thread_id = %thread_id,
            messages = messages.len(),
            turns = turns.len(),
            "Loaded session history"
        );

        let mut store = self.store.lock();
        store.replace_history(&session_id, turns)?;
        Ok(session_id)
    }

    fn thread_of(&self, session_id: &SessionId) -> Result<ThreadId, ConductorError> {
        let store = self.store.lock();
        let session = store
            .session(session_id)
            .ok_or_else(|| ConductorError::UnknownSession(session_id.clone()))?;
        session
            .thread_id
            .clone()
            .ok_or_else(|| ConductorError::NoThread(session_id.clone()))
    }
}

// ============================================================================
// Read loop
// ============================================================================

/// Upper bound for the work after the stream ends (metadata refresh, the
/// terminal update) when no idle timeout is configured
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything one spawned read loop needs
struct TurnTask<B> {
    backend: Arc<B>,
    store: Arc<Mutex<SessionStore>>,
    tx: mpsc::Sender<ConductorMessage>,
    cancel: CancellationToken,
    read_timeout: Option<Duration>,
    session_id: SessionId,
    /// The session was opened for this turn and goes away if nothing commits
    fresh_session: bool,
    request: StreamRequest,
}

/// What the reducer's effects left behind
#[derive(Default)]
struct TurnState {
    committed: Option<usize>,
    failure: Option<TurnError>,
    refresh_requested: bool,
}

/// Why the read loop stopped
enum LoopExit {
    /// A `Stop` effect (error, end, or a refused commit)
    Stopped,
    /// The caller cancelled
    Cancelled,
    /// The transport gave up
    Failed(TurnError),
}

impl<B: ChatBackend + SessionDirectory + 'static> TurnTask<B> {
    async fn run(self, turn: ConversationTurn) -> TurnOutcome {
        let turn_id = turn.id.clone();
        let mut state = TurnState::default();

        let started = self
            .deliver(ConductorMessage::TurnStarted {
                turn_id: turn_id.clone(),
                session_id: self.session_id.clone(),
            })
            .await;
        let exit = match started {
            Ok(()) => self.pump(turn, &mut state).await,
            Err(exit) => exit,
        };

        {
            let mut store = self.store.lock();
            // Releases the busy guard when nothing was committed
            store.finish_turn(&self.session_id, &turn_id);
            if self.fresh_session && state.committed.is_none() {
                store.discard_if_unused(&self.session_id);
            }
        }

        if state.refresh_requested {
            self.refresh_after_turn().await;
        }

        let outcome = self.resolve(state, exit);
        let message = match outcome {
            TurnOutcome::Committed { turn_index, .. } => {
                tracing::info!(turn_id = %turn_id, turn_index, "Turn committed");
                ConductorMessage::TurnCommitted {
                    turn_id,
                    session_id: self.session_id.clone(),
                    turn_index,
                }
            }
            TurnOutcome::Failed(ref e) => {
                tracing::warn!(turn_id = %turn_id, error = %e, "Turn failed");
                ConductorMessage::TurnFailed {
                    turn_id,
                    error: e.to_string(),
                }
            }
            TurnOutcome::Cancelled => {
                tracing::info!(turn_id = %turn_id, "Turn cancelled");
                ConductorMessage::TurnCancelled { turn_id }
            }
        };
        self.send_terminal(message).await;
        outcome
    }

    async fn pump(&self, mut turn: ConversationTurn, state: &mut TurnState) -> LoopExit {
        let opened = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return LoopExit::Cancelled,
            opened = idle_timeout(self.read_timeout, self.backend.open_stream(&self.request)) => {
                opened
            }
        };
        let mut body = match opened {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => return LoopExit::Failed(TurnError::Transport(e)),
            Err(limit) => return LoopExit::Failed(TurnError::Timeout(limit)),
        };

        let mut decoder = FrameDecoder::new();
        let mut interpreter = EventInterpreter::new();

        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return LoopExit::Cancelled,
                next = idle_timeout(self.read_timeout, body.next()) => next,
            };

            let (records, closed) = match next {
                Ok(Some(Ok(chunk))) => (decoder.decode(&chunk), false),
                Ok(Some(Err(e))) => return LoopExit::Failed(TurnError::Transport(e)),
                Ok(None) => (decoder.finish().into_iter().collect(), true),
                Err(limit) => return LoopExit::Failed(TurnError::Timeout(limit)),
            };

            for record in &records {
                let Some(event) = interpreter.accept(record) else {
                    continue;
                };
                match self.apply(turn, event, state).await {
                    Ok((next_turn, false)) => turn = next_turn,
                    Ok((_, true)) => return LoopExit::Stopped,
                    Err(exit) => return exit,
                }
            }

            if closed {
                tracing::debug!(
                    turn_id = %turn.id,
                    accepted = interpreter.accepted(),
                    skipped = interpreter.skipped(),
                    "Stream closed without end marker"
                );
                return LoopExit::Failed(TurnError::Disconnected);
            }
        }
    }

    /// Reduce one event and carry out its effects
    ///
    /// Returns the new turn and whether to stop reading, or how the loop
    /// ends when an update could not be handed over.
    async fn apply(
        &self,
        turn: ConversationTurn,
        event: VotingEvent,
        state: &mut TurnState,
    ) -> Result<(ConversationTurn, bool), LoopExit> {
        tracing::trace!(turn_id = %turn.id, event = event.kind(), "Applying event");
        let Reduction {
            turn,
            effects,
            changed,
        } = reduce(turn, event);

        if changed {
            self.deliver(ConductorMessage::TurnUpdated { turn: turn.clone() })
                .await?;
        }

        let mut stop = false;
        for effect in effects {
            match effect {
                TurnEffect::Commit => {
                    let committed = self.store.lock().commit(&self.session_id, turn.clone());
                    match committed {
                        Ok(index) => state.committed = Some(index),
                        Err(e) => {
                            tracing::warn!(turn_id = %turn.id, error = %e, "Commit refused");
                            state.failure = Some(TurnError::Store(e));
                            stop = true;
                        }
                    }
                }
                TurnEffect::AdoptThread(thread_id) => {
                    let adopted = self
                        .store
                        .lock()
                        .adopt_thread(&self.session_id, thread_id.clone());
                    match adopted {
                        Ok(true) => {
                            tracing::debug!(
                                session_id = %self.session_id,
                                thread_id = %thread_id,
                                "Session adopted thread"
                            );
                            self.deliver(ConductorMessage::ThreadAdopted {
                                session_id: self.session_id.clone(),
                                thread_id,
                            })
                            .await?;
                        }
                        Ok(false) => {}
                        Err(e) => tracing::warn!(error = %e, "Could not adopt thread"),
                    }
                }
                TurnEffect::RefreshMetadata { title } => {
                    if let Some(ref title) = title {
                        let renamed = self.store.lock().set_title(&self.session_id, title.clone());
                        if let Err(e) = renamed {
                            tracing::warn!(error = %e, "Could not apply new title");
                        }
                    }
                    state.refresh_requested = true;
                    self.deliver(ConductorMessage::MetadataRefreshRequested {
                        session_id: self.session_id.clone(),
                        title,
                    })
                    .await?;
                }
                TurnEffect::Phase { phase, message } => {
                    self.deliver(ConductorMessage::PhaseStarted {
                        turn_id: turn.id.clone(),
                        phase,
                        message,
                    })
                    .await?;
                }
                TurnEffect::Fail(reason) => {
                    state.failure = Some(match reason {
                        FailReason::Server(message) => TurnError::Server(message),
                        FailReason::PrematureEnd => TurnError::PrematureEnd,
                    });
                }
                TurnEffect::Stop => stop = true,
            }
        }

        Ok((turn, stop))
    }

    fn resolve(&self, state: TurnState, exit: LoopExit) -> TurnOutcome {
        if let Some(turn_index) = state.committed {
            if let LoopExit::Failed(ref e) = exit {
                tracing::debug!(error = %e, "Stream failed after commit, keeping the turn");
            }
            let thread_id = self
                .store
                .lock()
                .session(&self.session_id)
                .and_then(|s| s.thread_id.clone());
            return TurnOutcome::Committed {
                session_id: self.session_id.clone(),
                thread_id,
                turn_index,
            };
        }

        match exit {
            LoopExit::Cancelled => TurnOutcome::Cancelled,
            LoopExit::Failed(e) => TurnOutcome::Failed(e),
            LoopExit::Stopped => {
                TurnOutcome::Failed(state.failure.unwrap_or(TurnError::PrematureEnd))
            }
        }
    }

    /// Hand an update to the caller while the turn is still streaming
    ///
    /// A caller that stops draining the channel cannot pin the turn: the
    /// wait is cut short by a cancel or by the idle timeout.
    async fn deliver(&self, message: ConductorMessage) -> Result<(), LoopExit> {
        let sent = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(LoopExit::Cancelled),
            sent = idle_timeout(self.read_timeout, self.tx.send(message)) => sent,
        };
        match sent {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                tracing::debug!("Update receiver dropped");
                Ok(())
            }
            Err(limit) => {
                tracing::warn!(?limit, "Caller stopped reading updates");
                Err(LoopExit::Failed(TurnError::Timeout(limit)))
            }
        }
    }

    /// Run the coalesced metadata refresh, bounded in time and by cancel
    async fn refresh_after_turn(&self) {
        let limit = self.read_timeout.unwrap_or(SETTLE_TIMEOUT);
        let refresh = refresh_sessions(&*self.backend, &self.store, &self.tx);
        let refreshed = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                tracing::debug!("Cancelled, skipping metadata refresh");
                return;
            }
            refreshed = idle_timeout(Some(limit), refresh) => refreshed,
        };
        match refreshed {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Session metadata refresh failed"),
            Err(limit) => tracing::warn!(?limit, "Session metadata refresh timed out"),
        }
    }

    /// Send the turn's last message without letting it hold back the outcome
    async fn send_terminal(&self, message: ConductorMessage) {
        let limit = self.read_timeout.unwrap_or(SETTLE_TIMEOUT);
        let delivered = tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            sent = idle_timeout(Some(limit), self.tx.send(message.clone())) => {
                matches!(sent, Ok(Ok(())))
            }
        };
        if !delivered && self.tx.try_send(message).is_err() {
            tracing::debug!("Terminal update not delivered");
        }
    }
}

async fn send_update(tx: &mpsc::Sender<ConductorMessage>, message: ConductorMessage) {
    if tx.send(message).await.is_err() {
        tracing::debug!("Update receiver dropped");
    }
}

/// List sessions from the server and merge them into the store
async fn refresh_sessions<D: SessionDirectory + ?Sized>(
    directory: &D,
    store: &Mutex<SessionStore>,
    tx: &mpsc::Sender<ConductorMessage>,
) -> Result<usize, BackendError> {
    let summaries = directory.list_sessions().await?;
    let added = store.lock().apply_summaries(&summaries);
    tracing::debug!(count = summaries.len(), added, "Session metadata refreshed");

    send_update(
        tx,
        ConductorMessage::SessionsRefreshed {
            count: summaries.len(),
        },
    )
    .await;
    Ok(summaries.len())
}

/// Await `future`, giving up after `limit` of silence (`None` waits forever)
async fn idle_timeout<F: Future>(
    limit: Option<Duration>,
    future: F,
) -> Result<F::Output, Duration> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, future).await.map_err(|_| limit),
        None => Ok(future.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures::stream;
    use pretty_assertions::assert_eq;

    use crate::backend::{ByteStream, CreatedSession, HistoryMessage, SessionSummary};
    use crate::turn::{TurnStatus, VotingResults};

    // Mock backend for testing
    #[derive(Default)]
    struct MockBackend {
        /// Body chunks served for every stream
        chunks: Vec<Vec<u8>>,
        /// Keep the body open after the last chunk
        hang: bool,
        /// Fail opening with this status
        open_status: Option<u16>,
        /// Every stream request received
        requests: parking_lot::Mutex<Vec<StreamRequest>>,
        /// Chunks handed out so far
        pulled: Arc<AtomicUsize>,
        /// Server-side session listing
        listing: parking_lot::Mutex<Vec<SessionSummary>>,
        list_calls: AtomicUsize,
        /// Never answer the session listing
        list_hang: bool,
        history: Vec<HistoryMessage>,
        deleted: parking_lot::Mutex<Vec<ThreadId>>,
        renamed: parking_lot::Mutex<Vec<(ThreadId, String)>>,
    }

    impl MockBackend {
        fn with_chunks<I, S>(chunks: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: AsRef<[u8]>,
        {
            Self {
                chunks: chunks.into_iter().map(|c| c.as_ref().to_vec()).collect(),
                ..Self::default()
            }
        }

        fn with_body(body: &str) -> Self {
            Self::with_chunks([body])
        }

        fn hanging(mut self) -> Self {
            self.hang = true;
            self
        }
    }

    #[async_trait]
    impl ChatBackend for MockBackend {
        fn name(&self) -> &str {
            "Mock"
        }

        async fn open_stream(&self, request: &StreamRequest) -> Result<ByteStream, BackendError> {
            self.requests.lock().push(request.clone());
            if let Some(status) = self.open_status {
                return Err(BackendError::Status {
                    status,
                    body: "unavailable".to_string(),
                });
            }

            let pulled = Arc::clone(&self.pulled);
            let body = stream::iter(self.chunks.clone()).map(move |chunk| {
                pulled.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BackendError>(chunk)
            });
            if self.hang {
                Ok(body.chain(stream::pending()).boxed())
            } else {
                Ok(body.boxed())
            }
        }
    }

    #[async_trait]
    impl SessionDirectory for MockBackend {
        async fn list_sessions(&self) -> Result<Vec<SessionSummary>, BackendError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.list_hang {
                futures::future::pending::<()>().await;
            }
            Ok(self.listing.lock().clone())
        }

        async fn create_session(&self) -> Result<CreatedSession, BackendError> {
            Ok(CreatedSession {
                thread_id: ThreadId::new("created"),
                title: "Fresh".to_string(),
            })
        }

        async fn rename_session(
            &self,
            thread_id: &ThreadId,
            title: &str,
        ) -> Result<(), BackendError> {
            self.renamed
                .lock()
                .push((thread_id.clone(), title.to_string()));
            Ok(())
        }

        async fn delete_session(&self, thread_id: &ThreadId) -> Result<(), BackendError> {
            self.deleted.lock().push(thread_id.clone());
            Ok(())
        }

        async fn session_messages(
            &self,
            _thread_id: &ThreadId,
        ) -> Result<Vec<HistoryMessage>, BackendError> {
            Ok(self.history.clone())
        }
    }

    fn record(json: &str) -> String {
        format!("data: {json}\n\n")
    }

    fn body(records: &[&str]) -> String {
        records.iter().map(|r| record(r)).collect()
    }

    const AGENT_X: &str =
        r#"{"type":"agent_response","agent":"a1","agent_name":"Logical","response":"x"}"#;
    const AGENT_Y: &str =
        r#"{"type":"agent_response","agent":"a1","agent_name":"Logical","response":"y"}"#;
    const COMPLETE_T1: &str = r#"{"type":"complete","thread_id":"t1","updated_title":null}"#;
    const END: &str = r#"{"type":"end"}"#;

    type Harness = (Conductor<MockBackend>, mpsc::Receiver<ConductorMessage>);

    fn conductor(backend: MockBackend) -> Harness {
        conductor_with(backend, ConductorConfig::default())
    }

    fn conductor_with(backend: MockBackend, config: ConductorConfig) -> Harness {
        conductor_with_capacity(backend, config, 1024)
    }

    fn conductor_with_capacity(
        backend: MockBackend,
        config: ConductorConfig,
        capacity: usize,
    ) -> Harness {
        let (tx, rx) = mpsc::channel(capacity);
        (Conductor::new(backend, config, tx), rx)
    }

    /// Eight agent answers, then the body stays open
    fn busy_agents_backend() -> MockBackend {
        let agents: Vec<String> = (0..8)
            .map(|i| format!(r#"{{"type":"agent_response","agent":"a{i}","response":"r{i}"}}"#))
            .collect();
        let records: Vec<&str> = agents.iter().map(String::as_str).collect();
        MockBackend::with_body(&body(&records)).hanging()
    }

    /// Turn state that must not depend on chunking (id and timestamp vary)
    fn comparable(turn: &ConversationTurn) -> serde_json::Value {
        let mut value = serde_json::to_value(turn).unwrap();
        let fields = value.as_object_mut().unwrap();
        fields.remove("id");
        fields.remove("timestamp");
        value
    }

    fn drain(rx: &mut mpsc::Receiver<ConductorMessage>) -> Vec<ConductorMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    /// Wait until the read loop has applied at least one event
    async fn wait_for_update(rx: &mut mpsc::Receiver<ConductorMessage>) {
        while let Some(message) = rx.recv().await {
            if matches!(message, ConductorMessage::TurnUpdated { .. }) {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_example_a_upsert_commit_and_adopt() {
        let (conductor, mut rx) =
            conductor(MockBackend::with_body(&body(&[AGENT_X, AGENT_Y, COMPLETE_T1, END])));

        let handle = conductor.start("question", None, None).unwrap();
        let session_id = handle.session_id.clone();
        let outcome = handle.outcome().await;

        match outcome {
            TurnOutcome::Committed {
                thread_id,
                turn_index,
                ..
            } => {
                assert_eq!(turn_index, 0);
                assert_eq!(thread_id, Some(ThreadId::new("t1")));
            }
            other => panic!("expected commit, got {other:?}"),
        }

        let session = conductor.session(&session_id).unwrap();
        assert_eq!(session.thread_id, Some(ThreadId::new("t1")));
        assert_eq!(session.turns().len(), 1);
        let responses: Vec<_> = session.turns()[0]
            .agent_responses()
            .map(|r| (r.agent_id.clone(), r.response_text.clone()))
            .collect();
        assert_eq!(responses, vec![("a1".to_string(), "y".to_string())]);
        assert!(!session.is_busy());

        let messages = drain(&mut rx);
        assert!(matches!(messages[0], ConductorMessage::TurnStarted { .. }));
        assert!(messages
            .iter()
            .any(|m| matches!(m, ConductorMessage::ThreadAdopted { .. })));
        assert!(messages.last().unwrap().is_terminal());
        assert!(matches!(
            messages.last(),
            Some(ConductorMessage::TurnCommitted { turn_index: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_example_b_server_error() {
        let (conductor, mut rx) = conductor(MockBackend::with_body(&body(&[
            r#"{"type":"error","message":"boom"}"#,
            END,
        ])));

        let handle = conductor.start("question", None, None).unwrap();
        let session_id = handle.session_id.clone();
        let outcome = handle.outcome().await;

        match outcome {
            TurnOutcome::Failed(TurnError::Server(ref message)) => assert_eq!(message, "boom"),
            other => panic!("expected server failure, got {other:?}"),
        }
        // The session opened for this turn is gone again
        assert!(conductor.session(&session_id).is_none());
        assert!(conductor.sessions().is_empty());

        let messages = drain(&mut rx);
        match messages.last() {
            Some(ConductorMessage::TurnFailed { error, .. }) => assert_eq!(error, "boom"),
            other => panic!("expected TurnFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_example_c_voting_results_replaced() {
        let first = r#"{"type":"voting_results","voting_results":{"a1":{"a2":{"score":8,"reason":"clear"}},"a2":{"a1":{"score":5,"reason":"ok"}}}}"#;
        let second = r#"{"type":"voting_results","voting_results":{"a3":{"a1":{"score":9,"reason":"best"}}}}"#;
        let (conductor, _rx) = conductor(MockBackend::with_body(&body(&[
            first,
            second,
            COMPLETE_T1,
            END,
        ])));

        let handle = conductor.start("question", None, None).unwrap();
        let session_id = handle.session_id.clone();
        assert!(handle.outcome().await.is_committed());

        let session = conductor.session(&session_id).unwrap();
        let results: &VotingResults = session.turns()[0].voting_results.as_ref().unwrap();
        let expected: VotingResults =
            serde_json::from_str(r#"{"a3":{"a1":{"score":9,"reason":"best"}}}"#).unwrap();
        assert_eq!(results, &expected);
    }

    #[tokio::test]
    async fn test_stream_closed_without_complete_is_not_committed() {
        let (conductor, _rx) = conductor(MockBackend::with_body(&body(&[
            AGENT_X,
            r#"{"type":"final_response","response":"almost"}"#,
        ])));

        let handle = conductor.start("question", None, None).unwrap();
        let session_id = handle.session_id.clone();
        let outcome = handle.outcome().await;

        assert!(matches!(outcome, TurnOutcome::Failed(TurnError::Disconnected)));
        assert!(conductor.session(&session_id).is_none());
    }

    #[tokio::test]
    async fn test_premature_end_fails_turn() {
        let (conductor, _rx) = conductor(MockBackend::with_body(&body(&[AGENT_X, END])));

        let handle = conductor.start("question", None, None).unwrap();
        let session_id = handle.session_id.clone();

        assert!(matches!(
            handle.outcome().await,
            TurnOutcome::Failed(TurnError::PrematureEnd)
        ));
        assert!(conductor.session(&session_id).is_none());
    }

    #[tokio::test]
    async fn test_end_halts_further_bytes() {
        // complete shares a chunk with end but comes after it; the agent
        // response sits in a chunk that must never be pulled
        let first_chunk = body(&[END, COMPLETE_T1]);
        let second_chunk = body(&[AGENT_X]);
        let (conductor, _rx) = conductor(MockBackend::with_chunks([first_chunk, second_chunk]));

        let handle = conductor.start("question", None, None).unwrap();
        let session_id = handle.session_id.clone();

        assert!(matches!(
            handle.outcome().await,
            TurnOutcome::Failed(TurnError::PrematureEnd)
        ));
        assert_eq!(conductor.backend().pulled.load(Ordering::SeqCst), 1);
        // complete was never applied, so no thread was adopted either
        assert!(conductor.session(&session_id).is_none());
    }

    #[tokio::test]
    async fn test_chunk_boundaries_do_not_change_result() {
        let full = body(&[
            r#"{"type":"start","message":"投票開始"}"#,
            AGENT_X,
            r#"{"type":"agent_response","agent":"a2","agent_name":"共感","response":"やさしい"}"#,
            AGENT_Y,
            r#"{"type":"voting_results","voting_results":{"a1":{"a2":{"score":7,"reason":"温かい"}}}}"#,
            r#"{"type":"final_response","response":"答え"}"#,
            COMPLETE_T1,
            END,
        ]);
        let bytes = full.as_bytes();

        async fn final_state(chunks: Vec<&[u8]>) -> serde_json::Value {
            let (conductor, _rx) = conductor(MockBackend::with_chunks(chunks));
            let handle = conductor.start("question", None, None).unwrap();
            let session_id = handle.session_id.clone();
            assert!(handle.outcome().await.is_committed());
            comparable(&conductor.session(&session_id).unwrap().turns()[0])
        }

        let reference = final_state(vec![bytes]).await;
        assert_eq!(reference["status"], "Complete");
        assert_eq!(reference["voting_results"]["a1"]["a2"]["score"], 7.0);
        assert_eq!(reference["agent_responses"].as_object().unwrap().len(), 2);

        for split in (0..=bytes.len()).step_by(5) {
            let state = final_state(vec![&bytes[..split], &bytes[split..]]).await;
            assert_eq!(state, reference, "split at {split}");
        }

        // One byte per chunk
        let state = final_state(bytes.iter().map(std::slice::from_ref).collect()).await;
        assert_eq!(state, reference);
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_discards_turn() {
        let (conductor, mut rx) = conductor(MockBackend::with_body(&body(&[AGENT_X])).hanging());
        let session_id = conductor.open_thread(&ThreadId::new("t-cancel"));

        let handle = conductor
            .start("question", None, Some(session_id.clone()))
            .unwrap();
        wait_for_update(&mut rx).await;

        conductor.cancel(&handle);
        assert!(matches!(handle.outcome().await, TurnOutcome::Cancelled));

        let session = conductor.session(&session_id).unwrap();
        assert!(session.turns().is_empty());
        assert!(!session.is_busy());
        assert!(matches!(
            drain(&mut rx).last(),
            Some(ConductorMessage::TurnCancelled { .. })
        ));

        // Busy guard released: the session accepts a new turn
        let again = conductor
            .start("again", None, Some(session_id.clone()))
            .unwrap();
        again.cancel();
        assert!(matches!(again.outcome().await, TurnOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_busy_session_rejects_second_start() {
        let (conductor, mut rx) = conductor(MockBackend::with_body(&body(&[AGENT_X])).hanging());

        let first = conductor.start("one", None, None).unwrap();
        wait_for_update(&mut rx).await;

        let second = conductor.start("two", None, Some(first.session_id.clone()));
        match second {
            Err(ConductorError::Busy { in_flight, .. }) => assert_eq!(in_flight, first.turn_id),
            other => panic!("expected Busy, got {other:?}"),
        }

        // Other sessions are unaffected
        let other = conductor.start("three", None, None).unwrap();
        assert_ne!(other.session_id, first.session_id);

        first.cancel();
        other.cancel();
        assert!(matches!(first.outcome().await, TurnOutcome::Cancelled));
        assert!(matches!(other.outcome().await, TurnOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let (conductor, _rx) = conductor(MockBackend::default());
        assert!(matches!(
            conductor.start("   \n", None, None),
            Err(ConductorError::EmptyMessage)
        ));
        assert!(conductor.sessions().is_empty());
        assert!(conductor.backend().requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_session_rejected() {
        let (conductor, _rx) = conductor(MockBackend::default());
        assert!(matches!(
            conductor.start("hi", None, Some(SessionId::new())),
            Err(ConductorError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_idle_timeout_fails_turn() {
        let config = ConductorConfig {
            read_timeout: Some(Duration::from_millis(50)),
            ..ConductorConfig::default()
        };
        let (conductor, _rx) =
            conductor_with(MockBackend::with_body(&body(&[AGENT_X])).hanging(), config);

        let handle = conductor.start("question", None, None).unwrap();
        let session_id = handle.session_id.clone();

        match handle.outcome().await {
            TurnOutcome::Failed(TurnError::Timeout(limit)) => {
                assert_eq!(limit, Duration::from_millis(50));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(conductor.session(&session_id).is_none());
    }

    #[tokio::test]
    async fn test_open_failure_is_transport_error() {
        let backend = MockBackend {
            open_status: Some(503),
            ..MockBackend::default()
        };
        let (conductor, _rx) = conductor(backend);

        let handle = conductor.start("question", None, None).unwrap();
        let session_id = handle.session_id.clone();

        assert!(matches!(
            handle.outcome().await,
            TurnOutcome::Failed(TurnError::Transport(BackendError::Status { status: 503, .. }))
        ));
        assert!(conductor.session(&session_id).is_none());
    }

    #[tokio::test]
    async fn test_open_failure_keeps_existing_session() {
        let backend = MockBackend {
            open_status: Some(503),
            ..MockBackend::default()
        };
        let (conductor, _rx) = conductor(backend);
        let session_id = conductor.open_thread(&ThreadId::new("t1"));

        let handle = conductor
            .start("question", None, Some(session_id.clone()))
            .unwrap();
        assert!(!handle.outcome().await.is_committed());

        let session = conductor.session(&session_id).unwrap();
        assert!(!session.is_busy());
        assert_eq!(conductor.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_first_turn_leaves_no_session() {
        let (conductor, mut rx) = conductor(MockBackend::with_body(&body(&[AGENT_X])).hanging());

        let handle = conductor.start("question", None, None).unwrap();
        wait_for_update(&mut rx).await;
        handle.cancel();
        assert!(matches!(handle.outcome().await, TurnOutcome::Cancelled));

        assert!(conductor.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_caller_not_reading() {
        let config = ConductorConfig {
            read_timeout: None,
            ..ConductorConfig::default()
        };
        // Room for TurnStarted only; nobody drains the channel
        let (conductor, _rx) = conductor_with_capacity(busy_agents_backend(), config, 1);
        let session_id = conductor.open_thread(&ThreadId::new("t-slow"));

        let handle = conductor
            .start("question", None, Some(session_id.clone()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(2), handle.outcome()).await;
        assert!(matches!(outcome, Ok(TurnOutcome::Cancelled)), "got {outcome:?}");

        let session = conductor.session(&session_id).unwrap();
        assert!(!session.is_busy());
        assert!(session.turns().is_empty());
    }

    #[tokio::test]
    async fn test_idle_timeout_while_caller_not_reading() {
        let config = ConductorConfig {
            read_timeout: Some(Duration::from_millis(100)),
            ..ConductorConfig::default()
        };
        let (conductor, _rx) = conductor_with_capacity(busy_agents_backend(), config, 1);
        let session_id = conductor.open_thread(&ThreadId::new("t-slow"));

        let handle = conductor
            .start("question", None, Some(session_id.clone()))
            .unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(2), handle.outcome()).await;
        match outcome {
            Ok(TurnOutcome::Failed(TurnError::Timeout(limit))) => {
                assert_eq!(limit, Duration::from_millis(100));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(!conductor.session(&session_id).unwrap().is_busy());
    }

    #[tokio::test]
    async fn test_stalled_refresh_does_not_hold_back_commit() {
        let backend = MockBackend {
            list_hang: true,
            ..MockBackend::with_body(&body(&[
                AGENT_X,
                r#"{"type":"complete","thread_id":"t1","updated_title":"Lunch"}"#,
                END,
            ]))
        };
        let config = ConductorConfig {
            read_timeout: Some(Duration::from_millis(100)),
            ..ConductorConfig::default()
        };
        let (conductor, mut rx) = conductor_with(backend, config);

        let handle = conductor.start("lunch?", None, None).unwrap();
        let session_id = handle.session_id.clone();
        let outcome = tokio::time::timeout(Duration::from_secs(2), handle.outcome()).await;
        assert!(matches!(outcome, Ok(TurnOutcome::Committed { .. })), "got {outcome:?}");

        assert_eq!(conductor.backend().list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(conductor.session(&session_id).unwrap().title, "Lunch");
        let messages = drain(&mut rx);
        assert!(!messages
            .iter()
            .any(|m| matches!(m, ConductorMessage::SessionsRefreshed { .. })));
        assert!(matches!(
            messages.last(),
            Some(ConductorMessage::TurnCommitted { .. })
        ));
    }

    #[tokio::test]
    async fn test_second_turn_continues_thread() {
        let (conductor, _rx) =
            conductor(MockBackend::with_body(&body(&[AGENT_X, COMPLETE_T1, END])));

        let first = conductor.start("one", Some("gpt-4o"), None).unwrap();
        let session_id = first.session_id.clone();
        assert!(first.outcome().await.is_committed());

        let second = conductor
            .start("two", None, Some(session_id.clone()))
            .unwrap();
        assert!(matches!(
            second.outcome().await,
            TurnOutcome::Committed { turn_index: 1, .. }
        ));

        let requests = conductor.backend().requests.lock().clone();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].thread_id, None);
        assert_eq!(requests[0].model, "gpt-4o");
        assert_eq!(requests[1].thread_id, Some(ThreadId::new("t1")));
        assert_eq!(requests[1].model, ConductorConfig::default().default_model);

        let session = conductor.session(&session_id).unwrap();
        assert_eq!(session.turns().len(), 2);
        assert_eq!(session.message_count, 4);
    }

    #[tokio::test]
    async fn test_metadata_refresh_is_coalesced() {
        let backend = MockBackend::with_body(&body(&[
            r#"{"type":"title_updated","title":"Voting on lunch"}"#,
            AGENT_X,
            r#"{"type":"complete","thread_id":"t1","updated_title":"Voting on lunch"}"#,
            END,
        ]));
        backend.listing.lock().push(SessionSummary {
            thread_id: ThreadId::new("t1"),
            title: "Voting on lunch".to_string(),
            updated_at: None,
            message_count: 2,
            last_message_at: None,
        });
        let (conductor, mut rx) = conductor(backend);

        let handle = conductor.start("lunch?", None, None).unwrap();
        let session_id = handle.session_id.clone();
        assert!(handle.outcome().await.is_committed());

        assert_eq!(conductor.backend().list_calls.load(Ordering::SeqCst), 1);
        let session = conductor.session(&session_id).unwrap();
        assert_eq!(session.title, "Voting on lunch");
        assert_eq!(conductor.sessions().len(), 1);

        let messages = drain(&mut rx);
        let requested = messages
            .iter()
            .filter(|m| matches!(m, ConductorMessage::MetadataRefreshRequested { .. }))
            .count();
        assert_eq!(requested, 2);
        assert!(messages
            .iter()
            .any(|m| matches!(m, ConductorMessage::SessionsRefreshed { count: 1 })));
    }

    #[tokio::test]
    async fn test_malformed_records_are_skipped() {
        let (conductor, _rx) = conductor(MockBackend::with_body(&body(&[
            "not json",
            r#"{"type":"heartbeat"}"#,
            AGENT_X,
            r#"{"type":"agent_response","response":"no agent"}"#,
            COMPLETE_T1,
            END,
        ])));

        let handle = conductor.start("question", None, None).unwrap();
        let session_id = handle.session_id.clone();
        assert!(handle.outcome().await.is_committed());
        let session = conductor.session(&session_id).unwrap();
        assert_eq!(session.turns()[0].agent_responses().len(), 1);
        assert_eq!(session.turns()[0].status(), TurnStatus::Complete);
    }

    #[tokio::test]
    async fn test_unterminated_tail_is_flushed() {
        let mut raw = body(&[AGENT_X, COMPLETE_T1]);
        raw.push_str("data: {\"type\":\"end\"}");
        let (conductor, _rx) = conductor(MockBackend::with_body(&raw));

        let handle = conductor.start("question", None, None).unwrap();
        assert!(handle.outcome().await.is_committed());
    }

    #[tokio::test]
    async fn test_commit_survives_late_close() {
        // complete without end, then the body closes
        let (conductor, _rx) = conductor(MockBackend::with_body(&body(&[AGENT_X, COMPLETE_T1])));
        let handle = conductor.start("question", None, None).unwrap();
        assert!(handle.outcome().await.is_committed());
    }

    #[tokio::test]
    async fn test_phase_messages_forwarded() {
        let (conductor, mut rx) = conductor(MockBackend::with_body(&body(&[
            r#"{"type":"phase_start","phase":"agents","message":"..."}"#,
            r#"{"type":"phase_start","phase":"voting"}"#,
            COMPLETE_T1,
            END,
        ])));
        let handle = conductor.start("question", None, None).unwrap();
        assert!(handle.outcome().await.is_committed());

        let phases: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|m| match m {
                ConductorMessage::PhaseStarted { phase, .. } => phase,
                _ => None,
            })
            .collect();
        assert_eq!(phases, vec!["agents", "voting"]);
    }

    #[tokio::test]
    async fn test_session_crud_pass_throughs() {
        let backend = MockBackend {
            history: serde_json::from_str(
                r#"[{"role":"user","content":"q1"},{"role":"assistant","content":"a1"}]"#,
            )
            .unwrap(),
            ..MockBackend::default()
        };
        let (conductor, _rx) = conductor(backend);

        let created = conductor.create_session().await.unwrap();
        let session = conductor.session(&created).unwrap();
        assert_eq!(session.title, "Fresh");
        assert!(session.history_loaded);

        conductor.rename_session(&created, "Renamed").await.unwrap();
        assert_eq!(conductor.session(&created).unwrap().title, "Renamed");
        assert_eq!(
            conductor.backend().renamed.lock().clone(),
            vec![(ThreadId::new("created"), "Renamed".to_string())]
        );

        let loaded = conductor.load_session(&ThreadId::new("old")).await.unwrap();
        let turns = conductor.session(&loaded).unwrap().turns().to_vec();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].final_response.as_deref(), Some("a1"));

        conductor.delete_session(&created).await.unwrap();
        assert!(conductor.session(&created).is_none());
        assert_eq!(
            conductor.backend().deleted.lock().clone(),
            vec![ThreadId::new("created")]
        );
    }

    #[tokio::test]
    async fn test_rename_requires_thread() {
        let (conductor, mut rx) = conductor(MockBackend::with_body(&body(&[AGENT_X])).hanging());
        let handle = conductor.start("question", None, None).unwrap();
        wait_for_update(&mut rx).await;

        assert!(matches!(
            conductor.rename_session(&handle.session_id, "x").await,
            Err(ConductorError::NoThread(_))
        ));
        assert!(matches!(
            conductor.delete_session(&handle.session_id).await,
            Err(ConductorError::Busy { .. })
        ));

        handle.cancel();
        handle.outcome().await;
    }
}

//! Session Management
//!
//! Local view of the voting-graph conversations: which sessions exist, their
//! titles and counters, and the committed history of each.
//!
//! # Design Philosophy
//!
//! A session gets a local [`SessionId`] the moment it exists on this side. The
//! server's [`ThreadId`] arrives later, inside the completion event of the
//! session's first turn, and is only adopted then.
//!
//! The store is the single writer of history. A turn enters a session's
//! history through [`SessionStore::commit`] and nowhere else, and `commit`
//! only accepts the session's in-flight turn once it is complete. Clearing
//! the in-flight pointer on commit makes a second commit of the same turn
//! impossible.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use thiserror::Error;

use crate::backend::{HistoryMessage, HistoryRole, SessionSummary};
use crate::messages::{SessionId, ThreadId, TurnId};
use crate::turn::{ConversationTurn, TurnStatus};

/// Title of a session the server has not named yet
pub const DEFAULT_SESSION_TITLE: &str = "New Chat";

/// Session store errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No session with this id
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    /// The session already has a turn streaming
    #[error("session {session_id} is busy with {in_flight}")]
    Busy {
        /// Busy session
        session_id: SessionId,
        /// Turn currently streaming
        in_flight: TurnId,
    },

    /// Only complete turns can be committed
    #[error("turn {turn_id} is {status:?}, not complete")]
    NotComplete {
        /// Rejected turn
        turn_id: TurnId,
        /// Its status
        status: TurnStatus,
    },

    /// The turn is not (or no longer) the session's in-flight turn
    #[error("turn {turn_id} is not in flight for session {session_id}")]
    NotInFlight {
        /// Session
        session_id: SessionId,
        /// Rejected turn
        turn_id: TurnId,
    },
}

/// A conversation session
#[derive(Clone, Debug, Serialize)]
pub struct Session {
    /// Local session ID
    pub id: SessionId,
    /// Server thread, once known
    pub thread_id: Option<ThreadId>,
    /// Display title
    pub title: String,
    /// Committed turns, oldest first
    turns: Vec<ConversationTurn>,
    /// Time of the newest message
    pub last_message_at: Option<DateTime<Utc>>,
    /// Stored messages (user and assistant count separately)
    pub message_count: u32,
    /// Whether `turns` reflects the server's history
    pub history_loaded: bool,
    /// Turn currently streaming, if any
    #[serde(skip)]
    in_flight: Option<TurnId>,
}

impl Session {
    fn new(thread_id: Option<ThreadId>, history_loaded: bool) -> Self {
        Self {
            id: SessionId::new(),
            thread_id,
            title: DEFAULT_SESSION_TITLE.to_string(),
            turns: Vec::new(),
            last_message_at: None,
            message_count: 0,
            history_loaded,
            in_flight: None,
        }
    }

    /// Committed turns, oldest first
    #[must_use]
    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    /// Turn currently streaming
    #[must_use]
    pub fn in_flight(&self) -> Option<&TurnId> {
        self.in_flight.as_ref()
    }

    /// Whether a turn is streaming
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    fn apply_summary(&mut self, summary: &SessionSummary) {
        self.title.clone_from(&summary.title);
        self.message_count = summary.message_count;
        if let Some(at) = summary.last_message_at.or(summary.updated_at) {
            self.last_message_at = Some(at);
        }
    }
}

/// Every session this client knows, in creation order
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: IndexMap<SessionId, Session>,
}

impl SessionStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session that has no server thread yet
    pub fn open_new(&mut self) -> SessionId {
        self.insert(Session::new(None, true))
    }

    /// Find or create the local session for a server thread
    pub fn open_thread(&mut self, thread_id: &ThreadId) -> SessionId {
        if let Some(session) = self.find_by_thread(thread_id) {
            return session.id.clone();
        }
        self.insert(Session::new(Some(thread_id.clone()), false))
    }

    fn insert(&mut self, session: Session) -> SessionId {
        let id = session.id.clone();
        tracing::debug!(session_id = %id, thread_id = ?session.thread_id, "Session opened");
        self.sessions.insert(id.clone(), session);
        id
    }

    fn get_mut(&mut self, session_id: &SessionId) -> Result<&mut Session, StoreError> {
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::UnknownSession(session_id.clone()))
    }

    /// Mark a turn as streaming in a session
    ///
    /// # Errors
    ///
    /// [`StoreError::Busy`] if another turn is in flight,
    /// [`StoreError::UnknownSession`] for an unknown session.
    pub fn begin_turn(
        &mut self,
        session_id: &SessionId,
        turn_id: &TurnId,
    ) -> Result<(), StoreError> {
        let session = self.get_mut(session_id)?;
        if let Some(ref in_flight) = session.in_flight {
            return Err(StoreError::Busy {
                session_id: session_id.clone(),
                in_flight: in_flight.clone(),
            });
        }
        session.in_flight = Some(turn_id.clone());
        Ok(())
    }

    /// Append a completed turn to its session's history
    ///
    /// Returns the turn's index in the history.
    ///
    /// # Errors
    ///
    /// Rejects turns that are not complete or not the session's in-flight
    /// turn; history is untouched in that case.
    pub fn commit(
        &mut self,
        session_id: &SessionId,
        turn: ConversationTurn,
    ) -> Result<usize, StoreError> {
        let session = self.get_mut(session_id)?;

        let status = turn.status();
        if status != TurnStatus::Complete {
            return Err(StoreError::NotComplete {
                turn_id: turn.id,
                status,
            });
        }
        if session.in_flight.as_ref() != Some(&turn.id) {
            return Err(StoreError::NotInFlight {
                session_id: session_id.clone(),
                turn_id: turn.id,
            });
        }

        session.in_flight = None;
        session.last_message_at = Some(Utc::now());
        session.message_count += 2;
        session.turns.push(turn);
        Ok(session.turns.len() - 1)
    }

    /// Release the busy guard for a turn that ended without a commit
    ///
    /// Returns `true` if the pointer still named this turn. Idempotent.
    pub fn finish_turn(&mut self, session_id: &SessionId, turn_id: &TurnId) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(session) if session.in_flight.as_ref() == Some(turn_id) => {
                session.in_flight = None;
                true
            }
            _ => false,
        }
    }

    /// Give a session its server thread id, if it has none yet
    ///
    /// Returns `true` when the id was adopted.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownSession`] for an unknown session.
    pub fn adopt_thread(
        &mut self,
        session_id: &SessionId,
        thread_id: ThreadId,
    ) -> Result<bool, StoreError> {
        let session = self.get_mut(session_id)?;
        match session.thread_id {
            Some(ref existing) => {
                if *existing != thread_id {
                    tracing::warn!(
                        session_id = %session_id,
                        existing = %existing,
                        offered = %thread_id,
                        "Ignoring different thread id for session"
                    );
                }
                Ok(false)
            }
            None => {
                session.thread_id = Some(thread_id);
                Ok(true)
            }
        }
    }

    /// Merge a server session listing into local metadata
    ///
    /// Known threads get their title, count and timestamp refreshed; unseen
    /// threads become sessions without loaded history. Returns how many new
    /// sessions were recorded.
    pub fn apply_summaries(&mut self, summaries: &[SessionSummary]) -> usize {
        let mut added = 0;
        for summary in summaries {
            let existing = self
                .sessions
                .values_mut()
                .find(|s| s.thread_id.as_ref() == Some(&summary.thread_id));

            match existing {
                Some(session) => session.apply_summary(summary),
                None => {
                    let mut session = Session::new(Some(summary.thread_id.clone()), false);
                    session.apply_summary(summary);
                    self.insert(session);
                    added += 1;
                }
            }
        }
        added
    }

    /// Replace a session's history with turns loaded from the server
    ///
    /// # Errors
    ///
    /// [`StoreError::Busy`] while a turn is streaming in the session.
    pub fn replace_history(
        &mut self,
        session_id: &SessionId,
        turns: Vec<ConversationTurn>,
    ) -> Result<(), StoreError> {
        let session = self.get_mut(session_id)?;
        if let Some(ref in_flight) = session.in_flight {
            return Err(StoreError::Busy {
                session_id: session_id.clone(),
                in_flight: in_flight.clone(),
            });
        }
        session.turns = turns;
        session.history_loaded = true;
        Ok(())
    }

    /// Forget a session and its local history
    pub fn remove(&mut self, session_id: &SessionId) -> Option<Session> {
        self.sessions.shift_remove(session_id)
    }

    /// Forget a session that never got a server thread or a committed turn
    ///
    /// Returns `true` when the session was removed. Sessions with a turn in
    /// flight are kept.
    pub fn discard_if_unused(&mut self, session_id: &SessionId) -> bool {
        let unused = self.sessions.get(session_id).is_some_and(|session| {
            session.thread_id.is_none() && session.turns.is_empty() && session.in_flight.is_none()
        });
        if unused {
            self.sessions.shift_remove(session_id);
            tracing::debug!(session_id = %session_id, "Discarded unused session");
        }
        unused
    }

    /// Set a session's title locally
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownSession`] for an unknown session.
    pub fn set_title(
        &mut self,
        session_id: &SessionId,
        title: impl Into<String>,
    ) -> Result<(), StoreError> {
        self.get_mut(session_id)?.title = title.into();
        Ok(())
    }

    /// Look up a session
    #[must_use]
    pub fn session(&self, session_id: &SessionId) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    /// Look up the session bound to a server thread
    #[must_use]
    pub fn find_by_thread(&self, thread_id: &ThreadId) -> Option<&Session> {
        self.sessions
            .values()
            .find(|s| s.thread_id.as_ref() == Some(thread_id))
    }

    /// Turn currently streaming in a session
    #[must_use]
    pub fn in_flight(&self, session_id: &SessionId) -> Option<&TurnId> {
        self.sessions.get(session_id).and_then(Session::in_flight)
    }

    /// Copy of every session, in creation order
    #[must_use]
    pub fn snapshot(&self) -> Vec<Session> {
        self.sessions.values().cloned().collect()
    }

    /// Number of sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Rebuild committed turns from a thread's stored messages
///
/// Each user message followed by an assistant message becomes one turn whose
/// final answer is the assistant text. A trailing user message without an
/// answer still becomes a turn, with no final answer.
#[must_use]
pub fn turns_from_history(messages: &[HistoryMessage]) -> Vec<ConversationTurn> {
    let mut turns = Vec::new();
    let mut iter = messages.iter().peekable();

    while let Some(message) = iter.next() {
        match message.role {
            HistoryRole::User => {
                let answer = iter
                    .next_if(|next| next.role == HistoryRole::Assistant)
                    .map(|next| next.content.clone());
                turns.push(ConversationTurn::from_history(
                    message.content.clone(),
                    message.timestamp.unwrap_or_else(Utc::now),
                    answer,
                ));
            }
            HistoryRole::Assistant | HistoryRole::Other => {
                tracing::debug!(role = ?message.role, "Skipping unpaired history message");
            }
        }
    }

    turns
}

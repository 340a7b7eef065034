//! Conductor Messages
//!
//! Identifiers shared across the crate, and the updates the Conductor sends to
//! whoever started a turn (a CLI, a UI surface, a test harness).
//!
//! # Design Philosophy
//!
//! The Conductor owns the in-flight turn. Callers never touch it directly; they
//! observe it through [`ConductorMessage`] snapshots and the final
//! [`crate::conductor::TurnOutcome`]. Surfaces stay pure renderers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::turn::ConversationTurn;

/// Local session identifier
///
/// Assigned by the client as soon as a session exists locally, before the
/// server has issued a thread id for it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new unique session ID
    ///
    /// Uses an atomic counter combined with timestamp to ensure uniqueness
    /// even when multiple sessions are created in the same millisecond.
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::time::{SystemTime, UNIX_EPOCH};

        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let count = COUNTER.fetch_add(1, Ordering::SeqCst);
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(format!("session_{timestamp}_{count}"))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-issued conversation thread identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(pub String);

impl ThreadId {
    /// Wrap a server thread id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ThreadId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ThreadId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Turn identifier (one per submitted user message)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(pub String);

impl TurnId {
    /// Generate a new unique turn ID
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        Self(format!("turn_{id}"))
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Messages from the Conductor to the caller that started a turn
///
/// Sent in strict order for a given turn. `TurnUpdated` carries a full
/// snapshot so receivers never have to replay events themselves.
#[derive(Clone, Debug, Serialize)]
pub enum ConductorMessage {
    // ============================================
    // Turn lifecycle
    // ============================================
    /// A turn was accepted and its request is being opened
    TurnStarted {
        /// The new turn
        turn_id: TurnId,
        /// Local session the turn belongs to
        session_id: SessionId,
    },

    /// The in-flight turn changed
    TurnUpdated {
        /// Snapshot after the change
        turn: ConversationTurn,
    },

    /// The server announced a new phase (advisory)
    PhaseStarted {
        /// Turn the phase belongs to
        turn_id: TurnId,
        /// Phase name as sent by the server (`agents`, `voting`, `decision`, ...)
        phase: Option<String>,
        /// Human-readable status line, if any
        message: Option<String>,
    },

    /// The turn completed and was appended to its session's history
    TurnCommitted {
        /// Committed turn
        turn_id: TurnId,
        /// Owning session
        session_id: SessionId,
        /// Position in the session history
        turn_index: usize,
    },

    /// The turn failed and was discarded
    TurnFailed {
        /// Failed turn
        turn_id: TurnId,
        /// Error description surfaced to the user
        error: String,
    },

    /// The turn was cancelled (by the caller) and discarded
    TurnCancelled {
        /// Cancelled turn
        turn_id: TurnId,
    },

    // ============================================
    // Session metadata
    // ============================================
    /// A session learned its server thread id
    ThreadAdopted {
        /// Local session
        session_id: SessionId,
        /// Thread id supplied by the completion event
        thread_id: ThreadId,
    },

    /// The server signalled that session titles changed
    MetadataRefreshRequested {
        /// Session whose turn carried the signal
        session_id: SessionId,
        /// New title, when the server included it
        title: Option<String>,
    },

    /// Session metadata was re-fetched from the server
    SessionsRefreshed {
        /// Number of sessions the server listed
        count: usize,
    },
}

impl ConductorMessage {
    /// Turn this message is about, if it is turn-scoped
    #[must_use]
    pub fn turn_id(&self) -> Option<&TurnId> {
        match self {
            Self::TurnStarted { turn_id, .. }
            | Self::PhaseStarted { turn_id, .. }
            | Self::TurnCommitted { turn_id, .. }
            | Self::TurnFailed { turn_id, .. }
            | Self::TurnCancelled { turn_id } => Some(turn_id),
            Self::TurnUpdated { turn } => Some(&turn.id),
            Self::ThreadAdopted { .. }
            | Self::MetadataRefreshRequested { .. }
            | Self::SessionsRefreshed { .. } => None,
        }
    }

    /// Whether this message ends a turn's lifecycle
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::TurnCommitted { .. } | Self::TurnFailed { .. } | Self::TurnCancelled { .. }
        )
    }
}

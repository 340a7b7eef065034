//! Voting Stream Events
//!
//! Typed events decoded from `data:` records. The set is closed: anything the
//! server sends that does not map onto a [`VotingEvent`] variant is a
//! [`ProtocolError`] and gets skipped, never fatal.
//!
//! # Event Flow
//!
//! ```text
//! start ─► phase_start(agents) ─► agent_response × N
//!       ─► phase_start(voting) ─► voting_results
//!       ─► phase_start(decision) ─► final_response
//!       ─► title_updated? ─► complete ─► end
//! ```
//!
//! An `error` record may replace anything after `start`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::frame::EventRecord;
use crate::messages::ThreadId;
use crate::turn::VotingResults;

/// Discriminants the interpreter understands
pub const KNOWN_EVENT_TYPES: [&str; 9] = [
    "start",
    "phase_start",
    "agent_response",
    "voting_results",
    "final_response",
    "complete",
    "title_updated",
    "error",
    "end",
];

/// A record that could not be turned into a [`VotingEvent`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Payload is not JSON, has no `type`, or lacks a required field
    #[error("malformed record: {reason}")]
    Malformed {
        /// Parser diagnostic
        reason: String,
    },

    /// Payload has a `type` this client does not know
    #[error("unknown event type `{0}`")]
    UnknownType(String),
}

/// Events of one streamed voting turn
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VotingEvent {
    /// The server accepted the message (advisory)
    Start {
        /// Status line
        #[serde(default)]
        message: Option<String>,
        /// Thread the server is using; not authoritative until `complete`
        #[serde(default)]
        thread_id: Option<ThreadId>,
    },

    /// A new phase began (advisory)
    PhaseStart {
        /// Phase name (`agents`, `voting`, `decision`)
        #[serde(default)]
        phase: Option<String>,
        /// Status line
        #[serde(default)]
        message: Option<String>,
    },

    /// One agent produced (or replaced) its answer
    AgentResponse {
        /// Agent identifier, the upsert key
        #[serde(rename = "agent")]
        agent_id: String,
        /// Display name
        #[serde(default)]
        agent_name: Option<String>,
        /// Answer text
        response: String,
    },

    /// Cross-voting finished
    VotingResults {
        /// `{voter: {candidate: {score, reason}}}`
        voting_results: VotingResults,
    },

    /// The synthesized answer
    FinalResponse {
        /// Answer text
        response: String,
    },

    /// The turn is done and persisted server-side
    Complete {
        /// Authoritative thread id
        #[serde(default)]
        thread_id: Option<ThreadId>,
        /// Set when this turn generated the session title
        #[serde(default)]
        updated_title: Option<String>,
    },

    /// The session title changed
    TitleUpdated {
        /// New title, when included
        #[serde(default)]
        title: Option<String>,
    },

    /// The server failed the turn
    Error {
        /// Error description
        message: String,
    },

    /// End-of-stream marker
    End {
        /// Echoed thread id (ignored)
        #[serde(default)]
        thread_id: Option<ThreadId>,
    },
}

impl VotingEvent {
    /// Wire discriminant of this event
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::PhaseStart { .. } => "phase_start",
            Self::AgentResponse { .. } => "agent_response",
            Self::VotingResults { .. } => "voting_results",
            Self::FinalResponse { .. } => "final_response",
            Self::Complete { .. } => "complete",
            Self::TitleUpdated { .. } => "title_updated",
            Self::Error { .. } => "error",
            Self::End { .. } => "end",
        }
    }

    /// Encode as a `data:` line (used by test servers and fixtures)
    #[must_use]
    pub fn to_record_line(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("data: {json}\n\n")
    }
}

/// Parse one record into an event
///
/// # Errors
///
/// Returns [`ProtocolError::UnknownType`] for a well-formed record with an
/// unrecognised `type`, and [`ProtocolError::Malformed`] for everything else
/// that does not fit a variant.
pub fn interpret(record: &EventRecord) -> Result<VotingEvent, ProtocolError> {
    let value: Value =
        serde_json::from_str(&record.payload).map_err(|e| ProtocolError::Malformed {
            reason: e.to_string(),
        })?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed {
            reason: "missing string field `type`".to_string(),
        })?;

    if !KNOWN_EVENT_TYPES.contains(&kind) {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
        reason: e.to_string(),
    })
}

/// Record interpreter with local recovery
///
/// Wraps [`interpret`]: failures are logged and counted, and the caller just
/// moves on to the next record.
#[derive(Debug, Default)]
pub struct EventInterpreter {
    accepted: u64,
    skipped: u64,
}

impl EventInterpreter {
    /// Create an interpreter with zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpret a record, skipping it on protocol errors
    pub fn accept(&mut self, record: &EventRecord) -> Option<VotingEvent> {
        match interpret(record) {
            Ok(event) => {
                self.accepted += 1;
                Some(event)
            }
            Err(e) => {
                self.skipped += 1;
                tracing::warn!(
                    error = %e,
                    payload = %truncate(&record.payload, 200),
                    "Skipping unparseable stream record"
                );
                None
            }
        }
    }

    /// Records turned into events so far
    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Records skipped so far
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

/// Shorten a payload for diagnostics without splitting a character
fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

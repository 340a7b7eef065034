//! Conversation Turns
//!
//! A turn is one user message and everything the voting graph streams back
//! for it: per-agent answers, the cross-voting table, and the final answer.
//!
//! # State Machine
//!
//! ```text
//! Pending ──first event──► Streaming ──complete──► Complete
//!                              │
//!                              └──error / end──► Failed
//! ```
//!
//! Transitions only move forward. [`reduce`] is a pure function from
//! `(turn, event)` to the next turn plus the [`TurnEffect`]s the owner has to
//! carry out (commit, adopt a thread id, refresh metadata, stop reading).

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::events::VotingEvent;
use crate::messages::{ThreadId, TurnId};

/// One voter's assessment of one candidate answer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    /// Score given by the voter
    pub score: f64,
    /// Justification
    #[serde(default)]
    pub reason: String,
}

/// `voter -> candidate -> vote`, in the order the server sent them
pub type VotingResults = IndexMap<String, IndexMap<String, Vote>>;

/// One agent's answer within a turn
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResponse {
    /// Agent identifier (unique within a turn)
    pub agent_id: String,
    /// Display name
    pub agent_name: String,
    /// Latest answer text
    pub response_text: String,
}

/// Lifecycle status of a turn
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnStatus {
    /// Submitted, nothing received yet
    Pending,
    /// At least one event applied
    Streaming,
    /// Completed; eligible for commit
    Complete,
    /// Failed; never committed
    Failed,
}

impl TurnStatus {
    /// Whether the turn's lifecycle is over
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// One user-message-to-final-answer cycle
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Turn identifier
    pub id: TurnId,
    /// What the user asked
    pub user_message: String,
    /// Model the turn was requested with
    pub model: String,
    /// When the message was submitted
    pub timestamp: DateTime<Utc>,
    /// Agent answers keyed by agent id, in first-appearance order
    agent_responses: IndexMap<String, AgentResponse>,
    /// Voting table (replaced wholesale)
    pub voting_results: Option<VotingResults>,
    /// Synthesized answer (last one wins)
    pub final_response: Option<String>,
    /// Lifecycle status
    status: TurnStatus,
}

impl ConversationTurn {
    /// Create a pending turn for a freshly submitted message
    pub fn new(user_message: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: TurnId::new(),
            user_message: user_message.into(),
            model: model.into(),
            timestamp: Utc::now(),
            agent_responses: IndexMap::new(),
            voting_results: None,
            final_response: None,
            status: TurnStatus::Pending,
        }
    }

    /// Rebuild a completed turn from stored history
    ///
    /// The history endpoint only keeps the user message and the final answer,
    /// so agent answers and votes are empty.
    pub fn from_history(
        user_message: impl Into<String>,
        timestamp: DateTime<Utc>,
        final_response: Option<String>,
    ) -> Self {
        Self {
            id: TurnId::new(),
            user_message: user_message.into(),
            model: String::new(),
            timestamp,
            agent_responses: IndexMap::new(),
            voting_results: None,
            final_response,
            status: TurnStatus::Complete,
        }
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> TurnStatus {
        self.status
    }

    /// Agent answers in first-appearance order
    pub fn agent_responses(&self) -> impl ExactSizeIterator<Item = &AgentResponse> {
        self.agent_responses.values()
    }

    /// Answer of one agent
    #[must_use]
    pub fn agent_response(&self, agent_id: &str) -> Option<&AgentResponse> {
        self.agent_responses.get(agent_id)
    }

    /// Insert or replace an agent answer, keeping its first position
    fn upsert_agent_response(
        &mut self,
        agent_id: String,
        agent_name: Option<String>,
        text: String,
    ) {
        if let Some(existing) = self.agent_responses.get_mut(&agent_id) {
            existing.response_text = text;
            if let Some(name) = agent_name {
                existing.agent_name = name;
            }
            return;
        }

        let agent_name = agent_name.unwrap_or_else(|| agent_id.clone());
        self.agent_responses.insert(
            agent_id.clone(),
            AgentResponse {
                agent_id,
                agent_name,
                response_text: text,
            },
        );
    }
}

/// Why a turn failed, as decided by the reducer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailReason {
    /// The server sent an `error` record
    Server(String),
    /// `end` arrived before `complete`
    PrematureEnd,
}

/// Side effects requested by a reduction
#[derive(Clone, Debug, PartialEq)]
pub enum TurnEffect {
    /// Hand the (now complete) turn to the session store
    Commit,
    /// Adopt this thread id if the session has none
    AdoptThread(ThreadId),
    /// Re-fetch session metadata from the server
    RefreshMetadata {
        /// New title, when the server included one
        title: Option<String>,
    },
    /// Advisory phase change
    Phase {
        /// Phase name
        phase: Option<String>,
        /// Status line
        message: Option<String>,
    },
    /// The turn failed
    Fail(FailReason),
    /// Stop consuming the stream
    Stop,
}

/// Result of applying one event
#[derive(Clone, Debug, PartialEq)]
pub struct Reduction {
    /// The turn after the event
    pub turn: ConversationTurn,
    /// Effects to carry out, in order
    pub effects: Vec<TurnEffect>,
    /// Whether the turn itself changed (content or status)
    pub changed: bool,
}

impl Reduction {
    /// Whether the owner should stop reading
    #[must_use]
    pub fn stops(&self) -> bool {
        self.effects.contains(&TurnEffect::Stop)
    }
}

/// Apply one event to a turn
pub fn reduce(mut turn: ConversationTurn, event: VotingEvent) -> Reduction {
    let mut effects = Vec::new();
    let mut changed = false;

    if turn.status == TurnStatus::Pending {
        turn.status = TurnStatus::Streaming;
        changed = true;
    }
    let terminal = turn.status.is_terminal();
    let kind = event.kind();

    match event {
        VotingEvent::Start { .. } => {}

        VotingEvent::PhaseStart { phase, message } => {
            effects.push(TurnEffect::Phase { phase, message });
        }

        VotingEvent::AgentResponse {
            agent_id,
            agent_name,
            response,
        } => {
            if terminal {
                ignored(&turn, kind);
            } else {
                turn.upsert_agent_response(agent_id, agent_name, response);
                changed = true;
            }
        }

        VotingEvent::VotingResults { voting_results } => {
            if terminal {
                ignored(&turn, kind);
            } else {
                turn.voting_results = Some(voting_results);
                changed = true;
            }
        }

        VotingEvent::FinalResponse { response } => {
            if terminal {
                ignored(&turn, kind);
            } else {
                turn.final_response = Some(response);
                changed = true;
            }
        }

        VotingEvent::Complete {
            thread_id,
            updated_title,
        } => {
            if terminal {
                ignored(&turn, kind);
            } else {
                turn.status = TurnStatus::Complete;
                changed = true;
                effects.push(TurnEffect::Commit);
                if let Some(thread_id) = thread_id {
                    effects.push(TurnEffect::AdoptThread(thread_id));
                }
                if let Some(title) = updated_title {
                    effects.push(TurnEffect::RefreshMetadata { title: Some(title) });
                }
            }
        }

        VotingEvent::TitleUpdated { title } => {
            effects.push(TurnEffect::RefreshMetadata { title });
        }

        VotingEvent::Error { message } => {
            if terminal {
                tracing::warn!(
                    turn_id = %turn.id,
                    status = ?turn.status,
                    error = %message,
                    "Server error after turn finished"
                );
            } else {
                turn.status = TurnStatus::Failed;
                changed = true;
                effects.push(TurnEffect::Fail(FailReason::Server(message)));
            }
            effects.push(TurnEffect::Stop);
        }

        VotingEvent::End { .. } => {
            if !terminal {
                turn.status = TurnStatus::Failed;
                changed = true;
                effects.push(TurnEffect::Fail(FailReason::PrematureEnd));
            }
            effects.push(TurnEffect::Stop);
        }
    }

    Reduction {
        turn,
        effects,
        changed,
    }
}

/// Apply a sequence of events, stopping at the first `Stop`
///
/// Returns the final turn and every effect produced along the way.
pub fn replay(
    turn: ConversationTurn,
    events: impl IntoIterator<Item = VotingEvent>,
) -> (ConversationTurn, Vec<TurnEffect>) {
    let mut turn = turn;
    let mut effects = Vec::new();
    for event in events {
        let reduction = reduce(turn, event);
        let stop = reduction.stops();
        turn = reduction.turn;
        effects.extend(reduction.effects);
        if stop {
            break;
        }
    }
    (turn, effects)
}

fn ignored(turn: &ConversationTurn, kind: &str) {
    tracing::debug!(
        turn_id = %turn.id,
        status = ?turn.status,
        event = kind,
        "Ignoring event for finished turn"
    );
}

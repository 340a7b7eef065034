//! Votechat Core - Streaming Client for Multi-Agent Voting Conversations
//!
//! This crate consumes the voting-graph server's event stream: several agents
//! answer a question, vote on each other's answers, and a final answer is
//! synthesized. It turns that stream into an ordered conversation history,
//! independent of any UI. It can drive a CLI, a UI surface, or run headless
//! for tests.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    Callers (CLI / UI / tests)                    │
//! │        start() / cancel()  ▲  ConductorMessage, TurnOutcome      │
//! └────────────────────────────┼─────────────────────────────────────┘
//!                              │
//! ┌────────────────────────────┼─────────────────────────────────────┐
//! │                       VOTECHAT CORE                              │
//! │  ┌─────────────────────────┴──────────────────────────────────┐  │
//! │  │                       Conductor                            │  │
//! │  │  bytes ─► FrameDecoder ─► EventInterpreter ─► reduce()     │  │
//! │  │                                                │           │  │
//! │  │                              commit ─► SessionStore        │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! │                 │                               │                │
//! │            ChatBackend                   SessionDirectory        │
//! └─────────────────┼───────────────────────────────┼────────────────┘
//!                   └──────── HttpBackend ──────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Conductor`]: owns turn lifecycles and session operations
//! - [`ConversationTurn`]: one question and everything streamed back for it
//! - [`VotingEvent`]: the closed set of stream events
//! - [`SessionStore`]: committed history per session
//! - [`HttpBackend`]: reqwest client for the voting-graph server
//!
//! # Quick Start
//!
//! ```ignore
//! use votechat_core::{load_config, Conductor, ConductorConfig, HttpBackend, TurnOutcome};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config()?;
//!     let backend = HttpBackend::from_config(&config)?;
//!     let (tx, mut rx) = mpsc::channel(config.update_buffer);
//!     let conductor = Conductor::new(backend, ConductorConfig::from_config(&config), tx);
//!
//!     let handle = conductor.start("Which language should we use?", None, None)?;
//!     while let Some(msg) = rx.recv().await {
//!         // Render msg
//!         if msg.is_terminal() {
//!             break;
//!         }
//!     }
//!     let outcome = handle.outcome().await;
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`frame`]: byte chunks to `data:` records
//! - [`events`]: records to typed [`VotingEvent`]s
//! - [`turn`]: the turn model and its pure reducer
//! - [`session`]: sessions and committed history
//! - [`conductor`]: the orchestrator
//! - [`backend`]: server traits and the HTTP implementation
//! - [`messages`]: identifiers and caller-facing updates
//! - [`config`]: layered configuration (CLI, env, TOML, defaults)

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod conductor;
pub mod config;
pub mod events;
pub mod frame;
pub mod messages;
pub mod session;
pub mod turn;

// Re-exports for convenience
pub use backend::{
    BackendError, ChatBackend, HistoryMessage, HistoryRole, HttpBackend, SessionDirectory,
    SessionSummary, StreamRequest,
};
pub use conductor::{
    Conductor, ConductorConfig, ConductorError, TurnError, TurnHandle, TurnOutcome,
};
pub use events::{interpret, EventInterpreter, ProtocolError, VotingEvent};
pub use frame::{EventRecord, FrameDecoder};
pub use messages::{ConductorMessage, SessionId, ThreadId, TurnId};
pub use session::{turns_from_history, Session, SessionStore, StoreError};
pub use turn::{
    reduce, AgentResponse, ConversationTurn, Reduction, TurnEffect, TurnStatus, Vote,
    VotingResults,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, VoteChatConfig, VoteChatToml,
};

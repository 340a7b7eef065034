//! Voting-Graph Server Integration
//!
//! Network collaborators of the Conductor, behind two traits:
//!
//! - [`ChatBackend`]: opens the streaming request for one turn
//! - [`SessionDirectory`]: session list, create, rename, delete, history
//!
//! [`HttpBackend`] implements both against the real server.
//!
//! # Usage
//!
//! ```ignore
//! use votechat_core::backend::{ChatBackend, HttpBackend, StreamRequest};
//!
//! let backend = HttpBackend::new("http://localhost:8000", Duration::from_secs(10))?;
//! let body = backend.open_stream(&StreamRequest::new("Hello!", "gpt-4o-mini")).await?;
//! ```

mod http;
mod traits;

pub use http::HttpBackend;
pub use traits::{
    parse_server_time, BackendError, ByteStream, ChatBackend, CreatedSession, HistoryMessage,
    HistoryRole, SessionDirectory, SessionSummary, StreamRequest,
};

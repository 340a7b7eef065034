//! votechat - Command-line surface for voting-graph conversations
//!
//! Sends a question to the voting-graph server and prints the agents'
//! answers, the voting table and the final answer as they stream in.
//!
//! # Usage
//!
//! ```bash
//! # Ask in a new session
//! votechat chat "Which database fits a small team?"
//!
//! # Continue an existing server thread with another model
//! votechat chat "And for analytics?" --session 3f2a... --model gpt-4o
//!
//! # Session management
//! votechat sessions list
//! votechat sessions show 3f2a...
//! votechat sessions rename 3f2a... "Databases"
//!
//! # Verbose logging (stderr)
//! RUST_LOG=debug votechat chat "hi"
//! ```
//!
//! # Signals
//!
//! - `SIGINT` (Ctrl-C): cancels the streaming turn; nothing is recorded

mod render;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};

use votechat_core::{
    default_config_path, load_config_from_path, Conductor, ConductorConfig, ConfigOverrides,
    HttpBackend, ThreadId, TurnOutcome, VoteChatConfig,
};

use render::TurnRenderer;

/// votechat - multi-agent voting conversations from the terminal
#[derive(Parser, Debug)]
#[command(name = "votechat")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "VOTECHAT_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Server base URL (overrides config and environment)
    #[arg(long, value_name = "URL", global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ask the voting graph a question
    Chat {
        /// The question
        message: String,

        /// Server thread to continue
        #[arg(short, long, value_name = "THREAD_ID")]
        session: Option<String>,

        /// Model to request
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Manage server sessions
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },
}

#[derive(Subcommand, Debug)]
enum SessionsAction {
    /// List sessions
    List,
    /// Create an empty session
    Create,
    /// Rename a session
    Rename {
        /// Thread id
        id: String,
        /// New title
        title: String,
    },
    /// Delete a session
    Delete {
        /// Thread id
        id: String,
    },
    /// Print a session's stored history
    Show {
        /// Thread id
        id: String,
    },
}

fn resolve_config(args: &Args) -> Result<VoteChatConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(ref url) = args.base_url {
        overrides = overrides.with_base_url(url.clone());
    }
    overrides.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        base_url = %config.base_url,
        model = %config.default_model,
        source = %config.source(),
        "Configuration resolved"
    );
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the transcript
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("votechat=info".parse()?)
                .add_directive("votechat_core=info".parse()?),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = resolve_config(&args)?;

    let backend = HttpBackend::from_config(&config).context("Failed to create HTTP client")?;
    let (tx, rx) = mpsc::channel(config.update_buffer);
    let conductor = Conductor::new(backend, ConductorConfig::from_config(&config), tx);

    match args.command {
        Command::Chat {
            message,
            session,
            model,
        } => chat(&conductor, rx, message, session, model).await,
        Command::Sessions { action } => sessions(&conductor, action).await,
    }
}

async fn chat(
    conductor: &Conductor<HttpBackend>,
    mut rx: mpsc::Receiver<votechat_core::ConductorMessage>,
    message: String,
    session: Option<String>,
    model: Option<String>,
) -> Result<()> {
    let session_id = session.map(|thread| conductor.open_thread(&ThreadId::new(thread)));
    let handle = conductor.start(message, model.as_deref(), session_id)?;

    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling turn");
            cancel.cancel();
        }
    });

    let mut renderer = TurnRenderer::new();
    while let Some(update) = rx.recv().await {
        renderer.render(&update);
        if update.is_terminal() {
            break;
        }
    }

    match handle.outcome().await {
        TurnOutcome::Committed { thread_id, .. } => {
            if let Some(thread_id) = thread_id {
                println!("\n[session {thread_id}]");
            }
            Ok(())
        }
        TurnOutcome::Failed(e) => Err(e).context("Turn failed"),
        TurnOutcome::Cancelled => anyhow::bail!("Turn cancelled"),
    }
}

async fn sessions(conductor: &Conductor<HttpBackend>, action: SessionsAction) -> Result<()> {
    match action {
        SessionsAction::List => {
            let sessions = conductor.list_sessions().await?;
            if sessions.is_empty() {
                println!("No sessions");
            }
            for session in sessions {
                let thread = session
                    .thread_id
                    .as_ref()
                    .map_or_else(|| "-".to_string(), ToString::to_string);
                let last = session
                    .last_message_at
                    .map_or_else(|| "-".to_string(), |at| at.format("%Y-%m-%d %H:%M").to_string());
                println!(
                    "{thread}  {:<32}  {:>4} msgs  {last}",
                    session.title, session.message_count
                );
            }
        }
        SessionsAction::Create => {
            let session_id = conductor.create_session().await?;
            if let Some(session) = conductor.session(&session_id) {
                let thread = session.thread_id.map(|t| t.to_string()).unwrap_or_default();
                println!("{thread}  {}", session.title);
            }
        }
        SessionsAction::Rename { id, title } => {
            let session_id = conductor.open_thread(&ThreadId::new(id));
            conductor.rename_session(&session_id, &title).await?;
            println!("Renamed to {title}");
        }
        SessionsAction::Delete { id } => {
            let session_id = conductor.open_thread(&ThreadId::new(id.clone()));
            conductor.delete_session(&session_id).await?;
            println!("Deleted {id}");
        }
        SessionsAction::Show { id } => {
            let session_id = conductor.load_session(&ThreadId::new(id)).await?;
            if let Some(session) = conductor.session(&session_id) {
                render::print_history(&session);
            }
        }
    }
    Ok(())
}

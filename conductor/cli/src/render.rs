//! Terminal rendering of turn updates
//!
//! Prints each piece of a turn once, as soon as it appears: agent answers
//! (again if an agent replaces its answer), the voting table, then the
//! final answer. Phase and metadata notices go to stderr.

use std::collections::HashMap;

use votechat_core::{ConductorMessage, ConversationTurn, Session, VotingResults};

/// Remembers what was already printed for the current turn
#[derive(Debug, Default)]
pub struct TurnRenderer {
    printed_agents: HashMap<String, String>,
    printed_votes: Option<VotingResults>,
    printed_final: Option<String>,
}

impl TurnRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render(&mut self, message: &ConductorMessage) {
        match message {
            ConductorMessage::TurnUpdated { turn } => self.render_turn(turn),
            ConductorMessage::PhaseStarted { phase, message, .. } => {
                let label = message.as_deref().or(phase.as_deref()).unwrap_or("...");
                eprintln!("-- {label}");
            }
            ConductorMessage::MetadataRefreshRequested {
                title: Some(title), ..
            } => eprintln!("-- title: {title}"),
            ConductorMessage::TurnFailed { error, .. } => eprintln!("!! {error}"),
            ConductorMessage::TurnCancelled { .. } => eprintln!("!! cancelled"),
            _ => {}
        }
    }

    fn render_turn(&mut self, turn: &ConversationTurn) {
        for response in turn.agent_responses() {
            let previous = self.printed_agents.get(&response.agent_id);
            if previous == Some(&response.response_text) {
                continue;
            }
            println!("\n## {}\n{}", response.agent_name, response.response_text);
            self.printed_agents
                .insert(response.agent_id.clone(), response.response_text.clone());
        }

        if turn.voting_results.is_some() && turn.voting_results != self.printed_votes {
            if let Some(ref votes) = turn.voting_results {
                print_votes(votes);
            }
            self.printed_votes.clone_from(&turn.voting_results);
        }

        if turn.final_response.is_some() && turn.final_response != self.printed_final {
            if let Some(ref answer) = turn.final_response {
                println!("\n== Final answer ==\n{answer}");
            }
            self.printed_final.clone_from(&turn.final_response);
        }
    }
}

fn print_votes(votes: &VotingResults) {
    println!("\n== Votes ==");
    for (voter, ballots) in votes {
        for (candidate, vote) in ballots {
            println!("{voter:>20} -> {candidate:<20} {:>5.1}  {}", vote.score, vote.reason);
        }
    }
}

/// Print a session's committed turns
pub fn print_history(session: &Session) {
    println!("# {}", session.title);
    for turn in session.turns() {
        println!("\n> {}", turn.user_message);
        match turn.final_response {
            Some(ref answer) => println!("{answer}"),
            None => println!("(no answer)"),
        }
    }
}

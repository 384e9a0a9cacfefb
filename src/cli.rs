//! Command-line interface for agentdeck.

use crate::client::SOCKET_ENV;
use crate::config::ServerArgs;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Session engine for long-running AI coding agents.
#[derive(Debug, Parser)]
#[command(name = "agentdeck", version, about)]
pub struct Cli {
    /// Path to the Unix socket.
    #[arg(long, env = SOCKET_ENV)]
    pub socket: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the server (usually auto-started by other commands).
    Server(ServerArgs),

    /// Create a session.
    Create {
        /// Agent kind (e.g. "claude", "shell").
        #[arg(long, short = 'k', default_value = "shell")]
        agent: String,

        /// Display label.
        #[arg(long, short)]
        label: Option<String>,

        /// Command typed into the shell once it is up.
        #[arg(long, short)]
        command: Option<String>,

        /// Working directory.
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Branch to run on.
        #[arg(long, short)]
        branch: Option<String>,

        /// Base for a new worktree branch.
        #[arg(long, requires = "worktree")]
        base_branch: Option<String>,

        /// Provision an isolated git worktree for --branch.
        #[arg(long, requires = "branch")]
        worktree: bool,

        /// Ticket id; a prompt for it is typed after the agent starts.
        #[arg(long)]
        ticket: Option<String>,

        /// Ticket title.
        #[arg(long, requires = "ticket", default_value = "")]
        ticket_title: String,

        /// Ticket URL.
        #[arg(long, requires = "ticket", default_value = "")]
        ticket_url: String,

        /// Prompt template ({{id}}, {{title}}, {{url}}).
        #[arg(long, requires = "ticket")]
        prompt_template: Option<String>,

        /// Canvas node id (defaults to the session id).
        #[arg(long)]
        node: Option<String>,

        /// Category id.
        #[arg(long)]
        category: Option<String>,

        /// Terminal rows.
        #[arg(long)]
        rows: Option<u16>,

        /// Terminal columns.
        #[arg(long)]
        cols: Option<u16>,
    },

    /// List sessions.
    List {
        /// Output in JSON format (for piping to jq).
        #[arg(long)]
        json: bool,
    },

    /// Show one session as JSON.
    Get {
        /// Session ID.
        id: String,
    },

    /// Start a new process for a disconnected session.
    Restart {
        /// Session ID.
        id: String,
    },

    /// Terminate a session's process and forget it.
    Delete {
        /// Session ID.
        id: String,
    },

    /// Change a session's annotations. An empty value clears the field.
    Patch {
        /// Session ID.
        id: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        color: Option<String>,

        #[arg(long)]
        notes: Option<String>,

        #[arg(long)]
        category: Option<String>,
    },

    /// Send input to a session.
    Send {
        /// Session ID.
        id: String,

        /// Text to send.
        text: String,

        /// Do not append a carriage return.
        #[arg(long)]
        no_newline: bool,
    },

    /// Send raw bytes to a session.
    SendBytes {
        /// Session ID.
        id: String,

        /// Hex-encoded bytes (e.g., "1b5b41" for up arrow).
        hex: String,
    },

    /// Resize a session's terminal.
    Resize {
        /// Session ID.
        id: String,

        /// Terminal rows.
        rows: u16,

        /// Terminal columns.
        cols: u16,
    },

    /// Print a session's history, then follow its output until it is deleted.
    Watch {
        /// Session ID.
        id: String,

        /// Show raw output including ANSI escape codes.
        #[arg(long)]
        raw: bool,

        /// Also print status and metrics changes to stderr.
        #[arg(long)]
        status: bool,
    },

    /// Forward an agent hook payload (read from stdin) as a status report.
    ///
    /// Reads the session id from `AGENTDECK_SESSION_ID`. Payloads that carry
    /// no usable status are ignored.
    Hook,

    /// Manage categories.
    Category {
        #[command(subcommand)]
        action: CategoryAction,
    },

    /// Stream lifecycle events as JSON lines.
    Events {
        /// Only show events for these session IDs (can be repeated).
        #[arg(long, short)]
        filter: Vec<String>,
    },

    /// Shut down the server.
    Shutdown,
}

#[derive(Debug, Subcommand)]
pub enum CategoryAction {
    /// List categories.
    List,

    /// Create a category.
    Create {
        name: String,

        #[arg(long)]
        color: Option<String>,
    },

    /// Rename or recolor a category.
    Update {
        id: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        color: Option<String>,
    },

    /// Delete a category; its sessions become uncategorized.
    Delete { id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_flags() {
        let cli = Cli::parse_from([
            "agentdeck",
            "create",
            "--agent",
            "claude",
            "--branch",
            "feat/x",
            "--worktree",
            "--ticket",
            "ENG-1",
        ]);
        match cli.command {
            Command::Create {
                agent,
                branch,
                worktree,
                ticket,
                ticket_title,
                ..
            } => {
                assert_eq!(agent, "claude");
                assert_eq!(branch.as_deref(), Some("feat/x"));
                assert!(worktree);
                assert_eq!(ticket.as_deref(), Some("ENG-1"));
                assert_eq!(ticket_title, "");
            }
            other => panic!("expected Create, got {other:?}"),
        }
    }

    #[test]
    fn test_worktree_requires_branch() {
        assert!(Cli::try_parse_from(["agentdeck", "create", "--worktree"]).is_err());
    }

    #[test]
    fn test_server_flags() {
        let cli = Cli::parse_from(["agentdeck", "server", "--daemon", "--idle-after", "1"]);
        match cli.command {
            Command::Server(args) => {
                assert!(args.daemon);
                assert_eq!(args.idle_after, 1);
            }
            other => panic!("expected Server, got {other:?}"),
        }
    }
}

//! agentdeck: session engine for long-running AI coding agents
//!
//! Runs each agent inside a shell on its own pseudo-terminal, keeps a
//! bounded history of its output, infers a coarse status from output
//! timing and hook reports, extracts metrics the agent prints, and
//! persists enough to bring every session back (disconnected) after a
//! restart. Clients talk to it over a Unix socket.

// Error documentation is deferred - the errors are self-explanatory from types
#![allow(clippy::missing_errors_doc)]

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod hook;
pub mod metrics;
pub mod persist;
pub mod prompt;
pub mod protocol;
pub mod pty;
pub mod server;
pub mod status;
pub mod testing;
pub mod workspace;

pub use cli::{CategoryAction, Cli, Command};
pub use client::{default_socket_path, Client, ClientError};
pub use config::{EngineConfig, ServerArgs};
pub use error::EngineError;
pub use hook::StatusReport;
pub use metrics::{Metrics, MetricsExtractor};
pub use prompt::TicketContext;
pub use protocol::{
    CreateSession, EndReason, ErrorCode, LifecycleEvent, Request, Response, SessionEvent, SessionInfo,
    SessionPatch,
};
pub use server::{Engine, Server, ServerError};
pub use status::{ExplicitState, SessionStatus};
pub use testing::{SessionHandle, TestError, TestHarness};

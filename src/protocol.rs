//! Protocol types for client-server IPC.
//!
//! Clients talk to the agentdeck server over a Unix socket using
//! newline-delimited JSON `Request`/`Response` messages. `subscribe` and
//! `events` switch the connection into streaming mode.

use crate::hook::StatusReport;
use crate::metrics::Metrics;
use crate::prompt::TicketContext;
use crate::status::SessionStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Placement of a node on the canvas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
}

/// A user-defined group of sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

/// One decoded chunk of terminal output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    pub data: String,
}

/// Parameters of a new session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSession {
    /// Agent kind identifier (e.g. "claude"); selects metrics scanning.
    #[serde(default = "default_agent_kind")]
    pub agent_kind: String,
    /// Human label shown for the session.
    #[serde(default)]
    pub label: Option<String>,
    /// Command typed into the shell once it has settled.
    #[serde(default)]
    pub command: Option<String>,
    /// Working directory (default: the server's home directory).
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub base_branch: Option<String>,
    /// Provision an isolated worktree for `branch`.
    #[serde(default)]
    pub worktree: bool,
    #[serde(default)]
    pub ticket: Option<TicketContext>,
    /// Template for the ticket prompt; `{{url}}`, `{{id}}`, `{{title}}`.
    #[serde(default)]
    pub prompt_template: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub rows: Option<u16>,
    #[serde(default)]
    pub cols: Option<u16>,
}

/// Annotation changes. An empty string clears a field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionPatch {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
}

/// Requests from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Ping the server (for health checks / auto-start detection).
    Ping,

    /// Request server shutdown.
    Shutdown,

    /// Create a session and start its process.
    Create(CreateSession),

    /// Start a new process for a session that has none.
    Restart { id: String },

    /// Terminate the process and forget the session.
    Delete { id: String },

    /// Change user annotations.
    Patch(SessionPatch),

    /// List all sessions.
    List,

    /// Get one session.
    Get { id: String },

    /// Send UTF-8 text input to a session.
    Send {
        id: String,
        data: String,
        /// Whether to append a carriage return.
        #[serde(default)]
        newline: bool,
    },

    /// Send raw bytes to a session.
    SendBytes {
        id: String,
        /// Raw bytes (base64 encoded in JSON).
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },

    /// Resize a session's terminal.
    Resize { id: String, rows: u16, cols: u16 },

    /// Stream a session's events.
    /// Server replies `Subscribed`, then event messages until the session
    /// is deleted, the server shuts down or the client disconnects.
    Subscribe { id: String },

    /// Out-of-band status assertion from an instrumentation hook.
    ReportStatus(StatusReport),

    /// Update canvas positions, keyed by node id.
    SavePositions { positions: HashMap<String, Position> },

    CreateCategory {
        name: String,
        #[serde(default)]
        color: Option<String>,
        #[serde(default)]
        position: Option<Position>,
    },

    UpdateCategory {
        id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        color: Option<String>,
        #[serde(default)]
        position: Option<Position>,
    },

    DeleteCategory { id: String },

    ListCategories,

    /// Subscribe to the server-wide lifecycle stream.
    /// Server will send Event responses until the connection is closed.
    Events {
        /// Only events for these session IDs (empty = all).
        #[serde(default)]
        filter: Vec<String>,
    },
}

/// What the last explicit status report said besides the state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<crate::status::ExplicitState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Unix millis of the report.
    pub reported_at: u64,
}

/// Information about a single session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub node_id: String,
    pub agent_kind: String,
    pub label: String,
    pub command: Option<String>,
    pub cwd: PathBuf,
    pub branch: Option<String>,
    /// Unix millis.
    pub created_at: u64,
    pub status: SessionStatus,
    pub is_restored: bool,
    /// Process ID of the session's shell, if one is running.
    pub pid: Option<u32>,
    /// Terminal size (rows, cols).
    pub size: (u16, u16),
    pub metrics: Option<Metrics>,
    pub custom_name: Option<String>,
    pub custom_color: Option<String>,
    pub notes: Option<String>,
    pub category_id: Option<String>,
    pub position: Option<Position>,
    pub last_output_at: Option<u64>,
    pub last_input_at: Option<u64>,
    pub activity: Option<Activity>,
    pub observers: usize,
}

impl SessionInfo {
    /// Custom name if set, otherwise the label.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.custom_name.as_deref().unwrap_or(&self.label)
    }
}

/// Events delivered to a session's observers, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Output {
        data: String,
    },
    Status {
        status: SessionStatus,
        #[serde(rename = "isRestored")]
        is_restored: bool,
    },
    Metrics {
        metrics: Metrics,
    },
}

/// Why a subscription stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The session was deleted.
    Deleted,
    /// The server is shutting down.
    Shutdown,
}

/// Server-wide lifecycle notifications.
///
/// Used with the `agentdeck events` command for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    SessionCreated { id: String, node_id: String },
    SessionRestarted { id: String, pid: u32 },
    SessionDeleted { id: String },
    StatusChanged {
        id: String,
        status: SessionStatus,
        #[serde(rename = "isRestored")]
        is_restored: bool,
    },
}

impl LifecycleEvent {
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::SessionCreated { id, .. }
            | Self::SessionRestarted { id, .. }
            | Self::SessionDeleted { id }
            | Self::StatusChanged { id, .. } => id,
        }
    }
}

/// Machine-readable error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    AlreadyRunning,
    NotRunning,
    SpawnFailed,
    InvalidRequest,
    Internal,
}

/// Responses from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Generic success with no data.
    Ok,

    /// Pong response to Ping.
    Pong,

    /// A single session (create, restart, get, patch).
    Session { session: SessionInfo },

    /// List of sessions.
    Sessions { sessions: Vec<SessionInfo> },

    /// Subscription started; events follow.
    Subscribed {
        session: SessionInfo,
        /// Retained output history, oldest first.
        history: Vec<OutputChunk>,
    },

    /// Output chunk (subscription stream).
    Output { data: String },

    /// Status transition (subscription stream).
    Status {
        status: SessionStatus,
        #[serde(rename = "isRestored")]
        is_restored: bool,
    },

    /// New metrics snapshot (subscription stream).
    Metrics { metrics: Metrics },

    /// Subscription stream ended.
    SubscriptionEnded { id: String, reason: EndReason },

    Category { category: Category },

    Categories { categories: Vec<Category> },

    /// Lifecycle event (sent during event subscription).
    Event(LifecycleEvent),

    /// Error response.
    Error { code: ErrorCode, message: String },
}

impl Response {
    /// Create an error response.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}

impl From<SessionEvent> for Response {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::Output { data } => Self::Output { data },
            SessionEvent::Status {
                status,
                is_restored,
            } => Self::Status {
                status,
                is_restored,
            },
            SessionEvent::Metrics { metrics } => Self::Metrics { metrics },
        }
    }
}

fn default_agent_kind() -> String {
    "shell".to_string()
}

/// Module for base64 encoding/decoding of byte vectors in serde.
mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use base64::Engine;
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}

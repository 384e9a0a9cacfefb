//! Out-of-band status reports from agent instrumentation hooks.
//!
//! Agents such as Claude Code can run a command on lifecycle events and
//! pipe a JSON payload to it. `agentdeck hook` is meant to be that command:
//! it turns the payload into a [`StatusReport`] keyed by the engine's own
//! session id (exported into every session's shell as
//! [`SESSION_ID_ENV`]) and forwards it to the server.

use crate::status::ExplicitState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Environment variable carrying the engine session id inside a session.
pub const SESSION_ID_ENV: &str = "AGENTDECK_SESSION_ID";

/// Maximum length of a forwarded user prompt, in characters.
pub const PROMPT_PREVIEW_CHARS: usize = 200;

/// Payloads that carry no usable status.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HookError {
    #[error("payload is not a JSON object: {0}")]
    Malformed(String),

    #[error("unrecognized hook event: {0}")]
    UnknownEvent(String),

    #[error("payload has neither a state nor a hook event name")]
    MissingState,
}

/// An explicit status assertion for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub session_id: String,
    pub state: ExplicitState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl StatusReport {
    /// Enforce the prompt preview limit.
    #[must_use]
    pub fn truncated(mut self) -> Self {
        self.prompt = self.prompt.map(|p| truncate_chars(&p, PROMPT_PREVIEW_CHARS));
        self
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

/// Map a Claude Code style hook event name to an explicit state.
#[must_use]
pub fn state_for_event(event: &str) -> Option<ExplicitState> {
    let state = match event {
        "PreToolUse" => ExplicitState::ToolCalling,
        "PostToolUse" | "UserPromptSubmit" | "SubagentStop" => ExplicitState::Running,
        "Notification" | "PermissionRequest" => ExplicitState::WaitingInput,
        "Stop" | "SessionStart" => ExplicitState::Idle,
        "PreCompact" => ExplicitState::Compacting,
        "SessionEnd" => ExplicitState::Ended,
        _ => return None,
    };
    Some(state)
}

fn string_field(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// Parse a hook payload.
///
/// Accepts either a direct assertion (`{"state":"tool_calling"}`) or a raw
/// hook payload (`{"hook_event_name":"PreToolUse","tool_name":"Bash"}`).
pub fn parse_payload(payload: &str, session_id: &str) -> Result<StatusReport, HookError> {
    let value: Value =
        serde_json::from_str(payload).map_err(|e| HookError::Malformed(e.to_string()))?;
    let Value::Object(obj) = value else {
        return Err(HookError::Malformed("expected an object".into()));
    };

    let state = if let Some(state) = obj.get("state") {
        serde_json::from_value::<ExplicitState>(state.clone())
            .map_err(|_| HookError::UnknownEvent(state.to_string()))?
    } else if let Some(event) = string_field(&obj, &["hook_event_name", "event"]) {
        state_for_event(&event).ok_or(HookError::UnknownEvent(event))?
    } else {
        return Err(HookError::MissingState);
    };

    let report = StatusReport {
        session_id: session_id.to_string(),
        state,
        tool: string_field(&obj, &["tool_name", "tool"]),
        notification: string_field(&obj, &["message", "notification"]),
        prompt: string_field(&obj, &["prompt"]),
    };
    Ok(report.truncated())
}

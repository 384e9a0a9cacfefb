//! Ticket prompts injected into a freshly started agent.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Template used when a session is created for a ticket without one.
pub const DEFAULT_TEMPLATE: &str =
    "Please work on ticket {{id}}: {{title}}\n\nTicket details: {{url}}";

/// The ticket a session was created for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketContext {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
}

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{(url|id|title)\}\}").expect("placeholder pattern is valid"));

/// Substitute `{{url}}`, `{{id}}` and `{{title}}` in one pass, so ticket
/// fields are never themselves expanded. Unknown placeholders are left as
/// written.
#[must_use]
pub fn render(template: &str, ticket: &TicketContext) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| match &caps[1] {
            "url" => ticket.url.clone(),
            "id" => ticket.id.clone(),
            _ => ticket.title.clone(),
        })
        .into_owned()
}

/// Prompt bytes ready to be typed into the terminal.
///
/// Interior newlines are sent as-is (agent TUIs treat a pasted newline as a
/// soft break); a carriage return submits.
#[must_use]
pub fn as_input(prompt: &str) -> Vec<u8> {
    let mut bytes = prompt.trim_end().as_bytes().to_vec();
    bytes.push(b'\r');
    bytes
}

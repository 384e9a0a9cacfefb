//! Fuzz target for request handling logic.
//!
//! Uses arbitrary to generate structured Request values and verify handling doesn't panic.

#![no_main]

use agentdeck::protocol::{CreateSession, Request, SessionPatch};
use agentdeck::TicketContext;
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

/// Fuzzable subset of Request that doesn't require server state.
#[derive(Debug, Arbitrary)]
enum FuzzRequest {
    Create {
        agent_kind: String,
        command: Option<String>,
        branch: Option<String>,
        worktree: bool,
        ticket: Option<(String, String, String)>,
        prompt_template: Option<String>,
        rows: Option<u16>,
        cols: Option<u16>,
    },
    Patch {
        id: String,
        custom_name: Option<String>,
        notes: Option<String>,
    },
    Send {
        id: String,
        data: String,
        newline: bool,
    },
    SendBytes {
        id: String,
        data: Vec<u8>,
    },
    Events {
        filter: Vec<String>,
    },
}

fuzz_target!(|req: FuzzRequest| {
    // Convert to real Request and serialize/deserialize
    let request = match req {
        FuzzRequest::Create {
            agent_kind,
            command,
            branch,
            worktree,
            ticket,
            prompt_template,
            rows,
            cols,
        } => {
            // Rendering the prompt must not panic on any template
            if let (Some((id, title, url)), Some(template)) = (&ticket, &prompt_template) {
                let ticket = TicketContext {
                    id: id.clone(),
                    title: title.clone(),
                    url: url.clone(),
                };
                let _ = agentdeck::prompt::as_input(&agentdeck::prompt::render(template, &ticket));
            }
            Request::Create(CreateSession {
                agent_kind,
                command,
                branch,
                worktree,
                ticket: ticket.map(|(id, title, url)| TicketContext { id, title, url }),
                prompt_template,
                rows,
                cols,
                ..CreateSession::default()
            })
        }
        FuzzRequest::Patch {
            id,
            custom_name,
            notes,
        } => Request::Patch(SessionPatch {
            id,
            custom_name,
            notes,
            ..SessionPatch::default()
        }),
        FuzzRequest::Send { id, data, newline } => Request::Send { id, data, newline },
        FuzzRequest::SendBytes { id, data } => Request::SendBytes { id, data },
        FuzzRequest::Events { filter } => Request::Events { filter },
    };

    // Roundtrip through JSON - should not panic
    if let Ok(json) = serde_json::to_string(&request) {
        let _ = serde_json::from_str::<Request>(&json);
    }
});

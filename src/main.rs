//! agentdeck: session engine for long-running AI coding agents

use agentdeck::{
    default_socket_path, hook, CategoryAction, Cli, Client, Command, CreateSession, EngineConfig,
    EngineError, Request, Response, Server, ServerArgs, SessionInfo, SessionPatch, TicketContext,
};
use clap::Parser;
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG overrides the defaults
    let default_filter = if cli.verbose {
        "agentdeck=debug"
    } else if matches!(cli.command, Command::Server(_)) {
        "agentdeck=info"
    } else {
        "agentdeck=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let socket_path = cli.socket.unwrap_or_else(default_socket_path);

    let result = match cli.command {
        Command::Server(args) => run_server(socket_path, args).await,
        Command::Hook => run_hook(socket_path).await,
        cmd => run_client(socket_path, cmd).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run_server(socket_path: PathBuf, args: ServerArgs) -> CliResult {
    if args.daemon {
        // Leave the launching terminal's session so its signals don't reach us
        if let Err(e) = nix::unistd::setsid() {
            debug!("setsid failed: {e}");
        }
    }

    let config = EngineConfig::from(args);
    info!(data_dir = %config.data_dir.display(), shell = %config.shell, "Starting server");
    let mut server = Server::new(socket_path, config);
    server.run().await?;
    Ok(())
}

/// Forward a hook payload. Never fails the calling agent: anything that
/// cannot be reported is logged and dropped.
async fn run_hook(socket_path: PathBuf) -> CliResult {
    let Ok(session_id) = std::env::var(hook::SESSION_ID_ENV) else {
        debug!("{} not set; not inside a session", hook::SESSION_ID_ENV);
        return Ok(());
    };

    let mut payload = String::new();
    std::io::stdin().read_to_string(&mut payload)?;

    let report = match hook::parse_payload(&payload, &session_id) {
        Ok(report) => report,
        Err(e) => {
            debug!("{}", EngineError::ParseSkipped(e.to_string()));
            return Ok(());
        }
    };

    let mut client = Client::new(socket_path).without_autostart();
    match client.request(Request::ReportStatus(report)).await {
        Ok(Response::Error { message, .. }) => debug!("status report rejected: {message}"),
        Ok(_) => {}
        Err(e) => debug!("status report not delivered: {e}"),
    }
    Ok(())
}

fn print_session(session: &SessionInfo) -> CliResult {
    println!("{}", serde_json::to_string_pretty(session)?);
    Ok(())
}

/// Print stream output, stripping escape sequences unless `raw`.
fn write_output(data: &str, raw: bool) -> CliResult {
    let mut stdout = std::io::stdout();
    if raw {
        stdout.write_all(data.as_bytes())?;
    } else {
        stdout.write_all(&strip_ansi_escapes::strip(data))?;
    }
    stdout.flush()?;
    Ok(())
}

async fn run_client(socket_path: PathBuf, command: Command) -> CliResult {
    // Streaming commands need a dedicated connection
    if let Command::Watch { id, raw, status } = command {
        return run_watch_command(socket_path, id, raw, status).await;
    }
    if let Command::Events { filter } = command {
        return run_events_command(socket_path, filter).await;
    }

    let mut client = Client::new(socket_path);

    match command {
        Command::Create {
            agent,
            label,
            command,
            cwd,
            branch,
            base_branch,
            worktree,
            ticket,
            ticket_title,
            ticket_url,
            prompt_template,
            node,
            category,
            rows,
            cols,
        } => {
            let spec = CreateSession {
                agent_kind: agent,
                label,
                command,
                cwd,
                branch,
                base_branch,
                worktree,
                ticket: ticket.map(|id| TicketContext {
                    id,
                    title: ticket_title,
                    url: ticket_url,
                }),
                prompt_template,
                node_id: node,
                position: None,
                category_id: category,
                rows,
                cols,
            };
            match client.call(Request::Create(spec)).await? {
                Response::Session { session } => {
                    println!("{}", session.id);
                    debug!("Created session {} (pid {:?})", session.id, session.pid);
                }
                _ => return Err("unexpected response".into()),
            }
        }

        Command::List { json } => {
            let Response::Sessions { sessions } = client.call(Request::List).await? else {
                return Err("unexpected response".into());
            };

            if json {
                // JSON output for piping to jq
                println!("{}", serde_json::to_string(&sessions)?);
            } else if sessions.is_empty() {
                println!("(no sessions)");
            } else {
                // Default: TOON format (token-efficient for LLMs)
                let json_data = serde_json::json!({
                    "sessions": sessions.iter().map(|s| {
                        let mut entry = serde_json::json!({
                            "id": s.id,
                            "name": s.display_name(),
                            "agent": s.agent_kind,
                            "status": s.status.as_str(),
                        });
                        // Only include optional fields when set (keeps output compact)
                        if let Some(branch) = &s.branch {
                            entry["branch"] = serde_json::json!(branch);
                        }
                        if let Some(pid) = s.pid {
                            entry["pid"] = serde_json::json!(pid);
                        }
                        if s.is_restored {
                            entry["restored"] = serde_json::json!(true);
                        }
                        if let Some(ctx) = s.metrics.as_ref().and_then(|m| m.context_percent) {
                            entry["context"] = serde_json::json!(ctx);
                        }
                        entry
                    }).collect::<Vec<_>>()
                });
                let toon = toon_format::encode(&json_data, &toon_format::EncodeOptions::default())
                    .unwrap_or_else(|_| format!("{json_data:?}"));
                println!("{toon}");
            }
        }

        Command::Get { id } => match client.call(Request::Get { id }).await? {
            Response::Session { session } => print_session(&session)?,
            _ => return Err("unexpected response".into()),
        },

        Command::Restart { id } => match client.call(Request::Restart { id }).await? {
            Response::Session { session } => {
                debug!("Restarted {} (pid {:?})", session.id, session.pid);
            }
            _ => return Err("unexpected response".into()),
        },

        Command::Delete { id } => {
            client.call(Request::Delete { id }).await?;
        }

        Command::Patch {
            id,
            name,
            color,
            notes,
            category,
        } => {
            let patch = SessionPatch {
                id,
                custom_name: name,
                custom_color: color,
                notes,
                category_id: category,
            };
            match client.call(Request::Patch(patch)).await? {
                Response::Session { session } => print_session(&session)?,
                _ => return Err("unexpected response".into()),
            }
        }

        Command::Send {
            id,
            text,
            no_newline,
        } => {
            let request = Request::Send {
                id,
                data: text,
                newline: !no_newline,
            };
            client.call(request).await?;
        }

        Command::SendBytes { id, hex } => {
            let data = hex::decode(&hex).map_err(|e| format!("invalid hex: {e}"))?;
            client.call(Request::SendBytes { id, data }).await?;
        }

        Command::Resize { id, rows, cols } => {
            client.call(Request::Resize { id, rows, cols }).await?;
        }

        Command::Category { action } => run_category_command(&mut client, action).await?,

        Command::Shutdown => {
            client.call(Request::Shutdown).await?;
            println!("Server shutting down");
        }

        Command::Server(_) | Command::Hook | Command::Watch { .. } | Command::Events { .. } => {
            unreachable!("handled above")
        }
    }

    Ok(())
}

async fn run_category_command(client: &mut Client, action: CategoryAction) -> CliResult {
    let response = match action {
        CategoryAction::List => client.call(Request::ListCategories).await?,
        CategoryAction::Create { name, color } => {
            client
                .call(Request::CreateCategory {
                    name,
                    color,
                    position: None,
                })
                .await?
        }
        CategoryAction::Update { id, name, color } => {
            client
                .call(Request::UpdateCategory {
                    id,
                    name,
                    color,
                    position: None,
                })
                .await?
        }
        CategoryAction::Delete { id } => client.call(Request::DeleteCategory { id }).await?,
    };

    match response {
        Response::Categories { categories } => {
            println!("{}", serde_json::to_string(&categories)?);
        }
        Response::Category { category } => println!("{}", category.id),
        Response::Ok => {}
        _ => return Err("unexpected response".into()),
    }
    Ok(())
}

async fn run_watch_command(socket_path: PathBuf, id: String, raw: bool, status: bool) -> CliResult {
    let mut client = Client::new(socket_path);
    client.send(&Request::Subscribe { id }).await?;

    while let Some(response) = client.next_response().await? {
        match response {
            Response::Subscribed { session, history } => {
                debug!("Watching {} ({})", session.id, session.status);
                for chunk in &history {
                    write_output(&chunk.data, raw)?;
                }
            }
            Response::Output { data } => write_output(&data, raw)?,
            Response::Status {
                status: s,
                is_restored,
            } => {
                if status {
                    eprintln!("[status: {s}{}]", if is_restored { ", restored" } else { "" });
                }
            }
            Response::Metrics { metrics } => {
                if status {
                    eprintln!("[metrics: {}]", serde_json::to_string(&metrics)?);
                }
            }
            Response::SubscriptionEnded { id, reason } => {
                eprintln!("[{id}: subscription ended ({reason:?})]");
                break;
            }
            Response::Error { message, .. } => return Err(message.into()),
            _ => {}
        }
    }

    Ok(())
}

async fn run_events_command(socket_path: PathBuf, filter: Vec<String>) -> CliResult {
    // Don't auto-start - events are useless with no sessions
    let mut client = Client::new(socket_path).without_autostart();
    client.send(&Request::Events { filter }).await?;

    // Re-emit just the event (strip Response wrapper)
    while let Some(response) = client.next_response().await? {
        match response {
            Response::Event(event) => println!("{}", serde_json::to_string(&event)?),
            Response::Error { message, .. } => return Err(message.into()),
            _ => {}
        }
    }

    Ok(())
}

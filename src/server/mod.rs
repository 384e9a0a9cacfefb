//! The agentdeck server.
//!
//! Owns the session engine and exposes it on a Unix socket as
//! newline-delimited JSON. Most requests are one request, one response;
//! `Subscribe` and `Events` switch the connection into streaming mode.

// The handle_request function is large but logically coherent
#![allow(clippy::too_many_lines)]

mod engine;
mod fanout;
mod output;
mod registry;
mod session;

pub use engine::{BackgroundTasks, Engine, READ_POLL};
pub use fanout::{EventReceiver, Observers};
pub use output::{now_millis, OutputBuffer, Utf8Decoder, MAX_CHUNKS};
pub use registry::SessionRegistry;
pub use session::{Annotations, Provenance, Session};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::protocol::{EndReason, ErrorCode, Request, Response};
#[cfg(unix)]
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Errors that can occur in the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

/// The agentdeck server.
pub struct Server {
    socket_path: PathBuf,
    engine: Engine,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create a new server that will listen on the given socket path.
    #[must_use]
    pub fn new(socket_path: PathBuf, mut config: EngineConfig) -> Self {
        config.socket_path = Some(socket_path.clone());
        Self::with_engine(socket_path, Engine::new(config))
    }

    #[must_use]
    pub fn with_engine(socket_path: PathBuf, engine: Engine) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            socket_path,
            engine,
            shutdown_tx,
        }
    }

    #[must_use]
    pub const fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Run the server event loop.
    pub async fn run(&mut self) -> Result<(), ServerError> {
        // Security: Check for symlink attack before removing existing socket
        // Don't follow symlinks - a dangling one would otherwise look absent
        if let Ok(metadata) = std::fs::symlink_metadata(&self.socket_path) {
            if metadata.file_type().is_symlink() {
                return Err(ServerError::Bind(std::io::Error::other(
                    "socket path is a symlink - possible security attack",
                )));
            }

            // Only remove if it's a socket (or we can't tell)
            if metadata.file_type().is_socket() || metadata.file_type().is_file() {
                std::fs::remove_file(&self.socket_path).ok();
            }
        }

        // Ensure parent directory exists
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(ServerError::Io)?;
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(ServerError::Bind)?;

        // Security: Set socket permissions to owner-only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, perms).map_err(ServerError::Io)?;
        }

        info!("Server listening on {:?}", self.socket_path);

        // A corrupt or unreadable state file is not fatal; start empty
        if let Err(e) = self.engine.restore_sessions().await {
            error!("{e}; starting with no sessions");
        }

        let tasks = self.engine.start();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            debug!("Accepted connection");
                            let engine = self.engine.clone();
                            let shutdown_tx = self.shutdown_tx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, engine, shutdown_tx).await {
                                    error!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("{}", ServerError::Accept(e));
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
            }
        }

        tasks.abort();
        self.engine.shutdown().await;

        // Clean up socket
        std::fs::remove_file(&self.socket_path).ok();
        info!("Server shut down");
        Ok(())
    }

    /// Request server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &Response) -> std::io::Result<()> {
    let mut json = serde_json::to_string(response).expect("Response serialization should never fail");
    json.push('\n');
    writer.write_all(json.as_bytes()).await
}

fn error_response(e: &EngineError) -> Response {
    Response::error(e.code(), e.to_string())
}

/// Handle a single client connection.
async fn handle_connection(
    stream: UnixStream,
    engine: Engine,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), ServerError> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = writer;
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await.map_err(ServerError::Io)?;

        if n == 0 {
            // EOF - client disconnected
            debug!("Client disconnected");
            break;
        }

        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                let response = Response::error(ErrorCode::InvalidRequest, format!("invalid request: {e}"));
                write_response(&mut writer, &response).await.ok();
                continue;
            }
        };

        debug!(?request, "Received request");

        // Subscribe switches the connection to streaming mode
        if let Request::Subscribe { id } = &request {
            match handle_subscribe(id, reader, writer, &engine, &shutdown_tx).await {
                Ok(()) => debug!(%id, "Subscription ended normally"),
                Err(e) => warn!(%id, "Subscription error: {}", e),
            }
            return Ok(());
        }

        // Events switches the connection to streaming mode
        if let Request::Events { filter } = &request {
            match handle_events(filter.clone(), writer, &engine, &shutdown_tx).await {
                Ok(()) => debug!("Events stream ended normally"),
                Err(e) => warn!("Events stream error: {}", e),
            }
            return Ok(());
        }

        let is_shutdown = matches!(request, Request::Shutdown);
        let response = handle_request(request, &engine).await;

        write_response(&mut writer, &response)
            .await
            .map_err(ServerError::Io)?;

        // Trigger shutdown after sending response
        if is_shutdown {
            let _ = shutdown_tx.send(());
            break;
        }
    }

    Ok(())
}

/// Handle a single request.
async fn handle_request(request: Request, engine: &Engine) -> Response {
    let result = match request {
        Request::Ping => Ok(Response::Pong),

        Request::Shutdown => {
            info!("Shutdown requested");
            Ok(Response::Ok)
        }

        Request::Create(spec) => engine
            .create_session(spec)
            .await
            .map(|session| Response::Session { session }),

        Request::Restart { id } => engine
            .restart_session(&id)
            .await
            .map(|session| Response::Session { session }),

        Request::Delete { id } => engine.delete_session(&id).await.map(|()| Response::Ok),

        Request::Patch(patch) => engine
            .patch_session(patch)
            .await
            .map(|session| Response::Session { session }),

        Request::List => Ok(Response::Sessions {
            sessions: engine.list_sessions().await,
        }),

        Request::Get { id } => engine
            .get_session(&id)
            .await
            .map(|session| Response::Session { session }),

        Request::Send { id, data, newline } => {
            let mut bytes = data.into_bytes();
            if newline {
                // Enter in a terminal is a carriage return
                bytes.push(b'\r');
            }
            engine.send_input(&id, &bytes).await.map(|()| Response::Ok)
        }

        Request::SendBytes { id, data } => engine.send_input(&id, &data).await.map(|()| Response::Ok),

        Request::Resize { id, rows, cols } => engine.resize(&id, rows, cols).await.map(|()| Response::Ok),

        Request::ReportStatus(report) => engine
            .report_status(report)
            .await
            .map(|session| Response::Session { session }),

        Request::SavePositions { positions } => {
            engine.save_positions(positions).await;
            Ok(Response::Ok)
        }

        Request::CreateCategory {
            name,
            color,
            position,
        } => engine
            .create_category(name, color, position)
            .await
            .map(|category| Response::Category { category }),

        Request::UpdateCategory {
            id,
            name,
            color,
            position,
        } => engine
            .update_category(&id, name, color, position)
            .await
            .map(|category| Response::Category { category }),

        Request::DeleteCategory { id } => engine.delete_category(&id).await.map(|()| Response::Ok),

        Request::ListCategories => Ok(Response::Categories {
            categories: engine.list_categories().await,
        }),

        // Handled by handle_connection before reaching here
        Request::Subscribe { .. } | Request::Events { .. } => Err(EngineError::InvalidRequest(
            "streaming requests must be the first request on a connection".into(),
        )),
    };

    result.unwrap_or_else(|e| {
        debug!(code = ?e.code(), "{e}");
        error_response(&e)
    })
}

/// Stream one session's events until it is deleted, the server shuts down
/// or the client hangs up.
async fn handle_subscribe(
    id: &str,
    mut reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    engine: &Engine,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<(), ServerError> {
    let mut shutdown_rx = shutdown_tx.subscribe();

    let (session, history, mut rx) = match engine.subscribe(id).await {
        Ok(subscription) => subscription,
        Err(e) => {
            return write_response(&mut writer, &error_response(&e))
                .await
                .map_err(ServerError::Io);
        }
    };

    info!(%id, history = history.len(), "Subscription started");
    write_response(&mut writer, &Response::Subscribed { session, history })
        .await
        .map_err(ServerError::Io)?;

    // Anything the client sends after subscribing is ignored; only EOF matters
    let mut discard = String::new();

    let reason = loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        if write_response(&mut writer, &Response::from(event)).await.is_err() {
                            debug!(%id, "Subscriber disconnected");
                            return Ok(());
                        }
                    }
                    None => {
                        // Observers are cleared on delete and on shutdown
                        let reason = if engine.contains(id).await {
                            EndReason::Shutdown
                        } else {
                            EndReason::Deleted
                        };
                        break reason;
                    }
                }
            }
            read = reader.read_line(&mut discard) => {
                if matches!(read, Ok(0) | Err(_)) {
                    debug!(%id, "Subscriber disconnected");
                    return Ok(());
                }
                discard.clear();
            }
            _ = shutdown_rx.recv() => break EndReason::Shutdown,
        }
    };

    info!(%id, ?reason, "Subscription ended");
    write_response(
        &mut writer,
        &Response::SubscriptionEnded {
            id: id.to_string(),
            reason,
        },
    )
    .await
    .map_err(ServerError::Io)
}

/// Stream lifecycle events until the client hangs up or the server stops.
async fn handle_events(
    filter: Vec<String>,
    mut writer: OwnedWriteHalf,
    engine: &Engine,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<(), ServerError> {
    let mut event_rx = engine.subscribe_events();
    let mut shutdown_rx = shutdown_tx.subscribe();

    info!(?filter, "Events subscription started");

    loop {
        let received = tokio::select! {
            received = event_rx.recv() => received,
            _ = shutdown_rx.recv() => break,
        };
        match received {
            Ok(event) => {
                // Skip if not in filter (unless filter is empty = all)
                if !filter.is_empty() && !filter.iter().any(|id| id == event.session_id()) {
                    continue;
                }

                if write_response(&mut writer, &Response::Event(event)).await.is_err() {
                    // Client disconnected
                    debug!("Events client disconnected");
                    break;
                }
            }
            Err(broadcast::error::RecvError::Closed) => {
                // Channel closed (server shutting down)
                debug!("Events channel closed");
                break;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                // We missed some events - log but continue
                warn!("Events subscriber lagged, missed {n} events");
            }
        }
    }

    info!("Events subscription ended");
    Ok(())
}

/// Check if a server is running by trying to connect.
pub async fn is_server_running(socket_path: &Path) -> bool {
    UnixStream::connect(socket_path).await.is_ok()
}

//! Test framework for session engine scenarios.
//!
//! Runs a real server on a throwaway socket and data directory:
//!
//! ```ignore
//! let harness = TestHarness::new().await;
//! let session = harness.shell().await?;
//!
//! session.send("echo hello").await?;
//! session.wait_for_output("hello", Duration::from_secs(5)).await?;
//! session.wait_for_status(SessionStatus::Idle, Duration::from_secs(5)).await?;
//! ```

use crate::protocol::{CreateSession, ErrorCode, SessionInfo};
use crate::status::{ClassifierConfig, SessionStatus};
use crate::{Client, EngineConfig, Request, Response, Server};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Errors from the test framework.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("timeout waiting for condition")]
    Timeout,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("server error ({code:?}): {message}")]
    ServerError { code: ErrorCode, message: String },
}

impl TestError {
    /// Error code of a server-side rejection, if this is one.
    #[must_use]
    pub const fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::ServerError { code, .. } => Some(*code),
            Self::SessionNotFound(_) => Some(ErrorCode::NotFound),
            _ => None,
        }
    }
}

fn into_result(response: Response) -> Result<Response, TestError> {
    match response {
        Response::Error { code, message } => Err(TestError::ServerError { code, message }),
        other => Ok(other),
    }
}

/// Test harness that manages server lifecycle and provides session creation.
pub struct TestHarness {
    socket_path: PathBuf,
    config: EngineConfig,
    client: Arc<Mutex<Client>>,
    server_handle: JoinHandle<()>,
    /// Remove the data directory on drop.
    cleanup: bool,
}

impl TestHarness {
    /// Start a server with [`test_config`](Self::test_config).
    pub async fn new() -> Self {
        Self::with_config(Self::test_config()).await
    }

    /// Engine configuration tuned for tests: `/bin/sh`, a unique data
    /// directory, short delays and a one-second idle threshold.
    #[must_use]
    pub fn test_config() -> EngineConfig {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let pid = std::process::id();
        EngineConfig {
            shell: "/bin/sh".into(),
            launch_delay: Duration::from_millis(100),
            prompt_delay: Duration::from_millis(300),
            metrics_ttl: Duration::from_millis(100),
            persist_interval: Duration::from_millis(500),
            kill_grace: Duration::from_millis(500),
            classifier: ClassifierConfig {
                active_window: Duration::from_millis(500),
                idle_after: Duration::from_secs(1),
                tick: Duration::from_millis(100),
                ..ClassifierConfig::default()
            },
            ..EngineConfig::with_data_dir(PathBuf::from(format!("/tmp/agentdeck-test-{pid}-{id}")))
        }
    }

    /// Start a server with the given configuration. Files already present in
    /// `config.data_dir` are restored at startup.
    pub async fn with_config(config: EngineConfig) -> Self {
        let socket_path = config.data_dir.with_extension("sock");

        // Start server in background
        let server_socket = socket_path.clone();
        let server_config = config.clone();
        let server_handle = tokio::spawn(async move {
            let mut server = Server::new(server_socket, server_config);
            let _ = server.run().await;
        });

        // Wait for the socket to accept connections
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline && !crate::server::is_server_running(&socket_path).await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let client = Client::new(socket_path.clone()).without_autostart();

        Self {
            socket_path,
            config,
            client: Arc::new(Mutex::new(client)),
            server_handle,
            cleanup: true,
        }
    }

    /// Send a request on the shared connection; error responses become errors.
    pub async fn request(&self, request: Request) -> Result<Response, TestError> {
        let response = self
            .client
            .lock()
            .await
            .request(request)
            .await
            .map_err(|e| TestError::RequestFailed(e.to_string()))?;
        into_result(response)
    }

    /// Create a session.
    pub async fn create(&self, spec: CreateSession) -> Result<SessionHandle, TestError> {
        match self.request(Request::Create(spec)).await? {
            Response::Session { session } => Ok(self.handle(&session.id)),
            _ => Err(TestError::RequestFailed("unexpected response".into())),
        }
    }

    /// Create a plain shell session.
    pub async fn shell(&self) -> Result<SessionHandle, TestError> {
        self.create(CreateSession {
            agent_kind: "shell".into(),
            ..CreateSession::default()
        })
        .await
    }

    /// Handle for an existing session id.
    #[must_use]
    pub fn handle(&self, id: &str) -> SessionHandle {
        SessionHandle {
            id: id.to_string(),
            client: Arc::clone(&self.client),
            socket_path: self.socket_path.clone(),
        }
    }

    /// List all sessions.
    pub async fn list(&self) -> Result<Vec<SessionInfo>, TestError> {
        match self.request(Request::List).await? {
            Response::Sessions { sessions } => Ok(sessions),
            _ => Err(TestError::RequestFailed("unexpected response".into())),
        }
    }

    /// Get the socket path (useful for direct connections).
    #[must_use]
    pub const fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Shutdown the server gracefully and wait for it to finish.
    pub async fn shutdown(self) {
        self.stop().await;
    }

    async fn stop(&self) {
        let _ = self.client.lock().await.request(Request::Shutdown).await;
        let deadline = Instant::now() + Duration::from_secs(10);
        while !self.server_handle.is_finished() && Instant::now() < deadline {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Shut the server down and start a fresh one on the same data
    /// directory, as after a host restart.
    pub async fn restart_server(mut self) -> Self {
        self.stop().await;
        self.cleanup = false;
        let config = self.config.clone();
        // Old socket file goes away before the new server binds
        drop(self);
        Self::with_config(config).await
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        // Best effort cleanup
        self.server_handle.abort();
        std::fs::remove_file(&self.socket_path).ok();
        if self.cleanup {
            std::fs::remove_dir_all(&self.config.data_dir).ok();
        }
    }
}

/// Handle for interacting with one session.
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    client: Arc<Mutex<Client>>,
    socket_path: PathBuf,
}

impl SessionHandle {
    /// Get the session ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    async fn request(&self, request: Request) -> Result<Response, TestError> {
        let response = self
            .client
            .lock()
            .await
            .request(request)
            .await
            .map_err(|e| TestError::RequestFailed(e.to_string()))?;
        match into_result(response) {
            Err(TestError::ServerError {
                code: ErrorCode::NotFound,
                ..
            }) => Err(TestError::SessionNotFound(self.id.clone())),
            other => other,
        }
    }

    /// Current session info.
    pub async fn info(&self) -> Result<SessionInfo, TestError> {
        match self.request(Request::Get { id: self.id.clone() }).await? {
            Response::Session { session } => Ok(session),
            _ => Err(TestError::RequestFailed("unexpected response".into())),
        }
    }

    /// Send text input followed by a carriage return.
    pub async fn send(&self, text: &str) -> Result<(), TestError> {
        self.send_raw(text, true).await
    }

    /// Send text input without trailing carriage return.
    pub async fn send_no_newline(&self, text: &str) -> Result<(), TestError> {
        self.send_raw(text, false).await
    }

    async fn send_raw(&self, text: &str, newline: bool) -> Result<(), TestError> {
        self.request(Request::Send {
            id: self.id.clone(),
            data: text.to_string(),
            newline,
        })
        .await
        .map(drop)
    }

    /// Send raw bytes.
    pub async fn send_bytes(&self, data: &[u8]) -> Result<(), TestError> {
        self.request(Request::SendBytes {
            id: self.id.clone(),
            data: data.to_vec(),
        })
        .await
        .map(drop)
    }

    /// Start a new process for this session.
    pub async fn restart(&self) -> Result<SessionInfo, TestError> {
        match self.request(Request::Restart { id: self.id.clone() }).await? {
            Response::Session { session } => Ok(session),
            _ => Err(TestError::RequestFailed("unexpected response".into())),
        }
    }

    /// Delete the session.
    pub async fn delete(&self) -> Result<(), TestError> {
        self.request(Request::Delete { id: self.id.clone() }).await.map(drop)
    }

    /// Open a subscription on a dedicated connection.
    pub async fn subscribe(&self) -> Result<Subscription, TestError> {
        Subscription::open(&self.socket_path, &self.id).await
    }

    /// Wait until the session reports `status`.
    pub async fn wait_for_status(
        &self,
        status: SessionStatus,
        timeout_duration: Duration,
    ) -> Result<SessionInfo, TestError> {
        let deadline = Instant::now() + timeout_duration;

        while Instant::now() < deadline {
            let info = self.info().await?;
            if info.status == status {
                return Ok(info);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        Err(TestError::Timeout)
    }

    /// Wait until the session's output (history included) contains `needle`.
    /// Returns everything seen so far.
    pub async fn wait_for_output(
        &self,
        needle: &str,
        timeout_duration: Duration,
    ) -> Result<String, TestError> {
        let deadline = Instant::now() + timeout_duration;
        let mut subscription = self.subscribe().await?;
        let mut seen: String = subscription.history.iter().map(|c| c.data.as_str()).collect();

        while !seen.contains(needle) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match subscription.next(remaining).await? {
                Response::Output { data } => seen.push_str(&data),
                Response::SubscriptionEnded { .. } => return Err(TestError::SessionNotFound(self.id.clone())),
                _ => {}
            }
        }

        Ok(seen)
    }
}

/// A live `Subscribe` stream.
pub struct Subscription {
    client: Client,
    /// Session snapshot taken when the subscription started.
    pub session: SessionInfo,
    /// Output history delivered with the snapshot.
    pub history: Vec<crate::protocol::OutputChunk>,
}

impl Subscription {
    async fn open(socket_path: &Path, id: &str) -> Result<Self, TestError> {
        let mut client = Client::new(socket_path.to_path_buf()).without_autostart();
        client
            .send(&Request::Subscribe { id: id.to_string() })
            .await
            .map_err(|e| TestError::RequestFailed(e.to_string()))?;
        match next_message(&mut client, Duration::from_secs(5)).await? {
            Response::Subscribed { session, history } => Ok(Self {
                client,
                session,
                history,
            }),
            _ => Err(TestError::RequestFailed("expected subscribed".into())),
        }
    }

    /// Next message on the stream, waiting at most `timeout_duration`.
    pub async fn next(&mut self, timeout_duration: Duration) -> Result<Response, TestError> {
        next_message(&mut self.client, timeout_duration).await
    }
}

async fn next_message(client: &mut Client, timeout_duration: Duration) -> Result<Response, TestError> {
    let response = tokio::time::timeout(timeout_duration, client.next_response())
        .await
        .map_err(|_| TestError::Timeout)?
        .map_err(|e| TestError::RequestFailed(e.to_string()))?
        .ok_or_else(|| TestError::RequestFailed("stream closed".into()))?;
    into_result(response)
}

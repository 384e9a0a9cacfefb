//! Integration tests for agentdeck server/client IPC.
//!
//! Each test uses a unique socket path and data directory to avoid conflicts.

use agentdeck::protocol::{CreateSession, EndReason, ErrorCode, LifecycleEvent};
use agentdeck::{Client, EngineConfig, Request, Response, Server};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Socket path and data directory unique to one test; removed on drop.
struct TestPaths {
    socket: PathBuf,
    data_dir: PathBuf,
}

impl TestPaths {
    fn new() -> Self {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let pid = std::process::id();
        Self {
            socket: PathBuf::from(format!("/tmp/agentdeck-it-{pid}-{id}.sock")),
            data_dir: PathBuf::from(format!("/tmp/agentdeck-it-{pid}-{id}")),
        }
    }

    fn config(&self) -> EngineConfig {
        EngineConfig {
            shell: "/bin/sh".into(),
            launch_delay: Duration::from_millis(50),
            kill_grace: Duration::from_millis(300),
            ..EngineConfig::with_data_dir(self.data_dir.clone())
        }
    }
}

impl Drop for TestPaths {
    fn drop(&mut self) {
        std::fs::remove_file(&self.socket).ok();
        std::fs::remove_dir_all(&self.data_dir).ok();
    }
}

async fn start_server(paths: &TestPaths) -> JoinHandle<()> {
    let socket = paths.socket.clone();
    let config = paths.config();
    let handle = tokio::spawn(async move {
        let mut server = Server::new(socket, config);
        server.run().await.expect("server run");
    });

    // Give server time to start
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle
}

fn client(paths: &TestPaths) -> Client {
    Client::new(paths.socket.clone()).without_autostart()
}

fn shell() -> CreateSession {
    CreateSession {
        agent_kind: "shell".into(),
        cwd: Some(PathBuf::from("/tmp")),
        ..CreateSession::default()
    }
}

async fn create(client: &mut Client) -> String {
    match client.request(Request::Create(shell())).await.expect("create") {
        Response::Session { session } => session.id,
        other => panic!("expected Session, got {other:?}"),
    }
}

/// Raw line-oriented connection for streaming tests.
struct RawConn {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl RawConn {
    async fn open(paths: &TestPaths) -> Self {
        let stream = UnixStream::connect(&paths.socket).await.expect("connect");
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send_line(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.expect("write");
        self.writer.write_all(b"\n").await.expect("write");
    }

    async fn send(&mut self, request: &Request) {
        self.send_line(&serde_json::to_string(request).expect("serialize")).await;
    }

    /// Next response, or `None` on EOF.
    async fn recv(&mut self) -> Option<Response> {
        let mut line = String::new();
        let n = timeout(Duration::from_secs(10), self.reader.read_line(&mut line))
            .await
            .expect("timeout")
            .expect("read");
        (n > 0).then(|| serde_json::from_str(&line).expect("valid response"))
    }
}

#[tokio::test]
async fn test_server_ping_pong() {
    let paths = TestPaths::new();
    let server_handle = start_server(&paths).await;

    // Connect and ping
    let mut client = client(&paths);
    let response = timeout(Duration::from_secs(5), client.request(Request::Ping))
        .await
        .expect("timeout")
        .expect("request failed");

    assert!(matches!(response, Response::Pong));

    // Shutdown
    let _ = client.request(Request::Shutdown).await;
    timeout(Duration::from_secs(10), server_handle)
        .await
        .expect("server should stop")
        .expect("server task");
    assert!(!paths.socket.exists(), "socket removed on shutdown");
}

#[tokio::test]
async fn test_invalid_request_keeps_connection() {
    let paths = TestPaths::new();
    let server_handle = start_server(&paths).await;

    let mut conn = RawConn::open(&paths).await;
    conn.send_line("{not json").await;
    match conn.recv().await {
        Some(Response::Error { code, .. }) => assert_eq!(code, ErrorCode::InvalidRequest),
        other => panic!("expected Error, got {other:?}"),
    }

    conn.send_line(r#"{"type":"nonsense"}"#).await;
    assert!(matches!(
        conn.recv().await,
        Some(Response::Error {
            code: ErrorCode::InvalidRequest,
            ..
        })
    ));

    // Same connection still serves requests
    conn.send(&Request::Ping).await;
    assert_eq!(conn.recv().await, Some(Response::Pong));

    server_handle.abort();
}

#[tokio::test]
async fn test_create_list_delete() {
    let paths = TestPaths::new();
    let server_handle = start_server(&paths).await;
    let mut client = client(&paths);

    let id = create(&mut client).await;

    match client.request(Request::List).await.expect("list") {
        Response::Sessions { sessions } => {
            assert_eq!(sessions.len(), 1);
            assert_eq!(sessions[0].id, id);
            assert_eq!(sessions[0].agent_kind, "shell");
            assert_eq!(sessions[0].cwd, PathBuf::from("/tmp"));
            assert!(sessions[0].pid.is_some_and(|pid| pid > 0));
        }
        other => panic!("expected Sessions, got {other:?}"),
    }

    // The session is on disk
    let state = std::fs::read_to_string(paths.data_dir.join("state.json")).expect("state written");
    assert!(state.contains(&id));

    let response = client.request(Request::Delete { id: id.clone() }).await.expect("delete");
    assert_eq!(response, Response::Ok);

    match client.request(Request::List).await.expect("list") {
        Response::Sessions { sessions } => assert!(sessions.is_empty()),
        other => panic!("expected Sessions, got {other:?}"),
    }
    let state = std::fs::read_to_string(paths.data_dir.join("state.json")).expect("state written");
    assert!(!state.contains(&id));

    let _ = client.request(Request::Shutdown).await;
    server_handle.await.ok();
}

#[tokio::test]
async fn test_unknown_session_errors() {
    let paths = TestPaths::new();
    let server_handle = start_server(&paths).await;
    let mut client = client(&paths);

    let requests = [
        Request::Get { id: "nope".into() },
        Request::Delete { id: "nope".into() },
        Request::Restart { id: "nope".into() },
        Request::Send {
            id: "nope".into(),
            data: "x".into(),
            newline: true,
        },
        Request::Resize {
            id: "nope".into(),
            rows: 10,
            cols: 10,
        },
        Request::DeleteCategory { id: "nope".into() },
    ];
    for request in requests {
        match client.request(request).await.expect("request") {
            Response::Error { code, message } => {
                assert_eq!(code, ErrorCode::NotFound);
                assert!(message.contains("nope"), "message should name the id: {message}");
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    let mut conn = RawConn::open(&paths).await;
    conn.send(&Request::Subscribe { id: "nope".into() }).await;
    assert!(matches!(
        conn.recv().await,
        Some(Response::Error {
            code: ErrorCode::NotFound,
            ..
        })
    ));

    server_handle.abort();
}

#[tokio::test]
async fn test_create_rejects_bad_parameters() {
    let paths = TestPaths::new();
    let server_handle = start_server(&paths).await;
    let mut client = client(&paths);

    let zero_rows = CreateSession {
        rows: Some(0),
        ..shell()
    };
    let unknown_category = CreateSession {
        category_id: Some("cat-missing".into()),
        ..shell()
    };
    let empty_kind = CreateSession {
        agent_kind: String::new(),
        ..shell()
    };

    for (spec, expected) in [
        (zero_rows, ErrorCode::InvalidRequest),
        (unknown_category, ErrorCode::NotFound),
        (empty_kind, ErrorCode::InvalidRequest),
    ] {
        match client.request(Request::Create(spec)).await.expect("request") {
            Response::Error { code, .. } => assert_eq!(code, expected),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    // Nothing was registered
    assert_eq!(
        client.request(Request::List).await.expect("list"),
        Response::Sessions { sessions: vec![] }
    );

    server_handle.abort();
}

#[tokio::test]
async fn test_events_stream() {
    let paths = TestPaths::new();
    let server_handle = start_server(&paths).await;

    let mut events = RawConn::open(&paths).await;
    events.send(&Request::Events { filter: vec![] }).await;
    // Give the subscription time to register before anything happens
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = client(&paths);
    let id = create(&mut client).await;
    client.request(Request::Delete { id: id.clone() }).await.expect("delete");

    let mut created = false;
    loop {
        match events.recv().await {
            Some(Response::Event(LifecycleEvent::SessionCreated { id: got, .. })) => {
                assert_eq!(got, id);
                created = true;
            }
            Some(Response::Event(LifecycleEvent::SessionDeleted { id: got })) => {
                assert_eq!(got, id);
                assert!(created, "created must precede deleted");
                break;
            }
            Some(Response::Event(_)) => {}
            other => panic!("unexpected message: {other:?}"),
        }
    }

    server_handle.abort();
}

#[tokio::test]
async fn test_subscription_ends_on_shutdown() {
    let paths = TestPaths::new();
    let server_handle = start_server(&paths).await;
    let mut client = client(&paths);
    let id = create(&mut client).await;

    let mut conn = RawConn::open(&paths).await;
    conn.send(&Request::Subscribe { id: id.clone() }).await;
    match conn.recv().await {
        Some(Response::Subscribed { session, .. }) => assert_eq!(session.id, id),
        other => panic!("expected Subscribed, got {other:?}"),
    }

    client.request(Request::Shutdown).await.expect("shutdown");

    loop {
        match conn.recv().await {
            Some(Response::SubscriptionEnded { id: got, reason }) => {
                assert_eq!(got, id);
                assert_eq!(reason, EndReason::Shutdown);
                break;
            }
            Some(Response::Output { .. } | Response::Status { .. } | Response::Metrics { .. }) => {}
            other => panic!("unexpected message: {other:?}"),
        }
    }
    assert_eq!(conn.recv().await, None);

    timeout(Duration::from_secs(10), server_handle)
        .await
        .expect("server should stop")
        .expect("server task");
}

#[tokio::test]
async fn test_symlink_socket_refused() {
    let paths = TestPaths::new();
    std::os::unix::fs::symlink("/tmp/agentdeck-does-not-matter", &paths.socket).expect("symlink");

    let mut server = Server::new(paths.socket.clone(), paths.config());
    let result = server.run().await;
    assert!(result.is_err(), "symlinked socket path must be refused");
    assert!(std::fs::symlink_metadata(&paths.socket).is_ok_and(|m| m.file_type().is_symlink()));
}

#[tokio::test]
async fn test_send_bytes_and_resize() {
    let paths = TestPaths::new();
    let server_handle = start_server(&paths).await;
    let mut client = client(&paths);
    let id = create(&mut client).await;

    let response = client
        .request(Request::SendBytes {
            id: id.clone(),
            data: b"echo bytes-ok\r".to_vec(),
        })
        .await
        .expect("send bytes");
    assert_eq!(response, Response::Ok);

    let response = client
        .request(Request::Resize {
            id: id.clone(),
            rows: 40,
            cols: 120,
        })
        .await
        .expect("resize");
    assert_eq!(response, Response::Ok);

    match client.request(Request::Get { id: id.clone() }).await.expect("get") {
        Response::Session { session } => {
            assert_eq!(session.size, (40, 120));
            assert!(session.last_input_at.is_some());
        }
        other => panic!("expected Session, got {other:?}"),
    }

    // The echoed output shows up in the subscription history
    let mut found = false;
    for _ in 0..50 {
        let mut conn = RawConn::open(&paths).await;
        conn.send(&Request::Subscribe { id: id.clone() }).await;
        if let Some(Response::Subscribed { history, .. }) = conn.recv().await {
            let text: String = history.iter().map(|c| c.data.as_str()).collect();
            if text.matches("bytes-ok").count() >= 2 {
                found = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(found, "command output should be recorded");

    let _ = client.request(Request::Shutdown).await;
    server_handle.await.ok();
}

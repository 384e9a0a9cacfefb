//! The session engine.
//!
//! [`Engine`] is a cheap handle (everything behind `Arc`) over the session
//! registry. Connection handlers and the background tasks each hold a
//! clone. The registry lock is only held for short, synchronous updates;
//! process spawning, termination and disk writes happen outside it.
//!
//! Lock order: [`Store::lock`] before the registry, never the reverse.

use super::fanout::EventReceiver;
use super::output::{now_millis, OutputBuffer, MAX_CHUNKS};
use super::registry::SessionRegistry;
use super::session::{Annotations, Provenance, Session};
use crate::client::SOCKET_ENV;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::hook::{StatusReport, SESSION_ID_ENV};
use crate::metrics::{Metrics, MetricsExtractor, SCAN_WINDOW_CHARS};
use crate::persist::{PersistedState, Store, STATE_VERSION};
use crate::prompt::{self, DEFAULT_TEMPLATE};
use crate::protocol::{
    Activity, Category, CreateSession, LifecycleEvent, OutputChunk, Position, SessionEvent,
    SessionInfo, SessionPatch,
};
use crate::pty::{self, PtyProcess, ReadOutcome};
use crate::status::SessionStatus;
use crate::workspace::{self, GitWorktreeProvisioner, WorkspaceProvisioner};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// Poll interval of the PTY reader sweep.
pub const READ_POLL: Duration = Duration::from_millis(10);

/// Reads per session per sweep, so one chatty session cannot starve the rest.
const MAX_READS_PER_SWEEP: usize = 16;

/// Handle to the session engine.
#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    registry: Arc<Mutex<SessionRegistry>>,
    store: Arc<Store>,
    provisioner: Arc<dyn WorkspaceProvisioner>,
    extractor: Arc<MetricsExtractor>,
    events: broadcast::Sender<LifecycleEvent>,
}

/// Background tasks started by [`Engine::start`]; aborted on drop.
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Something a session's shell should receive after a delay.
struct Injection {
    delay: Duration,
    bytes: Vec<u8>,
    what: &'static str,
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

impl Engine {
    /// Engine using git worktrees for workspace provisioning.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self::with_provisioner(config, Arc::new(GitWorktreeProvisioner))
    }

    #[must_use]
    pub fn with_provisioner(config: EngineConfig, provisioner: Arc<dyn WorkspaceProvisioner>) -> Self {
        // Lifecycle channel with enough capacity for bursts of status changes
        let (events, _) = broadcast::channel(1024);
        Self {
            store: Arc::new(Store::new(config.data_dir.clone())),
            extractor: Arc::new(MetricsExtractor::new(&config.metrics_tag)),
            config: Arc::new(config),
            registry: Arc::new(Mutex::new(SessionRegistry::new())),
            provisioner,
            events,
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Receive lifecycle events from now on.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: LifecycleEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Start the reader sweep, the decay tick and the buffer flush.
    #[must_use]
    pub fn start(&self) -> BackgroundTasks {
        let reader = {
            let engine = self.clone();
            tokio::spawn(async move {
                let mut poll = tokio::time::interval(READ_POLL);
                poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    poll.tick().await;
                    engine.pump_output().await;
                }
            })
        };
        let ticker = {
            let engine = self.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(engine.config.classifier.tick);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tick.tick().await;
                    engine.tick().await;
                }
            })
        };
        let flusher = {
            let engine = self.clone();
            tokio::spawn(async move {
                let period = engine.config.persist_interval;
                let mut flush = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    flush.tick().await;
                    engine.flush_buffers().await;
                }
            })
        };
        BackgroundTasks {
            handles: vec![reader, ticker, flusher],
        }
    }

    // ---------------------------------------------------------------------
    // Process controller
    // ---------------------------------------------------------------------

    /// Variables exported into a session's shell. Hooks run by the agent
    /// find their session and this server through them.
    fn shell_env(&self, id: &str) -> Vec<(String, String)> {
        let mut vars = vec![
            ("TERM".to_string(), "xterm-256color".to_string()),
            (SESSION_ID_ENV.to_string(), id.to_string()),
        ];
        if let Some(socket) = &self.config.socket_path {
            vars.push((SOCKET_ENV.to_string(), socket.display().to_string()));
        }
        vars
    }

    async fn provision_workspace(&self, cwd: &Path, spec: &CreateSession) -> PathBuf {
        let Some(branch) = spec.branch.clone().filter(|_| spec.worktree) else {
            return cwd.to_path_buf();
        };
        let provisioner = Arc::clone(&self.provisioner);
        let base_dir = cwd.to_path_buf();
        let base_branch = spec.base_branch.clone();
        let result = tokio::task::spawn_blocking(move || {
            provisioner.provision(&base_dir, &branch, base_branch.as_deref())
        })
        .await;

        match result {
            Ok(Ok(path)) => path,
            Ok(Err(e)) => {
                let err = EngineError::ProvisioningFailed(e);
                warn!(%err, cwd = %cwd.display(), "falling back to the requested directory");
                cwd.to_path_buf()
            }
            Err(e) => {
                warn!(%e, "workspace provisioning task failed");
                cwd.to_path_buf()
            }
        }
    }

    async fn resolve_branch(dir: &Path) -> Option<String> {
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || workspace::resolve_branch(&dir))
            .await
            .ok()
            .flatten()
    }

    fn schedule(&self, id: &str, generation: u64, injection: Injection) -> AbortHandle {
        let registry = Arc::clone(&self.registry);
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(injection.delay).await;
            let mut registry = registry.lock().await;
            let Some(session) = registry.get_mut(&id) else {
                return;
            };
            if session.generation != generation {
                debug!(%id, what = injection.what, "process replaced, dropping injection");
                return;
            }
            let Some(pty) = session.pty.as_ref() else {
                return;
            };
            match pty.write_all(&injection.bytes) {
                Ok(()) => debug!(%id, what = injection.what, "injected"),
                Err(e) => warn!(%id, what = injection.what, %e, "injection failed"),
            }
        })
        .abort_handle()
    }

    fn schedule_launch(&self, session: &mut Session) {
        let Some(command) = session.provenance.command.clone().and_then(non_empty) else {
            return;
        };
        let handle = self.schedule(
            &session.id,
            session.generation,
            Injection {
                delay: self.config.launch_delay,
                bytes: format!("{command}\r").into_bytes(),
                what: "launch command",
            },
        );
        session.pending.push(handle);
    }

    /// Create a session and start its shell.
    pub async fn create_session(&self, spec: CreateSession) -> Result<SessionInfo, EngineError> {
        let rows = spec.rows.unwrap_or(self.config.rows);
        let cols = spec.cols.unwrap_or(self.config.cols);
        if rows == 0 || cols == 0 {
            return Err(EngineError::InvalidRequest("terminal size must be non-zero".into()));
        }
        if spec.agent_kind.trim().is_empty() {
            return Err(EngineError::InvalidRequest("agent kind cannot be empty".into()));
        }

        let id = {
            let mut registry = self.registry.lock().await;
            if let Some(node_id) = &spec.node_id
                && registry.node_in_use(node_id)
            {
                return Err(EngineError::InvalidRequest(format!(
                    "node {node_id} already has a session"
                )));
            }
            if let Some(category_id) = spec.category_id.as_deref().filter(|c| !c.is_empty())
                && !registry.categories().contains_key(category_id)
            {
                return Err(EngineError::category_not_found(category_id));
            }
            registry.reserve_id()
        };

        let result = self.spawn_new(&id, spec, rows, cols).await;
        if result.is_err() {
            self.registry.lock().await.release(&id);
        }
        let info = result?;

        info!(id = %info.id, pid = ?info.pid, cwd = %info.cwd.display(), "Created session");
        self.emit(LifecycleEvent::SessionCreated {
            id: info.id.clone(),
            node_id: info.node_id.clone(),
        });
        self.persist_state().await;
        Ok(info)
    }

    async fn spawn_new(
        &self,
        id: &str,
        spec: CreateSession,
        rows: u16,
        cols: u16,
    ) -> Result<SessionInfo, EngineError> {
        let requested_cwd = spec
            .cwd
            .clone()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("/"));
        let cwd = self.provision_workspace(&requested_cwd, &spec).await;

        let pty = pty::spawn_shell(&self.config.shell, &cwd, rows, cols, self.shell_env(id))
            .map_err(EngineError::ProcessSpawnFailed)?;
        let branch = Self::resolve_branch(&cwd).await.or_else(|| spec.branch.clone());

        let provenance = Provenance {
            label: spec
                .label
                .clone()
                .and_then(non_empty)
                .unwrap_or_else(|| spec.agent_kind.clone()),
            agent_kind: spec.agent_kind.clone(),
            command: spec.command.clone(),
            cwd,
            branch,
            created_at: now_millis(),
        };
        let annotations = Annotations {
            category_id: spec.category_id.clone().and_then(non_empty),
            position: spec.position,
            ..Annotations::default()
        };
        let node_id = spec.node_id.clone().unwrap_or_else(|| format!("node-{id}"));

        let mut session = Session::new(
            id.to_string(),
            node_id,
            provenance,
            annotations,
            pty,
            (rows, cols),
            self.config.classifier,
        );
        self.schedule_launch(&mut session);
        if let Some(ticket) = &spec.ticket {
            let template = spec.prompt_template.as_deref().unwrap_or(DEFAULT_TEMPLATE);
            let text = prompt::render(template, ticket);
            let handle = self.schedule(
                id,
                session.generation,
                Injection {
                    delay: self.config.prompt_delay,
                    bytes: prompt::as_input(&text),
                    what: "ticket prompt",
                },
            );
            session.pending.push(handle);
        }

        let info = session.info();
        let mut registry = self.registry.lock().await;
        // A concurrent create may have claimed the node while we spawned
        if registry.node_in_use(&session.node_id) {
            session.cancel_pending();
            let node_id = session.node_id.clone();
            if let Some(pty) = session.pty.take() {
                drop(self.reap(id.to_string(), pty));
            }
            return Err(EngineError::InvalidRequest(format!(
                "node {node_id} already has a session"
            )));
        }
        registry.add(session);
        Ok(info)
    }

    /// Start a new process for a session that has none.
    pub async fn restart_session(&self, id: &str) -> Result<SessionInfo, EngineError> {
        let (cwd, (rows, cols), generation) = {
            let mut registry = self.registry.lock().await;
            let session = registry
                .get_mut(id)
                .ok_or_else(|| EngineError::session_not_found(id))?;
            if session.has_process() || session.spawning {
                return Err(EngineError::AlreadyRunning(id.to_string()));
            }
            session.spawning = true;
            session.cancel_pending();
            (
                session.provenance.cwd.clone(),
                session.size,
                session.generation + 1,
            )
        };

        let pty = match pty::spawn_shell(&self.config.shell, &cwd, rows, cols, self.shell_env(id)) {
            Ok(pty) => pty,
            Err(e) => {
                if let Some(session) = self.registry.lock().await.get_mut(id) {
                    session.spawning = false;
                }
                return Err(EngineError::ProcessSpawnFailed(e));
            }
        };
        let branch = Self::resolve_branch(&cwd).await;

        let info = {
            let mut registry = self.registry.lock().await;
            let Some(session) = registry.get_mut(id) else {
                // Deleted while we were spawning
                drop(registry);
                self.reap(id.to_string(), pty);
                return Err(EngineError::session_not_found(id));
            };
            let now = Instant::now();
            let pid = pty.pid_u32();
            session.pty = Some(pty);
            session.spawning = false;
            session.generation = generation;
            session.restored = false;
            session.classifier.reset(now);
            session.decoder.reset();
            session.metrics_scanned_at = None;
            session.status = SessionStatus::Starting;
            if branch.is_some() {
                session.provenance.branch = branch;
            }
            let event = session.status_event();
            session.observers.broadcast(&event);
            self.schedule_launch(session);

            info!(%id, %pid, "Restarted session");
            self.emit(LifecycleEvent::SessionRestarted {
                id: id.to_string(),
                pid,
            });
            self.emit(LifecycleEvent::StatusChanged {
                id: id.to_string(),
                status: session.status,
                is_restored: false,
            });
            session.info()
        };

        self.persist_state().await;
        Ok(info)
    }

    /// Hang up a process and reap it off the event loop.
    fn reap(&self, id: String, pty: PtyProcess) -> JoinHandle<()> {
        let grace = self.config.kill_grace;
        tokio::task::spawn_blocking(move || {
            let code = pty.terminate(grace);
            debug!(%id, ?code, "reaped session process");
        })
    }

    /// Terminate the process and forget the session.
    pub async fn delete_session(&self, id: &str) -> Result<(), EngineError> {
        let pty = {
            let mut registry = self.registry.lock().await;
            let mut session = registry
                .remove(id)
                .ok_or_else(|| EngineError::session_not_found(id))?;
            session.cancel_pending();
            session.observers.clear();
            session.pty.take()
        };
        if let Some(pty) = pty {
            self.reap(id.to_string(), pty);
        }

        info!(%id, "Deleted session");
        self.emit(LifecycleEvent::SessionDeleted { id: id.to_string() });

        let _guard = self.store.lock().await;
        if let Err(e) = self.store.remove_buffer(id).await {
            let err = EngineError::from(e);
            warn!(%id, %err, "failed to remove output buffer");
        }
        self.write_state_locked().await;
        Ok(())
    }

    pub async fn send_input(&self, id: &str, bytes: &[u8]) -> Result<(), EngineError> {
        let mut registry = self.registry.lock().await;
        let session = registry
            .get_mut(id)
            .ok_or_else(|| EngineError::session_not_found(id))?;
        let pty = session
            .pty
            .as_ref()
            .ok_or_else(|| EngineError::NotRunning(id.to_string()))?;
        pty.write_all(bytes).map_err(EngineError::Io)?;

        let now = Instant::now();
        session.record_input(now);
        self.refresh_session(session, now);
        Ok(())
    }

    pub async fn resize(&self, id: &str, rows: u16, cols: u16) -> Result<(), EngineError> {
        if rows == 0 || cols == 0 {
            return Err(EngineError::InvalidRequest("terminal size must be non-zero".into()));
        }
        let mut registry = self.registry.lock().await;
        let session = registry
            .get_mut(id)
            .ok_or_else(|| EngineError::session_not_found(id))?;
        if let Some(pty) = session.pty.as_mut() {
            pty.resize(rows, cols).map_err(EngineError::Io)?;
        }
        session.size = (rows, cols);
        info!(%id, %rows, %cols, "Resized session");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Output, status and metrics
    // ---------------------------------------------------------------------

    /// Scan for metrics if the session is due. Returns a changed snapshot.
    fn scan_metrics(&self, session: &mut Session, now: Instant) -> Option<Metrics> {
        if !session.metrics_dirty || !self.config.scans_metrics(&session.provenance.agent_kind) {
            return None;
        }
        if let Some(at) = session.metrics_scanned_at
            && now.saturating_duration_since(at) < self.config.metrics_ttl
        {
            return None;
        }
        session.metrics_scanned_at = Some(now);
        session.metrics_dirty = false;

        let text = session.output.tail_text(SCAN_WINDOW_CHARS);
        let next = self.extractor.refresh(session.metrics.clone(), &text);
        if next == session.metrics {
            return None;
        }
        session.metrics.clone_from(&next);
        next
    }

    /// Reclassify and rescan, broadcasting what changed: status first, then
    /// metrics.
    fn refresh_session(&self, session: &mut Session, now: Instant) {
        if let Some(status) = session.reclassify(now) {
            let event = session.status_event();
            session.observers.broadcast(&event);
            debug!(id = %session.id, %status, "status changed");
            self.emit(LifecycleEvent::StatusChanged {
                id: session.id.clone(),
                status,
                is_restored: session.restored,
            });
        }
        if let Some(metrics) = self.scan_metrics(session, now) {
            session.observers.broadcast(&SessionEvent::Metrics { metrics });
        }
    }

    fn on_output(&self, session: &mut Session, bytes: &[u8], now: Instant) {
        if let Some(data) = session.record_output(bytes, now) {
            session.observers.broadcast(&SessionEvent::Output { data });
        }
        self.refresh_session(session, now);
    }

    fn on_exit(&self, session: &mut Session, pty: PtyProcess, code: Option<i32>, now: Instant) {
        info!(id = %session.id, ?code, "Session process exited");
        session.cancel_pending();
        session.decoder.reset();
        session.classifier.reset(now);
        if code.is_none() {
            // Slave side closed but the child is still around
            self.reap(session.id.clone(), pty);
        }
        self.refresh_session(session, now);
    }

    /// Read what is available, up to a per-sweep limit. Returns whether the
    /// slave side is closed.
    fn drain(&self, session: &mut Session, buf: &mut [u8], now: Instant) -> bool {
        for _ in 0..MAX_READS_PER_SWEEP {
            let Some(pty) = session.pty.as_ref() else {
                return false;
            };
            match pty.read(buf) {
                ReadOutcome::Data(n) => self.on_output(session, &buf[..n], now),
                ReadOutcome::Empty => return false,
                ReadOutcome::Closed => return true,
            }
        }
        false
    }

    /// One sweep over every live PTY.
    pub async fn pump_output(&self) {
        let mut registry = self.registry.lock().await;
        let now = Instant::now();
        let mut buf = [0u8; 4096];

        for session in registry.list_mut() {
            if !session.has_process() {
                continue;
            }
            let mut closed = self.drain(session, &mut buf, now);

            let exit_code = match session.pty.as_ref().map(PtyProcess::try_wait) {
                Some(Ok(code)) => code,
                Some(Err(e)) => {
                    warn!(id = %session.id, %e, "wait failed");
                    None
                }
                None => None,
            };
            if exit_code.is_some() && !closed {
                // Output written right before exit is still in the master
                closed = self.drain(session, &mut buf, now);
            }
            if (closed || exit_code.is_some())
                && let Some(pty) = session.pty.take()
            {
                self.on_exit(session, pty, exit_code, now);
            }
        }
    }

    /// One decay tick over every session.
    pub async fn tick(&self) {
        let mut registry = self.registry.lock().await;
        let now = Instant::now();
        for session in registry.list_mut() {
            session.classifier.decay();
            session.prune_pending();
            self.refresh_session(session, now);
        }
    }

    /// Apply an explicit status assertion.
    pub async fn report_status(&self, report: StatusReport) -> Result<SessionInfo, EngineError> {
        let report = report.truncated();
        let mut registry = self.registry.lock().await;
        let session = registry
            .get_mut(&report.session_id)
            .ok_or_else(|| EngineError::session_not_found(&report.session_id))?;

        let now = Instant::now();
        session.classifier.assert_explicit(report.state, now);
        session.activity = Some(Activity {
            state: Some(report.state),
            tool: report.tool,
            notification: report.notification,
            prompt: report.prompt,
            reported_at: now_millis(),
        });
        debug!(id = %session.id, state = ?report.state, "explicit status");
        self.refresh_session(session, now);
        Ok(session.info())
    }

    // ---------------------------------------------------------------------
    // Queries and observers
    // ---------------------------------------------------------------------

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut registry = self.registry.lock().await;
        let now = Instant::now();
        registry
            .list_mut()
            .map(|session| {
                self.refresh_session(session, now);
                session.info()
            })
            .collect()
    }

    pub async fn get_session(&self, id: &str) -> Result<SessionInfo, EngineError> {
        let mut registry = self.registry.lock().await;
        let session = registry
            .get_mut(id)
            .ok_or_else(|| EngineError::session_not_found(id))?;
        self.refresh_session(session, Instant::now());
        Ok(session.info())
    }

    /// Attach an observer. The snapshot and the registration happen under
    /// one lock, so the first event received follows the snapshot exactly.
    pub async fn subscribe(
        &self,
        id: &str,
    ) -> Result<(SessionInfo, Vec<OutputChunk>, EventReceiver), EngineError> {
        let mut registry = self.registry.lock().await;
        let session = registry
            .get_mut(id)
            .ok_or_else(|| EngineError::session_not_found(id))?;
        self.refresh_session(session, Instant::now());
        let rx = session.observers.attach();
        Ok((session.info(), session.output.to_vec(), rx))
    }

    /// Whether a session exists.
    pub async fn contains(&self, id: &str) -> bool {
        self.registry.lock().await.contains(id)
    }

    // ---------------------------------------------------------------------
    // Annotations, positions and categories
    // ---------------------------------------------------------------------

    pub async fn patch_session(&self, patch: SessionPatch) -> Result<SessionInfo, EngineError> {
        let info = {
            let mut registry = self.registry.lock().await;
            if let Some(category_id) = patch.category_id.as_deref().filter(|c| !c.is_empty())
                && !registry.categories().contains_key(category_id)
            {
                return Err(EngineError::category_not_found(category_id));
            }
            let session = registry
                .get_mut(&patch.id)
                .ok_or_else(|| EngineError::session_not_found(&patch.id))?;
            let annotations = &mut session.annotations;
            if let Some(name) = patch.custom_name {
                annotations.custom_name = non_empty(name);
            }
            if let Some(color) = patch.custom_color {
                annotations.custom_color = non_empty(color);
            }
            if let Some(notes) = patch.notes {
                annotations.notes = non_empty(notes);
            }
            if let Some(category_id) = patch.category_id {
                annotations.category_id = non_empty(category_id);
            }
            session.info()
        };
        self.persist_state().await;
        Ok(info)
    }

    /// Apply position updates (keyed by node id) to sessions, `state.json`
    /// and `positions.json`.
    pub async fn save_positions(&self, positions: HashMap<String, Position>) {
        let _guard = self.store.lock().await;
        {
            let mut registry = self.registry.lock().await;
            for (node_id, position) in &positions {
                if let Some(session) = registry.find_by_node_mut(node_id) {
                    session.annotations.position = Some(*position);
                } else {
                    debug!(%node_id, "position for unknown node kept on disk only");
                }
            }
        }

        let mut stored = match self.store.load_positions().await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(%e, "replacing unreadable positions file");
                HashMap::new()
            }
        };
        stored.extend(positions);
        if let Err(e) = self.store.save_positions(&stored).await {
            let err = EngineError::from(e);
            error!(%err, "failed to save positions");
        }
        self.write_state_locked().await;
    }

    pub async fn create_category(
        &self,
        name: String,
        color: Option<String>,
        position: Option<Position>,
    ) -> Result<Category, EngineError> {
        let name = non_empty(name)
            .ok_or_else(|| EngineError::InvalidRequest("category name cannot be empty".into()))?;
        let category = {
            let mut registry = self.registry.lock().await;
            let category = Category {
                id: registry.generate_category_id(),
                name,
                color: color.and_then(non_empty),
                position,
            };
            registry.insert_category(category.clone());
            category
        };
        info!(id = %category.id, "Created category");
        self.persist_state().await;
        Ok(category)
    }

    pub async fn update_category(
        &self,
        id: &str,
        name: Option<String>,
        color: Option<String>,
        position: Option<Position>,
    ) -> Result<Category, EngineError> {
        let category = {
            let mut registry = self.registry.lock().await;
            let category = registry
                .category_mut(id)
                .ok_or_else(|| EngineError::category_not_found(id))?;
            if let Some(name) = name.and_then(non_empty) {
                category.name = name;
            }
            if let Some(color) = color {
                category.color = non_empty(color);
            }
            if position.is_some() {
                category.position = position;
            }
            category.clone()
        };
        self.persist_state().await;
        Ok(category)
    }

    pub async fn delete_category(&self, id: &str) -> Result<(), EngineError> {
        self.registry
            .lock()
            .await
            .remove_category(id)
            .ok_or_else(|| EngineError::category_not_found(id))?;
        info!(%id, "Deleted category");
        self.persist_state().await;
        Ok(())
    }

    pub async fn list_categories(&self) -> Vec<Category> {
        self.registry.lock().await.categories().values().cloned().collect()
    }

    // ---------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------

    async fn snapshot_state(&self) -> PersistedState {
        let registry = self.registry.lock().await;
        PersistedState {
            version: STATE_VERSION,
            nodes: registry
                .list()
                .map(|s| (s.id.clone(), s.persisted()))
                .collect(),
            categories: registry.categories().clone(),
        }
    }

    /// Snapshot and write `state.json`; the caller holds the store lock.
    async fn write_state_locked(&self) {
        let state = self.snapshot_state().await;
        if let Err(e) = self.store.save_state(&state).await {
            let err = EngineError::from(e);
            error!(%err, "in-memory state remains authoritative");
        }
    }

    /// Write `state.json` from the current registry.
    pub async fn persist_state(&self) {
        let _guard = self.store.lock().await;
        self.write_state_locked().await;
    }

    /// Write the output history of every session that changed since the
    /// last flush.
    pub async fn flush_buffers(&self) {
        let _guard = self.store.lock().await;
        let dirty: Vec<(String, Vec<OutputChunk>)> = {
            let mut registry = self.registry.lock().await;
            registry
                .list_mut()
                .filter(|s| s.buffer_dirty)
                .map(|s| {
                    s.buffer_dirty = false;
                    (s.id.clone(), s.output.to_vec())
                })
                .collect()
        };

        for (id, chunks) in dirty {
            if let Err(e) = self.store.save_buffer(&id, &chunks).await {
                let err = EngineError::from(e);
                warn!(%id, %err, "failed to flush output buffer");
                if let Some(session) = self.registry.lock().await.get_mut(&id) {
                    session.buffer_dirty = true;
                }
            }
        }
    }

    /// Rebuild placeholders for every persisted node. Run once at startup.
    pub async fn restore_sessions(&self) -> Result<usize, EngineError> {
        let state = self
            .store
            .load_state()
            .await
            .map_err(EngineError::StateUnreadable)?;
        let positions = self.store.load_positions().await.unwrap_or_else(|e| {
            warn!(%e, "ignoring unreadable positions file");
            HashMap::new()
        });

        let mut restored = Vec::with_capacity(state.nodes.len());
        for (key, mut node) in state.nodes {
            if node.session_id.is_empty() {
                node.session_id = key;
            }
            let chunks = self.store.load_buffer(&node.session_id).await.unwrap_or_else(|e| {
                warn!(id = %node.session_id, %e, "ignoring unreadable output buffer");
                Vec::new()
            });
            node.branch = Self::resolve_branch(&node.cwd).await;
            if let Some(position) = positions.get(&node.node_id) {
                node.position = Some(*position);
            }
            restored.push(Session::restored(
                node,
                OutputBuffer::from_chunks(MAX_CHUNKS, chunks),
                (self.config.rows, self.config.cols),
                self.config.classifier,
            ));
        }

        let mut registry = self.registry.lock().await;
        for category in state.categories.into_values() {
            registry.insert_category(category);
        }
        let mut count = 0;
        for session in restored {
            if registry.contains(&session.id) || registry.node_in_use(&session.node_id) {
                warn!(id = %session.id, node = %session.node_id, "skipping duplicate persisted node");
                continue;
            }
            debug!(id = %session.id, chunks = session.output.len(), "restored session");
            registry.add(session);
            count += 1;
        }
        info!(count, "Restored sessions");
        Ok(count)
    }

    /// Flush everything, end all subscriptions and terminate all processes.
    pub async fn shutdown(&self) {
        self.flush_buffers().await;
        self.persist_state().await;

        let processes: Vec<(String, PtyProcess)> = {
            let mut registry = self.registry.lock().await;
            registry
                .list_mut()
                .filter_map(|session| {
                    session.cancel_pending();
                    session.observers.clear();
                    session.pty.take().map(|pty| (session.id.clone(), pty))
                })
                .collect()
        };
        let reaping: Vec<_> = processes
            .into_iter()
            .map(|(id, pty)| self.reap(id, pty))
            .collect();
        for handle in reaping {
            handle.await.ok();
        }
        info!("Engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::WorkspaceError;
    use std::sync::atomic::{AtomicU32, Ordering};

    static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn test_config() -> EngineConfig {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        EngineConfig {
            shell: "/bin/sh".into(),
            launch_delay: Duration::from_millis(50),
            kill_grace: Duration::from_millis(200),
            ..EngineConfig::with_data_dir(PathBuf::from(format!(
                "/tmp/agentdeck-engine-test-{}-{id}",
                std::process::id()
            )))
        }
    }

    struct FailingProvisioner;

    impl WorkspaceProvisioner for FailingProvisioner {
        fn provision(&self, base_dir: &Path, _: &str, _: Option<&str>) -> Result<PathBuf, WorkspaceError> {
            Err(WorkspaceError::NotARepository(base_dir.to_path_buf()))
        }
    }

    #[tokio::test]
    async fn test_provisioning_failure_falls_back() {
        let engine = Engine::with_provisioner(test_config(), Arc::new(FailingProvisioner));
        let info = engine
            .create_session(CreateSession {
                agent_kind: "shell".into(),
                cwd: Some(PathBuf::from("/tmp")),
                branch: Some("feature".into()),
                worktree: true,
                ..CreateSession::default()
            })
            .await
            .unwrap();
        assert_eq!(info.cwd, PathBuf::from("/tmp"));
        assert_eq!(info.status, SessionStatus::Starting);
        engine.shutdown().await;
        tokio::fs::remove_dir_all(&engine.config().data_dir).await.ok();
    }

    #[test]
    fn test_shell_env_points_hooks_at_this_server() {
        let engine = Engine::new(EngineConfig {
            socket_path: Some(PathBuf::from("/tmp/agentdeck-custom.sock")),
            ..test_config()
        });
        let vars = engine.shell_env("brave-otter");
        assert!(vars.contains(&(SESSION_ID_ENV.to_string(), "brave-otter".to_string())));
        assert!(vars.contains(&(SOCKET_ENV.to_string(), "/tmp/agentdeck-custom.sock".to_string())));

        let unbound = Engine::new(test_config());
        assert!(!unbound.shell_env("x").iter().any(|(k, _)| k == SOCKET_ENV));
    }

    #[tokio::test]
    async fn test_spawn_failure_registers_nothing() {
        let engine = Engine::new(test_config());
        let result = engine
            .create_session(CreateSession {
                agent_kind: "shell".into(),
                cwd: Some(PathBuf::from("/nonexistent/agentdeck/dir")),
                ..CreateSession::default()
            })
            .await;
        assert!(matches!(result, Err(EngineError::ProcessSpawnFailed(_))));
        assert!(engine.list_sessions().await.is_empty());
        assert!(!engine.store().state_path().exists());
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let engine = Engine::new(test_config());
        assert!(matches!(engine.restart_session("nope").await, Err(EngineError::NotFound { .. })));
        assert!(matches!(engine.delete_session("nope").await, Err(EngineError::NotFound { .. })));
        assert!(matches!(engine.get_session("nope").await, Err(EngineError::NotFound { .. })));
        assert!(matches!(engine.send_input("nope", b"x").await, Err(EngineError::NotFound { .. })));
        assert!(matches!(engine.delete_category("nope").await, Err(EngineError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_patch_and_categories() {
        let engine = Engine::new(test_config());
        let info = engine
            .create_session(CreateSession {
                agent_kind: "shell".into(),
                cwd: Some(PathBuf::from("/tmp")),
                ..CreateSession::default()
            })
            .await
            .unwrap();

        let category = engine
            .create_category("Backend".into(), Some("#00ff00".into()), None)
            .await
            .unwrap();
        let patched = engine
            .patch_session(SessionPatch {
                id: info.id.clone(),
                custom_name: Some("reviewer".into()),
                category_id: Some(category.id.clone()),
                ..SessionPatch::default()
            })
            .await
            .unwrap();
        assert_eq!(patched.display_name(), "reviewer");
        assert_eq!(patched.category_id.as_deref(), Some(category.id.as_str()));

        let bogus = engine
            .patch_session(SessionPatch {
                id: info.id.clone(),
                category_id: Some("cat-missing".into()),
                ..SessionPatch::default()
            })
            .await;
        assert!(matches!(bogus, Err(EngineError::NotFound { kind: "category", .. })));

        engine.delete_category(&category.id).await.unwrap();
        assert_eq!(engine.get_session(&info.id).await.unwrap().category_id, None);

        let state = engine.store().load_state().await.unwrap();
        let node = &state.nodes[&info.id];
        assert_eq!(node.custom_name.as_deref(), Some("reviewer"));
        assert_eq!(node.category_id, None);
        assert!(state.categories.is_empty());

        engine.shutdown().await;
        tokio::fs::remove_dir_all(&engine.config().data_dir).await.ok();
    }
}

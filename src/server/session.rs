//! Session representation.

// Instant-to-wall-clock conversion stays well inside u64 millis
#![allow(clippy::cast_possible_truncation)]

use super::fanout::Observers;
use super::output::{now_millis, OutputBuffer, Utf8Decoder};
use crate::metrics::Metrics;
use crate::persist::PersistedNode;
use crate::protocol::{Activity, Position, SessionEvent, SessionInfo};
use crate::pty::PtyProcess;
use crate::status::{Classifier, ClassifierConfig, SessionStatus};
use std::path::PathBuf;
use std::time::Instant;
use tokio::task::AbortHandle;

/// Identity and provenance of a session, fixed at creation.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub agent_kind: String,
    pub label: String,
    pub command: Option<String>,
    pub cwd: PathBuf,
    pub branch: Option<String>,
    /// Unix millis.
    pub created_at: u64,
}

/// User annotations, mutable regardless of process state.
#[derive(Debug, Clone, Default)]
pub struct Annotations {
    pub custom_name: Option<String>,
    pub custom_color: Option<String>,
    pub notes: Option<String>,
    pub category_id: Option<String>,
    pub position: Option<Position>,
}

/// One managed agent process plus its metadata and observers.
pub struct Session {
    /// Unique session ID (e.g., "rusty-nail").
    pub id: String,
    pub node_id: String,
    pub provenance: Provenance,
    pub annotations: Annotations,
    /// The PTY process; `None` once it exited or for restored placeholders.
    pub pty: Option<PtyProcess>,
    /// Terminal size (rows, cols).
    pub size: (u16, u16),
    pub status: SessionStatus,
    pub classifier: Classifier,
    pub observers: Observers,
    pub output: OutputBuffer,
    pub decoder: Utf8Decoder,
    pub metrics: Option<Metrics>,
    /// Output arrived since the last metrics scan.
    pub metrics_dirty: bool,
    pub metrics_scanned_at: Option<Instant>,
    /// Reconstructed from disk and never restarted since.
    pub restored: bool,
    pub activity: Option<Activity>,
    /// A spawn for this session is in flight.
    pub spawning: bool,
    /// Incremented on every spawn; delayed injections carry the value they
    /// were scheduled for.
    pub generation: u64,
    /// Pending command/prompt injections.
    pub pending: Vec<AbortHandle>,
    /// Output arrived since the buffer was last written to disk.
    pub buffer_dirty: bool,
    pub last_output_ms: Option<u64>,
    pub last_input_ms: Option<u64>,
}

impl Session {
    /// A live session around a freshly spawned process.
    #[must_use]
    pub fn new(
        id: String,
        node_id: String,
        provenance: Provenance,
        annotations: Annotations,
        pty: PtyProcess,
        size: (u16, u16),
        classifier: ClassifierConfig,
    ) -> Self {
        Self {
            id,
            node_id,
            provenance,
            annotations,
            pty: Some(pty),
            size,
            status: SessionStatus::Starting,
            classifier: Classifier::new(classifier, Instant::now()),
            observers: Observers::default(),
            output: OutputBuffer::default(),
            decoder: Utf8Decoder::default(),
            metrics: None,
            metrics_dirty: false,
            metrics_scanned_at: None,
            restored: false,
            activity: None,
            spawning: false,
            generation: 1,
            pending: Vec::new(),
            buffer_dirty: false,
            last_output_ms: None,
            last_input_ms: None,
        }
    }

    /// A disconnected placeholder rebuilt from disk.
    #[must_use]
    pub fn restored(
        node: PersistedNode,
        output: OutputBuffer,
        size: (u16, u16),
        classifier: ClassifierConfig,
    ) -> Self {
        let provenance = Provenance {
            agent_kind: node.agent_kind,
            label: node.label,
            command: node.command,
            cwd: node.cwd,
            branch: node.branch,
            created_at: node.created_at,
        };
        let annotations = Annotations {
            custom_name: node.custom_name,
            custom_color: node.custom_color,
            notes: node.notes,
            category_id: node.category_id,
            position: node.position,
        };
        Self {
            id: node.session_id,
            node_id: node.node_id,
            provenance,
            annotations,
            pty: None,
            size,
            status: SessionStatus::Disconnected,
            classifier: Classifier::new(classifier, Instant::now()),
            observers: Observers::default(),
            last_output_ms: output.iter().last().map(|c| c.timestamp),
            output,
            decoder: Utf8Decoder::default(),
            metrics: None,
            metrics_dirty: true,
            metrics_scanned_at: None,
            restored: true,
            activity: None,
            spawning: false,
            generation: 0,
            pending: Vec::new(),
            buffer_dirty: false,
            last_input_ms: None,
        }
    }

    #[must_use]
    pub const fn has_process(&self) -> bool {
        self.pty.is_some()
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pty.as_ref().map(PtyProcess::pid_u32)
    }

    /// Resolve the status now. Returns the new status if it changed.
    pub fn reclassify(&mut self, now: Instant) -> Option<SessionStatus> {
        let next = self.classifier.classify(self.has_process(), self.status, now);
        if next == self.status {
            return None;
        }
        self.status = next;
        Some(next)
    }

    /// Status event reflecting the current state.
    #[must_use]
    pub const fn status_event(&self) -> SessionEvent {
        SessionEvent::Status {
            status: self.status,
            is_restored: self.restored,
        }
    }

    /// Record a chunk of raw output. Returns the decoded text, if any.
    pub fn record_output(&mut self, bytes: &[u8], now: Instant) -> Option<String> {
        self.classifier.record_output(bytes.len(), now);
        self.last_output_ms = Some(now_millis());
        let text = self.decoder.decode(bytes);
        if text.is_empty() {
            return None;
        }
        self.output.push(text.clone());
        self.metrics_dirty = true;
        self.buffer_dirty = true;
        Some(text)
    }

    pub fn record_input(&mut self, now: Instant) {
        self.classifier.record_input(now);
        self.last_input_ms = Some(now_millis());
    }

    /// Abort every pending injection.
    pub fn cancel_pending(&mut self) {
        for handle in self.pending.drain(..) {
            handle.abort();
        }
    }

    /// Forget finished injection tasks.
    pub fn prune_pending(&mut self) {
        self.pending.retain(|h| !h.is_finished());
    }

    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            node_id: self.node_id.clone(),
            agent_kind: self.provenance.agent_kind.clone(),
            label: self.provenance.label.clone(),
            command: self.provenance.command.clone(),
            cwd: self.provenance.cwd.clone(),
            branch: self.provenance.branch.clone(),
            created_at: self.provenance.created_at,
            status: self.status,
            is_restored: self.restored,
            pid: self.pid(),
            size: self.size,
            metrics: self.metrics.clone(),
            custom_name: self.annotations.custom_name.clone(),
            custom_color: self.annotations.custom_color.clone(),
            notes: self.annotations.notes.clone(),
            category_id: self.annotations.category_id.clone(),
            position: self.annotations.position,
            last_output_at: self.last_output_ms,
            last_input_at: self.last_input_ms,
            activity: self.activity.clone(),
            observers: self.observers.len(),
        }
    }

    /// Durable projection.
    #[must_use]
    pub fn persisted(&self) -> PersistedNode {
        PersistedNode {
            session_id: self.id.clone(),
            node_id: self.node_id.clone(),
            agent_kind: self.provenance.agent_kind.clone(),
            label: self.provenance.label.clone(),
            command: self.provenance.command.clone(),
            cwd: self.provenance.cwd.clone(),
            branch: self.provenance.branch.clone(),
            created_at: self.provenance.created_at,
            custom_name: self.annotations.custom_name.clone(),
            custom_color: self.annotations.custom_color.clone(),
            notes: self.annotations.notes.clone(),
            category_id: self.annotations.category_id.clone(),
            position: self.annotations.position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OutputChunk;

    fn node() -> PersistedNode {
        PersistedNode {
            session_id: "calm-river".into(),
            node_id: "n1".into(),
            agent_kind: "claude".into(),
            label: "Claude".into(),
            command: Some("claude".into()),
            cwd: PathBuf::from("/tmp"),
            branch: Some("stale".into()),
            created_at: 42,
            custom_name: Some("reviewer".into()),
            custom_color: None,
            notes: None,
            category_id: Some("c1".into()),
            position: Some(Position {
                x: 1.0,
                y: 2.0,
                width: None,
                height: None,
            }),
        }
    }

    #[test]
    fn test_restored_placeholder() {
        let history = OutputBuffer::from_chunks(
            10,
            vec![OutputChunk {
                timestamp: 7,
                data: "old".into(),
            }],
        );
        let mut s = Session::restored(node(), history, (24, 80), ClassifierConfig::default());
        assert_eq!(s.status, SessionStatus::Disconnected);
        assert!(s.restored);
        assert!(!s.has_process());
        assert_eq!(s.last_output_ms, Some(7));
        // Without a process nothing changes
        assert_eq!(s.reclassify(Instant::now()), None);

        let info = s.info();
        assert_eq!(info.display_name(), "reviewer");
        assert!(info.is_restored);
        assert_eq!(info.pid, None);
        assert_eq!(s.persisted(), node());
    }
}

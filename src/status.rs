//! Session status classification.
//!
//! Terminal output is noisy, so status is inferred from timing and volume
//! (a leaky-bucket counter of recent bytes) unless an instrumentation hook
//! has recently asserted a state explicitly. Explicit signals win while
//! fresh; once they age out the heuristic takes over again.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Coarse lifecycle status reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    ToolCalling,
    WaitingInput,
    Idle,
    Disconnected,
    Error,
}

impl SessionStatus {
    /// Whether the status means the agent is actively producing work.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::ToolCalling)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::ToolCalling => "tool_calling",
            Self::WaitingInput => "waiting_input",
            Self::Idle => "idle",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state asserted by out-of-band instrumentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplicitState {
    Running,
    ToolCalling,
    WaitingInput,
    Idle,
    /// Context compaction in progress; reported as `running`.
    Compacting,
    /// The agent ended but its shell is still alive; reported as `idle`.
    Ended,
    Error,
}

impl ExplicitState {
    /// The status this assertion resolves to.
    #[must_use]
    pub const fn status(self) -> SessionStatus {
        match self {
            Self::Running | Self::Compacting => SessionStatus::Running,
            Self::ToolCalling => SessionStatus::ToolCalling,
            Self::WaitingInput => SessionStatus::WaitingInput,
            Self::Idle | Self::Ended => SessionStatus::Idle,
            Self::Error => SessionStatus::Error,
        }
    }
}

/// Thresholds for the classifier.
#[derive(Debug, Clone, Copy)]
pub struct ClassifierConfig {
    /// Output within this window counts as "currently running".
    pub active_window: Duration,
    /// Silence longer than this means idle.
    pub idle_after: Duration,
    /// How long an explicit signal takes precedence over the heuristic.
    pub explicit_ttl: Duration,
    /// Bytes removed from the decay counter per tick.
    pub decay_step: u64,
    /// Upper bound on the decay counter. A non-empty counter means running
    /// regardless of silence, so a burst keeps a quiet session running for
    /// up to `decay_cap / decay_step` ticks. Keep that below `idle_after`.
    pub decay_cap: u64,
    /// Interval of the decay tick.
    pub tick: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            active_window: Duration::from_secs(2),
            idle_after: Duration::from_secs(5),
            explicit_ttl: Duration::from_secs(30),
            decay_step: 512,
            decay_cap: 4 * 1024,
            tick: Duration::from_millis(500),
        }
    }
}

/// Per-session classifier state.
#[derive(Debug, Clone)]
pub struct Classifier {
    config: ClassifierConfig,
    spawned_at: Instant,
    last_output: Option<Instant>,
    last_input: Option<Instant>,
    recent_bytes: u64,
    explicit: Option<(ExplicitState, Instant)>,
}

impl Classifier {
    #[must_use]
    pub const fn new(config: ClassifierConfig, now: Instant) -> Self {
        Self {
            config,
            spawned_at: now,
            last_output: None,
            last_input: None,
            recent_bytes: 0,
            explicit: None,
        }
    }

    /// Forget everything observed about the previous process.
    pub fn reset(&mut self, now: Instant) {
        *self = Self::new(self.config, now);
    }

    pub fn record_output(&mut self, bytes: usize, now: Instant) {
        let bytes = u64::try_from(bytes).unwrap_or(u64::MAX);
        self.recent_bytes = self
            .recent_bytes
            .saturating_add(bytes)
            .min(self.config.decay_cap);
        self.last_output = Some(now);
    }

    /// Record user input. Answering a prompt invalidates a pending
    /// "waiting for input" assertion.
    pub fn record_input(&mut self, now: Instant) {
        self.last_input = Some(now);
        if matches!(self.explicit, Some((ExplicitState::WaitingInput, _))) {
            self.explicit = None;
        }
    }

    pub const fn assert_explicit(&mut self, state: ExplicitState, now: Instant) {
        self.explicit = Some((state, now));
    }

    /// One decay tick.
    pub const fn decay(&mut self) {
        self.recent_bytes = self.recent_bytes.saturating_sub(self.config.decay_step);
    }

    #[must_use]
    pub const fn recent_bytes(&self) -> u64 {
        self.recent_bytes
    }

    #[must_use]
    pub const fn last_output(&self) -> Option<Instant> {
        self.last_output
    }

    #[must_use]
    pub const fn last_input(&self) -> Option<Instant> {
        self.last_input
    }

    /// The explicit state if it is still fresh.
    #[must_use]
    pub fn fresh_explicit(&self, now: Instant) -> Option<ExplicitState> {
        self.explicit
            .filter(|(_, at)| now.saturating_duration_since(*at) < self.config.explicit_ttl)
            .map(|(state, _)| state)
    }

    /// Resolve the current status.
    #[must_use]
    pub fn classify(&self, has_process: bool, previous: SessionStatus, now: Instant) -> SessionStatus {
        if let Some(state) = self.fresh_explicit(now) {
            let status = state.status();
            if has_process || !status.is_active() {
                return status;
            }
        }

        if !has_process {
            return SessionStatus::Disconnected;
        }

        let Some(last_output) = self.last_output else {
            return if now.saturating_duration_since(self.spawned_at) >= self.config.idle_after {
                SessionStatus::Idle
            } else {
                SessionStatus::Starting
            };
        };

        let silence = now.saturating_duration_since(last_output);
        if self.recent_bytes > 0 || silence < self.config.active_window {
            return SessionStatus::Running;
        }
        if silence >= self.config.idle_after {
            return SessionStatus::Idle;
        }

        match previous {
            SessionStatus::Starting | SessionStatus::Disconnected | SessionStatus::Error => {
                SessionStatus::Running
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier(now: Instant) -> Classifier {
        Classifier::new(ClassifierConfig::default(), now)
    }

    #[test]
    fn test_starts_in_starting() {
        let t0 = Instant::now();
        let c = classifier(t0);
        assert_eq!(c.classify(true, SessionStatus::Starting, t0), SessionStatus::Starting);
    }

    #[test]
    fn test_output_means_running() {
        let t0 = Instant::now();
        let mut c = classifier(t0);
        c.record_output(10, t0);
        assert_eq!(c.classify(true, SessionStatus::Starting, t0), SessionStatus::Running);
    }

    #[test]
    fn test_decay_then_idle() {
        let t0 = Instant::now();
        let mut c = classifier(t0);
        c.record_output(100, t0);
        c.decay();
        assert_eq!(c.recent_bytes(), 0);

        // Between the active window and the idle threshold the previous state holds
        let t3 = t0 + Duration::from_secs(3);
        assert_eq!(c.classify(true, SessionStatus::Running, t3), SessionStatus::Running);

        let t6 = t0 + Duration::from_secs(6);
        assert_eq!(c.classify(true, SessionStatus::Running, t6), SessionStatus::Idle);
    }

    #[test]
    fn test_decay_floors_at_zero_and_caps() {
        let t0 = Instant::now();
        let mut c = classifier(t0);
        c.record_output(usize::MAX, t0);
        assert_eq!(c.recent_bytes(), ClassifierConfig::default().decay_cap);
        for _ in 0..1000 {
            c.decay();
        }
        assert_eq!(c.recent_bytes(), 0);
    }

    #[test]
    fn test_burst_drains_before_idle_threshold() {
        let config = ClassifierConfig::default();
        let t0 = Instant::now();
        let mut c = classifier(t0);
        c.record_output(10 * 1024 * 1024, t0);

        let ticks = config.idle_after.as_millis() / config.tick.as_millis();
        for _ in 0..ticks {
            c.decay();
        }
        assert_eq!(c.recent_bytes(), 0);
        let later = t0 + config.idle_after;
        assert_eq!(c.classify(true, SessionStatus::Running, later), SessionStatus::Idle);
    }

    #[test]
    fn test_recent_volume_keeps_running_past_window() {
        let t0 = Instant::now();
        let mut c = classifier(t0);
        c.record_output(4096, t0);
        let t3 = t0 + Duration::from_secs(3);
        assert_eq!(c.classify(true, SessionStatus::Idle, t3), SessionStatus::Running);
    }

    #[test]
    fn test_no_output_goes_idle_after_threshold() {
        let t0 = Instant::now();
        let c = classifier(t0);
        let t6 = t0 + Duration::from_secs(6);
        assert_eq!(c.classify(true, SessionStatus::Starting, t6), SessionStatus::Idle);
    }

    #[test]
    fn test_never_running_without_process() {
        let t0 = Instant::now();
        let mut c = classifier(t0);
        c.record_output(4096, t0);
        assert_eq!(c.classify(false, SessionStatus::Running, t0), SessionStatus::Disconnected);

        c.assert_explicit(ExplicitState::Running, t0);
        assert_eq!(c.classify(false, SessionStatus::Running, t0), SessionStatus::Disconnected);

        c.assert_explicit(ExplicitState::ToolCalling, t0);
        assert_eq!(c.classify(false, SessionStatus::Running, t0), SessionStatus::Disconnected);
    }

    #[test]
    fn test_explicit_non_active_overrides_disconnected() {
        let t0 = Instant::now();
        let mut c = classifier(t0);
        c.assert_explicit(ExplicitState::Error, t0);
        assert_eq!(c.classify(false, SessionStatus::Disconnected, t0), SessionStatus::Error);
    }

    #[test]
    fn test_explicit_overrides_heuristic() {
        let t0 = Instant::now();
        let mut c = classifier(t0);
        c.record_output(4096, t0);
        assert_eq!(c.classify(true, SessionStatus::Starting, t0), SessionStatus::Running);

        c.assert_explicit(ExplicitState::WaitingInput, t0);
        assert_eq!(c.classify(true, SessionStatus::Running, t0), SessionStatus::WaitingInput);

        c.assert_explicit(ExplicitState::ToolCalling, t0);
        assert_eq!(c.classify(true, SessionStatus::WaitingInput, t0), SessionStatus::ToolCalling);
    }

    #[test]
    fn test_explicit_expires() {
        let t0 = Instant::now();
        let mut c = classifier(t0);
        c.assert_explicit(ExplicitState::ToolCalling, t0);
        let later = t0 + Duration::from_secs(31);
        assert_eq!(c.fresh_explicit(later), None);
        // No output ever, idle threshold passed long ago
        assert_eq!(c.classify(true, SessionStatus::ToolCalling, later), SessionStatus::Idle);
    }

    #[test]
    fn test_compacting_and_ended_mapping() {
        assert_eq!(ExplicitState::Compacting.status(), SessionStatus::Running);
        assert_eq!(ExplicitState::Ended.status(), SessionStatus::Idle);
    }

    #[test]
    fn test_input_clears_waiting_input() {
        let t0 = Instant::now();
        let mut c = classifier(t0);
        c.assert_explicit(ExplicitState::WaitingInput, t0);
        c.record_input(t0);
        assert_eq!(c.fresh_explicit(t0), None);

        c.assert_explicit(ExplicitState::ToolCalling, t0);
        c.record_input(t0);
        assert_eq!(c.fresh_explicit(t0), Some(ExplicitState::ToolCalling));
    }

    #[test]
    fn test_restart_from_disconnected_resumes_running() {
        let t0 = Instant::now();
        let mut c = classifier(t0);
        c.record_output(1, t0);
        c.decay();
        let t3 = t0 + Duration::from_secs(3);
        assert_eq!(c.classify(true, SessionStatus::Disconnected, t3), SessionStatus::Running);
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&SessionStatus::WaitingInput).unwrap();
        assert_eq!(json, "\"waiting_input\"");
        let state: ExplicitState = serde_json::from_str("\"tool_calling\"").unwrap();
        assert_eq!(state, ExplicitState::ToolCalling);
    }
}

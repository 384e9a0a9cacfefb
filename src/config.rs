//! Engine configuration.

use crate::metrics::DEFAULT_TAG;
use crate::status::ClassifierConfig;
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the session engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Shell started in every session's PTY.
    pub shell: String,
    pub rows: u16,
    pub cols: u16,
    /// Delay between spawning the shell and typing the launch command.
    pub launch_delay: Duration,
    /// Delay between spawning the shell and typing a ticket prompt.
    pub prompt_delay: Duration,
    /// Marker name scanned for by the metrics extractor.
    pub metrics_tag: String,
    /// Minimum time between two metrics scans of the same session.
    pub metrics_ttl: Duration,
    /// Agent kinds whose output carries metrics markers.
    pub metrics_agents: Vec<String>,
    /// Interval of the output buffer flush.
    pub persist_interval: Duration,
    /// Time between SIGHUP and SIGKILL when deleting a session.
    pub kill_grace: Duration,
    /// Where state, positions and buffers are stored.
    pub data_dir: PathBuf,
    /// Socket the server listens on; exported to session shells so hooks
    /// running inside them report back to this server.
    pub socket_path: Option<PathBuf>,
    pub classifier: ClassifierConfig,
}

/// Shell used when `$SHELL` is unset.
pub const FALLBACK_SHELL: &str = "/bin/sh";

/// Default data directory: `$XDG_DATA_HOME/agentdeck`.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("agentdeck")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shell: std::env::var("SHELL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| FALLBACK_SHELL.to_string()),
            rows: 24,
            cols: 80,
            launch_delay: Duration::from_millis(500),
            prompt_delay: Duration::from_secs(5),
            metrics_tag: DEFAULT_TAG.to_string(),
            metrics_ttl: Duration::from_secs(2),
            metrics_agents: vec!["claude".to_string()],
            persist_interval: Duration::from_secs(5),
            kill_grace: Duration::from_secs(2),
            data_dir: default_data_dir(),
            socket_path: None,
            classifier: ClassifierConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Default configuration rooted at `data_dir`.
    #[must_use]
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            ..Self::default()
        }
    }

    /// Whether sessions of `agent_kind` are scanned for metrics.
    #[must_use]
    pub fn scans_metrics(&self, agent_kind: &str) -> bool {
        self.metrics_agents
            .iter()
            .any(|k| k.eq_ignore_ascii_case(agent_kind))
    }
}

/// Server options.
#[derive(Debug, Clone, Args)]
pub struct ServerArgs {
    /// Run as a daemon (fork to background).
    #[arg(long)]
    pub daemon: bool,

    /// Directory for persisted state and output buffers.
    #[arg(long, env = "AGENTDECK_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Shell started in each session.
    #[arg(long, env = "SHELL", default_value = FALLBACK_SHELL)]
    pub shell: String,

    /// Terminal rows for new sessions.
    #[arg(long, default_value = "24")]
    pub rows: u16,

    /// Terminal columns for new sessions.
    #[arg(long, default_value = "80")]
    pub cols: u16,

    /// Milliseconds to wait before typing the launch command.
    #[arg(long, default_value = "500", value_name = "MILLIS")]
    pub launch_delay: u64,

    /// Milliseconds to wait before typing a ticket prompt.
    #[arg(long, default_value = "5000", value_name = "MILLIS")]
    pub prompt_delay: u64,

    /// Marker name of embedded metrics.
    #[arg(long, default_value = DEFAULT_TAG)]
    pub metrics_tag: String,

    /// Agent kinds that print metrics markers (comma-separated).
    #[arg(long, value_delimiter = ',', default_value = "claude")]
    pub metrics_agents: Vec<String>,

    /// Seconds an explicit status report takes precedence over heuristics.
    #[arg(long, default_value = "30", value_name = "SECS")]
    pub explicit_ttl: u64,

    /// Seconds of silence after which a session is idle.
    #[arg(long, default_value = "5", value_name = "SECS")]
    pub idle_after: u64,
}

impl From<ServerArgs> for EngineConfig {
    fn from(args: ServerArgs) -> Self {
        let defaults = Self::default();
        Self {
            shell: if args.shell.is_empty() {
                FALLBACK_SHELL.to_string()
            } else {
                args.shell
            },
            rows: args.rows,
            cols: args.cols,
            launch_delay: Duration::from_millis(args.launch_delay),
            prompt_delay: Duration::from_millis(args.prompt_delay),
            metrics_tag: args.metrics_tag,
            metrics_agents: args.metrics_agents,
            data_dir: args.data_dir.unwrap_or(defaults.data_dir),
            classifier: ClassifierConfig {
                explicit_ttl: Duration::from_secs(args.explicit_ttl),
                idle_after: Duration::from_secs(args.idle_after),
                ..defaults.classifier
            },
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        server: ServerArgs,
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!((config.rows, config.cols), (24, 80));
        assert_eq!(config.launch_delay, Duration::from_millis(500));
        assert_eq!(config.prompt_delay, Duration::from_secs(5));
        assert!(config.scans_metrics("claude"));
        assert!(config.scans_metrics("Claude"));
        assert!(!config.scans_metrics("shell"));
    }

    #[test]
    fn test_server_args_conversion() {
        let w = Wrapper::parse_from([
            "x",
            "--data-dir",
            "/tmp/agentdeck-config-test",
            "--shell",
            "/bin/bash",
            "--metrics-agents",
            "claude,codex",
            "--explicit-ttl",
            "10",
        ]);
        let config = EngineConfig::from(w.server);
        assert_eq!(config.shell, "/bin/bash");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/agentdeck-config-test"));
        assert!(config.scans_metrics("codex"));
        assert_eq!(config.classifier.explicit_ttl, Duration::from_secs(10));
        assert_eq!(config.classifier.decay_step, 512);
    }
}

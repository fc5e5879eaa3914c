use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Durable tmux-backed shell sessions, driven by line-delimited JSON tool calls on stdin
#[derive(Debug, Parser)]
#[command(name = "agent-shell", version, about)]
pub struct Cli {
    /// tmux executable
    #[arg(long, env = "AGENT_SHELL_TMUX_BIN", default_value = "tmux")]
    pub tmux_bin: String,

    /// Shell to start in new session windows (tmux default shell when unset).
    /// Must understand POSIX `( ... )` and `$?`.
    #[arg(long, env = "AGENT_SHELL_SHELL")]
    pub shell: Option<String>,

    /// Deadline for a single tmux invocation
    #[arg(long, value_name = "MS", env = "AGENT_SHELL_ADAPTER_TIMEOUT_MS", default_value = "10000")]
    pub adapter_timeout_ms: u64,

    /// Interval between completion-marker checks
    #[arg(long, value_name = "MS", env = "AGENT_SHELL_POLL_INTERVAL_MS", default_value = "100")]
    pub poll_interval_ms: u64,

    /// Default command timeout when a call does not specify one
    #[arg(long, value_name = "SECONDS", env = "AGENT_SHELL_COMMAND_TIMEOUT_SECS", default_value = "30")]
    pub command_timeout_secs: u64,

    /// Attempts per command (and per session creation) before giving up
    #[arg(long, value_name = "COUNT", env = "AGENT_SHELL_MAX_ATTEMPTS", default_value = "3")]
    pub max_attempts: u32,

    /// Delay between attempts
    #[arg(long, value_name = "MS", env = "AGENT_SHELL_RETRY_DELAY_MS", default_value = "500")]
    pub retry_delay_ms: u64,

    /// Sessions idle longer than this are destroyed by the cleanup sweep
    #[arg(long, value_name = "MINUTES", env = "AGENT_SHELL_IDLE_THRESHOLD_MINS", default_value = "30")]
    pub idle_threshold_mins: u64,

    /// Interval between cleanup sweeps
    #[arg(long, value_name = "MINUTES", env = "AGENT_SHELL_CLEANUP_INTERVAL_MINS", default_value = "10")]
    pub cleanup_interval_mins: u64,

    /// How long a responsiveness probe may take
    #[arg(long, value_name = "MS", env = "AGENT_SHELL_PROBE_TIMEOUT_MS", default_value = "2000")]
    pub probe_timeout_ms: u64,

    /// Directory for per-execution capture and sentinel files
    #[arg(long, env = "AGENT_SHELL_ARTIFACT_DIR")]
    pub artifact_dir: Option<PathBuf>,

    /// Leftover artifacts older than this are swept
    #[arg(long, value_name = "MINUTES", env = "AGENT_SHELL_ORPHAN_MAX_AGE_MINS", default_value = "45")]
    pub orphan_max_age_mins: u64,

    /// Directory for shell history and UI mirror logs
    #[arg(long, env = "AGENT_SHELL_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Do not create the `ui` window that mirrors executed commands
    #[arg(long, env = "AGENT_SHELL_NO_MIRROR_UI")]
    pub no_mirror_ui: bool,
}

/// Resolved runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub tmux_bin: String,
    pub shell: Option<String>,
    pub adapter_timeout: Duration,
    pub poll_interval: Duration,
    pub default_command_timeout: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub idle_threshold: Duration,
    pub cleanup_interval: Duration,
    pub probe_timeout: Duration,
    pub artifact_dir: PathBuf,
    pub orphan_max_age: Duration,
    pub state_dir: PathBuf,
    pub mirror_ui: bool,
}

const MINUTE: u64 = 60;

impl Config {
    pub fn history_dir(&self) -> PathBuf {
        self.state_dir.join("history")
    }

    pub fn mirror_dir(&self) -> PathBuf {
        self.state_dir.join("mirror")
    }

    /// Fast timings and directories rooted at `root`
    #[cfg(test)]
    pub fn for_tests(root: &std::path::Path) -> Self {
        Self {
            artifact_dir: root.join("artifacts"),
            state_dir: root.join("state"),
            poll_interval: Duration::from_millis(20),
            retry_delay: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(500),
            ..Self::default()
        }
    }

    fn default_artifact_dir() -> PathBuf {
        std::env::temp_dir().join("agent-shell")
    }

    fn default_state_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".agent-shell")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tmux_bin: "tmux".to_string(),
            shell: None,
            adapter_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            default_command_timeout: Duration::from_secs(30),
            max_attempts: 3,
            retry_delay: Duration::from_millis(500),
            idle_threshold: Duration::from_secs(30 * MINUTE),
            cleanup_interval: Duration::from_secs(10 * MINUTE),
            probe_timeout: Duration::from_secs(2),
            artifact_dir: Self::default_artifact_dir(),
            orphan_max_age: Duration::from_secs(45 * MINUTE),
            state_dir: Self::default_state_dir(),
            mirror_ui: true,
        }
    }
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        Self {
            tmux_bin: cli.tmux_bin,
            shell: cli.shell,
            adapter_timeout: Duration::from_millis(cli.adapter_timeout_ms),
            poll_interval: Duration::from_millis(cli.poll_interval_ms.max(1)),
            default_command_timeout: Duration::from_secs(cli.command_timeout_secs),
            max_attempts: cli.max_attempts.max(1),
            retry_delay: Duration::from_millis(cli.retry_delay_ms),
            idle_threshold: Duration::from_secs(cli.idle_threshold_mins * MINUTE),
            cleanup_interval: Duration::from_secs(cli.cleanup_interval_mins.max(1) * MINUTE),
            probe_timeout: Duration::from_millis(cli.probe_timeout_ms),
            artifact_dir: cli.artifact_dir.unwrap_or_else(Self::default_artifact_dir),
            orphan_max_age: Duration::from_secs(cli.orphan_max_age_mins * MINUTE),
            state_dir: cli.state_dir.unwrap_or_else(Self::default_state_dir),
            mirror_ui: !cli.no_mirror_ui,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_match_config_defaults() {
        let config = Config::from(Cli::parse_from(["agent-shell"]));
        let defaults = Config::default();
        assert_eq!(config.poll_interval, defaults.poll_interval);
        assert_eq!(config.idle_threshold, defaults.idle_threshold);
        assert_eq!(config.cleanup_interval, defaults.cleanup_interval);
        assert_eq!(config.max_attempts, defaults.max_attempts);
        assert!(config.mirror_ui);
    }

    #[test]
    fn test_cli_overrides() {
        let config = Config::from(Cli::parse_from([
            "agent-shell",
            "--idle-threshold-mins",
            "5",
            "--max-attempts",
            "0",
            "--artifact-dir",
            "/var/tmp/x",
            "--no-mirror-ui",
        ]));
        assert_eq!(config.idle_threshold, Duration::from_secs(300));
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.artifact_dir, PathBuf::from("/var/tmp/x"));
        assert!(!config.mirror_ui);
        assert_eq!(config.mirror_dir(), config.state_dir.join("mirror"));
    }
}

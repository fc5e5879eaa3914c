use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::errors::{self, TmuxError};
use super::{Multiplexer, NewSession, TmuxSession};

/// Captured result of one tmux invocation
#[derive(Debug, Clone)]
pub struct TmuxOutput {
    pub stdout: String,
}

/// Client for interacting with tmux via CLI
pub struct TmuxClient {
    /// Path to tmux binary
    tmux_path: String,
    /// Deadline for every single invocation
    timeout: Duration,
}

impl TmuxClient {
    pub fn new(tmux_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            tmux_path: tmux_path.into(),
            timeout,
        }
    }

    /// Run one tmux subcommand with a bounded wall-clock deadline.
    ///
    /// The child runs in its own process group, which is killed as a whole
    /// when the deadline elapses.
    pub async fn run(&self, args: &[&str], timeout: Duration) -> Result<TmuxOutput, TmuxError> {
        let subcommand = args.first().copied().unwrap_or_default();
        debug!(?args, "tmux");

        let mut cmd = Command::new(&self.tmux_path);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(TmuxError::BinaryMissing(self.tmux_path.clone()));
            }
            Err(e) => return Err(TmuxError::Io(e)),
        };
        let pid = child.id();
        let started = Instant::now();

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                warn!(subcommand, ?timeout, "tmux invocation timed out");
                return Err(TmuxError::Timeout {
                    command: subcommand.to_string(),
                    elapsed: started.elapsed(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            return Err(errors::failure(subcommand, output.status.code(), &stderr));
        }

        if !stderr.trim().is_empty() {
            debug!(subcommand, stderr = %stderr.trim(), "tmux wrote to stderr");
        }
        Ok(TmuxOutput { stdout })
    }

    async fn run_default(&self, args: &[&str]) -> Result<TmuxOutput, TmuxError> {
        self.run(args, self.timeout).await
    }

    fn parse_session_line(line: &str) -> Option<TmuxSession> {
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() < 4 {
            return None;
        }

        Some(TmuxSession {
            id: parts[0].to_string(),
            name: parts[1].to_string(),
            created_at: parts[2].parse().unwrap_or(0),
            attached_clients: parts[3].parse().unwrap_or(0),
        })
    }
}

/// Exact-match session target, so "build" never resolves to "build2"
fn session_target(session: &str) -> String {
    format!("={}", session)
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: the child was spawned as the leader of its own process group.
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

#[async_trait]
impl Multiplexer for TmuxClient {
    async fn check_available(&self) -> Result<String, TmuxError> {
        let output = self.run_default(&["-V"]).await?;
        Ok(output.stdout.trim().to_string())
    }

    async fn new_session(&self, spec: &NewSession) -> Result<(), TmuxError> {
        let mut args: Vec<String> = vec![
            "new-session".into(),
            "-d".into(),
            "-s".into(),
            spec.name.clone(),
            "-n".into(),
            spec.window.clone(),
        ];
        if let Some(history) = &spec.history_file {
            args.push("-e".into());
            args.push(format!("HISTFILE={}", history.display()));
        }
        if let Some(shell) = &spec.shell {
            args.push(shell.clone());
        }

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_default(&args).await?;
        Ok(())
    }

    async fn new_window(
        &self,
        session: &str,
        window: &str,
        command: Option<&str>,
    ) -> Result<(), TmuxError> {
        let target = format!("{}:", session_target(session));
        let mut args = vec!["new-window", "-d", "-t", &target, "-n", window];
        if let Some(command) = command {
            args.push(command);
        }
        self.run_default(&args).await?;
        Ok(())
    }

    async fn list_windows(&self, session: &str) -> Result<Vec<String>, TmuxError> {
        let target = session_target(session);
        let output = self
            .run_default(&["list-windows", "-t", &target, "-F", "#{window_name}"])
            .await?;
        Ok(output
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    async fn list_sessions(&self) -> Result<Vec<TmuxSession>, TmuxError> {
        // Format: session_id|session_name|session_created|session_attached
        let result = self
            .run_default(&[
                "list-sessions",
                "-F",
                "#{session_id}|#{session_name}|#{session_created}|#{session_attached}",
            ])
            .await;

        let output = match result {
            Ok(output) => output,
            Err(TmuxError::NoServer(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        Ok(output
            .stdout
            .lines()
            .filter_map(Self::parse_session_line)
            .collect())
    }

    async fn capture_pane(
        &self,
        target: &str,
        scrollback: Option<usize>,
    ) -> Result<String, TmuxError> {
        let start;
        let mut args = vec!["capture-pane", "-p", "-J", "-t", target];
        if let Some(lines) = scrollback {
            start = format!("-{}", lines);
            args.push("-S");
            args.push(&start);
        }
        let output = self.run_default(&args).await?;
        Ok(output.stdout)
    }

    async fn send_keys(
        &self,
        target: &str,
        keys: &str,
        literal: bool,
        enter: bool,
    ) -> Result<(), TmuxError> {
        if literal {
            if !keys.is_empty() {
                self.run_default(&["send-keys", "-t", target, "-l", "--", keys])
                    .await?;
            }
        } else {
            let mut args = vec!["send-keys", "-t", target];
            args.extend(keys.split_whitespace());
            self.run_default(&args).await?;
        }

        if enter {
            self.run_default(&["send-keys", "-t", target, "Enter"]).await?;
        }
        Ok(())
    }

    async fn kill_session(&self, session: &str) -> Result<(), TmuxError> {
        let target = session_target(session);
        self.run_default(&["kill-session", "-t", &target]).await?;
        Ok(())
    }

    async fn pane_current_path(&self, target: &str) -> Result<String, TmuxError> {
        let output = self
            .run_default(&["display-message", "-p", "-t", target, "#{pane_current_path}"])
            .await?;
        Ok(output.stdout.trim().to_string())
    }
}

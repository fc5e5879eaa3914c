mod client;
mod errors;
#[cfg(test)]
pub mod fake;

pub use client::TmuxClient;
pub use errors::TmuxError;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Represents a tmux session as reported by `list-sessions`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmuxSession {
    /// Session ID (e.g., "$0")
    pub id: String,
    /// Session name
    pub name: String,
    /// Unix timestamp when session was created
    pub created_at: u64,
    /// Number of attached clients
    pub attached_clients: usize,
}

/// Parameters for `new-session`
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub name: String,
    /// Name of the first window
    pub window: String,
    /// Shell command for the first window, tmux default shell when absent
    pub shell: Option<String>,
    /// Isolated shell history file
    pub history_file: Option<PathBuf>,
}

/// Capability interface over the terminal multiplexer.
///
/// Sessions are addressed by bare name; window-level targets come from
/// [`window_target`].
#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Verify the backend binary can be executed
    async fn check_available(&self) -> Result<String, TmuxError>;

    async fn new_session(&self, spec: &NewSession) -> Result<(), TmuxError>;

    /// Create a window, optionally running `command` instead of a shell
    async fn new_window(
        &self,
        session: &str,
        window: &str,
        command: Option<&str>,
    ) -> Result<(), TmuxError>;

    /// Names of the windows in `session`
    async fn list_windows(&self, session: &str) -> Result<Vec<String>, TmuxError>;

    /// All sessions on the server; empty when no server is running
    async fn list_sessions(&self) -> Result<Vec<TmuxSession>, TmuxError>;

    /// Pane text, optionally including `scrollback` lines of history
    async fn capture_pane(
        &self,
        target: &str,
        scrollback: Option<usize>,
    ) -> Result<String, TmuxError>;

    /// Send `keys` to `target`. Literal text is not interpreted as key names.
    async fn send_keys(
        &self,
        target: &str,
        keys: &str,
        literal: bool,
        enter: bool,
    ) -> Result<(), TmuxError>;

    async fn kill_session(&self, session: &str) -> Result<(), TmuxError>;

    /// Current working directory of the pane's foreground process
    async fn pane_current_path(&self, target: &str) -> Result<String, TmuxError>;
}

/// Format an exact-match `session:window` target
pub fn window_target(session: &str, window: &str) -> String {
    format!("={}:{}", session, window)
}

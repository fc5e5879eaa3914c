use std::time::Duration;
use thiserror::Error;

use crate::tmux::TmuxError;

/// Failures of the session subsystem
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("terminal multiplexer unavailable: {0}")]
    BackendMissing(String),

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("session '{id}' is missing windows: {}", missing.join(", "))]
    SessionMisconfigured { id: String, missing: Vec<String> },

    #[error("session '{0}' was destroyed while a command was running")]
    SessionLost(String),

    #[error("command did not complete within {0:?}")]
    Timeout(Duration),

    #[error("failed to create session '{id}' after {attempts} attempts: {source}")]
    SessionCreateFailed {
        id: String,
        attempts: u32,
        #[source]
        source: TmuxError,
    },

    #[error("invalid session id '{0}'")]
    InvalidSessionId(String),

    #[error(transparent)]
    Adapter(TmuxError),

    #[error("artifact io error: {0}")]
    Artifact(#[from] std::io::Error),
}

impl From<TmuxError> for SessionError {
    fn from(err: TmuxError) -> Self {
        match err {
            TmuxError::BinaryMissing(bin) => SessionError::BackendMissing(bin),
            other => SessionError::Adapter(other),
        }
    }
}

impl SessionError {
    /// Whether bounded retry (with session repair) may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            SessionError::Adapter(e) => e.is_transient(),
            SessionError::SessionCreateFailed { source, .. } => source.is_transient(),
            SessionError::Timeout(_)
            | SessionError::SessionNotFound(_)
            | SessionError::SessionMisconfigured { .. }
            | SessionError::Artifact(_) => true,
            SessionError::SessionLost(_)
            | SessionError::BackendMissing(_)
            | SessionError::InvalidSessionId(_) => false,
        }
    }

    /// Stable machine-readable name
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::BackendMissing(_) => "backend_missing",
            SessionError::SessionNotFound(_) => "session_not_found",
            SessionError::SessionMisconfigured { .. } => "session_misconfigured",
            SessionError::SessionLost(_) => "session_lost",
            SessionError::Timeout(_) => "timeout",
            SessionError::SessionCreateFailed { .. } => "session_create_failed",
            SessionError::InvalidSessionId(_) => "invalid_session_id",
            SessionError::Adapter(_) => "adapter_exec_failure",
            SessionError::Artifact(_) => "artifact_io",
        }
    }

    /// Guidance for the caller on what to do next
    pub fn recovery_hint(&self) -> &'static str {
        match self {
            SessionError::BackendMissing(_) => {
                "Install tmux (e.g. `apt install tmux` or `brew install tmux`) and make sure it is on PATH, or pass --tmux-bin."
            }
            SessionError::SessionNotFound(_) => {
                "Create the session first with create_session, or run execute_command which creates it on demand."
            }
            SessionError::SessionMisconfigured { .. } => {
                "Call create_session again; it rebuilds sessions with missing windows."
            }
            SessionError::SessionLost(_) => {
                "The session was closed externally. Re-run the command; a fresh session will be created."
            }
            SessionError::Timeout(_) => {
                "The command may still be running in the session. Increase timeout_secs, or inspect it with capture_pane."
            }
            SessionError::SessionCreateFailed { .. } => {
                "Check that the tmux server is healthy (`tmux list-sessions`) and retry."
            }
            SessionError::InvalidSessionId(_) => {
                "Session ids may contain only letters, digits, '-' and '_'."
            }
            SessionError::Adapter(_) => "Retry the operation; if it keeps failing, destroy and recreate the session.",
            SessionError::Artifact(_) => "Check that the artifact directory is writable and has free space.",
        }
    }
}

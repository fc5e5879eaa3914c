use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single tmux invocation, classified once at the adapter boundary
#[derive(Debug, Error)]
pub enum TmuxError {
    /// The target session, window or pane does not exist
    #[error("tmux target not found: {0}")]
    NotFound(String),
    /// No tmux server is running (no sessions at all)
    #[error("no tmux server running: {0}")]
    NoServer(String),
    /// The tmux executable could not be located
    #[error("tmux binary '{0}' not found")]
    BinaryMissing(String),
    /// The invocation exceeded its wall-clock deadline and was killed
    #[error("tmux {command} timed out after {elapsed:?}")]
    Timeout { command: String, elapsed: Duration },
    /// tmux ran but exited unsuccessfully
    #[error("tmux {command} failed (exit {code:?}): {stderr}")]
    ExecFailure {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    /// Spawning or draining the process failed
    #[error("tmux io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TmuxError {
    /// Whether the target is gone (either the session or the whole server)
    pub fn is_missing_target(&self) -> bool {
        matches!(self, TmuxError::NotFound(_) | TmuxError::NoServer(_))
    }

    /// Transient failures worth another attempt
    pub fn is_transient(&self) -> bool {
        match self {
            TmuxError::Timeout { .. } | TmuxError::Io(_) => true,
            TmuxError::ExecFailure { stderr, .. } => RE_TRANSIENT.is_match(stderr),
            TmuxError::NotFound(_) | TmuxError::NoServer(_) => true,
            TmuxError::BinaryMissing(_) => false,
        }
    }
}

/// Kind of failure reported on tmux stderr
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrKind {
    NotFound,
    NoServer,
    Other,
}

static RE_NO_SERVER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(no server running|error connecting to|server exited unexpectedly|no sessions)")
        .unwrap()
});

static RE_NOT_FOUND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(can't find (session|window|pane)|session not found|no such (session|window|pane)|window not found|pane not found)")
        .unwrap()
});

static RE_TRANSIENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(connection refused|resource temporarily unavailable|lost server|server exited|protocol version mismatch)")
        .unwrap()
});

/// Classify raw tmux stderr
pub fn classify_stderr(stderr: &str) -> StderrKind {
    // "no server running" can mention the session too, so check it first
    if RE_NO_SERVER.is_match(stderr) {
        return StderrKind::NoServer;
    }

    if RE_NOT_FOUND.is_match(stderr) {
        return StderrKind::NotFound;
    }

    StderrKind::Other
}

/// Turn a failed invocation into the matching error variant
pub fn failure(command: &str, code: Option<i32>, stderr: &str) -> TmuxError {
    let trimmed = stderr.trim().to_string();
    match classify_stderr(&trimmed) {
        StderrKind::NoServer => TmuxError::NoServer(trimmed),
        StderrKind::NotFound => TmuxError::NotFound(trimmed),
        StderrKind::Other => TmuxError::ExecFailure {
            command: command.to_string(),
            code,
            stderr: trimmed,
        },
    }
}

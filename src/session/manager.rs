use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::registry::{HealthStatus, SessionRecord, SessionRegistry};
use crate::config::Config;
use crate::error::SessionError;
use crate::exec::capture::shell_quote;
use crate::tmux::{window_target, Multiplexer, NewSession, TmuxError};

/// Window that runs wrapped commands
pub const EXEC_WINDOW: &str = "exec";
/// Window tailing the per-session mirror log
pub const UI_WINDOW: &str = "ui";

/// Health and idle snapshot of one session
#[derive(Debug, Clone, Serialize)]
pub struct SessionHealth {
    pub session_id: String,
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    pub health_status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub age_minutes: u64,
    pub idle_minutes: u64,
    pub needs_cleanup: bool,
    pub command_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    /// Seconds since the last responsiveness probe
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check_secs: Option<u64>,
    /// A command is currently executing
    pub busy: bool,
}

impl SessionHealth {
    fn missing(id: &str) -> Self {
        Self {
            session_id: id.to_string(),
            exists: false,
            purpose: None,
            health_status: HealthStatus::Unknown,
            created_at: None,
            age_minutes: 0,
            idle_minutes: 0,
            needs_cleanup: false,
            command_count: 0,
            working_directory: None,
            last_health_check_secs: None,
            busy: false,
        }
    }
}

/// Reject ids tmux would misparse as targets
pub fn validate_session_id(id: &str) -> Result<(), SessionError> {
    let valid = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SessionError::InvalidSessionId(id.to_string()))
    }
}

pub fn generate_session_id() -> String {
    format!("s-{}", &Uuid::new_v4().simple().to_string()[..8])
}

/// Creates, validates and destroys sessions, keeping the registry in sync
/// with what the multiplexer actually has.
pub struct SessionManager {
    mux: Arc<dyn Multiplexer>,
    registry: Arc<SessionRegistry>,
    config: Arc<Config>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(mux: Arc<dyn Multiplexer>, registry: Arc<SessionRegistry>, config: Arc<Config>) -> Self {
        Self {
            mux,
            registry,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn mux(&self) -> &Arc<dyn Multiplexer> {
        &self.mux
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn exec_target(id: &str) -> String {
        window_target(id, EXEC_WINDOW)
    }

    pub fn mirror_log_path(&self, id: &str) -> PathBuf {
        self.config.mirror_dir().join(format!("{}.log", id))
    }

    fn required_windows(&self) -> Vec<&'static str> {
        if self.config.mirror_ui {
            vec![EXEC_WINDOW, UI_WINDOW]
        } else {
            vec![EXEC_WINDOW]
        }
    }

    fn missing_windows(&self, present: &[String]) -> Vec<String> {
        self.required_windows()
            .into_iter()
            .filter(|w| !present.iter().any(|p| p == w))
            .map(str::to_string)
            .collect()
    }

    fn lock_table(&self) -> MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Per-session execution lock; commands against one session run one at a time
    pub fn execution_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.lock_table().entry(id.to_string()).or_default())
    }

    /// Drop the lock entry for `id` unless a command holds or awaits it
    fn release_lock(&self, id: &str) {
        let mut table = self.lock_table();
        if table.get(id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            table.remove(id);
        }
    }

    /// Remove the registry record and idle lock of a session that is gone
    fn forget(&self, id: &str) -> Option<SessionRecord> {
        self.release_lock(id);
        self.registry.delete(id)
    }

    #[cfg(test)]
    pub(crate) fn tracked_locks(&self) -> usize {
        self.lock_table().len()
    }

    /// Whether a command currently holds the session's execution lock
    pub fn is_busy(&self, id: &str) -> bool {
        self.lock_table()
            .get(id)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Ask the backend whether `id` is live.
    ///
    /// `Ok(false)` only when tmux reports the target missing, in which case the
    /// stale registry record is dropped. Other adapter failures are passed on,
    /// since they say nothing about the session itself.
    pub async fn liveness(&self, id: &str) -> Result<bool, TmuxError> {
        match self.mux.list_windows(id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_missing_target() => {
                if self.forget(id).is_some() {
                    info!(session = %id, "dropped stale registry entry");
                }
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Like [`Self::liveness`], treating an inconclusive probe as absent
    pub async fn session_exists(&self, id: &str) -> bool {
        self.liveness(id).await.unwrap_or_else(|e| {
            warn!(session = %id, error = %e, "existence probe failed");
            false
        })
    }

    /// Ok when the session is live and has every required window
    pub async fn check_session(&self, id: &str) -> Result<(), SessionError> {
        match self.mux.list_windows(id).await {
            Ok(windows) => {
                let missing = self.missing_windows(&windows);
                if missing.is_empty() {
                    Ok(())
                } else {
                    Err(SessionError::SessionMisconfigured {
                        id: id.to_string(),
                        missing,
                    })
                }
            }
            Err(e) if e.is_missing_target() => {
                self.forget(id);
                Err(SessionError::SessionNotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Idempotently ensure a live, correctly configured session named `id`
    pub async fn create_session(&self, id: &str, purpose: &str) -> Result<String, SessionError> {
        validate_session_id(id)?;

        match self.mux.list_windows(id).await {
            Ok(windows) => {
                let missing = self.missing_windows(&windows);
                if missing.is_empty() {
                    self.registry.upsert(
                        id,
                        || SessionRecord::new(id, purpose),
                        |r| {
                            r.last_accessed = Instant::now();
                            if r.purpose.is_empty() {
                                r.purpose = purpose.to_string();
                            }
                        },
                    );
                    debug!(session = %id, "session already live");
                    return Ok(id.to_string());
                }
                warn!(session = %id, ?missing, "session misconfigured, recreating");
                self.kill_quietly(id).await;
            }
            // Only build over a session tmux positively reports as missing
            Err(e) if e.is_missing_target() => {
                self.registry.delete(id);
            }
            Err(e) => return Err(e.into()),
        }

        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.build_session(id).await {
                Ok(()) => break,
                Err(TmuxError::BinaryMissing(bin)) => return Err(SessionError::BackendMissing(bin)),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(session = %id, attempt, error = %e, "session creation failed, retrying");
                    tokio::time::sleep(self.config.retry_delay * attempt).await;
                }
                Err(e) => {
                    warn!(session = %id, attempt, error = %e, "session creation failed");
                    return Err(SessionError::SessionCreateFailed {
                        id: id.to_string(),
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }

        let mut record = SessionRecord::new(id, purpose);
        record.health = HealthStatus::Healthy;
        record.last_health_check = Some(Instant::now());
        self.registry.upsert(id, || record.clone(), |r| *r = record.clone());
        info!(session = %id, purpose, "session created");
        Ok(id.to_string())
    }

    /// Create `id` from scratch. A session this call created is killed again
    /// if it cannot be completed; a failed `new-session` kills nothing.
    async fn build_session(&self, id: &str) -> Result<(), TmuxError> {
        let history_file = match tokio::fs::create_dir_all(self.config.history_dir()).await {
            Ok(()) => Some(self.config.history_dir().join(format!("{}.hist", id))),
            Err(e) => {
                warn!(error = %e, "history directory unavailable");
                None
            }
        };

        self.mux
            .new_session(&NewSession {
                name: id.to_string(),
                window: EXEC_WINDOW.to_string(),
                shell: self.config.shell.clone(),
                history_file,
            })
            .await?;

        if let Err(e) = self.add_windows(id).await {
            self.kill_quietly(id).await;
            return Err(e);
        }
        Ok(())
    }

    async fn add_windows(&self, id: &str) -> Result<(), TmuxError> {
        if self.config.mirror_ui {
            let log = self.mirror_log_path(id);
            tokio::fs::create_dir_all(self.config.mirror_dir()).await?;
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log)
                .await?;
            let tail = format!("tail -n +1 -F {}", shell_quote(&log.to_string_lossy()));
            self.mux.new_window(id, UI_WINDOW, Some(&tail)).await?;
        }

        let windows = self.mux.list_windows(id).await?;
        let missing = self.missing_windows(&windows);
        if !missing.is_empty() {
            return Err(TmuxError::ExecFailure {
                command: "new-window".to_string(),
                code: None,
                stderr: format!("windows missing after creation: {}", missing.join(", ")),
            });
        }
        Ok(())
    }

    async fn kill_quietly(&self, id: &str) {
        if let Err(e) = self.mux.kill_session(id).await {
            debug!(session = %id, error = %e, "kill during cleanup failed");
        }
    }

    /// Destroy `id`. Returns false when the backend had no such session,
    /// unless `must_exist` is set, in which case that is `SessionNotFound`.
    pub async fn destroy_session(&self, id: &str, must_exist: bool) -> Result<bool, SessionError> {
        let killed = if self.liveness(id).await? {
            match self.mux.kill_session(id).await {
                Ok(()) => true,
                Err(e) if e.is_missing_target() => false,
                Err(e) => return Err(e.into()),
            }
        } else {
            false
        };

        self.forget(id);
        self.remove_mirror_log(id).await;

        if !killed && must_exist {
            return Err(SessionError::SessionNotFound(id.to_string()));
        }
        if killed {
            info!(session = %id, "session destroyed");
        }
        Ok(killed)
    }

    async fn remove_mirror_log(&self, id: &str) {
        match tokio::fs::remove_file(self.mirror_log_path(id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(session = %id, error = %e, "failed to remove mirror log"),
        }
    }

    fn snapshot(&self, record: &SessionRecord) -> SessionHealth {
        let idle = record.idle();
        SessionHealth {
            session_id: record.id.clone(),
            exists: true,
            purpose: Some(record.purpose.clone()),
            health_status: record.health,
            created_at: Some(record.created_wall),
            age_minutes: record.age().as_secs() / 60,
            idle_minutes: idle.as_secs() / 60,
            needs_cleanup: idle > self.config.idle_threshold,
            command_count: record.command_count,
            working_directory: record.working_directory.clone(),
            last_health_check_secs: record.last_health_check.map(|t| t.elapsed().as_secs()),
            busy: self.is_busy(&record.id),
        }
    }

    /// Registry state for `id`, reconciled against the backend
    pub async fn session_health(&self, id: &str) -> SessionHealth {
        if !self.session_exists(id).await {
            return SessionHealth::missing(id);
        }
        match self.registry.get(id) {
            Some(record) => self.snapshot(&record),
            // Live on the backend but created outside this process
            None => SessionHealth {
                exists: true,
                ..SessionHealth::missing(id)
            },
        }
    }

    /// Managed sessions that are still live; stale records are dropped
    pub async fn list_sessions(&self) -> Result<Vec<SessionHealth>, SessionError> {
        let live: HashSet<String> = self
            .mux
            .list_sessions()
            .await?
            .into_iter()
            .map(|s| s.name)
            .collect();

        let mut sessions = Vec::new();
        for record in self.registry.list() {
            if live.contains(&record.id) {
                sessions.push(self.snapshot(&record));
            } else {
                info!(session = %record.id, "dropped stale registry entry");
                self.forget(&record.id);
            }
        }
        Ok(sessions)
    }

    /// Inject a uniquely tagged echo and wait briefly for it to show up
    pub async fn probe_responsiveness(&self, id: &str) -> bool {
        let token = Uuid::new_v4().simple().to_string();
        let token = &token[..12];
        let target = Self::exec_target(id);
        // The typed line shows "probe <token>"; only real output joins them
        let probe = format!("printf '%s_%s\\n' probe {}", token);
        let expected = format!("probe_{}", token);

        if let Err(e) = self.mux.send_keys(&target, &probe, true, true).await {
            debug!(session = %id, error = %e, "probe send failed");
            return false;
        }

        let deadline = Instant::now() + self.config.probe_timeout;
        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            match self.mux.capture_pane(&target, None).await {
                Ok(text) if text.contains(&expected) => return true,
                Ok(_) => {}
                Err(e) => {
                    debug!(session = %id, error = %e, "probe capture failed");
                    return false;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
        }
    }

    /// Probe `id` and record the outcome
    pub async fn check_health(&self, id: &str) -> HealthStatus {
        let status = if self.probe_responsiveness(id).await {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        self.registry.update(id, |r| {
            r.health = status;
            r.last_health_check = Some(Instant::now());
        });
        status
    }

    /// Make `id` usable again, recreating it if it is gone or unresponsive.
    ///
    /// Returns the effective session id, which differs from `id` only when
    /// the original name could not be recreated.
    pub async fn repair_session(&self, id: &str, purpose: &str) -> Result<String, SessionError> {
        if self.liveness(id).await? && self.check_health(id).await == HealthStatus::Healthy {
            return Ok(id.to_string());
        }

        warn!(session = %id, "repairing session");
        if let Err(e) = self.destroy_session(id, false).await {
            warn!(session = %id, error = %e, "destroy during repair failed");
        }

        match self.create_session(id, purpose).await {
            Ok(id) => Ok(id),
            Err(e @ SessionError::BackendMissing(_)) => Err(e),
            Err(e) => {
                let fallback = format!("{}-{}", id, &Uuid::new_v4().simple().to_string()[..4]);
                warn!(session = %id, %fallback, error = %e, "recreating under a new id");
                self.create_session(&fallback, purpose).await
            }
        }
    }

    /// Bump access time and command count after a command ran
    pub fn record_execution(&self, id: &str, working_directory: Option<String>) {
        self.registry.update(id, |r| {
            r.last_accessed = Instant::now();
            r.command_count += 1;
            if working_directory.is_some() {
                r.working_directory = working_directory;
            }
        });
    }

    pub fn touch(&self, id: &str) {
        self.registry.update(id, |r| r.last_accessed = Instant::now());
    }

    /// Append a block to the session's UI mirror log, best effort
    pub async fn append_mirror(&self, id: &str, text: &str) {
        if !self.config.mirror_ui {
            return;
        }
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.mirror_log_path(id))
                .await?;
            file.write_all(text.as_bytes()).await
        }
        .await;
        if let Err(e) = result {
            debug!(session = %id, error = %e, "mirror log append failed");
        }
    }
}

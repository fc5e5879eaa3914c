use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::exec::artifacts;
use crate::session::{HealthStatus, SessionManager};

/// Why a session was reaped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupReason {
    Idle,
    Unresponsive,
}

#[derive(Debug, Clone, Serialize)]
pub struct DestroyedSession {
    pub session_id: String,
    pub reason: CleanupReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupFailure {
    pub session_id: String,
    pub error: String,
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub checked: usize,
    pub destroyed: Vec<DestroyedSession>,
    /// Sessions skipped because a command was running in them
    pub skipped_busy: Vec<String>,
    pub failures: Vec<CleanupFailure>,
    pub orphan_artifacts_removed: usize,
}

/// Periodically reaps idle or unresponsive sessions and orphaned artifacts
pub struct CleanupScheduler {
    manager: Arc<SessionManager>,
}

impl CleanupScheduler {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    /// Run one sweep. Failures are recorded per session, never propagated.
    pub async fn sweep(&self) -> CleanupReport {
        let mut report = CleanupReport::default();

        for id in self.manager.registry().ids() {
            report.checked += 1;

            // Held for the rest of this session's check so no command starts meanwhile
            let lock = self.manager.execution_lock(&id);
            let Ok(_guard) = lock.try_lock_owned() else {
                debug!(session = %id, "busy, skipping");
                report.skipped_busy.push(id);
                continue;
            };

            let health = self.manager.session_health(&id).await;
            if !health.exists {
                continue;
            }

            let reason = if health.needs_cleanup {
                Some(CleanupReason::Idle)
            } else if self.manager.check_health(&id).await == HealthStatus::Unhealthy {
                Some(CleanupReason::Unresponsive)
            } else {
                None
            };
            let Some(reason) = reason else {
                continue;
            };

            match self.manager.destroy_session(&id, false).await {
                Ok(_) => {
                    info!(session = %id, ?reason, idle_minutes = health.idle_minutes, "session reaped");
                    report.destroyed.push(DestroyedSession {
                        session_id: id,
                        reason,
                    });
                }
                Err(e) => {
                    error!(session = %id, error = %e, "cleanup failed");
                    report.failures.push(CleanupFailure {
                        session_id: id,
                        error: e.to_string(),
                    });
                }
            }
        }

        report.orphan_artifacts_removed = self.sweep_artifacts().await;
        report
    }

    /// Remove leftover execution artifacts past the configured age
    pub async fn sweep_artifacts(&self) -> usize {
        let dir = self.manager.config().artifact_dir.clone();
        let max_age = self.manager.config().orphan_max_age;
        match tokio::task::spawn_blocking(move || artifacts::sweep_orphans(&dir, max_age)).await {
            Ok(removed) => {
                if removed > 0 {
                    info!(removed, "orphaned artifacts removed");
                }
                removed
            }
            Err(e) => {
                warn!(error = %e, "artifact sweep panicked");
                0
            }
        }
    }

    /// Sweep on the configured interval until the task is aborted
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let period = self.manager.config().cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick fires immediately; startup already swept
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = self.sweep().await;
                info!(
                    checked = report.checked,
                    destroyed = report.destroyed.len(),
                    failures = report.failures.len(),
                    "cleanup sweep finished"
                );
            }
        })
    }
}

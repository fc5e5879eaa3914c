//! Command execution with sentinel-file completion detection.
//!
//! Each attempt wraps the caller's command so that its combined output and
//! exit status land in a capture file, then touches a sentinel file. The
//! engine polls for the sentinel, never for output content.

pub mod artifacts;
pub mod capture;

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SessionError;
use crate::session::{validate_session_id, SessionManager};
use artifacts::ExecutionArtifacts;
use capture::{split_capture_artifact, wrap_command};

/// Exit code reported when the real status could not be observed
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// Check that the session is still alive every this many polls
const LIVENESS_EVERY_POLLS: u32 = 20;

/// Terminal state of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    TimedOut,
    SessionLost,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub command: String,
    pub session_id: String,
    pub timeout: Duration,
    /// Purpose tag used if the session has to be created
    pub purpose: String,
}

/// Outcome of an execution; failures are reported here, never thrown
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Combined stdout and stderr, trimmed
    pub stdout: String,
    /// Error text when the execution did not complete
    pub stderr: String,
    pub exit_code: i32,
    /// Effective session id, which may differ from the requested one after repair
    pub session_id: String,
    pub execution_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    pub attempts: u32,
    pub status: ExecutionStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    /// Whether the caller could reasonably retry
    pub recoverable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_hint: Option<&'static str>,
}

/// A finished attempt
struct Completion {
    stdout: String,
    exit_code: i32,
    working_directory: Option<String>,
}

/// A failed attempt, with whatever output could be salvaged
struct AttemptFailure {
    error: SessionError,
    partial: String,
}

impl AttemptFailure {
    fn new(error: impl Into<SessionError>) -> Self {
        Self {
            error: error.into(),
            partial: String::new(),
        }
    }
}

/// Transitions of one execution
enum Step {
    Attempt { session_id: String, attempt: u32 },
    Repair { session_id: String, attempt: u32 },
    Done(ExecutionResult),
}

enum Outcome {
    Completed,
    TimedOut,
    SessionLost,
}

pub struct ExecutionEngine {
    manager: Arc<SessionManager>,
}

impl ExecutionEngine {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    /// Run `request`, retrying recoverable failures with session repair
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let execution_id = Uuid::new_v4().simple().to_string();
        let started = Instant::now();
        let max_attempts = self.manager.config().max_attempts.max(1);
        info!(execution = %execution_id, session = %request.session_id, command = %request.command, "executing");

        let mut step = Step::Attempt {
            session_id: request.session_id.clone(),
            attempt: 1,
        };
        loop {
            step = match step {
                Step::Attempt { session_id, attempt } => {
                    match self.attempt(&session_id, &request, &execution_id, attempt).await {
                        Ok(done) => Step::Done(ExecutionResult {
                            stdout: done.stdout,
                            stderr: String::new(),
                            exit_code: done.exit_code,
                            session_id,
                            execution_id: execution_id.clone(),
                            working_directory: done.working_directory,
                            attempts: attempt,
                            status: ExecutionStatus::Completed,
                            duration_ms: started.elapsed().as_millis() as u64,
                            error_kind: None,
                            recoverable: false,
                            recovery_hint: None,
                        }),
                        Err(failure) if Self::should_retry(&failure.error) && attempt < max_attempts => {
                            warn!(execution = %execution_id, session = %session_id, attempt, error = %failure.error, "attempt failed, retrying");
                            tokio::time::sleep(self.manager.config().retry_delay).await;
                            Step::Repair { session_id, attempt }
                        }
                        Err(failure) => {
                            Step::Done(Self::failed(&execution_id, session_id, attempt, failure, started))
                        }
                    }
                }
                Step::Repair { session_id, attempt } => {
                    match self.manager.repair_session(&session_id, &request.purpose).await {
                        Ok(effective) => Step::Attempt {
                            session_id: effective,
                            attempt: attempt + 1,
                        },
                        // The next attempt creates the session itself
                        Err(e) if e.is_recoverable() => {
                            warn!(execution = %execution_id, session = %session_id, error = %e, "repair failed");
                            Step::Attempt {
                                session_id,
                                attempt: attempt + 1,
                            }
                        }
                        Err(e) => Step::Done(Self::failed(
                            &execution_id,
                            session_id,
                            attempt,
                            AttemptFailure::new(e),
                            started,
                        )),
                    }
                }
                Step::Done(result) => return result,
            };
        }
    }

    /// A timed-out command keeps running in the shell, so it is never resubmitted
    fn should_retry(error: &SessionError) -> bool {
        error.is_recoverable() && !matches!(error, SessionError::Timeout(_))
    }

    fn failed(
        execution_id: &str,
        session_id: String,
        attempts: u32,
        failure: AttemptFailure,
        started: Instant,
    ) -> ExecutionResult {
        let status = match failure.error {
            SessionError::Timeout(_) => ExecutionStatus::TimedOut,
            SessionError::SessionLost(_) => ExecutionStatus::SessionLost,
            _ => ExecutionStatus::Failed,
        };
        warn!(execution = %execution_id, session = %session_id, ?status, error = %failure.error, "execution failed");

        ExecutionResult {
            stdout: failure.partial.trim().to_string(),
            stderr: failure.error.to_string(),
            exit_code: UNKNOWN_EXIT_CODE,
            session_id,
            execution_id: execution_id.to_string(),
            working_directory: None,
            attempts,
            status,
            duration_ms: started.elapsed().as_millis() as u64,
            error_kind: Some(failure.error.kind()),
            recoverable: failure.error.is_recoverable(),
            recovery_hint: Some(failure.error.recovery_hint()),
        }
    }

    async fn attempt(
        &self,
        session_id: &str,
        request: &ExecutionRequest,
        execution_id: &str,
        attempt: u32,
    ) -> Result<Completion, AttemptFailure> {
        validate_session_id(session_id).map_err(AttemptFailure::new)?;

        // Waiting behind another command counts against this one's budget
        let deadline = Instant::now() + request.timeout;
        let lock = self.manager.execution_lock(session_id);
        let _guard = tokio::time::timeout(request.timeout, lock.lock_owned())
            .await
            .map_err(|_| AttemptFailure::new(SessionError::Timeout(request.timeout)))?;

        self.manager
            .create_session(session_id, &request.purpose)
            .await
            .map_err(AttemptFailure::new)?;

        let config = self.manager.config();
        artifacts::ensure_dir(&config.artifact_dir)
            .await
            .map_err(AttemptFailure::new)?;
        let artifacts = ExecutionArtifacts::new(&config.artifact_dir, &format!("{}-{}", execution_id, attempt));
        let wrapped = wrap_command(&request.command, &artifacts.capture, &artifacts.sentinel);
        let target = SessionManager::exec_target(session_id);

        if let Err(e) = self.manager.mux().send_keys(&target, &wrapped, true, true).await {
            artifacts.remove().await;
            return Err(AttemptFailure::new(e));
        }
        debug!(execution = %execution_id, session = %session_id, "submitted");

        let outcome = self.await_completion(session_id, &artifacts, deadline).await;
        let text = artifacts.read_capture().await;
        artifacts.remove().await;

        match outcome {
            Outcome::Completed => {
                let parts = split_capture_artifact(&text.unwrap_or_default());
                if parts.exit_code.is_none() {
                    warn!(execution = %execution_id, "exit status marker missing from capture");
                }
                let stdout = parts.body.trim().to_string();
                let exit_code = parts.exit_code.unwrap_or(UNKNOWN_EXIT_CODE);

                let working_directory = match self.manager.mux().pane_current_path(&target).await {
                    Ok(path) if !path.is_empty() => Some(path),
                    Ok(_) => None,
                    Err(e) => {
                        debug!(session = %session_id, error = %e, "cwd query failed");
                        None
                    }
                };
                self.manager
                    .record_execution(session_id, working_directory.clone());
                self.manager
                    .append_mirror(
                        session_id,
                        &format!("$ {}\n{}\n[exit {}]\n\n", request.command, stdout, exit_code),
                    )
                    .await;

                Ok(Completion {
                    stdout,
                    exit_code,
                    working_directory,
                })
            }
            Outcome::TimedOut => {
                self.manager.touch(session_id);
                Err(AttemptFailure {
                    error: SessionError::Timeout(request.timeout),
                    partial: text.unwrap_or_default(),
                })
            }
            Outcome::SessionLost => Err(AttemptFailure {
                error: SessionError::SessionLost(session_id.to_string()),
                partial: text.unwrap_or_default(),
            }),
        }
    }

    /// True only when tmux confirms the session no longer exists
    async fn session_gone(&self, session_id: &str) -> bool {
        match self.manager.liveness(session_id).await {
            Ok(live) => !live,
            Err(e) => {
                debug!(session = %session_id, error = %e, "liveness check inconclusive");
                false
            }
        }
    }

    /// Poll for the sentinel until `deadline`
    async fn await_completion(
        &self,
        session_id: &str,
        artifacts: &ExecutionArtifacts,
        deadline: Instant,
    ) -> Outcome {
        let poll_interval = self.manager.config().poll_interval;
        let mut polls: u32 = 0;

        loop {
            if artifacts.completed().await {
                return Outcome::Completed;
            }

            let now = Instant::now();
            if now >= deadline {
                return if self.session_gone(session_id).await {
                    Outcome::SessionLost
                } else {
                    Outcome::TimedOut
                };
            }

            polls += 1;
            if polls % LIVENESS_EVERY_POLLS == 0 && self.session_gone(session_id).await {
                return Outcome::SessionLost;
            }

            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::session::SessionRegistry;
    use crate::tmux::fake::FakeMux;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        mux: Arc<FakeMux>,
        manager: Arc<SessionManager>,
        engine: ExecutionEngine,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let mux = Arc::new(FakeMux::shell());
        let manager = Arc::new(SessionManager::new(
            mux.clone(),
            Arc::new(SessionRegistry::new()),
            Arc::new(Config::for_tests(dir.path())),
        ));
        let engine = ExecutionEngine::new(manager.clone());
        Harness {
            _dir: dir,
            mux,
            manager,
            engine,
        }
    }

    fn request(command: &str, session: &str, timeout: Duration) -> ExecutionRequest {
        ExecutionRequest {
            command: command.to_string(),
            session_id: session.to_string(),
            timeout,
            purpose: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_exit_code_and_output() {
        let h = harness();
        h.manager.create_session("build", "ci").await.unwrap();

        let result = h
            .engine
            .execute(request("echo hi; exit 3", "build", Duration::from_secs(5)))
            .await;
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.exit_code, 3);
        assert!(result.stdout.contains("hi"));
        assert!(!result.stdout.contains(capture::EXIT_MARKER));
        assert_eq!(result.attempts, 1);

        let result = h
            .engine
            .execute(request("exit 0", "build", Duration::from_secs(5)))
            .await;
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "");
    }

    #[tokio::test]
    async fn test_session_created_on_demand_and_recorded() {
        let h = harness();
        let result = h
            .engine
            .execute(request("printf 'a\\nb\\n'", "fresh", Duration::from_secs(5)))
            .await;
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.stdout, "a\nb");
        assert_eq!(result.working_directory.as_deref(), Some("/tmp"));

        let record = h.manager.registry().get("fresh").unwrap();
        assert_eq!(record.command_count, 1);
        assert_eq!(record.working_directory.as_deref(), Some("/tmp"));

        let mirror = std::fs::read_to_string(h.manager.mirror_log_path("fresh")).unwrap();
        assert!(mirror.contains("[exit 0]"));
    }

    #[tokio::test]
    async fn test_stderr_is_merged_and_marker_text_survives() {
        let h = harness();
        let result = h
            .engine
            .execute(request(
                "echo __AGENT_SHELL_EXIT__:5; echo oops >&2; exit 2",
                "merge",
                Duration::from_secs(5),
            ))
            .await;
        assert_eq!(result.exit_code, 2);
        assert!(result.stdout.contains("__AGENT_SHELL_EXIT__:5"));
        assert!(result.stdout.contains("oops"));
    }

    #[tokio::test]
    async fn test_timeout_is_bounded_and_keeps_partial_output() {
        let h = harness();
        h.manager.create_session("slow", "").await.unwrap();

        let started = std::time::Instant::now();
        let result = h
            .engine
            .execute(request("echo partial; sleep 10", "slow", Duration::from_secs(1)))
            .await;
        assert!(started.elapsed() < Duration::from_millis(1500));
        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert_eq!(result.exit_code, UNKNOWN_EXIT_CODE);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.error_kind, Some("timeout"));
        assert!(result.recoverable);
        assert!(result.stdout.contains("partial"));
    }

    #[tokio::test]
    async fn test_timeout_on_fresh_session_includes_creation() {
        let h = harness();

        let started = std::time::Instant::now();
        let result = h
            .engine
            .execute(request("sleep 10", "cold", Duration::from_secs(1)))
            .await;
        assert!(started.elapsed() < Duration::from_millis(1500));
        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert_eq!(result.exit_code, UNKNOWN_EXIT_CODE);
        assert_eq!(result.attempts, 1);
        assert!(h.mux.has_session("cold"));
    }

    #[tokio::test]
    async fn test_inconclusive_liveness_check_keeps_polling() {
        let h = harness();
        h.manager.create_session("steady", "").await.unwrap();

        let mux = h.mux.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            mux.fail_list_windows.store(1, Ordering::SeqCst);
        });

        let result = h
            .engine
            .execute(request("sleep 1; echo done", "steady", Duration::from_secs(3)))
            .await;
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.stdout, "done");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.attempts, 1);
        assert!(h.manager.registry().contains("steady"));
    }

    #[tokio::test]
    async fn test_invalid_session_id_is_rejected_before_locking() {
        let h = harness();
        let result = h
            .engine
            .execute(request("echo hi", "no spaces", Duration::from_secs(1)))
            .await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error_kind, Some("invalid_session_id"));
        assert_eq!(result.attempts, 1);
        assert_eq!(h.manager.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn test_session_killed_mid_execution() {
        let h = harness();
        h.manager.create_session("doomed", "").await.unwrap();

        let mux = h.mux.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            mux.kill_externally("doomed");
        });

        let result = h
            .engine
            .execute(request("sleep 5", "doomed", Duration::from_secs(3)))
            .await;
        assert_eq!(result.status, ExecutionStatus::SessionLost);
        assert_eq!(result.exit_code, UNKNOWN_EXIT_CODE);
        assert_eq!(result.attempts, 1);
        assert!(!result.recoverable);
        assert!(!h.manager.registry().contains("doomed"));
    }

    #[tokio::test]
    async fn test_recoverable_failure_is_retried_after_repair() {
        let h = harness();
        // Exhausts the first attempt's creation retries, then clears
        h.mux.fail_new_session.store(3, Ordering::SeqCst);

        let result = h
            .engine
            .execute(request("echo ok", "retry", Duration::from_secs(5)))
            .await;
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.attempts, 2);
        assert_eq!(result.session_id, "retry");
        assert_eq!(result.stdout, "ok");
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let h = harness();
        h.mux.fail_new_session.store(100, Ordering::SeqCst);

        let result = h
            .engine
            .execute(request("echo never", "broken", Duration::from_secs(5)))
            .await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.exit_code, UNKNOWN_EXIT_CODE);
        assert_eq!(result.error_kind, Some("session_create_failed"));
        assert!(result.recovery_hint.is_some());
    }

    #[tokio::test]
    async fn test_same_session_commands_are_serialized() {
        let h = harness();
        h.manager.create_session("shared", "").await.unwrap();

        let (a, b) = tokio::join!(
            h.engine
                .execute(request("sleep 0.3; echo first", "shared", Duration::from_secs(5))),
            h.engine
                .execute(request("echo second", "shared", Duration::from_secs(5))),
        );
        assert_eq!(a.stdout, "first");
        assert_eq!(b.stdout, "second");
        assert_eq!(h.manager.registry().get("shared").unwrap().command_count, 2);
    }

    #[tokio::test]
    async fn test_artifacts_are_cleaned_up() {
        let h = harness();
        h.engine
            .execute(request("echo done", "clean", Duration::from_secs(5)))
            .await;
        h.engine
            .execute(request("sleep 5", "clean", Duration::from_millis(200)))
            .await;

        let leftovers = std::fs::read_dir(&h.manager.config().artifact_dir)
            .unwrap()
            .count();
        assert_eq!(leftovers, 0);
    }
}

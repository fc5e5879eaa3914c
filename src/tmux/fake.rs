//! In-memory multiplexer for tests. Literal keys sent with Enter are run
//! through `sh -c` and their stdout is appended to the window's screen.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Multiplexer, NewSession, TmuxError, TmuxSession};

#[derive(Default)]
struct FakeSession {
    windows: Vec<String>,
    screen: Arc<Mutex<String>>,
}

pub struct FakeMux {
    sessions: Mutex<HashMap<String, FakeSession>>,
    run_commands: bool,
    /// When false, keys are accepted but never reach a shell
    pub responsive: AtomicBool,
    /// Number of upcoming `new_session` calls that fail transiently
    pub fail_new_session: AtomicUsize,
    pub new_session_calls: AtomicUsize,
    /// Number of upcoming `list_windows` calls that time out
    pub fail_list_windows: AtomicUsize,
    /// Whether `new_window` honours requests (false simulates a broken topology)
    pub create_windows: AtomicBool,
    /// Make `kill_session` fail with a generic error
    pub fail_kill: AtomicBool,
}

impl FakeMux {
    /// A backend whose panes actually execute commands
    pub fn shell() -> Self {
        Self::build(true)
    }

    /// A backend that only does bookkeeping
    pub fn inert() -> Self {
        Self::build(false)
    }

    fn build(run_commands: bool) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            run_commands,
            responsive: AtomicBool::new(true),
            fail_new_session: AtomicUsize::new(0),
            new_session_calls: AtomicUsize::new(0),
            fail_list_windows: AtomicUsize::new(0),
            create_windows: AtomicBool::new(true),
            fail_kill: AtomicBool::new(false),
        }
    }

    /// Destroy a session behind the manager's back
    pub fn kill_externally(&self, session: &str) {
        self.sessions.lock().unwrap().remove(session);
    }

    pub fn drop_window(&self, session: &str, window: &str) {
        if let Some(s) = self.sessions.lock().unwrap().get_mut(session) {
            s.windows.retain(|w| w != window);
        }
    }

    pub fn has_session(&self, session: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(session)
    }

    fn not_found(session: &str) -> TmuxError {
        TmuxError::NotFound(format!("can't find session: {}", session))
    }

    /// Split "=session:window" into its parts
    fn parse_target(target: &str) -> (String, Option<String>) {
        let target = target.trim_start_matches('=');
        match target.split_once(':') {
            Some((session, window)) => (session.to_string(), Some(window.to_string())),
            None => (target.to_string(), None),
        }
    }

    fn screen(&self, target: &str) -> Result<Arc<Mutex<String>>, TmuxError> {
        let (session, window) = Self::parse_target(target);
        let sessions = self.sessions.lock().unwrap();
        let s = sessions.get(&session).ok_or_else(|| Self::not_found(&session))?;
        if let Some(window) = window {
            if !s.windows.contains(&window) {
                return Err(TmuxError::NotFound(format!("can't find window: {}", window)));
            }
        }
        Ok(Arc::clone(&s.screen))
    }
}

#[async_trait]
impl Multiplexer for FakeMux {
    async fn check_available(&self) -> Result<String, TmuxError> {
        Ok("tmux fake".into())
    }

    async fn new_session(&self, spec: &NewSession) -> Result<(), TmuxError> {
        self.new_session_calls.fetch_add(1, Ordering::SeqCst);
        let pending = self.fail_new_session.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_new_session.store(pending - 1, Ordering::SeqCst);
            return Err(TmuxError::ExecFailure {
                command: "new-session".into(),
                code: Some(1),
                stderr: "connection refused".into(),
            });
        }

        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(&spec.name) {
            return Err(TmuxError::ExecFailure {
                command: "new-session".into(),
                code: Some(1),
                stderr: format!("duplicate session: {}", spec.name),
            });
        }
        sessions.insert(
            spec.name.clone(),
            FakeSession {
                windows: vec![spec.window.clone()],
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn new_window(
        &self,
        session: &str,
        window: &str,
        _command: Option<&str>,
    ) -> Result<(), TmuxError> {
        let mut sessions = self.sessions.lock().unwrap();
        let s = sessions.get_mut(session).ok_or_else(|| Self::not_found(session))?;
        if self.create_windows.load(Ordering::SeqCst) {
            s.windows.push(window.to_string());
        }
        Ok(())
    }

    async fn list_windows(&self, session: &str) -> Result<Vec<String>, TmuxError> {
        let pending = self.fail_list_windows.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_list_windows.store(pending - 1, Ordering::SeqCst);
            return Err(TmuxError::Timeout {
                command: "list-windows".into(),
                elapsed: Duration::from_secs(10),
            });
        }
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(session)
            .map(|s| s.windows.clone())
            .ok_or_else(|| Self::not_found(session))
    }

    async fn list_sessions(&self) -> Result<Vec<TmuxSession>, TmuxError> {
        let sessions = self.sessions.lock().unwrap();
        Ok(sessions
            .keys()
            .enumerate()
            .map(|(i, name)| TmuxSession {
                id: format!("${}", i),
                name: name.clone(),
                created_at: 0,
                attached_clients: 0,
            })
            .collect())
    }

    async fn capture_pane(
        &self,
        target: &str,
        _scrollback: Option<usize>,
    ) -> Result<String, TmuxError> {
        let screen = self.screen(target)?;
        let text = screen.lock().unwrap().clone();
        Ok(text)
    }

    async fn send_keys(
        &self,
        target: &str,
        keys: &str,
        literal: bool,
        enter: bool,
    ) -> Result<(), TmuxError> {
        let screen = self.screen(target)?;
        if !self.responsive.load(Ordering::SeqCst) || !self.run_commands || !literal || !enter {
            return Ok(());
        }

        let script = keys.to_string();
        tokio::spawn(async move {
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&script)
                .output()
                .await;
            if let Ok(output) = output {
                screen
                    .lock()
                    .unwrap()
                    .push_str(&String::from_utf8_lossy(&output.stdout));
            }
        });
        Ok(())
    }

    async fn kill_session(&self, session: &str) -> Result<(), TmuxError> {
        if self.fail_kill.load(Ordering::SeqCst) {
            return Err(TmuxError::ExecFailure {
                command: "kill-session".into(),
                code: Some(1),
                stderr: "server busy".into(),
            });
        }
        self.sessions
            .lock()
            .unwrap()
            .remove(session)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(session))
    }

    async fn pane_current_path(&self, target: &str) -> Result<String, TmuxError> {
        self.screen(target)?;
        Ok("/tmp".into())
    }
}

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::actions::{
    CapturePaneArgs, CreateSessionArgs, DestroySessionArgs, ExecuteCommandArgs, SendInputArgs,
    SessionInfoArgs, ToolCall, ToolFailure, ToolReply, ToolRequest,
};
use crate::error::SessionError;
use crate::exec::{ExecutionEngine, ExecutionRequest, ExecutionResult};
use crate::scheduler::{CleanupReport, CleanupScheduler};
use crate::session::{generate_session_id, SessionHealth, SessionManager, EXEC_WINDOW};
use crate::tmux::window_target;

/// Session used by execute_command when the caller names none
pub const DEFAULT_SESSION: &str = "default";

/// Upper bound for caller-supplied command timeouts
const MAX_COMMAND_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Serialize)]
pub struct CreateSessionResult {
    pub session_id: String,
    pub session: SessionHealth,
}

#[derive(Debug, Clone, Serialize)]
pub struct DestroySessionResult {
    pub session_id: String,
    pub destroyed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListSessionsResult {
    pub count: usize,
    pub sessions: Vec<SessionHealth>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendInputResult {
    pub session_id: String,
    pub window: String,
    pub bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapturePaneResult {
    pub session_id: String,
    pub window: String,
    pub content: String,
}

/// One async function per tool
pub struct Tools {
    manager: Arc<SessionManager>,
    engine: ExecutionEngine,
    scheduler: Arc<CleanupScheduler>,
}

impl Tools {
    pub fn new(manager: Arc<SessionManager>, scheduler: Arc<CleanupScheduler>) -> Self {
        Self {
            engine: ExecutionEngine::new(manager.clone()),
            manager,
            scheduler,
        }
    }

    /// Parse, dispatch and shape the reply for one request
    pub async fn handle(&self, request: ToolRequest) -> ToolReply {
        let call = match ToolCall::parse(&request.tool, request.arguments) {
            Ok(call) => call,
            Err(e) => return ToolReply::err(request.id, ToolFailure::from(&e)),
        };
        debug!(tool = %request.tool, "dispatch");

        match self.dispatch(call).await {
            Ok(result) => ToolReply::ok(request.id, result),
            Err(e) => ToolReply::err(request.id, ToolFailure::from(&e)),
        }
    }

    pub async fn dispatch(&self, call: ToolCall) -> Result<Value, SessionError> {
        Ok(match call {
            ToolCall::CreateSession(args) => to_value(self.create_session(args).await?),
            ToolCall::DestroySession(args) => to_value(self.destroy_session(args).await?),
            ToolCall::ListSessions => to_value(self.list_sessions().await?),
            ToolCall::ExecuteCommand(args) => to_value(self.execute_command(args).await),
            ToolCall::SendInput(args) => to_value(self.send_input(args).await?),
            ToolCall::CapturePane(args) => to_value(self.capture_pane(args).await?),
            ToolCall::SessionInfo(args) => to_value(self.session_info(args).await),
            ToolCall::CleanupSessions => to_value(self.cleanup_sessions().await),
        })
    }

    pub async fn create_session(&self, args: CreateSessionArgs) -> Result<CreateSessionResult, SessionError> {
        let id = args.session_id.unwrap_or_else(generate_session_id);
        let id = self
            .manager
            .create_session(&id, args.purpose.as_deref().unwrap_or_default())
            .await?;
        let session = self.manager.session_health(&id).await;
        Ok(CreateSessionResult {
            session_id: id,
            session,
        })
    }

    pub async fn destroy_session(&self, args: DestroySessionArgs) -> Result<DestroySessionResult, SessionError> {
        let destroyed = self
            .manager
            .destroy_session(&args.session_id, args.must_exist)
            .await?;
        Ok(DestroySessionResult {
            session_id: args.session_id,
            destroyed,
        })
    }

    pub async fn list_sessions(&self) -> Result<ListSessionsResult, SessionError> {
        let sessions = self.manager.list_sessions().await?;
        Ok(ListSessionsResult {
            count: sessions.len(),
            sessions,
        })
    }

    /// Always yields a result; failures are described inside it
    pub async fn execute_command(&self, args: ExecuteCommandArgs) -> ExecutionResult {
        let timeout = match args.timeout_secs {
            Some(secs) if secs.is_finite() && secs > 0.0 => {
                Duration::from_secs_f64(secs.min(MAX_COMMAND_TIMEOUT.as_secs_f64()))
            }
            _ => self.manager.config().default_command_timeout,
        };

        self.engine
            .execute(ExecutionRequest {
                command: args.command,
                session_id: args.session_id.unwrap_or_else(|| DEFAULT_SESSION.to_string()),
                timeout,
                purpose: args.purpose.unwrap_or_default(),
            })
            .await
    }

    pub async fn send_input(&self, args: SendInputArgs) -> Result<SendInputResult, SessionError> {
        self.manager.check_session(&args.session_id).await?;
        let window = args.window.unwrap_or_else(|| EXEC_WINDOW.to_string());
        let target = window_target(&args.session_id, &window);
        self.manager
            .mux()
            .send_keys(&target, &args.input, args.literal, args.enter)
            .await?;
        self.manager.touch(&args.session_id);
        Ok(SendInputResult {
            session_id: args.session_id,
            window,
            bytes: args.input.len(),
        })
    }

    pub async fn capture_pane(&self, args: CapturePaneArgs) -> Result<CapturePaneResult, SessionError> {
        self.manager.check_session(&args.session_id).await?;
        let window = args.window.unwrap_or_else(|| EXEC_WINDOW.to_string());
        let target = window_target(&args.session_id, &window);
        let content = self.manager.mux().capture_pane(&target, args.lines).await?;
        self.manager.touch(&args.session_id);
        Ok(CapturePaneResult {
            session_id: args.session_id,
            window,
            content,
        })
    }

    pub async fn session_info(&self, args: SessionInfoArgs) -> SessionHealth {
        self.manager.session_health(&args.session_id).await
    }

    pub async fn cleanup_sessions(&self) -> CleanupReport {
        self.scheduler.sweep().await
    }
}

fn to_value<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

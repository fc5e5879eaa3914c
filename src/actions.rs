use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SessionError;

/// One line of input: `{"id": ..., "tool": "...", "arguments": {...}}`
#[derive(Debug, Clone, Deserialize)]
pub struct ToolRequest {
    #[serde(default)]
    pub id: Value,
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreateSessionArgs {
    pub session_id: Option<String>,
    pub purpose: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DestroySessionArgs {
    pub session_id: String,
    /// Fail with session_not_found instead of returning `destroyed: false`
    #[serde(default)]
    pub must_exist: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteCommandArgs {
    pub command: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    #[serde(default)]
    pub purpose: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendInputArgs {
    pub session_id: String,
    pub input: String,
    #[serde(default)]
    pub window: Option<String>,
    /// Press Enter after the input
    #[serde(default = "default_true")]
    pub enter: bool,
    /// Send as text rather than tmux key names such as `C-c`
    #[serde(default = "default_true")]
    pub literal: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CapturePaneArgs {
    pub session_id: String,
    #[serde(default)]
    pub window: Option<String>,
    /// Scrollback lines to include above the visible pane
    #[serde(default)]
    pub lines: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfoArgs {
    pub session_id: String,
}

/// Tool calls that can be dispatched to the core
#[derive(Debug, Clone)]
pub enum ToolCall {
    CreateSession(CreateSessionArgs),
    DestroySession(DestroySessionArgs),
    ListSessions,
    ExecuteCommand(ExecuteCommandArgs),
    SendInput(SendInputArgs),
    CapturePane(CapturePaneArgs),
    SessionInfo(SessionInfoArgs),
    CleanupSessions,
}

/// Why a request could not be turned into a [`ToolCall`]
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("invalid arguments for '{tool}': {source}")]
    InvalidArguments {
        tool: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ToolCall {
    pub fn parse(tool: &str, arguments: Value) -> Result<Self, ParseError> {
        let arguments = match arguments {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        let invalid = |source| ParseError::InvalidArguments {
            tool: tool.to_string(),
            source,
        };

        Ok(match tool {
            "create_session" => ToolCall::CreateSession(serde_json::from_value(arguments).map_err(invalid)?),
            "destroy_session" => ToolCall::DestroySession(serde_json::from_value(arguments).map_err(invalid)?),
            "list_sessions" => ToolCall::ListSessions,
            "execute_command" => ToolCall::ExecuteCommand(serde_json::from_value(arguments).map_err(invalid)?),
            "send_input" => ToolCall::SendInput(serde_json::from_value(arguments).map_err(invalid)?),
            "capture_pane" => ToolCall::CapturePane(serde_json::from_value(arguments).map_err(invalid)?),
            "session_info" => ToolCall::SessionInfo(serde_json::from_value(arguments).map_err(invalid)?),
            "cleanup_sessions" => ToolCall::CleanupSessions,
            other => return Err(ParseError::UnknownTool(other.to_string())),
        })
    }
}

/// Error shape returned to callers instead of a raw exception
#[derive(Debug, Clone, Serialize)]
pub struct ToolFailure {
    pub kind: &'static str,
    pub message: String,
    pub recovery_hint: &'static str,
    pub recoverable: bool,
}

impl From<&SessionError> for ToolFailure {
    fn from(err: &SessionError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            recovery_hint: err.recovery_hint(),
            recoverable: err.is_recoverable(),
        }
    }
}

impl From<&ParseError> for ToolFailure {
    fn from(err: &ParseError) -> Self {
        let (kind, recovery_hint) = match err {
            ParseError::UnknownTool(_) => (
                "unknown_tool",
                "Use one of: create_session, destroy_session, list_sessions, execute_command, send_input, capture_pane, session_info, cleanup_sessions.",
            ),
            ParseError::InvalidArguments { .. } => {
                ("invalid_arguments", "Check the argument names and types for this tool.")
            }
            ParseError::Malformed(_) => (
                "malformed_request",
                "Send one JSON object per line with \"tool\" and \"arguments\" fields.",
            ),
        };
        Self {
            kind,
            message: err.to_string(),
            recovery_hint,
            recoverable: false,
        }
    }
}

/// One line of output
#[derive(Debug, Clone, Serialize)]
pub struct ToolReply {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolFailure>,
}

impl ToolReply {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, error: ToolFailure) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_known_tools() {
        let call = ToolCall::parse(
            "execute_command",
            json!({"command": "ls", "session_id": "build", "timeout_secs": 2.5}),
        )
        .unwrap();
        match call {
            ToolCall::ExecuteCommand(args) => {
                assert_eq!(args.command, "ls");
                assert_eq!(args.session_id.as_deref(), Some("build"));
                assert_eq!(args.timeout_secs, Some(2.5));
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            ToolCall::parse("create_session", Value::Null).unwrap(),
            ToolCall::CreateSession(_)
        ));
        assert!(matches!(
            ToolCall::parse("cleanup_sessions", Value::Null).unwrap(),
            ToolCall::CleanupSessions
        ));
    }

    #[test]
    fn test_send_input_defaults() {
        match ToolCall::parse("send_input", json!({"session_id": "a", "input": "q"})).unwrap() {
            ToolCall::SendInput(args) => {
                assert!(args.enter);
                assert!(args.literal);
                assert!(args.window.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            ToolCall::parse("rm_rf", Value::Null),
            Err(ParseError::UnknownTool(_))
        ));
        let err = ToolCall::parse("execute_command", json!({"session_id": "a"})).unwrap_err();
        assert!(matches!(err, ParseError::InvalidArguments { .. }));
        assert_eq!(ToolFailure::from(&err).kind, "invalid_arguments");
    }

    #[test]
    fn test_reply_shapes() {
        let reply = ToolReply::ok(json!(1), json!({"stdout": "hi"}));
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value, json!({"id": 1, "result": {"stdout": "hi"}}));

        let failure = ToolFailure::from(&SessionError::SessionNotFound("x".into()));
        let value = serde_json::to_value(ToolReply::err(Value::Null, failure)).unwrap();
        assert_eq!(value["error"]["kind"], "session_not_found");
        assert!(value.get("result").is_none());
    }
}

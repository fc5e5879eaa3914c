use std::path::Path;

/// Prefix of the trailing line that carries the command's exit status
pub const EXIT_MARKER: &str = "__AGENT_SHELL_EXIT__:";

/// A capture artifact split into command output and exit status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureParts {
    pub body: String,
    /// None when the trailing marker line is missing or malformed
    pub exit_code: Option<i32>,
}

/// Split a capture artifact at its trailing exit-status line.
///
/// Only the last non-empty line is considered, so marker-shaped text earlier
/// in the output stays part of the body.
pub fn split_capture_artifact(text: &str) -> CaptureParts {
    let trimmed = text.trim_end_matches(['\n', '\r']);
    let (head, last) = match trimmed.rfind('\n') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
        None => ("", trimmed),
    };

    let exit_code = last
        .trim_end_matches('\r')
        .strip_prefix(EXIT_MARKER)
        .and_then(|code| code.trim().parse::<i32>().ok());

    match exit_code {
        Some(code) => CaptureParts {
            body: head.to_string(),
            exit_code: Some(code),
        },
        None => CaptureParts {
            body: text.to_string(),
            exit_code: None,
        },
    }
}

/// Quote `s` for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Rewrite `command` so that it runs in a subshell with combined output
/// redirected to `capture`, appends its exit status there, and only then
/// creates `sentinel`.
pub fn wrap_command(command: &str, capture: &Path, sentinel: &Path) -> String {
    let capture = shell_quote(&capture.to_string_lossy());
    let sentinel = shell_quote(&sentinel.to_string_lossy());
    // The newline before ')' keeps a trailing comment from swallowing it
    format!(
        "( {command}\n) > {capture} 2>&1; printf '\\n{EXIT_MARKER}%s\\n' \"$?\" >> {capture}; : > {sentinel}"
    )
}

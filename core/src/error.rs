use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FmshErr>;

/// Malformed shell output. `line` is the 0-based index of the offending line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("parse error at line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }

    /// Re-anchors an error produced while parsing a single line.
    pub(crate) fn at_line(self, line: usize) -> Self {
        Self { line, ..self }
    }
}

#[derive(Debug, Error)]
pub enum FmshErr {
    /// The binary behind the program is not installed in the shell's PATH.
    #[error("command not found: {command}")]
    CommandNotFound { command: String },

    /// The command was refused by the filesystem. Relaunchable on a
    /// privileged console.
    #[error("insufficient permissions running `{command}`: {detail}")]
    InsufficientPermissions { command: String, detail: String },

    #[error("no such file or directory: {detail}")]
    NoSuchFileOrDirectory { command: String, detail: String },

    #[error("`{command}` did not complete within {timeout:?}")]
    OperationTimeout { command: String, timeout: Duration },

    #[error("`{command}` failed with exit code {exit_code}: {detail}")]
    Execution {
        command: String,
        exit_code: i32,
        detail: String,
    },

    #[error("failed to allocate console: {reason}")]
    ConsoleAlloc { reason: String },

    #[error("console is no longer active")]
    ConsoleInactive,

    #[error("invalid command definition: {0}")]
    InvalidCommandDefinition(String),

    #[error("privileged relaunch failed: {source}")]
    RelaunchFailed {
        #[source]
        source: Box<FmshErr>,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FmshErr {
    pub(crate) fn console_alloc(reason: impl Into<String>) -> Self {
        Self::ConsoleAlloc {
            reason: reason.into(),
        }
    }

    pub(crate) fn execution(command: &str, exit_code: i32, detail: impl Into<String>) -> Self {
        Self::Execution {
            command: command.to_string(),
            exit_code,
            detail: detail.into(),
        }
    }

    /// Only permission failures may be replayed with escalated privileges.
    pub fn is_relaunchable(&self) -> bool {
        matches!(self, Self::InsufficientPermissions { .. })
    }
}

const PERMISSION_PATTERNS: [&str; 3] = [
    "Permission denied",
    "Operation not permitted",
    "Read-only file system",
];
const MISSING_PATTERN: &str = "No such file or directory";

/// Maps a rejected exit code plus the command's stderr onto the error
/// taxonomy. Shared by every program that classifies by stderr.
pub fn classify_failure(command: &str, exit_code: i32, stderr: &str) -> FmshErr {
    let detail = first_line(stderr);
    if PERMISSION_PATTERNS
        .iter()
        .any(|pattern| stderr.contains(pattern))
    {
        return FmshErr::InsufficientPermissions {
            command: command.to_string(),
            detail,
        };
    }
    if stderr.contains(MISSING_PATTERN) {
        return FmshErr::NoSuchFileOrDirectory {
            command: command.to_string(),
            detail,
        };
    }
    FmshErr::execution(command, exit_code, detail)
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .to_string()
}

//! Programs: one shell command invocation plus the logic that interprets
//! its output and exit code.

mod compress;
mod find;
mod fs_op;
mod identity;
mod list;
mod partial;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::FmshErr;
use crate::error::ParseError;
use crate::error::Result;

pub use compress::CompressProgram;
pub use compress::CompressionMode;
pub use find::FindProgram;
pub use fs_op::FsOp;
pub use fs_op::FsOpProgram;
pub use identity::Identity;
pub use identity::IdentityProgram;
pub use list::ListMode;
pub use list::ListProgram;
pub use list::SYMLINK_DATA_REF;
pub use list::SYMLINK_REF;
pub use list::parse_listing;
pub use partial::PartialLineBuffer;

/// Exit status reported by the shell when the binary is missing.
pub const COMMAND_NOT_FOUND_EXIT_CODE: i32 = 127;
/// Conventional shell encoding of "terminated by signal": 128 + signal.
pub const EXIT_CODE_SIGNAL_BASE: i32 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramState {
    Created,
    Dispatched,
    Parsing,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for ProgramState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Created => "created",
            Self::Dispatched => "dispatched",
            Self::Parsing => "parsing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Signals a console may deliver to a running command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Hangup,
    Interrupt,
    Quit,
    Kill,
    Terminate,
}

impl Signal {
    pub fn number(self) -> i32 {
        match self {
            Self::Hangup => libc::SIGHUP,
            Self::Interrupt => libc::SIGINT,
            Self::Quit => libc::SIGQUIT,
            Self::Kill => libc::SIGKILL,
            Self::Terminate => libc::SIGTERM,
        }
    }

    /// Name understood by `kill -s`.
    pub fn name(self) -> &'static str {
        match self {
            Self::Hangup => "HUP",
            Self::Interrupt => "INT",
            Self::Quit => "QUIT",
            Self::Kill => "KILL",
            Self::Terminate => "TERM",
        }
    }

    /// Exit status a shell reports for a command killed by this signal.
    pub fn exit_code(self) -> i32 {
        EXIT_CODE_SIGNAL_BASE + self.number()
    }
}

/// The command a program runs: an identifier (the binary), its arguments,
/// an optional working directory and, for programs that need more than a
/// single command, the shell script that replaces the plain argv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    id: String,
    args: Vec<String>,
    cwd: Option<String>,
    script: Option<String>,
}

impl CommandLine {
    pub fn new<I, S>(id: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            script: None,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    /// Human readable form used in logs and error messages.
    pub fn preview(&self) -> String {
        std::iter::once(self.id.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Shell text executed by the console.
    pub fn render(&self) -> Result<String> {
        let body = match &self.script {
            Some(script) => script.clone(),
            None => shlex::try_join(
                std::iter::once(self.id.as_str()).chain(self.args.iter().map(String::as_str)),
            )
            .map_err(|err| FmshErr::InvalidCommandDefinition(err.to_string()))?,
        };
        match &self.cwd {
            Some(cwd) => Ok(format!("cd -- {} && {body}", quote(cwd)?)),
            None => Ok(body),
        }
    }
}

/// POSIX shell quoting of one word.
pub(crate) fn quote(word: &str) -> Result<String> {
    shlex::try_quote(word)
        .map(|quoted| quoted.into_owned())
        .map_err(|err| FmshErr::InvalidCommandDefinition(err.to_string()))
}

/// Command and lifecycle bookkeeping every program embeds.
#[derive(Debug, Clone)]
pub struct ProgramCore {
    command: CommandLine,
    state: ProgramState,
}

impl ProgramCore {
    pub fn new(command: CommandLine) -> Self {
        Self {
            command,
            state: ProgramState::Created,
        }
    }
}

pub trait Program: Send {
    fn core(&self) -> &ProgramCore;

    fn core_mut(&mut self) -> &mut ProgramCore;

    /// Accepts the exit code or maps it onto an error. Runs after the
    /// output has been parsed.
    fn check_exit_code(&mut self, exit_code: i32, stderr: &str) -> Result<()>;

    /// Per-execution deadline overriding the console default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn command(&self) -> &CommandLine {
        &self.core().command
    }

    fn state(&self) -> ProgramState {
        self.core().state
    }

    fn set_state(&mut self, state: ProgramState) {
        self.core_mut().state = state;
    }
}

/// Programs parsed once, after their whole output has been captured.
pub trait SyncProgram: Program {
    type Output;

    fn parse(&mut self, stdout: &str, stderr: &str) -> std::result::Result<(), ParseError>;

    fn result(&self) -> &Self::Output;
}

/// Programs fed with output as it arrives. Chunks are arbitrary: they are
/// not aligned on line boundaries.
pub trait AsyncProgram: Program {
    fn on_start_parse_partial_result(&mut self);

    fn on_parse_partial_result(&mut self, partial: &str);

    fn on_parse_error_partial_result(&mut self, partial: &str);

    /// Called exactly once per execution, including failed and cancelled
    /// ones.
    fn on_end_parse_partial_result(&mut self, canceled: bool);

    fn on_exit_code(&mut self, _exit_code: i32) {}

    fn on_exception(&mut self, _cause: &FmshErr) {}

    /// Signal to deliver when the command is ended early. `None` lets the
    /// console pick.
    fn on_request_end(&mut self) -> Option<Signal> {
        None
    }

    /// Lets the program stop the command once it has seen enough output.
    fn wants_end(&self) -> bool {
        false
    }
}

/// Receiver of the partial results of an asynchronous program.
pub trait AsyncResultListener<T>: Send + Sync {
    fn on_async_start(&self) {}

    fn on_async_end(&self, _canceled: bool) {}

    fn on_async_exit_code(&self, _exit_code: i32) {}

    fn on_partial_result(&self, partial: T);

    fn on_exception(&self, _cause: &FmshErr) {}
}

pub type SharedListener<T> = Arc<dyn AsyncResultListener<T>>;

/// Listener events delivered over a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum AsyncEvent<T> {
    Started,
    Partial(T),
    ExitCode(i32),
    Failed(String),
    Ended { canceled: bool },
}

impl<T: Send> AsyncResultListener<T> for mpsc::UnboundedSender<AsyncEvent<T>> {
    fn on_async_start(&self) {
        let _ = self.send(AsyncEvent::Started);
    }

    fn on_async_end(&self, canceled: bool) {
        let _ = self.send(AsyncEvent::Ended { canceled });
    }

    fn on_async_exit_code(&self, exit_code: i32) {
        let _ = self.send(AsyncEvent::ExitCode(exit_code));
    }

    fn on_partial_result(&self, partial: T) {
        let _ = self.send(AsyncEvent::Partial(partial));
    }

    fn on_exception(&self, cause: &FmshErr) {
        let _ = self.send(AsyncEvent::Failed(cause.to_string()));
    }
}

/// Listener backed by an unbounded channel; returns the listener and the
/// receiving end.
pub fn channel_listener<T: Send + 'static>()
-> (SharedListener<T>, mpsc::UnboundedReceiver<AsyncEvent<T>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(tx), rx)
}

//! A console owns one persistent shell process and runs programs on it, one
//! at a time.

mod factory;
mod frame;
mod signal;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::FmshErr;
use crate::error::Result;
use crate::program::AsyncProgram;
use crate::program::COMMAND_NOT_FOUND_EXIT_CODE;
use crate::program::CommandLine;
use crate::program::ProgramState;
use crate::program::Signal;
use crate::program::SyncProgram;
use crate::program::quote;

pub use factory::ConsoleFactory;
use frame::FrameEvent;
use frame::FrameScanner;
use frame::Sentinels;
use signal::signal_job;

const READ_CHUNK_SIZE: usize = 8192;
const READ_CHANNEL_CAPACITY: usize = 128;
const DISPOSE_TIMEOUT: Duration = Duration::from_secs(2);

static NEXT_CONSOLE_ID: AtomicU64 = AtomicU64::new(1);

/// How to start a shell: a program, its arguments and extra environment.
/// The shell must read commands from stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellLauncher {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl ShellLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

impl Default for ShellLauncher {
    fn default() -> Self {
        Self::new("/bin/sh")
    }
}

#[derive(Debug, Clone)]
pub struct ConsoleSettings {
    /// Directory the shell starts in.
    pub root_directory: String,
    /// Default deadline of synchronous executions.
    pub exec_timeout: Duration,
    pub startup_timeout: Duration,
    /// How long to wait for the sentinels after interrupting a command.
    pub resync_timeout: Duration,
    pub trace: bool,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            root_directory: "/".to_string(),
            exec_timeout: Duration::from_secs(10),
            startup_timeout: Duration::from_secs(5),
            resync_timeout: Duration::from_secs(2),
            trace: false,
        }
    }
}

struct ConsoleIo {
    child: Child,
    stdin: ChildStdin,
    stdout_rx: mpsc::Receiver<Vec<u8>>,
    stderr_rx: mpsc::Receiver<Vec<u8>>,
    readers: Vec<JoinHandle<()>>,
}

impl Drop for ConsoleIo {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Cancelled,
    ProgramEnded,
    TimedOut,
}

#[derive(Debug)]
struct Completion {
    exit_code: Option<i32>,
    stop: Option<StopReason>,
}

/// Receives the output of one execution as it is unframed.
trait FrameSink: Send {
    fn on_stdout(&mut self, text: &str);

    fn on_stderr(&mut self, text: &str);

    fn wants_end(&self) -> bool {
        false
    }

    fn end_signal(&mut self) -> Option<Signal> {
        None
    }
}

#[derive(Default)]
struct Collector {
    stdout: String,
    stderr: String,
}

impl FrameSink for Collector {
    fn on_stdout(&mut self, text: &str) {
        self.stdout.push_str(text);
    }

    fn on_stderr(&mut self, text: &str) {
        self.stderr.push_str(text);
    }
}

struct StreamingSink<'a, P> {
    program: &'a mut P,
    stderr: String,
}

impl<P: AsyncProgram> FrameSink for StreamingSink<'_, P> {
    fn on_stdout(&mut self, text: &str) {
        self.program.on_parse_partial_result(text);
    }

    fn on_stderr(&mut self, text: &str) {
        self.stderr.push_str(text);
        self.program.on_parse_error_partial_result(text);
    }

    fn wants_end(&self) -> bool {
        self.program.wants_end()
    }

    fn end_signal(&mut self) -> Option<Signal> {
        self.program.on_request_end()
    }
}

pub struct Console {
    name: String,
    privileged: bool,
    launcher: ShellLauncher,
    settings: ConsoleSettings,
    trace: AtomicBool,
    active: AtomicBool,
    disposed: AtomicBool,
    shutdown: CancellationToken,
    io: Mutex<ConsoleIo>,
}

impl fmt::Debug for Console {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Console")
            .field("name", &self.name)
            .field("privileged", &self.privileged)
            .field("launcher", &self.launcher.program)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl Console {
    /// Starts the shell and checks that it answers a framed no-op within the
    /// startup timeout. `privileged` only records what the caller asked
    /// for; [`ConsoleFactory`] is responsible for verifying it.
    pub async fn spawn(
        launcher: ShellLauncher,
        privileged: bool,
        settings: ConsoleSettings,
    ) -> Result<Self> {
        let name = format!(
            "console-{}",
            NEXT_CONSOLE_ID.fetch_add(1, Ordering::Relaxed)
        );
        let mut child = Command::new(&launcher.program)
            .args(&launcher.args)
            .envs(&launcher.env)
            .env("LC_ALL", "C")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                FmshErr::console_alloc(format!("failed to spawn `{}`: {err}", launcher.program))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| FmshErr::console_alloc("stdin pipe was unexpectedly not available"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FmshErr::console_alloc("stdout pipe was unexpectedly not available"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| FmshErr::console_alloc("stderr pipe was unexpectedly not available"))?;

        let (stdout_tx, stdout_rx) = mpsc::channel(READ_CHANNEL_CAPACITY);
        let (stderr_tx, stderr_rx) = mpsc::channel(READ_CHANNEL_CAPACITY);
        let readers = vec![
            spawn_reader(stdout, stdout_tx),
            spawn_reader(stderr, stderr_tx),
        ];
        info!(
            console = %name,
            launcher = %launcher.program,
            pid = ?child.id(),
            privileged,
            "shell started"
        );

        let console = Self {
            name,
            privileged,
            launcher,
            trace: AtomicBool::new(settings.trace),
            settings,
            active: AtomicBool::new(true),
            disposed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            io: Mutex::new(ConsoleIo {
                child,
                stdin,
                stdout_rx,
                stderr_rx,
                readers,
            }),
        };
        if let Err(err) = console.handshake().await {
            console.dispose().await;
            return Err(match err {
                FmshErr::ConsoleAlloc { .. } => err,
                other => FmshErr::console_alloc(format!("shell did not answer: {other}")),
            });
        }
        Ok(console)
    }

    async fn handshake(&self) -> Result<()> {
        let init = format!(
            "cd -- {} 2>/dev/null; LC_ALL=C; export LC_ALL\n",
            quote(&self.settings.root_directory)?
        );
        {
            let mut io = self.io.lock().await;
            write_line(&mut io.stdin, &init).await?;
        }
        let mut collector = Collector::default();
        let completion = self
            .run_framed(
                &CommandLine::new("true", Vec::<String>::new()),
                Some(self.settings.startup_timeout),
                &mut collector,
                &CancellationToken::new(),
            )
            .await?;
        match completion.exit_code {
            Some(0) => Ok(()),
            other => Err(FmshErr::console_alloc(format!(
                "handshake exited with {other:?}: {}",
                collector.stderr.trim()
            ))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn launcher(&self) -> &ShellLauncher {
        &self.launcher
    }

    pub fn is_tracing(&self) -> bool {
        self.trace.load(Ordering::Relaxed)
    }

    pub fn reload_trace(&self, enabled: bool) {
        self.trace.store(enabled, Ordering::Relaxed);
    }

    /// Runs a synchronous program: output is captured whole, parsed once,
    /// then the exit code is checked. A rejected exit code wins over a
    /// parse error.
    pub async fn execute<P: SyncProgram>(&self, program: &mut P) -> Result<()> {
        program.set_state(ProgramState::Dispatched);
        let command = program.command().clone();
        let timeout = program.timeout().unwrap_or(self.settings.exec_timeout);
        let mut collector = Collector::default();
        let outcome = self
            .run_framed(
                &command,
                Some(timeout),
                &mut collector,
                &CancellationToken::new(),
            )
            .await;
        let result = match outcome {
            Ok(Completion {
                exit_code: Some(exit_code),
                ..
            }) => {
                if exit_code == COMMAND_NOT_FOUND_EXIT_CODE {
                    Err(FmshErr::CommandNotFound {
                        command: command.id().to_string(),
                    })
                } else {
                    program.set_state(ProgramState::Parsing);
                    let parsed = program.parse(&collector.stdout, &collector.stderr);
                    program
                        .check_exit_code(exit_code, &collector.stderr)
                        .and_then(|()| parsed.map_err(FmshErr::from))
                }
            }
            Ok(Completion { exit_code: None, .. }) => Err(FmshErr::ConsoleInactive),
            Err(err) => Err(err),
        };
        program.set_state(match result {
            Ok(()) => ProgramState::Completed,
            Err(_) => ProgramState::Failed,
        });
        result
    }

    /// Runs an asynchronous program, feeding it output as it arrives.
    ///
    /// `on_end_parse_partial_result` is called exactly once whatever the
    /// outcome. Cancellation through `cancel`, or the program asking to
    /// stop, skips exit-code classification.
    pub async fn execute_async<P: AsyncProgram>(
        &self,
        program: &mut P,
        cancel: &CancellationToken,
    ) -> Result<()> {
        program.set_state(ProgramState::Dispatched);
        program.on_start_parse_partial_result();
        let command = program.command().clone();
        let timeout = program.timeout();
        let mut sink = StreamingSink {
            program: &mut *program,
            stderr: String::new(),
        };
        let outcome = self.run_framed(&command, timeout, &mut sink, cancel).await;
        let stderr = sink.stderr;

        let result = match outcome {
            Ok(completion) => {
                if let Some(exit_code) = completion.exit_code {
                    program.on_exit_code(exit_code);
                }
                match (completion.stop, completion.exit_code) {
                    (Some(StopReason::Cancelled), _) => {
                        program.set_state(ProgramState::Cancelled);
                        program.on_end_parse_partial_result(true);
                        return Ok(());
                    }
                    (Some(_), _) => Ok(()),
                    (None, Some(COMMAND_NOT_FOUND_EXIT_CODE)) => Err(FmshErr::CommandNotFound {
                        command: command.id().to_string(),
                    }),
                    (None, Some(exit_code)) => program.check_exit_code(exit_code, &stderr),
                    (None, None) => Err(FmshErr::ConsoleInactive),
                }
            }
            Err(err) => Err(err),
        };
        match &result {
            Ok(()) => program.set_state(ProgramState::Completed),
            Err(err) => {
                program.on_exception(err);
                program.set_state(ProgramState::Failed);
            }
        }
        program.on_end_parse_partial_result(false);
        result
    }

    /// Runs `program` on a spawned task and returns immediately.
    pub fn spawn_async<P>(self: &Arc<Self>, mut program: P) -> AsyncExecution<P>
    where
        P: AsyncProgram + 'static,
    {
        let cancel = CancellationToken::new();
        let console = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let result = console.execute_async(&mut program, &token).await;
            (program, result)
        });
        AsyncExecution { cancel, handle }
    }

    /// Kills the shell. Safe to call more than once; waits for a running
    /// execution to notice.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.active.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        let mut io = self.io.lock().await;
        self.dispose_io(&mut io).await;
    }

    async fn dispose_io(&self, io: &mut ConsoleIo) {
        self.disposed.store(true, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        let _ = io.stdin.shutdown().await;
        if let Err(err) = io.child.start_kill() {
            debug!(console = %self.name, "kill failed, waiting for the shell to exit: {err}");
        }
        match tokio::time::timeout(DISPOSE_TIMEOUT, io.child.wait()).await {
            Ok(Ok(status)) => debug!(console = %self.name, ?status, "shell exited"),
            Ok(Err(err)) => warn!(console = %self.name, "failed to reap shell: {err}"),
            Err(_) => warn!(console = %self.name, "shell did not exit after disposal"),
        }
        info!(console = %self.name, "console disposed");
    }

    fn mark_inactive(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            warn!(console = %self.name, "shell closed its output; console is inactive");
        }
    }

    async fn request_signal(&self, pid: Option<i32>, signal: Signal, pending: &mut Option<Signal>) {
        match pid {
            Some(pid) => signal_job(pid, signal, &self.launcher).await,
            None => *pending = Some(signal),
        }
    }

    /// Writes one framed command and unframes its output.
    async fn run_framed(
        &self,
        command: &CommandLine,
        timeout: Option<Duration>,
        sink: &mut dyn FrameSink,
        cancel: &CancellationToken,
    ) -> Result<Completion> {
        if !self.is_active() {
            return Err(FmshErr::ConsoleInactive);
        }
        let script = command.render()?;
        let sentinels = Sentinels::new();
        let line = sentinels.wrap(&script)?;

        let mut guard = self.io.lock().await;
        if !self.is_active() {
            return Err(FmshErr::ConsoleInactive);
        }
        let io = &mut *guard;
        let tracing = self.is_tracing();
        if tracing {
            debug!(console = %self.name, command = %script, "exec");
        }
        if let Err(err) = write_line(&mut io.stdin, &line).await {
            self.mark_inactive();
            return Err(FmshErr::Io(err));
        }

        let timed_out = || FmshErr::OperationTimeout {
            command: command.preview(),
            timeout: timeout.unwrap_or_default(),
        };
        let mut stdout = FrameScanner::stdout(&sentinels);
        let mut stderr = FrameScanner::stderr(&sentinels);
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut resync_deadline: Option<Instant> = None;
        let mut pid: Option<i32> = None;
        let mut pending_signal: Option<Signal> = None;
        let mut exit_code: Option<i32> = None;
        let mut stop: Option<StopReason> = None;

        while !(stdout.is_done() && stderr.is_done()) {
            let timer = resync_deadline.or(deadline);
            tokio::select! {
                chunk = io.stdout_rx.recv(), if !stdout.is_done() => {
                    let Some(bytes) = chunk else {
                        self.mark_inactive();
                        return Err(FmshErr::ConsoleInactive);
                    };
                    for event in stdout.push(&bytes) {
                        match event {
                            FrameEvent::Data(text) => {
                                if tracing {
                                    debug!(console = %self.name, stdout = %text);
                                }
                                sink.on_stdout(&text);
                            }
                            FrameEvent::ExitCode(code) => exit_code = Some(code),
                            FrameEvent::Malformed(reason) => {
                                warn!(console = %self.name, "{reason}; disposing console");
                                self.dispose_io(io).await;
                                return Err(FmshErr::execution(&command.preview(), -1, reason));
                            }
                            FrameEvent::Pid(_) => {}
                        }
                    }
                }
                chunk = io.stderr_rx.recv(), if !stderr.is_done() => {
                    let Some(bytes) = chunk else {
                        self.mark_inactive();
                        return Err(FmshErr::ConsoleInactive);
                    };
                    for event in stderr.push(&bytes) {
                        match event {
                            FrameEvent::Data(text) => {
                                if tracing {
                                    debug!(console = %self.name, stderr = %text);
                                }
                                sink.on_stderr(&text);
                            }
                            FrameEvent::Pid(job) => {
                                pid = Some(job);
                                if let Some(signal) = pending_signal.take() {
                                    signal_job(job, signal, &self.launcher).await;
                                }
                            }
                            FrameEvent::ExitCode(_) | FrameEvent::Malformed(_) => {}
                        }
                    }
                }
                () = cancel.cancelled(), if stop.is_none() => {
                    debug!(console = %self.name, "cancel requested");
                    stop = Some(StopReason::Cancelled);
                    let signal = sink.end_signal().unwrap_or(Signal::Interrupt);
                    self.request_signal(pid, signal, &mut pending_signal).await;
                    resync_deadline = Some(Instant::now() + self.settings.resync_timeout);
                }
                () = self.shutdown.cancelled() => {
                    if let Some(pid) = pid {
                        signal_job(pid, Signal::Kill, &self.launcher).await;
                    }
                    return Err(FmshErr::ConsoleInactive);
                }
                () = sleep_until(timer) => {
                    if resync_deadline.is_some() {
                        warn!(console = %self.name, "shell did not resynchronise; disposing console");
                        self.dispose_io(io).await;
                        return match stop {
                            Some(StopReason::TimedOut) | None => Err(timed_out()),
                            Some(reason) => Ok(Completion { exit_code: None, stop: Some(reason) }),
                        };
                    }
                    warn!(console = %self.name, command = %command.preview(), "execution timed out");
                    stop = Some(StopReason::TimedOut);
                    self.request_signal(pid, Signal::Interrupt, &mut pending_signal).await;
                    resync_deadline = Some(Instant::now() + self.settings.resync_timeout);
                }
            }

            if stop.is_none() && sink.wants_end() {
                debug!(console = %self.name, "program asked to end the command");
                stop = Some(StopReason::ProgramEnded);
                let signal = sink.end_signal().unwrap_or(Signal::Interrupt);
                self.request_signal(pid, signal, &mut pending_signal).await;
                resync_deadline = Some(Instant::now() + self.settings.resync_timeout);
            }
        }

        if tracing {
            debug!(console = %self.name, ?exit_code, ?stop, "exec finished");
        }
        if stop == Some(StopReason::TimedOut) {
            return Err(timed_out());
        }
        Ok(Completion { exit_code, stop })
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Handle to an asynchronous execution started with
/// [`Console::spawn_async`].
pub struct AsyncExecution<P> {
    cancel: CancellationToken,
    handle: JoinHandle<(P, Result<()>)>,
}

impl<P> AsyncExecution<P> {
    /// Signals the running command. The program still receives its end
    /// notification, with `canceled` set.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the execution and hands the program back together with
    /// its outcome. The outer error only reports a task that panicked.
    pub async fn wait(self) -> Result<(P, Result<()>)> {
        self.handle
            .await
            .map_err(|err| FmshErr::Io(io::Error::other(err)))
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

fn spawn_reader<R>(mut reader: R, tx: mpsc::Sender<Vec<u8>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!("shell output read failed: {err}");
                    break;
                }
            }
        }
    })
}

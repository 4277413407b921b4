//! Fixtures shared by the fmsh-core integration tests.
//!
//! Privilege is simulated. The privileged launcher is a plain `/bin/sh`
//! whose environment carries [`ROLE_ENV`], and the privileged uid is the
//! uid running the tests, so the identity probe accepts it. Scripts wrapped
//! with [`role_guarded`] fail with "Permission denied" anywhere else.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::fs::symlink;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use fmsh_core::EngineConfig;
use fmsh_core::EngineEvent;
use fmsh_core::EscalationPrompt;
use fmsh_core::FmshErr;
use fmsh_core::ParseError;
use fmsh_core::Result;
use fmsh_core::ShellLauncher;
use fmsh_core::classify_failure;
use fmsh_core::program::AsyncProgram;
use fmsh_core::program::CommandLine;
use fmsh_core::program::PartialLineBuffer;
use fmsh_core::program::Program;
use fmsh_core::program::ProgramCore;
use fmsh_core::program::Signal;
use fmsh_core::program::SyncProgram;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub const ROLE_ENV: &str = "FMSH_TEST_ROLE";
pub const PRIVILEGED_ROLE: &str = "root";

pub fn current_uid() -> u32 {
    // SAFETY: geteuid(2) cannot fail.
    unsafe { libc::geteuid() }
}

/// Both launchers are `/bin/sh`; the privileged one is tagged with the
/// privileged role and verifies as the current uid.
pub fn test_config() -> EngineConfig {
    let mut privileged_shell = ShellLauncher::new("/bin/sh");
    privileged_shell
        .env
        .insert(ROLE_ENV.to_string(), PRIVILEGED_ROLE.to_string());
    EngineConfig {
        shell: ShellLauncher::new("/bin/sh"),
        privileged_shell,
        privileged_uid: current_uid(),
        exec_timeout_ms: 5_000,
        startup_timeout_ms: 5_000,
        resync_timeout_ms: 2_000,
        ..EngineConfig::default()
    }
}

/// The privileged shell starts but reports the wrong uid, like `su` on a
/// device where it silently drops privileges.
pub fn config_with_unverifiable_privileges() -> EngineConfig {
    EngineConfig {
        privileged_uid: current_uid().wrapping_add(1),
        ..test_config()
    }
}

/// The privileged launcher does not exist at all.
pub fn config_without_privileged_shell() -> EngineConfig {
    let mut config = test_config();
    config.privileged_shell.program = "/nonexistent/fmsh-su".to_string();
    config
}

/// Prefixes `body` with a check that fails like a refused syscall unless
/// the shell was started with the privileged role.
pub fn role_guarded(body: &str) -> String {
    format!(
        "[ \"${ROLE_ENV}\" = {PRIVILEGED_ROLE} ] || \
         {{ echo 'fmsh-test: Permission denied' >&2; exit 1; }}; {body}"
    )
}

/// A small directory tree:
///
/// ```text
/// a.txt        regular file, 10 bytes, mode 0644
/// .hidden      regular file
/// sub/         directory holding inner.log
/// b         -> a.txt
/// dirlink   -> sub
/// dangling  -> missing
/// ```
pub struct FixtureTree {
    _dir: TempDir,
    root: PathBuf,
}

impl FixtureTree {
    pub fn create() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        // Symlink targets are compared against `readlink -f` output.
        let root = dir.path().canonicalize()?;
        fs::write(root.join("a.txt"), "0123456789")?;
        fs::set_permissions(root.join("a.txt"), fs::Permissions::from_mode(0o644))?;
        fs::write(root.join(".hidden"), "")?;
        fs::create_dir(root.join("sub"))?;
        fs::write(root.join("sub").join("inner.log"), "log line\n")?;
        symlink(root.join("a.txt"), root.join("b"))?;
        symlink(root.join("sub"), root.join("dirlink"))?;
        symlink(root.join("missing"), root.join("dangling"))?;
        Ok(Self { _dir: dir, root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn root(&self) -> String {
        self.root.to_string_lossy().into_owned()
    }

    pub fn join(&self, name: &str) -> String {
        self.root.join(name).to_string_lossy().into_owned()
    }
}

/// Runs an arbitrary script and keeps its raw output. Exit codes other
/// than 0 are classified from stderr.
#[derive(Debug, Clone)]
pub struct ScriptProgram {
    core: ProgramCore,
    timeout: Option<Duration>,
    stdout: String,
    stderr: String,
}

impl ScriptProgram {
    pub fn new(script: &str) -> Self {
        Self::from_command(CommandLine::new("sh", Vec::<String>::new()).with_script(script))
    }

    pub fn from_command(command: CommandLine) -> Self {
        Self {
            core: ProgramCore::new(command),
            timeout: None,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }
}

impl Program for ScriptProgram {
    fn core(&self) -> &ProgramCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProgramCore {
        &mut self.core
    }

    fn check_exit_code(&mut self, exit_code: i32, stderr: &str) -> Result<()> {
        match exit_code {
            0 => Ok(()),
            code => Err(classify_failure(&self.command().preview(), code, stderr)),
        }
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl SyncProgram for ScriptProgram {
    type Output = String;

    fn parse(&mut self, stdout: &str, stderr: &str) -> std::result::Result<(), ParseError> {
        self.stdout = stdout.to_string();
        self.stderr = stderr.to_string();
        Ok(())
    }

    fn result(&self) -> &Self::Output {
        &self.stdout
    }
}

/// Asynchronous script runner that records every callback it receives.
#[derive(Debug, Clone)]
pub struct RecordingProgram {
    core: ProgramCore,
    buffer: PartialLineBuffer,
    end_signal: Option<Signal>,
    stop_after: Option<usize>,
    pub lines: Vec<String>,
    pub stderr: String,
    pub starts: usize,
    pub exit_codes: Vec<i32>,
    pub failures: Vec<String>,
    pub ends: Vec<bool>,
}

impl RecordingProgram {
    pub fn new(script: &str) -> Self {
        Self {
            core: ProgramCore::new(
                CommandLine::new("sh", Vec::<String>::new()).with_script(script),
            ),
            buffer: PartialLineBuffer::default(),
            end_signal: None,
            stop_after: None,
            lines: Vec::new(),
            stderr: String::new(),
            starts: 0,
            exit_codes: Vec::new(),
            failures: Vec::new(),
            ends: Vec::new(),
        }
    }

    pub fn with_end_signal(mut self, signal: Signal) -> Self {
        self.end_signal = Some(signal);
        self
    }

    /// Asks the console to end the command once `lines` lines were seen.
    pub fn stop_after(mut self, lines: usize) -> Self {
        self.stop_after = Some(lines);
        self
    }
}

impl Program for RecordingProgram {
    fn core(&self) -> &ProgramCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProgramCore {
        &mut self.core
    }

    fn check_exit_code(&mut self, exit_code: i32, stderr: &str) -> Result<()> {
        match exit_code {
            0 => Ok(()),
            code => Err(classify_failure(&self.command().preview(), code, stderr)),
        }
    }
}

impl AsyncProgram for RecordingProgram {
    fn on_start_parse_partial_result(&mut self) {
        self.starts += 1;
    }

    fn on_parse_partial_result(&mut self, partial: &str) {
        let lines = self.buffer.push(partial);
        self.lines.extend(lines);
    }

    fn on_parse_error_partial_result(&mut self, partial: &str) {
        self.stderr.push_str(partial);
    }

    fn on_end_parse_partial_result(&mut self, canceled: bool) {
        if let Some(line) = self.buffer.finish() {
            self.lines.push(line);
        }
        self.ends.push(canceled);
    }

    fn on_exit_code(&mut self, exit_code: i32) {
        self.exit_codes.push(exit_code);
    }

    fn on_exception(&mut self, cause: &FmshErr) {
        self.failures.push(cause.to_string());
    }

    fn on_request_end(&mut self) -> Option<Signal> {
        self.end_signal
    }

    fn wants_end(&self) -> bool {
        self.stop_after
            .is_some_and(|limit| self.lines.len() >= limit)
    }
}

/// Prompt with a fixed answer that counts how often it was asked.
#[derive(Debug, Default)]
pub struct CountingPrompt {
    answer: bool,
    asked: AtomicUsize,
}

impl CountingPrompt {
    pub fn answering(answer: bool) -> Self {
        Self {
            answer,
            asked: AtomicUsize::new(0),
        }
    }

    pub fn times_asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EscalationPrompt for CountingPrompt {
    async fn confirm_escalation(&self, _command: &CommandLine, _cause: &FmshErr) -> bool {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.answer
    }
}

/// Every event published so far, without waiting.
pub fn drain_events(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

//! Command framing.
//!
//! Every execution is sent to the shell as a single line that prints a start
//! sentinel on both streams, runs the command in a child `sh -c` (which
//! reports its pid on stderr before anything else) and finally prints
//! `<end>\n<exit status>\n` on stdout and `<end>\n` on stderr. The end
//! sentinel may follow output that has no trailing newline, so it is
//! matched anywhere on a line. Sentinels carry a per-execution token, so
//! output left behind by an abandoned execution never matches.
//!
//! The job runs in the foreground: a shell without job control starts
//! asynchronous lists with SIGINT and SIGQUIT ignored, which would make the
//! job deaf to interruption.

use uuid::Uuid;

use crate::error::Result;
use crate::program::quote;

const SENTINEL_PREFIX: &str = "@@fmsh";

#[derive(Debug, Clone)]
pub(crate) struct Sentinels {
    start: String,
    end: String,
    pid_prefix: String,
}

impl Sentinels {
    pub(crate) fn new() -> Self {
        let token = Uuid::new_v4().simple().to_string();
        Self {
            start: format!("{SENTINEL_PREFIX}:start:{token}@@"),
            end: format!("{SENTINEL_PREFIX}:end:{token}@@"),
            pid_prefix: format!("{SENTINEL_PREFIX}:pid:{token}:"),
        }
    }

    /// The line written to the shell's stdin for `script`.
    pub(crate) fn wrap(&self, script: &str) -> Result<String> {
        let Self {
            start,
            end,
            pid_prefix,
        } = self;
        let job = quote(&format!("echo \"{pid_prefix}$$@@\" >&2; eval \"$1\""))?;
        let script = quote(script)?;
        Ok(format!(
            "printf '%s\\n' '{start}'; printf '%s\\n' '{start}' >&2; \
             sh -c {job} fmsh {script} </dev/null; fmsh_rc=$?; \
             printf '%s\\n%s\\n' '{end}' \"$fmsh_rc\"; printf '%s\\n' '{end}' >&2\n"
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FrameEvent {
    /// Output of the command itself.
    Data(String),
    /// Pid of the `sh -c` job running the command.
    Pid(i32),
    ExitCode(i32),
    /// The frame did not have the expected shape; the console cannot be
    /// trusted to be in sync anymore.
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    AwaitingStart,
    AwaitingPid,
    Streaming,
    AwaitingExitCode,
    Done,
}

/// Incremental scanner for one stream of one execution.
#[derive(Debug)]
pub(crate) struct FrameScanner {
    state: FrameState,
    buf: Vec<u8>,
    start_needle: Vec<u8>,
    end_needle: Vec<u8>,
    pid_prefix: Vec<u8>,
    reports_pid: bool,
    reports_exit_code: bool,
}

impl FrameScanner {
    pub(crate) fn stdout(sentinels: &Sentinels) -> Self {
        Self::new(sentinels, false, true)
    }

    pub(crate) fn stderr(sentinels: &Sentinels) -> Self {
        Self::new(sentinels, true, false)
    }

    fn new(sentinels: &Sentinels, reports_pid: bool, reports_exit_code: bool) -> Self {
        Self {
            state: FrameState::AwaitingStart,
            buf: Vec::new(),
            start_needle: format!("{}\n", sentinels.start).into_bytes(),
            end_needle: format!("{}\n", sentinels.end).into_bytes(),
            pid_prefix: sentinels.pid_prefix.clone().into_bytes(),
            reports_pid,
            reports_exit_code,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state == FrameState::Done
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        if self.state == FrameState::Done {
            return events;
        }
        self.buf.extend_from_slice(bytes);
        while self.step(&mut events) {}
        events
    }

    /// Advances the state machine once; returns whether progress was made.
    fn step(&mut self, events: &mut Vec<FrameEvent>) -> bool {
        match self.state {
            FrameState::AwaitingStart => match find(&self.buf, &self.start_needle) {
                Some(pos) => {
                    self.buf.drain(..pos + self.start_needle.len());
                    self.state = if self.reports_pid {
                        FrameState::AwaitingPid
                    } else {
                        FrameState::Streaming
                    };
                    true
                }
                None => {
                    let keep = self.start_needle.len() - 1;
                    if self.buf.len() > keep {
                        self.buf.drain(..self.buf.len() - keep);
                    }
                    false
                }
            },
            FrameState::AwaitingPid => {
                let Some(newline) = self.buf.iter().position(|byte| *byte == b'\n') else {
                    return false;
                };
                let line = &self.buf[..newline];
                if let Some(pid) = line
                    .strip_prefix(self.pid_prefix.as_slice())
                    .and_then(|rest| rest.strip_suffix(b"@@"))
                    .and_then(|digits| std::str::from_utf8(digits).ok())
                    .and_then(|digits| digits.parse::<i32>().ok())
                {
                    events.push(FrameEvent::Pid(pid));
                    self.buf.drain(..=newline);
                }
                self.state = FrameState::Streaming;
                true
            }
            FrameState::Streaming => match find(&self.buf, &self.end_needle) {
                Some(pos) => {
                    if pos > 0 {
                        events.push(FrameEvent::Data(
                            String::from_utf8_lossy(&self.buf[..pos]).into_owned(),
                        ));
                    }
                    self.buf.drain(..pos + self.end_needle.len());
                    self.state = if self.reports_exit_code {
                        FrameState::AwaitingExitCode
                    } else {
                        FrameState::Done
                    };
                    true
                }
                None => {
                    let safe = self.buf.len() - partial_match_len(&self.buf, &self.end_needle);
                    let safe = safe - incomplete_utf8_tail(&self.buf[..safe]);
                    if safe > 0 {
                        events.push(FrameEvent::Data(
                            String::from_utf8_lossy(&self.buf[..safe]).into_owned(),
                        ));
                        self.buf.drain(..safe);
                    }
                    false
                }
            },
            FrameState::AwaitingExitCode => {
                let Some(newline) = self.buf.iter().position(|byte| *byte == b'\n') else {
                    return false;
                };
                let raw = String::from_utf8_lossy(&self.buf[..newline]).trim().to_string();
                match raw.parse::<i32>() {
                    Ok(code) => events.push(FrameEvent::ExitCode(code)),
                    Err(_) => events.push(FrameEvent::Malformed(format!(
                        "expected an exit status, found `{raw}`"
                    ))),
                }
                self.buf.clear();
                self.state = FrameState::Done;
                false
            }
            FrameState::Done => false,
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Length of the longest suffix of `haystack` that is a proper prefix of
/// `needle`. Only those bytes may still turn out to be a sentinel.
fn partial_match_len(haystack: &[u8], needle: &[u8]) -> usize {
    let longest = haystack.len().min(needle.len().saturating_sub(1));
    (1..=longest)
        .rev()
        .find(|len| haystack.ends_with(&needle[..*len]))
        .unwrap_or(0)
}

/// Number of trailing bytes forming the start of a multi-byte character
/// that is not complete yet.
fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match byte {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

//! Delivery of signals to the job running a command.
//!
//! Shells started without a terminal keep every job in their own process
//! group, so the job's process group is tried first and its process tree is
//! signalled when no such group exists.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use tracing::warn;

use super::ShellLauncher;
use crate::program::Signal;

const ONE_SHOT_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Signals `pid` and everything it spawned. Processes owned by another
/// user (the job of a privileged console) are signalled through a one-shot
/// shell started with `launcher`.
pub(crate) async fn signal_job(pid: i32, signal: Signal, launcher: &ShellLauncher) {
    let targets = match signal_locally(pid, signal) {
        Ok(()) => return,
        Err(targets) => targets,
    };
    if let Err(err) = signal_through_launcher(&targets, signal, launcher).await {
        warn!(pid, signal = signal.name(), "failed to signal job: {err}");
    }
}

/// Returns the pids that could not be signalled for lack of permission.
fn signal_locally(pid: i32, signal: Signal) -> Result<(), Vec<i32>> {
    // SAFETY: kill(2) has no memory safety requirements.
    if unsafe { libc::kill(-pid, signal.number()) } == 0 {
        debug!(pid, signal = signal.name(), "signalled process group");
        return Ok(());
    }
    let mut targets = descendants(pid);
    targets.push(pid);
    let mut denied = Vec::new();
    for target in targets {
        // SAFETY: as above.
        if unsafe { libc::kill(target, signal.number()) } == 0 {
            continue;
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => {}
            Some(libc::EPERM) => denied.push(target),
            _ => debug!(target, "kill failed: {err}"),
        }
    }
    debug!(pid, signal = signal.name(), denied = denied.len(), "signalled process tree");
    if denied.is_empty() {
        Ok(())
    } else {
        Err(denied)
    }
}

async fn signal_through_launcher(
    targets: &[i32],
    signal: Signal,
    launcher: &ShellLauncher,
) -> io::Result<()> {
    let pids = targets
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    let mut child = Command::new(&launcher.program)
        .args(&launcher.args)
        .envs(&launcher.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        let script = format!("kill -s {} {pids} 2>/dev/null; exit 0\n", signal.name());
        stdin.write_all(script.as_bytes()).await?;
        stdin.shutdown().await?;
    }
    match tokio::time::timeout(ONE_SHOT_KILL_TIMEOUT, child.wait()).await {
        Ok(status) => {
            debug!(?status, %pids, "one-shot kill finished");
            Ok(())
        }
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "one-shot kill did not finish",
        )),
    }
}

/// Transitive children of `root`, deepest first.
#[cfg(target_os = "linux")]
pub(crate) fn descendants(root: i32) -> Vec<i32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let table: Vec<(i32, i32)> = entries
        .flatten()
        .filter_map(|entry| {
            let pid = entry.file_name().to_str()?.parse::<i32>().ok()?;
            let stat = std::fs::read_to_string(entry.path().join("stat")).ok()?;
            Some((pid, parent_pid(&stat)?))
        })
        .collect();

    let mut found = Vec::new();
    let mut frontier = vec![root];
    while let Some(parent) = frontier.pop() {
        for &(pid, ppid) in &table {
            if ppid == parent && !found.contains(&pid) {
                found.push(pid);
                frontier.push(pid);
            }
        }
    }
    found.reverse();
    found
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn descendants(_root: i32) -> Vec<i32> {
    Vec::new()
}

/// Field 4 of `/proc/<pid>/stat`. The command name may contain spaces and
/// parentheses, so parsing starts after the last `)`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parent_pid(stat: &str) -> Option<i32> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(1)?.parse().ok()
}

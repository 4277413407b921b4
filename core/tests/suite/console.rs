use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use assert_matches::assert_matches;
use core_test_support::FixtureTree;
use core_test_support::RecordingProgram;
use core_test_support::ScriptProgram;
use core_test_support::test_config;
use fmsh_core::Console;
use fmsh_core::ConsoleFactory;
use fmsh_core::FmshErr;
use fmsh_core::ShellLauncher;
use fmsh_core::console::ConsoleSettings;
use fmsh_core::program::CommandLine;
use fmsh_core::program::FsOpProgram;
use fmsh_core::program::Program;
use fmsh_core::program::ProgramState;
use fmsh_core::program::Signal;
use fmsh_core::program::SyncProgram;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

async fn console() -> Console {
    ConsoleFactory::new(&test_config())
        .create_non_privileged_console("/")
        .await
        .expect("console")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn output_is_returned_byte_for_byte() -> anyhow::Result<()> {
    let console = console().await;

    let mut program = ScriptProgram::new("printf 'a\\n\\nb'");
    console.execute(&mut program).await?;
    assert_eq!(program.result(), "a\n\nb");
    assert_eq!(program.state(), ProgramState::Completed);

    let mut program = ScriptProgram::new("echo out; echo err >&2");
    console.execute(&mut program).await?;
    assert_eq!(program.result(), "out\n");
    assert_eq!(program.stderr(), "err\n");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shell_starts_in_the_root_directory() -> anyhow::Result<()> {
    let fixture = FixtureTree::create()?;
    let console = ConsoleFactory::new(&test_config())
        .create_non_privileged_console(&fixture.root())
        .await?;

    let mut program = ScriptProgram::new("pwd");
    console.execute(&mut program).await?;
    assert_eq!(program.result().trim_end(), fixture.root());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_command_is_classified_and_console_survives() -> anyhow::Result<()> {
    let fixture = FixtureTree::create()?;
    let console = console().await;

    let mut remove = FsOpProgram::delete_file(&fixture.join("nope"))?;
    let err = console.execute(&mut remove).await.expect_err("missing file");
    assert_matches!(err, FmshErr::NoSuchFileOrDirectory { .. });
    assert!(!*remove.result());
    assert_eq!(remove.state(), ProgramState::Failed);

    assert!(console.is_active());
    let mut program = ScriptProgram::new("echo still here");
    console.execute(&mut program).await?;
    assert_eq!(program.result(), "still here\n");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exit_code_127_is_command_not_found() {
    let console = console().await;

    let mut program = ScriptProgram::from_command(CommandLine::new("fmsh-no-such-binary", ["x"]));
    let err = console.execute(&mut program).await.expect_err("127");
    assert_matches!(err, FmshErr::CommandNotFound { command } if command == "fmsh-no-such-binary");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeout_interrupts_the_command_and_keeps_the_console() -> anyhow::Result<()> {
    let console = console().await;
    let started = Instant::now();

    let mut program = ScriptProgram::new("sleep 30").with_timeout(Duration::from_millis(300));
    let err = console.execute(&mut program).await.expect_err("timeout");
    assert_matches!(err, FmshErr::OperationTimeout { .. });
    assert!(started.elapsed() < Duration::from_secs(10));

    assert!(console.is_active(), "the interrupted command resynchronised");
    let mut program = ScriptProgram::new("echo ok");
    console.execute(&mut program).await?;
    assert_eq!(program.result(), "ok\n");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_launcher_fails_allocation() {
    let err = Console::spawn(
        ShellLauncher::new("/nonexistent/fmsh-sh"),
        false,
        ConsoleSettings::default(),
    )
    .await
    .expect_err("no shell");
    assert_matches!(err, FmshErr::ConsoleAlloc { .. });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disposed_console_rejects_work() {
    let console = console().await;
    console.dispose().await;
    console.dispose().await;
    assert!(!console.is_active());

    let mut program = ScriptProgram::new("true");
    let err = console.execute(&mut program).await.expect_err("disposed");
    assert_matches!(err, FmshErr::ConsoleInactive);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shell_death_marks_console_inactive() {
    let console = console().await;

    let mut program = ScriptProgram::new("kill -9 $PPID");
    let err = console.execute(&mut program).await.expect_err("shell killed");
    assert_matches!(err, FmshErr::ConsoleInactive);
    assert!(!console.is_active());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_executions_are_serialised() -> anyhow::Result<()> {
    let console = Arc::new(console().await);
    console.reload_trace(true);

    let tasks = (0..4).map(|index| {
        let console = Arc::clone(&console);
        tokio::spawn(async move {
            let mut program = ScriptProgram::new(&format!("echo start {index}; sleep 0.1; echo end {index}"));
            console.execute(&mut program).await.map(|()| program.result().clone())
        })
    });
    for (index, task) in tasks.collect::<Vec<_>>().into_iter().enumerate() {
        let output = task.await??;
        assert_eq!(output, format!("start {index}\nend {index}\n"));
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_program_sees_every_line_and_one_end() -> anyhow::Result<()> {
    let console = console().await;

    let mut program = RecordingProgram::new("printf 'one\\ntwo\\n'; sleep 0.1; printf three");
    console
        .execute_async(&mut program, &CancellationToken::new())
        .await?;
    assert_eq!(program.starts, 1);
    assert_eq!(program.lines, vec!["one", "two", "three"]);
    assert_eq!(program.exit_codes, vec![0]);
    assert_eq!(program.ends, vec![false]);
    assert!(program.failures.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_failure_reports_exception_before_end() {
    let console = console().await;

    let mut program = RecordingProgram::new("echo 'x: Permission denied' >&2; exit 1");
    let err = console
        .execute_async(&mut program, &CancellationToken::new())
        .await
        .expect_err("denied");
    assert_matches!(err, FmshErr::InsufficientPermissions { .. });
    assert_eq!(program.exit_codes, vec![1]);
    assert_eq!(program.failures.len(), 1);
    assert_eq!(program.ends, vec![false]);
    assert_eq!(program.stderr, "x: Permission denied\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_execution_ends_once_as_canceled() -> anyhow::Result<()> {
    let console = Arc::new(console().await);
    let started = Instant::now();

    let execution = console.spawn_async(RecordingProgram::new("echo ready; sleep 30"));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!execution.is_finished());
    execution.cancel();
    let (program, result) = execution.wait().await?;

    result?;
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(program.lines, vec!["ready"]);
    assert_eq!(program.ends, vec![true]);
    assert_eq!(program.state(), ProgramState::Cancelled);
    assert!(program.failures.is_empty());
    assert!(console.is_active());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_before_the_job_reports_its_pid() -> anyhow::Result<()> {
    let console = console().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut program = RecordingProgram::new("sleep 30").with_end_signal(Signal::Terminate);
    let started = Instant::now();
    console.execute_async(&mut program, &cancel).await?;
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(program.ends, vec![true]);
    assert_eq!(program.exit_codes, vec![Signal::Terminate.exit_code()]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn program_can_end_its_own_command() -> anyhow::Result<()> {
    let console = console().await;

    let mut program =
        RecordingProgram::new("i=0; while :; do i=$((i+1)); echo line$i; sleep 0.05; done")
            .stop_after(3);
    console
        .execute_async(&mut program, &CancellationToken::new())
        .await?;
    assert!(program.lines.len() >= 3);
    assert_eq!(&program.lines[..3], ["line1", "line2", "line3"]);
    assert_eq!(program.ends, vec![false]);
    assert!(program.failures.is_empty());
    assert!(console.is_active());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn short_line_reaches_the_program_while_the_command_runs() -> anyhow::Result<()> {
    let console = console().await;

    let mut program = RecordingProgram::new("echo hello; sleep 4").stop_after(1);
    let started = Instant::now();
    console
        .execute_async(&mut program, &CancellationToken::new())
        .await?;

    assert!(
        started.elapsed() < Duration::from_secs(3),
        "ended after {:?}",
        started.elapsed()
    );
    assert_eq!(program.lines, vec!["hello"]);
    assert_eq!(program.ends, vec![false]);
    assert!(console.is_active());
    Ok(())
}

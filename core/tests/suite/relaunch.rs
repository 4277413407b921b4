use std::fs;
use std::sync::Arc;

use assert_matches::assert_matches;
use core_test_support::CountingPrompt;
use core_test_support::FixtureTree;
use core_test_support::RecordingProgram;
use core_test_support::ScriptProgram;
use core_test_support::config_with_unverifiable_privileges;
use core_test_support::drain_events;
use core_test_support::role_guarded;
use core_test_support::test_config;
use fmsh_core::AlwaysEscalate;
use fmsh_core::EngineConfig;
use fmsh_core::EngineContext;
use fmsh_core::EngineEvent;
use fmsh_core::FmshErr;
use fmsh_core::RelaunchPolicy;
use fmsh_core::program::SyncProgram;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

/// Appends to `marker` only when allowed, so the file shows how many
/// attempts got past the permission check.
fn guarded_append(marker: &str) -> ScriptProgram {
    ScriptProgram::new(&role_guarded(&format!(
        "echo attempt >> '{marker}'; echo done"
    )))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn permission_failure_is_replayed_once_on_a_privileged_console() -> anyhow::Result<()> {
    let fixture = FixtureTree::create()?;
    let marker = fixture.join("marker");
    let engine = EngineContext::with_config(test_config());
    let mut events = engine.subscribe();
    let prompt = Arc::new(CountingPrompt::answering(true));

    let program = RelaunchPolicy::new(&engine, prompt.clone())
        .execute(guarded_append(&marker))
        .await?;

    assert_eq!(program.result(), "done\n");
    assert_eq!(fs::read_to_string(&marker)?, "attempt\n");
    assert_eq!(prompt.times_asked(), 1);
    let current = engine.current_console().await.expect("current console");
    assert!(current.is_privileged());

    let events = drain_events(&mut events);
    assert_eq!(events.len(), 4);
    assert_eq!(events[0], EngineEvent::ConsoleAllocated { privileged: false });
    assert_matches!(&events[1], EngineEvent::RelaunchRequested { .. });
    assert_eq!(events[2], EngineEvent::ConsoleAllocated { privileged: true });
    assert_matches!(&events[3], EngineEvent::Relaunched { .. });

    engine.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn declined_prompt_returns_the_original_error() -> anyhow::Result<()> {
    let fixture = FixtureTree::create()?;
    let marker = fixture.join("marker");
    let engine = EngineContext::with_config(test_config());
    let prompt = Arc::new(CountingPrompt::answering(false));

    let err = RelaunchPolicy::new(&engine, prompt.clone())
        .execute(guarded_append(&marker))
        .await
        .expect_err("declined");

    assert_matches!(err, FmshErr::InsufficientPermissions { .. });
    assert_eq!(prompt.times_asked(), 1);
    assert!(!fixture.path().join("marker").exists());
    let current = engine.current_console().await.expect("current console");
    assert!(!current.is_privileged());

    engine.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unavailable_privileges_surface_as_relaunch_failed() -> anyhow::Result<()> {
    let fixture = FixtureTree::create()?;
    let marker = fixture.join("marker");
    let engine = EngineContext::with_config(config_with_unverifiable_privileges());

    let err = RelaunchPolicy::new(&engine, Arc::new(AlwaysEscalate))
        .execute(guarded_append(&marker))
        .await
        .expect_err("no privileged shell");

    assert_matches!(err, FmshErr::RelaunchFailed { source } if matches!(*source, FmshErr::ConsoleAlloc { .. }));
    assert!(!fixture.path().join("marker").exists());

    engine.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failures_on_a_privileged_console_are_not_replayed() -> anyhow::Result<()> {
    let engine = EngineContext::with_config(EngineConfig {
        superuser_mode: true,
        ..test_config()
    });
    let prompt = Arc::new(CountingPrompt::answering(true));

    let err = RelaunchPolicy::new(&engine, prompt.clone())
        .execute(ScriptProgram::new("echo 'x: Permission denied' >&2; exit 1"))
        .await
        .expect_err("denied even for root");

    assert_matches!(err, FmshErr::InsufficientPermissions { .. });
    assert_eq!(prompt.times_asked(), 0);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn other_failures_are_not_replayed() -> anyhow::Result<()> {
    let engine = EngineContext::with_config(test_config());
    let prompt = Arc::new(CountingPrompt::answering(true));

    let err = RelaunchPolicy::new(&engine, prompt.clone())
        .execute(ScriptProgram::new("echo 'x: No such file or directory' >&2; exit 1"))
        .await
        .expect_err("missing");

    assert_matches!(err, FmshErr::NoSuchFileOrDirectory { .. });
    assert_eq!(prompt.times_asked(), 0);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_replay_starts_from_a_pristine_program() -> anyhow::Result<()> {
    let engine = EngineContext::with_config(test_config());

    let program = RelaunchPolicy::new(&engine, Arc::new(AlwaysEscalate))
        .execute_async(
            RecordingProgram::new(&role_guarded("echo privileged output")),
            &CancellationToken::new(),
        )
        .await?;

    assert_eq!(program.starts, 1);
    assert_eq!(program.lines, vec!["privileged output"]);
    assert_eq!(program.exit_codes, vec![0]);
    assert_eq!(program.ends, vec![false]);
    assert!(program.failures.is_empty());

    engine.shutdown().await;
    Ok(())
}

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use std::time::Instant;

use assert_matches::assert_matches;
use core_test_support::FixtureTree;
use core_test_support::current_uid;
use core_test_support::test_config;
use fmsh_core::Console;
use fmsh_core::ConsoleFactory;
use fmsh_core::FmshErr;
use fmsh_core::model::FileSystemObject;
use fmsh_core::program::AsyncEvent;
use fmsh_core::program::CompressProgram;
use fmsh_core::program::CompressionMode;
use fmsh_core::program::FindProgram;
use fmsh_core::program::FsOpProgram;
use fmsh_core::program::IdentityProgram;
use fmsh_core::program::SyncProgram;
use fmsh_core::program::channel_listener;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

async fn console() -> Console {
    ConsoleFactory::new(&test_config())
        .create_non_privileged_console("/")
        .await
        .expect("console")
}

fn collect<T>(rx: &mut UnboundedReceiver<AsyncEvent<T>>) -> Vec<AsyncEvent<T>> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn archive_reports_each_entry() -> anyhow::Result<()> {
    let fixture = FixtureTree::create()?;
    let console = console().await;
    let (listener, mut rx) = channel_listener::<String>();

    let destination = fixture.join("out.tar.gz");
    let mut program = CompressProgram::archive(
        CompressionMode::ArchiveGzip,
        &destination,
        &[fixture.join("a.txt"), fixture.join("sub")],
        Some(listener),
    )?;
    console
        .execute_async(&mut program, &CancellationToken::new())
        .await?;

    assert!(program.result());
    assert_eq!(program.out_compressed_file(), destination);
    assert!(Path::new(&destination).is_file());

    let events = collect(&mut rx);
    assert_eq!(events.first(), Some(&AsyncEvent::Started));
    assert_eq!(events.last(), Some(&AsyncEvent::Ended { canceled: false }));
    assert!(events.contains(&AsyncEvent::ExitCode(0)));
    let mut entries: Vec<&str> = events
        .iter()
        .filter_map(|event| match event {
            AsyncEvent::Partial(line) => Some(line.as_str()),
            _ => None,
        })
        .collect();
    entries.sort_unstable();
    assert_eq!(entries, vec!["a.txt", "sub/", "sub/inner.log"]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_file_compression_replaces_the_source() -> anyhow::Result<()> {
    let fixture = FixtureTree::create()?;
    let console = console().await;

    let mut program = CompressProgram::single(CompressionMode::CompressGzip, &fixture.join("a.txt"), None)?;
    console
        .execute_async(&mut program, &CancellationToken::new())
        .await?;

    assert!(program.result());
    assert_eq!(program.out_compressed_file(), fixture.join("a.txt.gz"));
    assert!(fixture.path().join("a.txt.gz").is_file());
    assert!(!fixture.path().join("a.txt").exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn archiving_a_missing_source_fails_once() -> anyhow::Result<()> {
    let fixture = FixtureTree::create()?;
    let console = console().await;
    let (listener, mut rx) = channel_listener::<String>();

    let mut program = CompressProgram::archive(
        CompressionMode::ArchiveGzip2,
        &fixture.join("out.tgz"),
        &[fixture.join("missing")],
        Some(listener),
    )?;
    let err = console
        .execute_async(&mut program, &CancellationToken::new())
        .await
        .expect_err("missing source");
    assert_matches!(
        err,
        FmshErr::Execution { exit_code: 2, ref detail, .. } if detail.contains("No such file or directory")
    );
    assert!(!program.result());

    let events = collect(&mut rx);
    let ends = events
        .iter()
        .filter(|event| matches!(event, AsyncEvent::Ended { .. }))
        .count();
    assert_eq!(ends, 1);
    assert!(events.iter().any(|event| matches!(event, AsyncEvent::Failed(_))));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn find_streams_matches() -> anyhow::Result<()> {
    let fixture = FixtureTree::create()?;
    let console = console().await;
    let (listener, mut rx) = channel_listener::<Vec<FileSystemObject>>();

    let mut program = FindProgram::new(&fixture.root(), "A", 0, Some(listener))?;
    console
        .execute_async(&mut program, &CancellationToken::new())
        .await?;

    let mut names: Vec<&str> = program.results().iter().map(FileSystemObject::name).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["a.txt", "dangling"]);
    let dangling = program
        .results()
        .iter()
        .find(|fso| fso.name() == "dangling")
        .expect("dangling");
    assert_eq!(dangling.parent(), fixture.root());

    let streamed: usize = collect(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            AsyncEvent::Partial(batch) => Some(batch.len()),
            _ => None,
        })
        .sum();
    assert_eq!(streamed, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn find_stops_at_its_cap() -> anyhow::Result<()> {
    let fixture = FixtureTree::create()?;
    let console = console().await;

    let mut program = FindProgram::new(&fixture.root(), "a", 1, None)?;
    console
        .execute_async(&mut program, &CancellationToken::new())
        .await?;
    assert_eq!(program.results().len(), 1);
    assert!(console.is_active());
    Ok(())
}

/// Console whose `stat` prints its result and then stalls, so every
/// further match of a search takes seconds.
async fn console_with_slow_stat(bin: &Path) -> anyhow::Result<Console> {
    let wrapper = bin.join("stat");
    fs::write(&wrapper, "#!/bin/sh\nPATH=/usr/bin:/bin stat \"$@\"\nsleep 2\n")?;
    fs::set_permissions(&wrapper, fs::Permissions::from_mode(0o755))?;

    let mut config = test_config();
    config.shell.env.insert(
        "PATH".to_string(),
        format!("{}:/usr/bin:/bin", bin.display()),
    );
    Ok(ConsoleFactory::new(&config)
        .create_non_privileged_console("/")
        .await?)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn capped_find_ends_without_finishing_the_scan() -> anyhow::Result<()> {
    let bin = tempfile::tempdir()?;
    let tree = tempfile::tempdir()?;
    for name in ["m1", "m2", "m3"] {
        fs::write(tree.path().join(name), "")?;
    }
    let console = console_with_slow_stat(bin.path()).await?;
    let root = tree.path().to_string_lossy().into_owned();

    let mut program = FindProgram::new(&root, "M", 1, None)?;
    let started = Instant::now();
    console
        .execute_async(&mut program, &CancellationToken::new())
        .await?;

    assert!(
        started.elapsed() < Duration::from_secs(4),
        "search ran for {:?}",
        started.elapsed()
    );
    assert_eq!(program.results().len(), 1);
    assert!(console.is_active());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_operations_change_the_tree() -> anyhow::Result<()> {
    let fixture = FixtureTree::create()?;
    let console = console().await;
    let dir = fixture.join("made");
    let file = fixture.join("made/new file");

    let mut program = FsOpProgram::create_directory(&dir)?;
    console.execute(&mut program).await?;
    assert!(*program.result());
    assert!(Path::new(&dir).is_dir());

    let mut program = FsOpProgram::create_file(&file)?;
    console.execute(&mut program).await?;
    assert!(Path::new(&file).is_file());

    let mut program = FsOpProgram::delete_file(&file)?;
    console.execute(&mut program).await?;
    assert!(!Path::new(&file).exists());

    let mut program = FsOpProgram::create_file(&file)?;
    console.execute(&mut program).await?;
    let mut program = FsOpProgram::delete_directory(&dir)?;
    console.execute(&mut program).await?;
    assert!(!Path::new(&dir).exists());

    let mut program = FsOpProgram::create_directory(&fixture.join("sub"))?;
    let err = console.execute(&mut program).await.expect_err("exists");
    assert_matches!(err, FmshErr::Execution { .. });
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn identity_reports_the_shell_user() -> anyhow::Result<()> {
    let console = console().await;

    let mut program = IdentityProgram::new();
    console.execute(&mut program).await?;
    let identity = program.result().as_ref().expect("identity");
    assert_eq!(identity.uid, current_uid());
    Ok(())
}

//! Command-line front end of the engine. Every subcommand runs one program
//! through the relaunch policy and prints its result as JSON.

mod prompt;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use fmsh_core::AlwaysEscalate;
use fmsh_core::EngineConfig;
use fmsh_core::EngineContext;
use fmsh_core::EscalationPrompt;
use fmsh_core::NeverEscalate;
use fmsh_core::RelaunchPolicy;
use fmsh_core::listing::ListingPreferences;
use fmsh_core::listing::SortMode;
use fmsh_core::listing::apply_user_preferences;
use fmsh_core::model::FileSystemObject;
use fmsh_core::paths;
use fmsh_core::program::AsyncResultListener;
use fmsh_core::program::CompressProgram;
use fmsh_core::program::CompressionMode;
use fmsh_core::program::FindProgram;
use fmsh_core::program::FsOp;
use fmsh_core::program::FsOpProgram;
use fmsh_core::program::IdentityProgram;
use fmsh_core::program::ListProgram;
use fmsh_core::program::SharedListener;
use fmsh_core::program::SyncProgram;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use prompt::InquirePrompt;

#[derive(Debug, Parser)]
#[command(name = "fmsh", version, about = "File manager shell engine")]
pub struct Cli {
    /// Engine configuration (TOML). Defaults apply when omitted.
    #[arg(long = "config", value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Start on a privileged console.
    #[arg(long = "superuser", default_value_t = false, global = true)]
    superuser: bool,

    /// Retry permission failures on a privileged console without asking.
    #[arg(long = "yes", default_value_t = false, global = true, conflicts_with = "no_escalate")]
    yes: bool,

    /// Never retry permission failures.
    #[arg(long = "no-escalate", default_value_t = false, global = true)]
    no_escalate: bool,

    /// Log every command and its output.
    #[arg(long = "trace", default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List a directory.
    Ls {
        path: String,
        /// Hide dot files.
        #[arg(long = "no-hidden", default_value_t = false)]
        no_hidden: bool,
        /// name-asc, name-desc, date-asc, date-desc, size-asc or size-desc.
        #[arg(long = "sort", value_parser = parse_sort_mode)]
        sort: Option<SortMode>,
    },
    /// Show a single entry.
    Info { path: String },
    /// Search below a directory by name, case-insensitively.
    Find {
        directory: String,
        term: String,
        /// Stop after this many matches (0 for no limit).
        #[arg(long = "max", default_value_t = 0)]
        max: usize,
    },
    /// Archive several sources or compress one file.
    Compress {
        /// One of archive-tar, archive-gzip, archive-gzip2, archive-bzip,
        /// compress-gzip or compress-bzip.
        #[arg(long = "mode", value_parser = parse_compression_mode)]
        mode: CompressionMode,
        /// Archive to create. Defaults to the first source's name, without
        /// its extension, next to that source.
        #[arg(long = "out", value_name = "PATH")]
        out: Option<String>,
        #[arg(required = true)]
        sources: Vec<String>,
    },
    /// Delete a file, or a directory with `-r`.
    Rm {
        path: String,
        #[arg(short = 'r', default_value_t = false)]
        recursive: bool,
    },
    Mkdir { path: String },
    Touch { path: String },
    /// Report who the shell runs as.
    Whoami,
}

fn parse_sort_mode(raw: &str) -> std::result::Result<SortMode, String> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| format!("unknown sort mode `{raw}`"))
}

fn parse_compression_mode(raw: &str) -> std::result::Result<CompressionMode, String> {
    CompressionMode::from_name(raw).ok_or_else(|| format!("unknown compression mode `{raw}`"))
}

/// Prints every search match as soon as it is parsed, one JSON document
/// per line.
struct JsonLinesListener;

impl AsyncResultListener<Vec<FileSystemObject>> for JsonLinesListener {
    fn on_partial_result(&self, partial: Vec<FileSystemObject>) {
        for fso in partial {
            match serde_json::to_string(&fso) {
                Ok(line) => println!("{line}"),
                Err(err) => debug!("failed to serialize match: {err}"),
            }
        }
    }
}

/// Echoes archiver progress on stderr so stdout stays JSON.
struct ProgressListener;

impl AsyncResultListener<String> for ProgressListener {
    fn on_partial_result(&self, partial: String) {
        eprintln!("{partial}");
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    config.superuser_mode |= cli.superuser;
    config.trace |= cli.trace;

    let prompt: Arc<dyn EscalationPrompt> = if cli.yes {
        Arc::new(AlwaysEscalate)
    } else if cli.no_escalate {
        Arc::new(NeverEscalate)
    } else {
        Arc::new(InquirePrompt)
    };
    let engine = EngineContext::with_config(config);
    let outcome = dispatch(&engine, prompt, cli.command).await;
    engine.shutdown().await;
    outcome
}

async fn dispatch(
    engine: &EngineContext,
    prompt: Arc<dyn EscalationPrompt>,
    command: Command,
) -> Result<()> {
    let policy = RelaunchPolicy::new(engine, prompt);
    match command {
        Command::Ls {
            path,
            no_hidden,
            sort,
        } => {
            let path = absolute(&path)?;
            let program = policy.execute(ListProgram::directory(&path)?).await?;
            let defaults = engine.preferences().listing();
            let prefs = ListingPreferences {
                show_hidden: defaults.show_hidden && !no_hidden,
                sort_mode: sort.unwrap_or(defaults.sort_mode),
                ..defaults
            };
            let files = apply_user_preferences(program.into_files(), &prefs);
            println!("{}", serde_json::to_string_pretty(&files)?);
        }
        Command::Info { path } => {
            let path = absolute(&path)?;
            let program = policy.execute(ListProgram::file_info(&path)?).await?;
            let entry = program
                .single_result()
                .with_context(|| format!("no entry for {path}"))?;
            println!("{}", serde_json::to_string_pretty(entry)?);
        }
        Command::Find {
            directory,
            term,
            max,
        } => {
            let directory = absolute(&directory)?;
            let program =
                FindProgram::new(&directory, &term, max, Some(Arc::new(JsonLinesListener)))?;
            let cancel = cancel_on_ctrl_c();
            let program = policy.execute_async(program, &cancel).await?;
            debug!(matches = program.results().len(), "search finished");
        }
        Command::Compress { mode, out, sources } => {
            let listener: Option<SharedListener<String>> = Some(Arc::new(ProgressListener));
            let program = if mode.is_archive() {
                let sources = sources
                    .iter()
                    .map(String::as_str)
                    .map(absolute)
                    .collect::<Result<Vec<_>>>()?;
                let out = match out {
                    Some(out) => absolute(&out)?,
                    None => {
                        let first = sources.first().context("nothing to archive")?;
                        default_archive_path(mode, first)
                    }
                };
                CompressProgram::archive(mode, &out, &sources, listener)?
            } else {
                let [source] = sources.as_slice() else {
                    anyhow::bail!("{mode} compresses exactly one file");
                };
                CompressProgram::single(mode, &absolute(source)?, listener)?
            };
            let cancel = cancel_on_ctrl_c();
            let program = policy.execute_async(program, &cancel).await?;
            println!(
                "{}",
                json!({
                    "output": program.out_compressed_file(),
                    "completed": program.result() && !cancel.is_cancelled(),
                })
            );
        }
        Command::Rm { path, recursive } => {
            let op = if recursive {
                FsOp::DeleteDirectory
            } else {
                FsOp::DeleteFile
            };
            run_fs_op(&policy, op, &path).await?;
        }
        Command::Mkdir { path } => run_fs_op(&policy, FsOp::CreateDirectory, &path).await?,
        Command::Touch { path } => run_fs_op(&policy, FsOp::CreateFile, &path).await?,
        Command::Whoami => {
            let program = policy.execute(IdentityProgram::new()).await?;
            let identity = program
                .result()
                .as_ref()
                .context("`id` printed nothing")?;
            println!("{}", serde_json::to_string_pretty(identity)?);
        }
    }
    Ok(())
}

async fn run_fs_op(policy: &RelaunchPolicy<'_>, op: FsOp, path: &str) -> Result<()> {
    let path = absolute(path)?;
    let program = policy.execute(FsOpProgram::new(op, &path)?).await?;
    println!(
        "{}",
        json!({ "operation": op.to_string(), "path": path, "done": *program.result() })
    );
    Ok(())
}

/// `<dir>/<stem>.<archive extension>` for the first source `<dir>/<name>`.
fn default_archive_path(mode: CompressionMode, source: &str) -> String {
    let name = paths::file_name(source);
    let stem = match paths::extension(&name) {
        Some(extension) => &name[..name.len() - extension.len() - 1],
        None => name.as_str(),
    };
    let directory =
        paths::parent_dir(source).unwrap_or_else(|| paths::ROOT_DIRECTORY.to_string());
    paths::join(&directory, &format!("{stem}.{}", mode.extension()))
}

/// Resolves `path` against the process working directory.
fn absolute(path: &str) -> Result<String> {
    if path.starts_with(paths::ROOT_DIRECTORY) {
        return Ok(paths::normalize(path));
    }
    let cwd = std::env::current_dir().context("failed to read the working directory")?;
    Ok(paths::absolute(path, &cwd.to_string_lossy()))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
    cancel
}

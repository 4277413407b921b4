use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use super::AsyncProgram;
use super::CommandLine;
use super::PartialLineBuffer;
use super::Program;
use super::ProgramCore;
use super::SharedListener;
use super::Signal;
use super::quote;
use crate::error::FmshErr;
use crate::error::Result;
use crate::paths;

/// Archive and single-file compression formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionMode {
    ArchiveTar,
    ArchiveGzip,
    /// Same format as `ArchiveGzip`, written with the short `.tgz` name.
    ArchiveGzip2,
    ArchiveBzip,
    CompressGzip,
    CompressBzip,
}

impl CompressionMode {
    pub const ALL: [CompressionMode; 6] = [
        Self::ArchiveTar,
        Self::ArchiveGzip,
        Self::ArchiveGzip2,
        Self::ArchiveBzip,
        Self::CompressGzip,
        Self::CompressBzip,
    ];

    /// Archive modes bundle many sources with `tar`; the others compress a
    /// single file in place.
    pub fn is_archive(self) -> bool {
        matches!(
            self,
            Self::ArchiveTar | Self::ArchiveGzip | Self::ArchiveGzip2 | Self::ArchiveBzip
        )
    }

    /// `tar` compression flag; empty for plain tar and single-file modes.
    pub fn flag(self) -> &'static str {
        match self {
            Self::ArchiveGzip | Self::ArchiveGzip2 => "z",
            Self::ArchiveBzip => "j",
            Self::ArchiveTar | Self::CompressGzip | Self::CompressBzip => "",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::ArchiveTar => "tar",
            Self::ArchiveGzip => "tar.gz",
            Self::ArchiveGzip2 => "tgz",
            Self::ArchiveBzip => "tar.bz2",
            Self::CompressGzip => "gz",
            Self::CompressBzip => "bz2",
        }
    }

    fn binary(self) -> &'static str {
        match self {
            Self::CompressGzip => "gzip",
            Self::CompressBzip => "bzip2",
            _ => "tar",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| mode.to_string() == name)
    }
}

impl fmt::Display for CompressionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ArchiveTar => "archive-tar",
            Self::ArchiveGzip => "archive-gzip",
            Self::ArchiveGzip2 => "archive-gzip2",
            Self::ArchiveBzip => "archive-bzip",
            Self::CompressGzip => "compress-gzip",
            Self::CompressBzip => "compress-bzip",
        };
        f.write_str(name)
    }
}

/// Creates an archive of several sources, or compresses one file. Each
/// complete line `tar -v` prints is forwarded to the listener.
#[derive(Clone)]
pub struct CompressProgram {
    core: ProgramCore,
    mode: CompressionMode,
    out_file: String,
    lines: PartialLineBuffer,
    result: bool,
    listener: Option<SharedListener<String>>,
}

impl CompressProgram {
    /// Archives `sources` into `destination`. Sources are passed relative
    /// to the destination's directory, which becomes the working directory.
    pub fn archive(
        mode: CompressionMode,
        destination: &str,
        sources: &[String],
        listener: Option<SharedListener<String>>,
    ) -> Result<Self> {
        if !mode.is_archive() {
            return Err(FmshErr::InvalidCommandDefinition(format!(
                "{mode} does not create archives"
            )));
        }
        if sources.is_empty() {
            return Err(FmshErr::InvalidCommandDefinition(
                "an archive needs at least one source".to_string(),
            ));
        }
        let destination = paths::normalize(destination);
        let base =
            paths::parent_dir(&destination).unwrap_or_else(|| paths::ROOT_DIRECTORY.to_string());
        let relative: Vec<String> = sources
            .iter()
            .map(|source| paths::to_relative_path(&paths::absolute(source, &base), &base))
            .collect();

        let mut script = format!("tar -c{}vf {}", mode.flag(), quote(&destination)?);
        for source in &relative {
            script.push(' ');
            script.push_str(&quote(source)?);
        }
        let args = std::iter::once(mode.flag().to_string())
            .chain(std::iter::once(destination.clone()))
            .chain(relative);
        let command = CommandLine::new(mode.binary(), args)
            .with_cwd(base)
            .with_script(script);
        Ok(Self::new(command, mode, destination, listener))
    }

    /// Compresses `source` in place; the output gains the mode's extension.
    pub fn single(
        mode: CompressionMode,
        source: &str,
        listener: Option<SharedListener<String>>,
    ) -> Result<Self> {
        if mode.is_archive() {
            return Err(FmshErr::InvalidCommandDefinition(format!(
                "{mode} needs a destination and a list of sources"
            )));
        }
        let source = paths::normalize(source);
        let out_file = format!("{source}.{}", mode.extension());
        let command = CommandLine::new(mode.binary(), [source]);
        Ok(Self::new(command, mode, out_file, listener))
    }

    fn new(
        command: CommandLine,
        mode: CompressionMode,
        out_file: String,
        listener: Option<SharedListener<String>>,
    ) -> Self {
        Self {
            core: ProgramCore::new(command),
            mode,
            out_file,
            lines: PartialLineBuffer::new(),
            result: false,
            listener,
        }
    }

    pub fn mode(&self) -> CompressionMode {
        self.mode
    }

    pub fn out_compressed_file(&self) -> &str {
        &self.out_file
    }

    /// Whether the last execution finished with an accepted exit code.
    pub fn result(&self) -> bool {
        self.result
    }

    fn emit(&self, line: String) {
        if let Some(listener) = &self.listener {
            listener.on_partial_result(line);
        }
    }
}

impl fmt::Debug for CompressProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressProgram")
            .field("command", self.command())
            .field("mode", &self.mode)
            .field("out_file", &self.out_file)
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

impl Program for CompressProgram {
    fn core(&self) -> &ProgramCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProgramCore {
        &mut self.core
    }

    /// 137 and 143 are the shell's report of a command ended with SIGKILL
    /// or SIGTERM, which is how an archive in progress is stopped.
    fn check_exit_code(&mut self, exit_code: i32, stderr: &str) -> Result<()> {
        let accepted = [0, 1, Signal::Kill.exit_code(), Signal::Terminate.exit_code()];
        self.result = accepted.contains(&exit_code);
        if self.result {
            Ok(())
        } else {
            let detail = stderr.lines().next().unwrap_or_default();
            Err(FmshErr::execution(&self.command().preview(), exit_code, detail))
        }
    }
}

impl AsyncProgram for CompressProgram {
    fn on_start_parse_partial_result(&mut self) {
        self.result = false;
        self.lines.clear();
        if let Some(listener) = &self.listener {
            listener.on_async_start();
        }
    }

    fn on_parse_partial_result(&mut self, partial: &str) {
        for line in self.lines.push(partial) {
            self.emit(line);
        }
    }

    fn on_parse_error_partial_result(&mut self, _partial: &str) {}

    fn on_end_parse_partial_result(&mut self, canceled: bool) {
        if let Some(line) = self.lines.finish() {
            self.emit(line);
        }
        if let Some(listener) = &self.listener {
            listener.on_async_end(canceled);
        }
    }

    fn on_exit_code(&mut self, exit_code: i32) {
        if let Some(listener) = &self.listener {
            listener.on_async_exit_code(exit_code);
        }
    }

    fn on_exception(&mut self, cause: &FmshErr) {
        if let Some(listener) = &self.listener {
            listener.on_exception(cause);
        }
    }

    fn on_request_end(&mut self) -> Option<Signal> {
        Some(Signal::Terminate)
    }
}

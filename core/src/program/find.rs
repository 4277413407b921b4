use std::fmt;

use tracing::debug;

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
use crate::error::classify_failure;
use crate::model::FileSystemObject;
use crate::parse::STAT_FORMAT;
use crate::parse::parse_entity_line;
use crate::paths;

/// Recursive, case-insensitive name search below a directory. Matches are
/// streamed to the listener in batches, one batch per output chunk. Each
/// match is described by its own `stat` so it is printed as soon as it is
/// found.
#[derive(Clone)]
pub struct FindProgram {
    core: ProgramCore,
    directory: String,
    max_results: usize,
    lines: PartialLineBuffer,
    found: Vec<FileSystemObject>,
    listener: Option<SharedListener<Vec<FileSystemObject>>>,
}

impl FindProgram {
    /// `max_results` of zero means unlimited.
    pub fn new(
        directory: &str,
        term: &str,
        max_results: usize,
        listener: Option<SharedListener<Vec<FileSystemObject>>>,
    ) -> Result<Self> {
        if !directory.starts_with(paths::ROOT_DIRECTORY) {
            return Err(FmshErr::InvalidCommandDefinition(format!(
                "search directory must be absolute: `{directory}`"
            )));
        }
        if term.trim().is_empty() {
            return Err(FmshErr::InvalidCommandDefinition(
                "empty search term".to_string(),
            ));
        }
        let directory = paths::normalize(directory);
        let pattern = format!("*{term}*");
        let script = format!(
            "find {} -mindepth 1 -iname {} -exec stat -c {} -- {{}} \\;",
            quote(&directory)?,
            quote(&pattern)?,
            quote(STAT_FORMAT)?,
        );
        let command = CommandLine::new("find", [directory.clone(), pattern]).with_script(script);
        Ok(Self {
            core: ProgramCore::new(command),
            directory,
            max_results,
            lines: PartialLineBuffer::new(),
            found: Vec::new(),
            listener,
        })
    }

    pub fn directory(&self) -> &str {
        &self.directory
    }

    pub fn results(&self) -> &[FileSystemObject] {
        &self.found
    }

    fn limit_reached(&self) -> bool {
        self.max_results > 0 && self.found.len() >= self.max_results
    }

    fn accept(&mut self, lines: Vec<String>) {
        let mut batch = Vec::new();
        for line in lines {
            if self.limit_reached() {
                break;
            }
            if line.trim().is_empty() {
                continue;
            }
            match parse_entity_line(&self.directory, &line) {
                Ok(fso) => {
                    self.found.push(fso.clone());
                    batch.push(fso);
                }
                Err(err) => debug!("skipping unparsable search result: {err}"),
            }
        }
        if batch.is_empty() {
            return;
        }
        if let Some(listener) = &self.listener {
            listener.on_partial_result(batch);
        }
    }
}

impl fmt::Debug for FindProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FindProgram")
            .field("command", self.command())
            .field("max_results", &self.max_results)
            .field("found", &self.found.len())
            .finish_non_exhaustive()
    }
}

impl Program for FindProgram {
    fn core(&self) -> &ProgramCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProgramCore {
        &mut self.core
    }

    fn check_exit_code(&mut self, exit_code: i32, stderr: &str) -> Result<()> {
        match exit_code {
            0 | 1 => Ok(()),
            code => Err(classify_failure(&self.command().preview(), code, stderr)),
        }
    }
}

impl AsyncProgram for FindProgram {
    fn on_start_parse_partial_result(&mut self) {
        self.found.clear();
        self.lines.clear();
        if let Some(listener) = &self.listener {
            listener.on_async_start();
        }
    }

    fn on_parse_partial_result(&mut self, partial: &str) {
        let lines = self.lines.push(partial);
        self.accept(lines);
    }

    fn on_parse_error_partial_result(&mut self, partial: &str) {
        debug!(stderr = partial.trim_end(), "search reported an error");
    }

    fn on_end_parse_partial_result(&mut self, canceled: bool) {
        if let Some(rest) = self.lines.finish() {
            self.accept(vec![rest]);
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
        Some(Signal::Interrupt)
    }

    fn wants_end(&self) -> bool {
        self.limit_reached()
    }
}

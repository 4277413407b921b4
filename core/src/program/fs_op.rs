use std::fmt;

use super::CommandLine;
use super::Program;
use super::ProgramCore;
use super::SyncProgram;
use crate::error::FmshErr;
use crate::error::ParseError;
use crate::error::Result;
use crate::error::classify_failure;
use crate::paths;

/// Single-path filesystem mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsOp {
    DeleteFile,
    DeleteDirectory,
    CreateFile,
    CreateDirectory,
}

impl FsOp {
    fn argv(self) -> (&'static str, &'static [&'static str]) {
        match self {
            Self::DeleteFile => ("rm", &["--"]),
            Self::DeleteDirectory => ("rm", &["-r", "--"]),
            Self::CreateFile => ("touch", &["--"]),
            Self::CreateDirectory => ("mkdir", &["--"]),
        }
    }
}

impl fmt::Display for FsOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::DeleteFile => "delete file",
            Self::DeleteDirectory => "delete directory",
            Self::CreateFile => "create file",
            Self::CreateDirectory => "create directory",
        };
        f.write_str(label)
    }
}

/// Runs one [`FsOp`] on an absolute path. Produces no output; the exit code
/// alone decides success.
#[derive(Debug, Clone)]
pub struct FsOpProgram {
    core: ProgramCore,
    op: FsOp,
    path: String,
    done: bool,
}

impl FsOpProgram {
    pub fn new(op: FsOp, path: &str) -> Result<Self> {
        if !path.starts_with(paths::ROOT_DIRECTORY) || paths::is_root(path) {
            return Err(FmshErr::InvalidCommandDefinition(format!(
                "cannot {op} `{path}`"
            )));
        }
        let path = paths::normalize(path);
        let (binary, flags) = op.argv();
        let args = flags
            .iter()
            .map(|flag| (*flag).to_string())
            .chain(std::iter::once(path.clone()));
        Ok(Self {
            core: ProgramCore::new(CommandLine::new(binary, args)),
            op,
            path,
            done: false,
        })
    }

    pub fn delete_file(path: &str) -> Result<Self> {
        Self::new(FsOp::DeleteFile, path)
    }

    pub fn delete_directory(path: &str) -> Result<Self> {
        Self::new(FsOp::DeleteDirectory, path)
    }

    pub fn create_file(path: &str) -> Result<Self> {
        Self::new(FsOp::CreateFile, path)
    }

    pub fn create_directory(path: &str) -> Result<Self> {
        Self::new(FsOp::CreateDirectory, path)
    }

    pub fn op(&self) -> FsOp {
        self.op
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Program for FsOpProgram {
    fn core(&self) -> &ProgramCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProgramCore {
        &mut self.core
    }

    fn check_exit_code(&mut self, exit_code: i32, stderr: &str) -> Result<()> {
        self.done = exit_code == 0;
        if self.done {
            Ok(())
        } else {
            Err(classify_failure(&self.command().preview(), exit_code, stderr))
        }
    }
}

impl SyncProgram for FsOpProgram {
    type Output = bool;

    fn parse(&mut self, _stdout: &str, _stderr: &str) -> std::result::Result<(), ParseError> {
        Ok(())
    }

    fn result(&self) -> &bool {
        &self.done
    }
}

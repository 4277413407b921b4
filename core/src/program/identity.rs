use serde::Serialize;

use super::CommandLine;
use super::Program;
use super::ProgramCore;
use super::SyncProgram;
use crate::error::ParseError;
use crate::error::Result;
use crate::error::classify_failure;

/// Effective identity of a shell, as printed by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub uid: u32,
    pub user: Option<String>,
    pub gid: u32,
    pub group: Option<String>,
    pub groups: Vec<(u32, Option<String>)>,
}

impl Identity {
    /// Parses `uid=0(root) gid=0(root) groups=0(root),3003(inet)`.
    pub fn parse(output: &str) -> std::result::Result<Self, ParseError> {
        let line = output
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| ParseError::new(0, "empty id output"))?;

        let mut uid = None;
        let mut gid = None;
        let mut groups = Vec::new();
        for field in line.split_whitespace() {
            let Some((key, value)) = field.split_once('=') else {
                continue;
            };
            match key {
                "uid" => uid = Some(parse_id(value)?),
                "gid" => gid = Some(parse_id(value)?),
                "groups" => {
                    for group in value.split(',').filter(|group| !group.is_empty()) {
                        groups.push(parse_id(group)?);
                    }
                }
                _ => {}
            }
        }
        let (uid, user) = uid.ok_or_else(|| ParseError::new(0, format!("no uid in `{line}`")))?;
        let (gid, group) = gid.ok_or_else(|| ParseError::new(0, format!("no gid in `{line}`")))?;
        Ok(Self {
            uid,
            user,
            gid,
            group,
            groups,
        })
    }
}

fn parse_id(raw: &str) -> std::result::Result<(u32, Option<String>), ParseError> {
    let (number, name) = match raw.split_once('(') {
        Some((number, rest)) => (number, Some(rest.trim_end_matches(')').to_string())),
        None => (raw, None),
    };
    let number = number
        .parse::<u32>()
        .map_err(|err| ParseError::new(0, format!("invalid id `{raw}`: {err}")))?;
    Ok((number, name))
}

/// Runs `id` to learn who a console runs as.
#[derive(Debug, Clone)]
pub struct IdentityProgram {
    core: ProgramCore,
    identity: Option<Identity>,
}

impl IdentityProgram {
    pub fn new() -> Self {
        Self {
            core: ProgramCore::new(CommandLine::new("id", Vec::<String>::new())),
            identity: None,
        }
    }
}

impl Default for IdentityProgram {
    fn default() -> Self {
        Self::new()
    }
}

impl Program for IdentityProgram {
    fn core(&self) -> &ProgramCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProgramCore {
        &mut self.core
    }

    fn check_exit_code(&mut self, exit_code: i32, stderr: &str) -> Result<()> {
        match exit_code {
            0 => Ok(()),
            code => Err(classify_failure(self.command().id(), code, stderr)),
        }
    }
}

impl SyncProgram for IdentityProgram {
    type Output = Option<Identity>;

    fn parse(&mut self, stdout: &str, _stderr: &str) -> std::result::Result<(), ParseError> {
        self.identity = Some(Identity::parse(stdout)?);
        Ok(())
    }

    fn result(&self) -> &Option<Identity> {
        &self.identity
    }
}

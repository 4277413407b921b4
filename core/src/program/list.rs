//! Directory listings and single-entry lookups.
//!
//! The listing script prints every non-symlink entry, then the symlinks
//! after a `>SIMLINKS>` marker, then a `>SIMLINKS_DATA>` marker followed by
//! one resolved absolute path per symlink and one entity line per
//! resolved target (`?` when the target cannot be read). The two data
//! blocks pair with the symlinks by position.

use tracing::debug;

use super::CommandLine;
use super::Program;
use super::ProgramCore;
use super::SyncProgram;
use super::quote;
use crate::error::FmshErr;
use crate::error::ParseError;
use crate::error::Result;
use crate::error::classify_failure;
use crate::model::FileSystemObject;
use crate::parse::STAT_FORMAT;
use crate::parse::parse_entity_line;
use crate::paths;

pub const SYMLINK_REF: &str = ">SIMLINKS>";
pub const SYMLINK_DATA_REF: &str = ">SIMLINKS_DATA>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMode {
    /// Children of a directory, preceded by the parent marker.
    Directory,
    /// The entry at the path itself.
    FileInfo,
}

#[derive(Debug, Clone)]
pub struct ListProgram {
    core: ProgramCore,
    mode: ListMode,
    path: String,
    files: Vec<FileSystemObject>,
}

impl ListProgram {
    pub fn directory(path: &str) -> Result<Self> {
        Self::new(ListMode::Directory, path)
    }

    pub fn file_info(path: &str) -> Result<Self> {
        Self::new(ListMode::FileInfo, path)
    }

    fn new(mode: ListMode, path: &str) -> Result<Self> {
        if !path.starts_with(paths::ROOT_DIRECTORY) {
            return Err(FmshErr::InvalidCommandDefinition(format!(
                "listing path must be absolute: `{path}`"
            )));
        }
        let path = paths::normalize(path);
        let script = match mode {
            ListMode::Directory => directory_script(&path)?,
            ListMode::FileInfo => file_info_script(&path)?,
        };
        let command = CommandLine::new("ls", [path.clone()]).with_script(script);
        Ok(Self {
            core: ProgramCore::new(command),
            mode,
            path,
            files: Vec::new(),
        })
    }

    pub fn mode(&self) -> ListMode {
        self.mode
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The looked-up entry in file-info mode.
    pub fn single_result(&self) -> Option<&FileSystemObject> {
        self.files.first()
    }

    pub fn into_files(self) -> Vec<FileSystemObject> {
        self.files
    }

    fn entries_parent(&self) -> String {
        match self.mode {
            ListMode::Directory => self.path.clone(),
            ListMode::FileInfo => {
                paths::parent_dir(&self.path).unwrap_or_else(|| paths::ROOT_DIRECTORY.to_string())
            }
        }
    }
}

impl Program for ListProgram {
    fn core(&self) -> &ProgramCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProgramCore {
        &mut self.core
    }

    /// `find` exits 1 when some entries could not be read; the listing is
    /// still usable.
    fn check_exit_code(&mut self, exit_code: i32, stderr: &str) -> Result<()> {
        match exit_code {
            0 | 1 => Ok(()),
            code => Err(classify_failure(&self.command().preview(), code, stderr)),
        }
    }
}

impl SyncProgram for ListProgram {
    type Output = Vec<FileSystemObject>;

    fn parse(&mut self, stdout: &str, _stderr: &str) -> std::result::Result<(), ParseError> {
        let mut files = parse_listing(&self.entries_parent(), stdout)?;
        if self.mode == ListMode::Directory && !paths::is_root(&self.path) {
            let parent =
                paths::parent_dir(&self.path).unwrap_or_else(|| paths::ROOT_DIRECTORY.to_string());
            files.insert(0, FileSystemObject::parent_directory(parent));
        }
        self.files = files;
        Ok(())
    }

    fn result(&self) -> &Self::Output {
        &self.files
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListingState {
    ReadingEntries,
    ReadingSymlinkRefs,
    ReadingSymlinkTargets,
    Done,
}

/// Parses listing script output. Entity lines that fail to parse abort the
/// whole listing; unresolvable symlink targets only leave the symlink
/// unresolved.
pub fn parse_listing(parent: &str, stdout: &str) -> std::result::Result<Vec<FileSystemObject>, ParseError> {
    let lines: Vec<&str> = stdout.lines().collect();
    let mut files = Vec::new();
    let mut symlinks = Vec::new();
    let mut state = ListingState::ReadingEntries;
    let mut index = 0;

    loop {
        match state {
            ListingState::ReadingEntries | ListingState::ReadingSymlinkRefs => {
                let Some(line) = lines.get(index) else {
                    state = ListingState::Done;
                    continue;
                };
                if line.trim().is_empty() {
                    state = ListingState::Done;
                    continue;
                }
                index += 1;
                if line.starts_with(SYMLINK_DATA_REF) {
                    state = ListingState::ReadingSymlinkTargets;
                } else if line.starts_with(SYMLINK_REF) {
                    state = ListingState::ReadingSymlinkRefs;
                } else {
                    let fso = parse_entity_line(parent, line).map_err(|err| err.at_line(index - 1))?;
                    if state == ListingState::ReadingSymlinkRefs {
                        symlinks.push(files.len());
                    }
                    files.push(fso);
                }
            }
            ListingState::ReadingSymlinkTargets => {
                let count = symlinks.len();
                for (position, &file_index) in symlinks.iter().enumerate() {
                    let target_path = lines.get(index + position).map(|line| line.trim());
                    let target_data = lines.get(index + count + position).copied();
                    if let (Some(target_path), Some(target_data)) = (target_path, target_data) {
                        resolve_symlink(&mut files[file_index], target_path, target_data);
                    }
                }
                state = ListingState::Done;
            }
            ListingState::Done => break,
        }
    }
    Ok(files)
}

fn resolve_symlink(link: &mut FileSystemObject, target_path: &str, target_data: &str) {
    let Some(symlink) = link.as_symlink_mut() else {
        return;
    };
    if target_path.is_empty() {
        debug!(link = %symlink.attributes.name, "symlink target could not be resolved");
        return;
    }
    let parent =
        paths::parent_dir(target_path).unwrap_or_else(|| paths::ROOT_DIRECTORY.to_string());
    match parse_entity_line(&parent, target_data) {
        Ok(target) => {
            if symlink.set_link_ref(target).is_err() {
                debug!(link = %symlink.attributes.name, "symlink target is not a concrete entity");
            }
        }
        Err(err) => {
            debug!(link = %symlink.attributes.name, %target_path, "unreadable symlink target: {err}");
        }
    }
}

fn directory_script(path: &str) -> Result<String> {
    let dir = quote(&paths::add_trailing_slash(path))?;
    let format = quote(STAT_FORMAT)?;
    let children = r#"find "$d" -mindepth 1 -maxdepth 1"#;
    Ok(format!(
        "d={dir}; \
         stat -c %n -- \"$d\" >/dev/null || exit 2; \
         [ -d \"$d\" ] || {{ echo \"$d: Not a directory\" >&2; exit 2; }}; \
         [ -r \"$d\" ] && [ -x \"$d\" ] || {{ echo \"$d: Permission denied\" >&2; exit 2; }}; \
         {children} ! -type l -exec stat -c {format} -- {{}} +; \
         echo '{SYMLINK_REF}'; \
         {children} -type l -exec stat -c {format} -- {{}} +; \
         echo '{SYMLINK_DATA_REF}'; \
         {children} -type l | while IFS= read -r l; do readlink -f -- \"$l\" || echo; done; \
         {children} -type l | while IFS= read -r l; do \
         t=$(readlink -f -- \"$l\") && stat -c {format} -- \"$t\" 2>/dev/null || echo '?'; done"
    ))
}

fn file_info_script(path: &str) -> Result<String> {
    let target = quote(path)?;
    let format = quote(STAT_FORMAT)?;
    Ok(format!(
        "p={target}; \
         if [ -L \"$p\" ]; then \
         echo '{SYMLINK_REF}'; stat -c {format} -- \"$p\" || exit 2; echo '{SYMLINK_DATA_REF}'; \
         t=$(readlink -f -- \"$p\"); echo \"$t\"; stat -c {format} -- \"$t\" 2>/dev/null || echo '?'; \
         else stat -c {format} -- \"$p\" || exit 2; fi"
    ))
}

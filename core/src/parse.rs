//! Conversion of single lines of shell output into typed entities.
//!
//! An entity line is what `stat -c '%A %U %G %s %Y %n'` prints:
//!
//! ```text
//! -rw-rw-rw- alice alice 10 1700000000 a.txt
//! ```
//!
//! The name is the remainder of the line and may contain spaces. A name
//! holding a `/` (as printed for `find` results and resolved symlink
//! targets) carries its own parent directory.

use chrono::DateTime;
use chrono::Utc;

use crate::error::ParseError;
use crate::model::Attributes;
use crate::model::FileSystemObject;
use crate::model::Permissions;
use crate::paths;

/// `stat` format producing one entity line.
pub const STAT_FORMAT: &str = "%A %U %G %s %Y %n";

/// Splits a ten character mode string (`drwxr-xr-x`) into its type
/// character and permissions.
pub fn parse_mode(raw: &str) -> Result<(char, Permissions), ParseError> {
    let mut chars = raw.chars();
    let type_char = chars
        .next()
        .ok_or_else(|| ParseError::new(0, "empty mode string"))?;
    let permissions = Permissions::parse(chars.as_str())?;
    Ok((type_char, permissions))
}

/// Parses one entity line. `parent` is the directory the entry lives in;
/// it is ignored when the name is itself an absolute path.
pub fn parse_entity_line(parent: &str, line: &str) -> Result<FileSystemObject, ParseError> {
    let mut rest = line.trim_end_matches(['\r', '\n']);
    let mut fields = [""; 5];
    for (index, field) in fields.iter_mut().enumerate() {
        let trimmed = rest.trim_start();
        let (token, tail) = trimmed.split_once(char::is_whitespace).ok_or_else(|| {
            ParseError::new(0, format!("expected 6 fields, found {}: `{line}`", index + 1))
        })?;
        *field = token;
        rest = tail;
    }
    let [mode, user, group, size, mtime] = fields;
    let name = rest.trim_start();
    if name.is_empty() {
        return Err(ParseError::new(0, format!("missing name: `{line}`")));
    }

    let (type_char, permissions) = parse_mode(mode)?;
    let size = size
        .parse::<u64>()
        .map_err(|err| ParseError::new(0, format!("invalid size `{size}`: {err}")))?;
    let last_modified = parse_timestamp(mtime)?;

    let (parent, name) = split_name(parent, name);
    let attributes = Attributes::new(name, parent, user, group, permissions, size, last_modified);
    Ok(FileSystemObject::from_type_char(type_char, attributes))
}

/// The root directory has no parent: its name is `/` and its parent is
/// empty, so its full path renders as `/`.
fn split_name(parent: &str, name: &str) -> (String, String) {
    if name.starts_with('/') && paths::is_root(name) {
        return (String::new(), paths::ROOT_DIRECTORY.to_string());
    }
    if !name.contains('/') {
        return (parent.to_string(), name.to_string());
    }
    let full = if name.starts_with('/') {
        paths::normalize(name)
    } else {
        paths::absolute(name, parent)
    };
    let parent = paths::parent_dir(&full).unwrap_or_else(|| paths::ROOT_DIRECTORY.to_string());
    (parent, paths::file_name(&full))
}

/// Epoch seconds, optionally with a fractional part.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ParseError> {
    let (secs, nanos) = match raw.split_once('.') {
        Some((secs, frac)) => {
            let digits: String = frac.chars().take(9).collect();
            let nanos = format!("{digits:0<9}")
                .parse::<u32>()
                .map_err(|err| ParseError::new(0, format!("invalid timestamp `{raw}`: {err}")))?;
            (secs, nanos)
        }
        None => (raw, 0),
    };
    let secs = secs
        .parse::<i64>()
        .map_err(|err| ParseError::new(0, format!("invalid timestamp `{raw}`: {err}")))?;
    DateTime::<Utc>::from_timestamp(secs, nanos)
        .ok_or_else(|| ParseError::new(0, format!("timestamp out of range `{raw}`")))
}

//! Lexical path helpers. Paths are the shell's paths, so they are handled as
//! `/`-separated strings and never touched on the local filesystem.

use std::path::Path;

use path_clean::clean;

pub const ROOT_DIRECTORY: &str = "/";
pub const PARENT_DIRECTORY: &str = "..";
pub const CURRENT_DIRECTORY: &str = ".";

const MULTI_PART_EXTENSIONS: [&str; 3] = ["tar.gz", "tar.bz2", "tar.lzma"];

pub fn is_root(path: &str) -> bool {
    normalize(path) == ROOT_DIRECTORY
}

/// Collapses `.`/`..` segments and duplicate separators.
pub fn normalize(path: &str) -> String {
    if path.is_empty() {
        return CURRENT_DIRECTORY.to_string();
    }
    clean(path).to_string_lossy().into_owned()
}

/// Resolves `path` against `cwd` when it is relative.
pub fn absolute(path: &str, cwd: &str) -> String {
    if path.starts_with(ROOT_DIRECTORY) {
        normalize(path)
    } else {
        normalize(&join(cwd, path))
    }
}

pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Parent of an absolute path, `None` for the root directory.
pub fn parent_dir(path: &str) -> Option<String> {
    let normalized = normalize(path);
    Path::new(&normalized)
        .parent()
        .map(|parent| parent.to_string_lossy().into_owned())
        .filter(|parent| !parent.is_empty())
}

pub fn file_name(path: &str) -> String {
    let normalized = normalize(path);
    Path::new(&normalized)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or(normalized)
}

pub fn add_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

/// Rewrites `path` relative to `base`; paths that cannot be expressed
/// relative to `base` are returned unchanged.
pub fn to_relative_path(path: &str, base: &str) -> String {
    match pathdiff::diff_paths(normalize(path), normalize(base)) {
        Some(relative) if relative.as_os_str().is_empty() => CURRENT_DIRECTORY.to_string(),
        Some(relative) => relative.to_string_lossy().into_owned(),
        None => path.to_string(),
    }
}

/// Extension of a file name, honouring the compound archive extensions.
/// Hidden files without a further dot have no extension.
pub fn extension(name: &str) -> Option<&str> {
    let pos = name.rfind('.')?;
    if pos == 0 {
        return None;
    }
    for compound in MULTI_PART_EXTENSIONS {
        if name.len() > compound.len() + 1
            && name.ends_with(compound)
            && name[..name.len() - compound.len()].ends_with('.')
        {
            return Some(&name[name.len() - compound.len()..]);
        }
    }
    Some(&name[pos + 1..])
}

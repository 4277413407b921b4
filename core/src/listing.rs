//! User preferences applied to a parsed listing: filtering and sorting.

use std::cmp::Ordering;

use serde::Deserialize;
use serde::Serialize;

use crate::model::FileSystemObject;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortMode {
    #[default]
    NameAsc,
    NameDesc,
    DateAsc,
    DateDesc,
    SizeAsc,
    SizeDesc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingPreferences {
    pub sort_mode: SortMode,
    pub show_dirs_first: bool,
    pub show_hidden: bool,
    pub show_system: bool,
    pub show_symlinks: bool,
    pub case_sensitive: bool,
}

impl Default for ListingPreferences {
    fn default() -> Self {
        Self {
            sort_mode: SortMode::NameAsc,
            show_dirs_first: true,
            show_hidden: true,
            show_system: true,
            show_symlinks: true,
            case_sensitive: false,
        }
    }
}

/// Filters and sorts `files`. The parent directory marker is never filtered
/// and always comes first.
pub fn apply_user_preferences(
    files: Vec<FileSystemObject>,
    prefs: &ListingPreferences,
) -> Vec<FileSystemObject> {
    let (mut markers, mut entries): (Vec<_>, Vec<_>) = files
        .into_iter()
        .partition(|fso| matches!(fso, FileSystemObject::ParentDirectory(_)));
    entries.retain(|fso| {
        (prefs.show_hidden || !fso.is_hidden())
            && (prefs.show_system || !fso.is_system_file())
            && (prefs.show_symlinks || !matches!(fso, FileSystemObject::Symlink(_)))
    });
    entries.sort_by(|a, b| compare(a, b, prefs));
    markers.truncate(1);
    markers.extend(entries);
    markers
}

fn compare(a: &FileSystemObject, b: &FileSystemObject, prefs: &ListingPreferences) -> Ordering {
    if prefs.show_dirs_first {
        match (a.is_directory(), b.is_directory()) {
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }
    }
    let by_name = || {
        if prefs.case_sensitive {
            a.name().cmp(b.name())
        } else {
            a.name()
                .to_lowercase()
                .cmp(&b.name().to_lowercase())
                .then_with(|| a.name().cmp(b.name()))
        }
    };
    let modified = |fso: &FileSystemObject| fso.attributes().map(|attrs| attrs.last_modified);
    let size = |fso: &FileSystemObject| fso.attributes().map_or(0, |attrs| attrs.size);
    match prefs.sort_mode {
        SortMode::NameAsc => by_name(),
        SortMode::NameDesc => by_name().reverse(),
        SortMode::DateAsc => modified(a).cmp(&modified(b)).then_with(by_name),
        SortMode::DateDesc => modified(b).cmp(&modified(a)).then_with(by_name),
        SortMode::SizeAsc => size(a).cmp(&size(b)).then_with(by_name),
        SortMode::SizeDesc => size(b).cmp(&size(a)).then_with(by_name),
    }
}

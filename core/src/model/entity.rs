use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use super::permissions::Permissions;
use crate::paths;

/// Account that owns files created by a privileged shell.
pub const USER_ROOT: &str = "root";

/// Attributes shared by every concrete filesystem entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    pub name: String,
    pub parent: String,
    pub user: String,
    pub group: String,
    pub permissions: Permissions,
    /// Bytes. Meaningless for directories.
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub hidden: bool,
}

impl Attributes {
    pub fn new(
        name: impl Into<String>,
        parent: impl Into<String>,
        user: impl Into<String>,
        group: impl Into<String>,
        permissions: Permissions,
        size: u64,
        last_modified: DateTime<Utc>,
    ) -> Self {
        let name = name.into();
        let hidden = name.starts_with('.');
        Self {
            name,
            parent: parent.into(),
            user: user.into(),
            group: group.into(),
            permissions,
            size,
            last_modified,
            hidden,
        }
    }

    pub fn full_path(&self) -> String {
        paths::join(&self.parent, &self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symlink {
    #[serde(flatten)]
    pub attributes: Attributes,
    link_ref: Option<Box<FileSystemObject>>,
}

impl Symlink {
    pub fn new(attributes: Attributes) -> Self {
        Self {
            attributes,
            link_ref: None,
        }
    }

    pub fn link_ref(&self) -> Option<&FileSystemObject> {
        self.link_ref.as_deref()
    }

    /// Attaches the resolved target. Symlinks and parent markers are not
    /// valid targets and are handed back untouched.
    pub fn set_link_ref(&mut self, target: FileSystemObject) -> Result<(), FileSystemObject> {
        match target {
            FileSystemObject::Symlink(_) | FileSystemObject::ParentDirectory(_) => Err(target),
            concrete => {
                self.link_ref = Some(Box::new(concrete));
                Ok(())
            }
        }
    }
}

/// The synthetic `..` entry of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentDirectory {
    pub parent: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileSystemObject {
    RegularFile(Attributes),
    Directory(Attributes),
    SystemFile(Attributes),
    Symlink(Symlink),
    BlockDevice(Attributes),
    CharacterDevice(Attributes),
    NamedPipe(Attributes),
    DomainSocket(Attributes),
    ParentDirectory(ParentDirectory),
}

impl FileSystemObject {
    /// Maps the leading type character of an `ls`/`stat` mode string.
    pub fn from_type_char(type_char: char, attributes: Attributes) -> Self {
        match type_char {
            '-' => Self::RegularFile(attributes),
            'd' => Self::Directory(attributes),
            'l' => Self::Symlink(Symlink::new(attributes)),
            'b' => Self::BlockDevice(attributes),
            'c' => Self::CharacterDevice(attributes),
            'p' => Self::NamedPipe(attributes),
            's' => Self::DomainSocket(attributes),
            _ => Self::SystemFile(attributes),
        }
    }

    pub fn parent_directory(parent: impl Into<String>) -> Self {
        Self::ParentDirectory(ParentDirectory {
            parent: parent.into(),
        })
    }

    pub fn attributes(&self) -> Option<&Attributes> {
        match self {
            Self::RegularFile(attrs)
            | Self::Directory(attrs)
            | Self::SystemFile(attrs)
            | Self::BlockDevice(attrs)
            | Self::CharacterDevice(attrs)
            | Self::NamedPipe(attrs)
            | Self::DomainSocket(attrs) => Some(attrs),
            Self::Symlink(link) => Some(&link.attributes),
            Self::ParentDirectory(_) => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::ParentDirectory(_) => paths::PARENT_DIRECTORY,
            other => other.attributes().map_or("", |attrs| attrs.name.as_str()),
        }
    }

    pub fn parent(&self) -> &str {
        match self {
            Self::ParentDirectory(marker) => &marker.parent,
            other => other.attributes().map_or("", |attrs| attrs.parent.as_str()),
        }
    }

    pub fn full_path(&self) -> String {
        match self {
            Self::ParentDirectory(marker) => marker.parent.clone(),
            other => other
                .attributes()
                .map(Attributes::full_path)
                .unwrap_or_default(),
        }
    }

    pub fn is_hidden(&self) -> bool {
        self.attributes().is_some_and(|attrs| attrs.hidden)
    }

    pub fn as_symlink(&self) -> Option<&Symlink> {
        match self {
            Self::Symlink(link) => Some(link),
            _ => None,
        }
    }

    pub fn as_symlink_mut(&mut self) -> Option<&mut Symlink> {
        match self {
            Self::Symlink(link) => Some(link),
            _ => None,
        }
    }

    pub fn has_link_ref(&self) -> bool {
        self.as_symlink().is_some_and(|link| link.link_ref().is_some())
    }

    /// The link target for resolved symlinks, otherwise `self`.
    pub fn reference(&self) -> &FileSystemObject {
        match self {
            Self::Symlink(link) => link.link_ref().unwrap_or(self),
            _ => self,
        }
    }

    /// Directories, and symlinks resolving to one.
    pub fn is_directory(&self) -> bool {
        matches!(self.reference(), Self::Directory(_))
    }

    pub fn is_system_file(&self) -> bool {
        matches!(self.reference(), Self::SystemFile(_))
    }

    /// Whether operating on the entry probably needs a privileged console.
    pub fn is_privileged(&self) -> bool {
        match self {
            Self::ParentDirectory(_) => false,
            other => other
                .attributes()
                .is_some_and(|attrs| attrs.user == USER_ROOT),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::RegularFile(_) => "file",
            Self::Directory(_) => "directory",
            Self::SystemFile(_) => "system",
            Self::Symlink(_) => "symlink",
            Self::BlockDevice(_) => "block-device",
            Self::CharacterDevice(_) => "char-device",
            Self::NamedPipe(_) => "pipe",
            Self::DomainSocket(_) => "socket",
            Self::ParentDirectory(_) => "parent",
        }
    }
}

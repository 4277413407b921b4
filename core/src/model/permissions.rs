use std::cmp::Ordering;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::error::ParseError;

/// Read/write/execute bits of one permission group plus the group's extra
/// bit (setuid for the owner, setgid for the group, sticky for others).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionBits {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub special: bool,
}

impl PermissionBits {
    pub const fn new(read: bool, write: bool, execute: bool) -> Self {
        Self {
            read,
            write,
            execute,
            special: false,
        }
    }

    fn octal_digit(self) -> u32 {
        (u32::from(self.read) << 2) | (u32::from(self.write) << 1) | u32::from(self.execute)
    }

    fn from_octal_digit(digit: u32) -> Self {
        Self::new(digit & 0b100 != 0, digit & 0b010 != 0, digit & 0b001 != 0)
    }

    fn render(self, special_lower: char, special_upper: char) -> [char; 3] {
        let execute = match (self.execute, self.special) {
            (true, true) => special_lower,
            (false, true) => special_upper,
            (true, false) => 'x',
            (false, false) => '-',
        };
        [
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            execute,
        ]
    }

    fn parse(chunk: &[char], special_lower: char, special_upper: char) -> Option<Self> {
        let [r, w, x] = chunk else {
            return None;
        };
        let read = match r {
            'r' => true,
            '-' => false,
            _ => return None,
        };
        let write = match w {
            'w' => true,
            '-' => false,
            _ => return None,
        };
        let (execute, special) = match *x {
            'x' => (true, false),
            '-' => (false, false),
            c if c == special_lower => (true, true),
            c if c == special_upper => (false, true),
            _ => return None,
        };
        Some(Self {
            read,
            write,
            execute,
            special,
        })
    }
}

/// Owner/group/others permission triple of a filesystem object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permissions {
    pub user: PermissionBits,
    pub group: PermissionBits,
    pub others: PermissionBits,
}

impl Permissions {
    pub fn new(user: PermissionBits, group: PermissionBits, others: PermissionBits) -> Self {
        Self {
            user,
            group,
            others,
        }
    }

    pub fn is_setuid(&self) -> bool {
        self.user.special
    }

    pub fn is_setgid(&self) -> bool {
        self.group.special
    }

    pub fn is_sticky(&self) -> bool {
        self.others.special
    }

    /// Unix style rendering, e.g. `rwxr-xr-x` or `rwsr-xr-t`.
    pub fn to_raw_string(&self) -> String {
        self.user
            .render('s', 'S')
            .into_iter()
            .chain(self.group.render('s', 'S'))
            .chain(self.others.render('t', 'T'))
            .collect()
    }

    /// Four digit octal rendering, e.g. `0755`.
    pub fn to_octal_string(&self) -> String {
        let special = (u32::from(self.is_setuid()) << 2)
            | (u32::from(self.is_setgid()) << 1)
            | u32::from(self.is_sticky());
        format!(
            "{special}{}{}{}",
            self.user.octal_digit(),
            self.group.octal_digit(),
            self.others.octal_digit()
        )
    }

    /// Builds permissions from a numeric mode (`0o4755`).
    pub fn from_mode(mode: u32) -> Self {
        let mut user = PermissionBits::from_octal_digit((mode >> 6) & 0o7);
        let mut group = PermissionBits::from_octal_digit((mode >> 3) & 0o7);
        let mut others = PermissionBits::from_octal_digit(mode & 0o7);
        user.special = mode & 0o4000 != 0;
        group.special = mode & 0o2000 != 0;
        others.special = mode & 0o1000 != 0;
        Self::new(user, group, others)
    }

    /// Parses the nine-character symbolic form (without the type character).
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let chars: Vec<char> = raw.chars().collect();
        if chars.len() != 9 {
            return Err(ParseError::new(
                0,
                format!("invalid permission string `{raw}`"),
            ));
        }
        let invalid = || ParseError::new(0, format!("invalid permission string `{raw}`"));
        let user = PermissionBits::parse(&chars[0..3], 's', 'S').ok_or_else(invalid)?;
        let group = PermissionBits::parse(&chars[3..6], 's', 'S').ok_or_else(invalid)?;
        let others = PermissionBits::parse(&chars[6..9], 't', 'T').ok_or_else(invalid)?;
        Ok(Self::new(user, group, others))
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_raw_string())
    }
}

impl PartialOrd for Permissions {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Permissions {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_raw_string().cmp(&other.to_raw_string())
    }
}

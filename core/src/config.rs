use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::console::ConsoleSettings;
use crate::console::ShellLauncher;
use crate::paths;

pub const DEFAULT_PRIVILEGED_LAUNCHER: &str = "su";

/// Engine configuration, usually read from a TOML file. Every field has a
/// default so partial files are valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Shell used by non-privileged consoles.
    pub shell: ShellLauncher,
    /// Shell used by privileged consoles.
    pub privileged_shell: ShellLauncher,
    /// Uid a privileged console must report to be accepted.
    pub privileged_uid: u32,
    pub root_directory: String,
    pub exec_timeout_ms: u64,
    pub startup_timeout_ms: u64,
    pub resync_timeout_ms: u64,
    /// Initial value of the trace preference.
    pub trace: bool,
    /// Initial value of the superuser preference.
    pub superuser_mode: bool,
    /// Initial value of the advanced-mode preference.
    pub advanced_mode: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shell: ShellLauncher::default(),
            privileged_shell: ShellLauncher::new(DEFAULT_PRIVILEGED_LAUNCHER),
            privileged_uid: 0,
            root_directory: paths::ROOT_DIRECTORY.to_string(),
            exec_timeout_ms: 10_000,
            startup_timeout_ms: 5_000,
            resync_timeout_ms: 2_000,
            trace: false,
            superuser_mode: false,
            advanced_mode: true,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> io::Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> io::Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if !config.root_directory.starts_with(paths::ROOT_DIRECTORY) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "root_directory must be absolute, got `{}`",
                    config.root_directory
                ),
            ));
        }
        Ok(config)
    }

    pub fn console_settings(&self) -> ConsoleSettings {
        ConsoleSettings {
            root_directory: self.root_directory.clone(),
            exec_timeout: Duration::from_millis(self.exec_timeout_ms),
            startup_timeout: Duration::from_millis(self.startup_timeout_ms),
            resync_timeout: Duration::from_millis(self.resync_timeout_ms),
            trace: self.trace,
        }
    }
}

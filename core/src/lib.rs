//! Shell command execution and result-parsing engine of a file manager.
//!
//! Programs describe one shell command and how to read its output; consoles
//! run them on persistent shell processes; the [`EngineContext`] owns the
//! consoles and decides when a privileged shell is used.

pub mod config;
pub mod console;
pub mod engine;
mod error;
pub mod listing;
pub mod model;
pub mod parse;
pub mod paths;
pub mod preferences;
pub mod program;
pub mod relaunch;

pub use config::EngineConfig;
pub use console::AsyncExecution;
pub use console::Console;
pub use console::ConsoleFactory;
pub use console::ShellLauncher;
pub use engine::EngineContext;
pub use engine::EngineEvent;
pub use engine::SettingChange;
pub use error::FmshErr;
pub use error::ParseError;
pub use error::Result;
pub use error::classify_failure;
pub use relaunch::AlwaysEscalate;
pub use relaunch::EscalationPrompt;
pub use relaunch::NeverEscalate;
pub use relaunch::RelaunchPolicy;

use tracing::info;
use tracing::warn;

use super::Console;
use super::ConsoleSettings;
use super::ShellLauncher;
use crate::config::EngineConfig;
use crate::error::FmshErr;
use crate::error::Result;
use crate::program::IdentityProgram;
use crate::program::SyncProgram;

/// Builds consoles from the configured launchers. Privileged consoles are
/// only handed out after `id` confirmed the shell runs as the privileged
/// uid.
#[derive(Debug, Clone)]
pub struct ConsoleFactory {
    shell: ShellLauncher,
    privileged_shell: ShellLauncher,
    privileged_uid: u32,
    settings: ConsoleSettings,
}

impl ConsoleFactory {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            privileged_shell: config.privileged_shell.clone(),
            privileged_uid: config.privileged_uid,
            settings: config.console_settings(),
        }
    }

    pub fn settings(&self) -> &ConsoleSettings {
        &self.settings
    }

    pub async fn create_non_privileged_console(&self, root_path: &str) -> Result<Console> {
        Console::spawn(self.shell.clone(), false, self.settings_for(root_path)).await
    }

    pub async fn create_privileged_console(&self, root_path: &str) -> Result<Console> {
        let console =
            Console::spawn(self.privileged_shell.clone(), true, self.settings_for(root_path)).await?;
        match self.verify_identity(&console).await {
            Ok(()) => {
                info!(console = %console.name(), "privileged console ready");
                Ok(console)
            }
            Err(err) => {
                warn!(console = %console.name(), "privileged console rejected: {err}");
                console.dispose().await;
                Err(err)
            }
        }
    }

    pub async fn create_console(&self, privileged: bool, root_path: &str) -> Result<Console> {
        if privileged {
            self.create_privileged_console(root_path).await
        } else {
            self.create_non_privileged_console(root_path).await
        }
    }

    async fn verify_identity(&self, console: &Console) -> Result<()> {
        let mut probe = IdentityProgram::new();
        console
            .execute(&mut probe)
            .await
            .map_err(|err| FmshErr::console_alloc(format!("identity probe failed: {err}")))?;
        match probe.result() {
            Some(identity) if identity.uid == self.privileged_uid => Ok(()),
            Some(identity) => Err(FmshErr::console_alloc(format!(
                "shell runs as uid {}, expected {}",
                identity.uid, self.privileged_uid
            ))),
            None => Err(FmshErr::console_alloc("identity probe produced no result")),
        }
    }

    fn settings_for(&self, root_path: &str) -> ConsoleSettings {
        ConsoleSettings {
            root_directory: root_path.to_string(),
            ..self.settings.clone()
        }
    }
}

//! The engine context: the consoles of one embedding process, the
//! preferences that decide how they are allocated and the channel engine
//! events are published on.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::MutexGuard;
use tokio::sync::broadcast;
use tracing::info;
use tracing::warn;

use crate::config::EngineConfig;
use crate::console::Console;
use crate::console::ConsoleFactory;
use crate::error::Result;
use crate::preferences::InMemoryPreferences;
use crate::preferences::PreferenceStore;
use crate::program::SyncProgram;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    ConsoleAllocated { privileged: bool },
    ConsoleDestroyed,
    BackgroundConsoleAllocated { privileged: bool },
    BackgroundConsoleDestroyed,
    /// A stored preference did not match what could be obtained and was
    /// rewritten.
    PreferenceCorrected { superuser_mode: bool },
    RelaunchRequested { command: String },
    Relaunched { command: String },
}

/// Preference changes the engine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingChange {
    ShowTraces(bool),
    SuperuserMode(bool),
    AdvancedMode(bool),
}

/// Slot for one shared console. The slot lock is also the allocation lock:
/// the liveness check and any reallocation happen while holding it.
#[derive(Debug, Default)]
pub struct ConsoleHolder {
    slot: Mutex<Option<Arc<Console>>>,
}

impl ConsoleHolder {
    /// The held console, if any, active or not.
    pub async fn current(&self) -> Option<Arc<Console>> {
        self.slot.lock().await.clone()
    }

    async fn lock(&self) -> MutexGuard<'_, Option<Arc<Console>>> {
        self.slot.lock().await
    }
}

pub struct EngineContext {
    config: EngineConfig,
    factory: ConsoleFactory,
    preferences: Arc<dyn PreferenceStore>,
    console: ConsoleHolder,
    background: ConsoleHolder,
    events: broadcast::Sender<EngineEvent>,
}

impl EngineContext {
    pub fn new(config: EngineConfig, preferences: Arc<dyn PreferenceStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            factory: ConsoleFactory::new(&config),
            config,
            preferences,
            console: ConsoleHolder::default(),
            background: ConsoleHolder::default(),
            events,
        }
    }

    /// Context whose preferences start from the config and live in memory.
    pub fn with_config(config: EngineConfig) -> Self {
        let preferences = Arc::new(InMemoryPreferences::from_config(&config));
        Self::new(config, preferences)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn factory(&self) -> &ConsoleFactory {
        &self.factory
    }

    pub fn preferences(&self) -> &Arc<dyn PreferenceStore> {
        &self.preferences
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub async fn current_console(&self) -> Option<Arc<Console>> {
        self.console.current().await
    }

    pub async fn current_background_console(&self) -> Option<Arc<Console>> {
        self.background.current().await
    }

    /// The current console, allocating one if there is none or it died.
    /// With `escalate` the console must be privileged: a non-privileged one
    /// is replaced and failing to obtain a privileged shell is an error.
    pub async fn get_console(&self, escalate: bool) -> Result<Arc<Console>> {
        let mut slot = self.console.lock().await;
        if let Some(console) = slot.as_ref()
            && console.is_active()
            && (!escalate || console.is_privileged())
        {
            return Ok(Arc::clone(console));
        }
        let console = if escalate {
            self.factory
                .create_privileged_console(&self.config.root_directory)
                .await?
        } else {
            self.allocate_preferred().await?
        };
        let console = self.install(&mut slot, console).await;
        self.publish(EngineEvent::ConsoleAllocated {
            privileged: console.is_privileged(),
        });
        Ok(console)
    }

    pub async fn create_privileged_console(&self, root_path: &str) -> Result<Console> {
        self.factory.create_privileged_console(root_path).await
    }

    pub async fn create_non_privileged_console(&self, root_path: &str) -> Result<Console> {
        self.factory.create_non_privileged_console(root_path).await
    }

    /// Swaps the current console for a privileged one. On failure the
    /// current console is kept and `false` is returned.
    pub async fn change_to_privileged_console(&self) -> bool {
        let changed = self.change_console(true).await;
        if changed {
            self.preferences.set_superuser_mode(true);
        }
        changed
    }

    /// Swaps the current console for a non-privileged one. On failure the
    /// current console is kept and `false` is returned.
    pub async fn change_to_non_privileged_console(&self) -> bool {
        let changed = self.change_console(false).await;
        if changed {
            self.preferences.set_superuser_mode(false);
        }
        changed
    }

    async fn change_console(&self, privileged: bool) -> bool {
        let mut slot = self.console.lock().await;
        if let Some(console) = slot.as_ref()
            && console.is_active()
            && console.is_privileged() == privileged
        {
            return true;
        }
        match self
            .factory
            .create_console(privileged, &self.config.root_directory)
            .await
        {
            Ok(console) => {
                self.install(&mut slot, console).await;
                self.publish(EngineEvent::ConsoleAllocated { privileged });
                true
            }
            Err(err) => {
                warn!(privileged, "failed to change console: {err}");
                false
            }
        }
    }

    pub async fn destroy_console(&self) {
        let previous = self.console.lock().await.take();
        if let Some(console) = previous {
            console.dispose().await;
            self.publish(EngineEvent::ConsoleDestroyed);
        }
    }

    /// The console used for work that must not wait behind the user's
    /// commands. Re-created whenever it is found inactive.
    pub async fn background_console(&self) -> Result<Arc<Console>> {
        let mut slot = self.background.lock().await;
        if let Some(console) = slot.as_ref()
            && console.is_active()
        {
            return Ok(Arc::clone(console));
        }
        let console = self.allocate_preferred().await?;
        let console = self.install(&mut slot, console).await;
        self.publish(EngineEvent::BackgroundConsoleAllocated {
            privileged: console.is_privileged(),
        });
        Ok(console)
    }

    pub async fn change_background_console_to_privileged(&self) -> bool {
        let mut slot = self.background.lock().await;
        if let Some(console) = slot.as_ref()
            && console.is_active()
            && console.is_privileged()
        {
            return true;
        }
        match self
            .factory
            .create_privileged_console(&self.config.root_directory)
            .await
        {
            Ok(console) => {
                self.install(&mut slot, console).await;
                self.publish(EngineEvent::BackgroundConsoleAllocated { privileged: true });
                true
            }
            Err(err) => {
                warn!("failed to make the background console privileged: {err}");
                false
            }
        }
    }

    pub async fn destroy_background_console(&self) {
        let previous = self.background.lock().await.take();
        if let Some(console) = previous {
            console.dispose().await;
            self.publish(EngineEvent::BackgroundConsoleDestroyed);
        }
    }

    pub async fn on_setting_changed(&self, change: SettingChange) {
        info!(?change, "setting changed");
        match change {
            SettingChange::ShowTraces(enabled) => {
                for holder in [&self.console, &self.background] {
                    if let Some(console) = holder.current().await {
                        console.reload_trace(enabled);
                    }
                }
            }
            SettingChange::SuperuserMode(true) => {
                if !self.change_to_privileged_console().await {
                    self.correct_superuser_mode(false);
                }
            }
            SettingChange::SuperuserMode(false) => {
                if !self.change_to_non_privileged_console().await {
                    self.correct_superuser_mode(true);
                }
            }
            SettingChange::AdvancedMode(false) => {
                let privileged = self
                    .console
                    .current()
                    .await
                    .is_some_and(|console| console.is_privileged());
                if privileged && !self.change_to_non_privileged_console().await {
                    self.correct_superuser_mode(true);
                }
            }
            SettingChange::AdvancedMode(true) => {}
        }
    }

    /// Disposes every console owned by the context.
    pub async fn shutdown(&self) {
        self.destroy_background_console().await;
        self.destroy_console().await;
        info!("engine shut down");
    }

    /// Convenience: runs `program` on the current console.
    pub async fn execute<P: SyncProgram>(&self, program: &mut P) -> Result<()> {
        let console = self.get_console(false).await?;
        console.execute(program).await
    }

    /// Privileged if the preferences ask for it and a privileged console can
    /// be verified, otherwise non-privileged. A privileged request that
    /// cannot be honoured rewrites the preference.
    async fn allocate_preferred(&self) -> Result<Console> {
        let root = &self.config.root_directory;
        if self.preferences.superuser_mode() && self.preferences.advanced_mode() {
            match self.factory.create_privileged_console(root).await {
                Ok(console) => return Ok(console),
                Err(err) => {
                    warn!("privileged console unavailable, falling back: {err}");
                    self.correct_superuser_mode(false);
                }
            }
        }
        self.factory.create_non_privileged_console(root).await
    }

    fn correct_superuser_mode(&self, superuser_mode: bool) {
        if self.preferences.superuser_mode() != superuser_mode {
            self.preferences.set_superuser_mode(superuser_mode);
            self.publish(EngineEvent::PreferenceCorrected { superuser_mode });
        }
    }

    /// Puts `console` in the slot, then disposes whatever it replaced.
    async fn install(
        &self,
        slot: &mut Option<Arc<Console>>,
        console: Console,
    ) -> Arc<Console> {
        let console = Arc::new(console);
        console.reload_trace(self.preferences.show_traces());
        if let Some(previous) = slot.replace(Arc::clone(&console)) {
            previous.dispose().await;
        }
        console
    }
}

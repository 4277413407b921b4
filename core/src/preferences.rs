//! The preference store collaborator. Persistence is the embedder's
//! business; the engine only reads and corrects values through this trait.

use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use crate::config::EngineConfig;
use crate::listing::ListingPreferences;

pub trait PreferenceStore: Send + Sync {
    /// Whether the user asked for a privileged console.
    fn superuser_mode(&self) -> bool;

    /// Called by the engine when the stored value turned out to be wrong.
    fn set_superuser_mode(&self, enabled: bool);

    fn show_traces(&self) -> bool;

    /// Without advanced mode only non-privileged consoles are used.
    fn advanced_mode(&self) -> bool;

    fn listing(&self) -> ListingPreferences {
        ListingPreferences::default()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPreferences {
    superuser_mode: AtomicBool,
    show_traces: AtomicBool,
    advanced_mode: AtomicBool,
    listing: RwLock<ListingPreferences>,
}

impl InMemoryPreferences {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            superuser_mode: AtomicBool::new(config.superuser_mode),
            show_traces: AtomicBool::new(config.trace),
            advanced_mode: AtomicBool::new(config.advanced_mode),
            listing: RwLock::new(ListingPreferences::default()),
        }
    }

    pub fn set_show_traces(&self, enabled: bool) {
        self.show_traces.store(enabled, Ordering::SeqCst);
    }

    pub fn set_advanced_mode(&self, enabled: bool) {
        self.advanced_mode.store(enabled, Ordering::SeqCst);
    }

    pub fn set_listing(&self, listing: ListingPreferences) {
        *self.listing.write().unwrap_or_else(PoisonError::into_inner) = listing;
    }
}

impl PreferenceStore for InMemoryPreferences {
    fn superuser_mode(&self) -> bool {
        self.superuser_mode.load(Ordering::SeqCst)
    }

    fn set_superuser_mode(&self, enabled: bool) {
        self.superuser_mode.store(enabled, Ordering::SeqCst);
    }

    fn show_traces(&self) -> bool {
        self.show_traces.load(Ordering::SeqCst)
    }

    fn advanced_mode(&self) -> bool {
        self.advanced_mode.load(Ordering::SeqCst)
    }

    fn listing(&self) -> ListingPreferences {
        self.listing
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

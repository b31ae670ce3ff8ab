//! Durable preferences shared by the download coordinator and the loader
//!
//! Two facts survive a restart: which model the user selected, and which
//! models finished downloading. Everything else is rebuilt at cold start.
//!
//! Module structure:
//! - `sqlite`: rusqlite-backed store used by the app
//! - `migrations`: schema versions for the sqlite store

pub mod migrations;
pub mod sqlite;

use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::error::CoreError;

pub use sqlite::SqlitePreferences;

/// Settings key holding the active model id
pub const ACTIVE_MODEL_KEY: &str = "active_model";

/// Persistence capability for the active selection and the completed set
pub trait PreferencesStore: Send + Sync {
    fn active_selection(&self) -> Result<Option<String>, CoreError>;

    /// `None` clears the selection
    fn set_active_selection(&self, model_id: Option<&str>) -> Result<(), CoreError>;

    fn completed_downloads(&self) -> Result<BTreeSet<String>, CoreError>;

    fn insert_completed(&self, model_id: &str) -> Result<(), CoreError>;

    fn remove_completed(&self, model_id: &str) -> Result<(), CoreError>;

    fn is_completed(&self, model_id: &str) -> Result<bool, CoreError> {
        Ok(self.completed_downloads()?.contains(model_id))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    active: Option<String>,
    completed: BTreeSet<String>,
}

/// Non-durable store for tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    state: Mutex<MemoryState>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> Result<T, CoreError> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| CoreError::Preferences(format!("Failed to lock preferences: {}", e)))?;
        Ok(f(&mut state))
    }
}

impl PreferencesStore for MemoryPreferences {
    fn active_selection(&self) -> Result<Option<String>, CoreError> {
        self.with_state(|s| s.active.clone())
    }

    fn set_active_selection(&self, model_id: Option<&str>) -> Result<(), CoreError> {
        self.with_state(|s| s.active = model_id.map(str::to_string))
    }

    fn completed_downloads(&self) -> Result<BTreeSet<String>, CoreError> {
        self.with_state(|s| s.completed.clone())
    }

    fn insert_completed(&self, model_id: &str) -> Result<(), CoreError> {
        self.with_state(|s| {
            s.completed.insert(model_id.to_string());
        })
    }

    fn remove_completed(&self, model_id: &str) -> Result<(), CoreError> {
        self.with_state(|s| {
            s.completed.remove(model_id);
        })
    }
}

//! JSON-file persistence for match settings.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::game::settings::MatchSettings;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("settings i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid settings file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Reads and writes one settings file. The file is rewritten whole after
/// every settings change.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load previously saved settings. `Ok(None)` when the file does not
    /// exist yet; a present-but-unreadable file is an error so a typo never
    /// silently discards an operator's configuration.
    pub fn load(&self) -> Result<Option<MatchSettings>, StoreError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No settings file, using defaults");
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)?;
        let settings = serde_json::from_str(&raw)?;
        Ok(Some(settings))
    }

    pub fn save(&self, settings: &MatchSettings) -> Result<(), StoreError> {
        let raw = serde_json::to_string_pretty(settings)?;
        fs::write(&self.path, raw)?;
        debug!(path = %self.path.display(), "Saved match settings");
        Ok(())
    }
}

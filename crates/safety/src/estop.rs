//! File-based emergency stop marker.
//!
//! `cadence estop` drops a marker file; a running `cadence run` polls for it
//! and raises an external stop on every session. `--resume` removes it.

use cadence_config::CadenceConfig;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct EstopMarker {
    path: PathBuf,
}

impl EstopMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The marker in the config directory (`~/.cadence/.estop`).
    pub fn default_location() -> Self {
        Self::new(CadenceConfig::config_dir().join(".estop"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Engage: write the marker with the engage time.
    pub fn engage(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, chrono::Utc::now().to_rfc3339())
    }

    /// Release. Returns `false` if no stop was engaged.
    pub fn release(&self) -> std::io::Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.path.exists()
    }

    /// When the stop was engaged, if the marker is present and readable.
    pub fn engaged_at(&self) -> Option<String> {
        std::fs::read_to_string(&self.path)
            .ok()
            .map(|s| s.trim().to_string())
    }
}

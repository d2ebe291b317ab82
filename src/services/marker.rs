//! Marker files shared with other processes on the gateway.
//!
//! A marker signals a condition by its mere existence. The out-of-band
//! updater and the display controller watch the data directory for them.

use log::{error, info};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::{fs, io};

#[derive(Clone, Debug)]
pub struct MarkerFile {
    path: PathBuf,
    label: &'static str,
}

impl MarkerFile {
    pub fn new(path: impl Into<PathBuf>, label: &'static str) -> Self {
        Self {
            path: path.into(),
            label,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Set the marker file.
    pub fn set(&self) -> io::Result<()> {
        info!("setting {} marker at: {}", self.label, self.path.display());
        fs::write(&self.path, "")
    }

    /// Set the marker file, logging errors instead of propagating them.
    pub fn set_or_log(&self) {
        if let Err(e) = self.set() {
            error!("failed to set {} marker: {e}", self.label);
        }
    }

    /// Clear the marker file. NotFound is silently ignored.
    pub fn clear(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => info!("cleared {} marker", self.label),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => error!("failed to clear {} marker: {e}", self.label),
        }
    }
}

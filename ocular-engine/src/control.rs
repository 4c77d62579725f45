use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::info;

/// Filesystem handshake for the interactive needle workflow. Existence of a
/// file is the signal: `stop_waitforneedle` asks the engine to freeze on the
/// next poll, `continue_waitforneedle` tells a timed-out assertion to give
/// up normally instead of freezing again.
pub struct ControlSignals {
    stop_path: PathBuf,
    continue_path: PathBuf,
}

impl ControlSignals {
    pub fn new(dir: &Path) -> Self {
        Self {
            stop_path: dir.join("stop_waitforneedle"),
            continue_path: dir.join("continue_waitforneedle"),
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_path.exists()
    }

    /// Raise the stop signal if not already present.
    pub fn request_stop(&self) -> Result<()> {
        if self.stop_path.exists() {
            return Ok(());
        }
        fs::write(&self.stop_path, b"")
            .with_context(|| format!("Failed to create {}", self.stop_path.display()))?;
        info!(file = %self.stop_path.display(), "Waiting for needle, stop signal raised");
        Ok(())
    }

    pub fn continue_present(&self) -> bool {
        self.continue_path.exists()
    }

    pub fn clear_continue(&self) -> Result<()> {
        remove_if_present(&self.continue_path)
    }

    pub fn clear_stop(&self) -> Result<()> {
        remove_if_present(&self.stop_path)
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn stop_signal_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let signals = ControlSignals::new(tmp.path());

        assert!(!signals.stop_requested());
        signals.request_stop().unwrap();
        assert!(signals.stop_requested());
        // Raising twice is fine.
        signals.request_stop().unwrap();
        signals.clear_stop().unwrap();
        assert!(!signals.stop_requested());
    }

    #[test]
    fn clearing_absent_signals_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let signals = ControlSignals::new(tmp.path());
        signals.clear_stop().unwrap();
        signals.clear_continue().unwrap();
    }

    #[test]
    fn continue_signal_is_observed() {
        let tmp = TempDir::new().unwrap();
        let signals = ControlSignals::new(tmp.path());
        assert!(!signals.continue_present());
        fs::write(tmp.path().join("continue_waitforneedle"), b"").unwrap();
        assert!(signals.continue_present());
        signals.clear_continue().unwrap();
        assert!(!signals.continue_present());
    }
}

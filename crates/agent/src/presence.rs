use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use tracing::info;

use crate::engine::Presence;

/// Process presence: a log line, plus a status file other tools can watch
/// when one is configured. The file holds `active <deviceId>` while a session
/// runs and is removed on withdrawal.
pub struct ProcessPresence {
    status_file: Option<PathBuf>,
    active: Mutex<Option<String>>,
}

impl ProcessPresence {
    pub fn new(status_file: Option<PathBuf>) -> Self {
        Self {
            status_file,
            active: Mutex::new(None),
        }
    }
}

impl Presence for ProcessPresence {
    fn activate(&self, device_id: &str) -> anyhow::Result<()> {
        if let Some(path) = &self.status_file {
            std::fs::write(path, format!("active {device_id}\n"))
                .with_context(|| format!("Failed to write status file {}", path.display()))?;
        }
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = Some(device_id.to_string());
        info!(device_id, "Screen share active");
        Ok(())
    }

    fn withdraw(&self) -> anyhow::Result<()> {
        let Some(device_id) = self.active.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return Ok(());
        };
        if let Some(path) = &self.status_file {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to remove status file {}", path.display()));
                }
            }
        }
        info!(device_id, "Screen share ended");
        Ok(())
    }
}

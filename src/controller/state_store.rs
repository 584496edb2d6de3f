//! JSON file persistence of the controller state for crash recovery

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{ControllerState, STATE_VERSION};

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last saved state; `None` when nothing usable was saved
    pub async fn load(&self) -> Result<Option<ControllerState>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()))
            }
        };
        let state: ControllerState = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        if state.version != STATE_VERSION {
            warn!(
                found = state.version,
                expected = STATE_VERSION,
                path = %self.path.display(),
                "ignoring controller state of another version"
            );
            return Ok(None);
        }
        info!(
            cycle = state.cycle,
            last_horizon = ?state.last_horizon_start,
            "controller state restored"
        );
        Ok(Some(state))
    }

    /// Write via a temporary file and rename so a crash never leaves a torn file
    pub async fn save(&self, state: &ControllerState) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(state).context("serializing controller state")?;
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("renaming {} to {}", tmp.display(), self.path.display()))?;
        debug!(path = %self.path.display(), cycle = state.cycle, "controller state saved");
        Ok(())
    }
}

// Checkpoint State Store
//
// Persists the opaque checkpoint object between runs. The engine is the only
// writer; extensions see a get/set capability over an in-memory copy.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::error::{Error, Result};

pub type CheckpointState = Map<String, Value>;

/// Backing storage for the checkpoint of one extension stream
pub trait StateStore {
    /// Previously committed state, empty when nothing was committed yet
    fn load(&self) -> Result<CheckpointState>;

    fn save(&self, state: &CheckpointState) -> Result<()>;
}

/// JSON document on disk
#[derive(Debug, Clone)]
pub struct JsonFileStateStore {
    path: PathBuf,
}

impl JsonFileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// State file for an extension descriptor id inside `state_dir`
    pub fn for_extension(state_dir: &Path, extension_id: &str) -> Self {
        Self::new(state_dir.join(format!("{}.json", sanitize_file_name(extension_id))))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for JsonFileStateStore {
    fn load(&self) -> Result<CheckpointState> {
        if !self.path.exists() {
            log::debug!("No checkpoint at {}, starting from empty state", self.path.display());
            return Ok(CheckpointState::new());
        }

        let raw = fs::read_to_string(&self.path)?;
        if raw.trim().is_empty() {
            return Ok(CheckpointState::new());
        }

        match serde_json::from_str::<Value>(&raw)? {
            Value::Object(state) => Ok(state),
            other => Err(Error::MalformedInput {
                what: "checkpoint file",
                message: format!("expected a JSON object in {}", self.path.display()),
                input: other.to_string(),
            }),
        }
    }

    fn save(&self, state: &CheckpointState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write next to the target then rename so a crash never leaves half a file
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        fs::rename(&tmp, &self.path)?;

        log::info!("Checkpoint saved to {}", self.path.display());
        Ok(())
    }
}

fn sanitize_file_name(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect()
}

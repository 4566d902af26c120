//! The checkpoint file kept in a persistent working directory.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use super::BuildState;
use crate::error::{Error, ResumeError, Result};

pub const CHECKPOINT_FILE: &str = ".gadget-image.json";
pub const CHECKPOINT_FORMAT: &str = "gadget-image-checkpoint";
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Serialize)]
struct EnvelopeOut<'a> {
    format: &'a str,
    version: u32,
    state: &'a BuildState,
}

#[derive(Deserialize)]
struct EnvelopeIn {
    format: String,
    version: u32,
    state: Value,
}

pub fn path_in(workdir: &Path) -> PathBuf {
    workdir.join(CHECKPOINT_FILE)
}

/// Write `state` to its working directory (temp file, then rename).
pub fn save(state: &BuildState) -> Result<()> {
    let path = path_in(&state.workdir);
    let temp_path = state.workdir.join(format!("{CHECKPOINT_FILE}.tmp"));

    let content = serde_json::to_string_pretty(&EnvelopeOut {
        format: CHECKPOINT_FORMAT,
        version: CHECKPOINT_VERSION,
        state,
    })?;
    fs::write(&temp_path, content)
        .map_err(|e| Error::io(format!("failed to write {}", temp_path.display()), e))?;
    fs::rename(&temp_path, &path)
        .map_err(|e| Error::io(format!("failed to replace {}", path.display()), e))?;
    log::debug!("checkpoint saved to {}", path.display());
    Ok(())
}

/// Load the checkpoint from `workdir`.
pub fn load(workdir: &Path) -> Result<BuildState> {
    let path = path_in(workdir);
    let content = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ResumeError::Missing(workdir.to_path_buf()).into());
        }
        Err(e) => return Err(Error::io(format!("failed to read {}", path.display()), e)),
    };

    let incompatible = |reason: String| ResumeError::Incompatible {
        path: path.clone(),
        reason,
    };
    let envelope: EnvelopeIn =
        serde_json::from_str(&content).map_err(|e| incompatible(e.to_string()))?;
    if envelope.format != CHECKPOINT_FORMAT {
        return Err(incompatible(format!("unknown format `{}`", envelope.format)).into());
    }
    if envelope.version != CHECKPOINT_VERSION {
        return Err(incompatible(format!(
            "version {} (expected {CHECKPOINT_VERSION})",
            envelope.version
        ))
        .into());
    }
    let state: BuildState =
        serde_json::from_value(envelope.state).map_err(|e| incompatible(e.to_string()))?;
    Ok(state)
}

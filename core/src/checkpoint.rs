//! JSON training snapshots.
//!
//! Everything a resumed run needs: cell parameters, step counter, optimizer
//! momentum, estimator history, clipper history and the data cursor. Files
//! are written to a temporary sibling first and then renamed over the target.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::data::StreamCursor;
use crate::error::Result;
use crate::estimator::EstimatorState;
use crate::grad_clip::GradClipState;
use crate::muon::MuonState;
use crate::params::ParamSet;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainState {
    pub params: ParamSet,
    #[serde(default)]
    pub step: u64,
    #[serde(default)]
    pub muon: MuonState,
    #[serde(default)]
    pub estimator: EstimatorState,
    #[serde(default)]
    pub clipper: GradClipState,
    #[serde(default)]
    pub data: Option<StreamCursor>,
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

pub fn save_state(path: &Path, state: &TrainState) -> Result<()> {
    let json = serde_json::to_string(state)?;
    let tmp = temp_sibling(path);
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    info!(path = %path.display(), step = state.step, "saved training state");
    Ok(())
}

pub fn load_state(path: &Path) -> Result<TrainState> {
    let json = fs::read_to_string(path)?;
    let state: TrainState = serde_json::from_str(&json)?;
    info!(path = %path.display(), step = state.step, "loaded training state");
    Ok(state)
}

//! Error taxonomy for the cell network.
//!
//! Configuration invariants are raised as `Err` before any tensor work and are
//! expected to abort the run at the top level. Numeric instability is never an
//! error: it is absorbed by epsilon guards at the arithmetic site.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CellNetError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("graph topology: cell count {cell_count} must be at least in_count + out_count = {in_count}+{out_count}")]
    GraphTopology { cell_count: usize, in_count: usize, out_count: usize },

    #[error("metric `{key}` not in returned metrics: [{available}]")]
    MissingMetric { key: String, available: String },

    #[error("duplicate metric `{0}` when combining metrics")]
    DuplicateMetric(String),

    #[error("orthogonalization needs a tensor of rank >= 2, got shape {shape:?}")]
    RankTooLow { shape: Vec<usize> },

    #[error("shape mismatch for {label}: expected {expected:?}, got {got:?}")]
    ShapeMismatch { label: String, expected: Vec<usize>, got: Vec<usize> },

    #[error("unknown parameter `{0}`")]
    UnknownParam(String),

    #[error("restore failed: {0}")]
    Restore(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CellNetError>;

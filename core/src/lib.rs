pub mod error;
pub mod tensor;
pub mod tape;
pub mod traced;
pub mod params;
pub mod metrics;
pub mod graph;
pub mod cell;
pub mod rollout;
pub mod objective;
pub mod estimator;
pub mod es;
pub mod finite_diffs;
pub mod muon;
pub mod grad_clip;
pub mod data;
pub mod checkpoint;
pub mod trainer;

pub use error::{CellNetError, Result};
pub use tensor::Tensor;
pub use tape::{BufId, GradHook, Tape};
pub use params::{ParamOverride, ParamSet};
pub use metrics::{MetricKey, Metrics};
pub use graph::{Graph, GraphConfig, GraphKind};
pub use cell::{Cell, CellConfig, CellWeights, NetworkState};
pub use rollout::{Rollout, RolloutConfig};
pub use estimator::{EstimatorConfig, GradientEstimator, LossFn};
pub use muon::{Muon, MuonConfig};
pub use trainer::{TrainConfig, Trainer};
